//! Host-supplied configuration (§6, §9 "never as ambient globals"). A plain
//! struct with sensible defaults — nothing in `spec.md` calls for a
//! persisted config file format, so unlike the teacher's `FluffConfig`
//! (TOML/YAML on disk), a host integration just builds one of these and
//! passes it to [`crate::engine::SemanticEngine`]'s constructors.

use std::path::PathBuf;

/// Tuning knobs for the cache (C10) and prewarm analyzer (C12). `cascade_source_dirs`
/// is accepted and stored only — the directory scan that turns cascade files
/// into [`crate::registry::FunctionEntry`] rows is the external collaborator's
/// job, out of scope here (§1).
#[derive(Debug, Clone)]
pub struct Config {
    pub l1_max_size: usize,
    pub l1_eviction_fraction: f64,
    pub distinct_query_limit: u32,
    pub default_ttl_seconds: u64,
    pub cascade_source_dirs: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            l1_max_size: 10_000,
            l1_eviction_fraction: 0.10,
            distinct_query_limit: 500,
            default_ttl_seconds: 0,
            cascade_source_dirs: Vec::new(),
        }
    }
}
