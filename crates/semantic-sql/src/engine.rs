//! Process-wide facade tying the rewrite pipeline (C9), dispatcher (C11),
//! prewarm analyzer/sidecar (C12/C13), and query tracker (C14) into the
//! single entry point a host integration calls (§2 dataflow, §4.9).
//!
//! [`SemanticEngine`] owns the process-wide services as explicit `Arc`s
//! rather than hidden globals (§9): a host wires one up at startup and calls
//! it per query. `CascadeRunner` and `HostQueryRunner` are the two remaining
//! external collaborators this crate depends on purely through traits — the
//! cascade runtime and the host SQL engine itself are both out of scope (§1).

use std::sync::Arc;

use serde_json::Value;

use crate::annotation;
use crate::cache::{L2Store, SemanticCache};
use crate::config::Config;
use crate::dispatcher::{CascadeRunner, Dispatcher};
use crate::prewarm::{self, PrewarmBatch, PrewarmSpec};
use crate::registry::Registry;
use crate::rewrite::pipeline::{self, RewriteOutput};
use crate::tracker::{CostTotals, QueryTracker};

/// External collaborator: runs a SQL query against the host engine and
/// materializes a single-column result set as strings (§4.13 step 1). Used by
/// the prewarm sidecar to resolve a [`PrewarmSpec::distinct_query`] before
/// fanning cascades out over its rows. Out of scope for this crate (§1).
pub trait HostQueryRunner: Send + Sync {
    fn query_distinct_values(&self, sql: &str) -> Result<Vec<String>, String>;
}

/// The process-wide facade. Cheap to clone (every field is an `Arc`).
#[derive(Clone)]
pub struct SemanticEngine {
    registry: Arc<Registry>,
    cache: Arc<SemanticCache>,
    tracker: Arc<QueryTracker>,
    dispatcher: Arc<Dispatcher>,
    host: Arc<dyn HostQueryRunner>,
    distinct_query_limit: u32,
}

impl SemanticEngine {
    pub fn new(
        registry: Arc<Registry>,
        cache: Arc<SemanticCache>,
        tracker: Arc<QueryTracker>,
        runner: Arc<dyn CascadeRunner>,
        host: Arc<dyn HostQueryRunner>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&cache), Arc::clone(&tracker), runner));
        SemanticEngine { registry, cache, tracker, dispatcher, host, distinct_query_limit: 500 }
    }

    /// Builds the cache's L1 capacity/eviction knobs and the prewarm
    /// analyzer's `distinct_query` `LIMIT` from a host-supplied [`Config`]
    /// (§3.3) instead of the library defaults.
    pub fn with_config(
        config: &Config,
        registry: Arc<Registry>,
        l2: Option<Arc<dyn L2Store>>,
        tracker: Arc<QueryTracker>,
        runner: Arc<dyn CascadeRunner>,
        host: Arc<dyn HostQueryRunner>,
    ) -> Self {
        let cache = Arc::new(SemanticCache::with_config(l2, config.l1_max_size, config.l1_eviction_fraction));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), Arc::clone(&cache), Arc::clone(&tracker), runner));
        SemanticEngine { registry, cache, tracker, dispatcher, host, distinct_query_limit: config.distinct_query_limit }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }

    pub fn tracker(&self) -> &Arc<QueryTracker> {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// §4.9: runs the unified rewriter over `sql`. Pure and registry-only —
    /// no lifecycle tracking, no cache, no sidecar. Idempotent (§8 property 2).
    pub fn rewrite(&self, sql: &str) -> RewriteOutput {
        pipeline::rewrite(sql, &self.registry)
    }

    /// Invokes a single registered UDF directly (C11) — the callback a host
    /// engine's UDF registration wires up per semantic function name.
    pub fn dispatch(&self, name: &str, args: &[Value]) -> Value {
        self.dispatcher.dispatch(name, args)
    }

    /// §4.12: finds the prewarm specs for an already-rewritten query.
    pub fn analyze_for_prewarm(&self, rewritten_sql: &str) -> Vec<PrewarmSpec> {
        prewarm::analyze_query_for_prewarm_with_limit(rewritten_sql, self.distinct_query_limit)
    }

    /// §4.13 / testable property 8: gates the sidecar on a `-- @ parallel: N`
    /// hint read off the *raw* (pre-rewrite) SQL. With no hint, or no scalar
    /// semantic calls left to prewarm after rewriting, this launches nothing
    /// and returns `None` — the sidecar never runs uninvited.
    ///
    /// When it does run, materializing each spec's `distinct_query` happens
    /// synchronously on the caller's thread (§4.13 step 1) — only the cascade
    /// fan-out itself is backgrounded, so the returned handle's `join` is
    /// purely advisory: per §4.13's "daemonic, fire-and-forget" contract, a
    /// host integration need not join it at all.
    pub fn maybe_launch_prewarm_sidecar(&self, raw_sql: &str, rewritten_sql: &str, caller_id: &str) -> Option<std::thread::JoinHandle<()>> {
        let parallel = annotation::scan_parallel_hint(raw_sql)?;
        let specs = self.analyze_for_prewarm(rewritten_sql);
        if specs.is_empty() {
            return None;
        }

        let mut batches = Vec::with_capacity(specs.len());
        for spec in specs {
            match self.host.query_distinct_values(&spec.distinct_query) {
                Ok(values) if !values.is_empty() => batches.push(PrewarmBatch { spec, values }),
                Ok(_) => {}
                Err(e) => log::warn!("prewarm distinct-query failed for {}: {e}", spec.function),
            }
        }
        if batches.is_empty() {
            return None;
        }

        let dispatcher = Arc::clone(&self.dispatcher);
        let caller_id = caller_id.to_string();
        let parallel = parallel as usize;
        Some(std::thread::spawn(move || {
            prewarm::run_prewarm_sidecar(batches, parallel, &caller_id, dispatcher);
        }))
    }

    /// Starts the lifecycle row for a new query (C14) and runs the rewrite
    /// pipeline (C9) in one step, returning the `query_id` the host must pass
    /// back to [`Self::complete_query`] / [`Self::fail_query`] once the
    /// rewritten SQL has actually executed.
    pub fn begin_query(&self, caller_id: &str, raw_sql: &str, protocol: &str) -> (String, RewriteOutput) {
        let query_id = self.tracker.log_query_start(caller_id, raw_sql, protocol);
        (query_id, self.rewrite(raw_sql))
    }

    pub fn complete_query(&self, query_id: &str, rows_output: Option<u64>, duration_ms: Option<f64>, cost: Option<CostTotals>) {
        self.tracker.log_query_complete(query_id, rows_output, duration_ms, cost);
    }

    pub fn fail_query(&self, query_id: &str, error_message: &str) {
        self.tracker.log_query_error(query_id, error_message);
    }
}
