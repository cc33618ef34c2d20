//! Cascade registry (C3): maps a function name to its cascade descriptor.

use ahash::AHashMap;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shape {
    Scalar,
    Aggregate,
    Dimension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnType {
    Boolean,
    Double,
    Integer,
    Varchar,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: String,
    pub sql_type: String,
    pub default: Option<String>,
    /// `Some(true)` marks this argument as the dimension-rewriter's `dimension_source`.
    pub is_dimension_source: bool,
}

/// A single node of an operator/block template mini-syntax.
///
/// `Sequence` groups several nodes so `repeat`/`optional` can carry more than one
/// step (e.g. `WHEN SEMANTIC <capture> THEN <capture>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureNode {
    Keyword(String),
    Capture { name: String, quoted: bool },
    Repeat { min: usize, pattern: Box<StructureNode> },
    Optional { pattern: Box<StructureNode> },
    Sequence(Vec<StructureNode>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorTemplate {
    pub pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOperator {
    pub start_keyword: String,
    pub end_keyword: String,
    pub structure: Vec<StructureNode>,
    /// Capture names in the order they become positional arguments of the
    /// synthesised function call.
    pub output_args: Vec<String>,
    /// Subset of `output_args` that come from a `repeat` node and must be
    /// JSON-array-encoded rather than emitted as a bare literal.
    pub array_args: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionMode {
    Mapping,
    ExtractorClassifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEntry {
    pub name: String,
    pub cascade_path: String,
    pub shape: Shape,
    pub returns: ReturnType,
    pub args: Vec<ArgSpec>,
    pub operators: Vec<OperatorTemplate>,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: Option<u64>,
    pub block_operator: Option<BlockOperator>,
    pub dimension_mode: Option<DimensionMode>,
    /// `extractor_classifier` mode only: overrides the default `{name}_extract`
    /// function name used in the bucket-extraction CTE.
    pub dimension_extractor_fn: Option<String>,
    /// `extractor_classifier` mode only: overrides the default `{name}_classify`
    /// function name used in the per-row classification CTE.
    pub dimension_classifier_fn: Option<String>,
}

impl FunctionEntry {
    pub fn dimension_source_arg(&self) -> Option<&ArgSpec> {
        self.args.iter().find(|a| a.is_dimension_source)
    }
}

/// Shared, atomically-swappable set of registered functions.
///
/// Initialised once under a mutex; after init, shared immutably by cloning the
/// `Arc<AHashMap<..>>` snapshot out of the `RwLock`. `reload` swaps the whole map.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<Arc<AHashMap<String, FunctionEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry { entries: RwLock::new(Arc::new(AHashMap::new())) }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = FunctionEntry>) -> Self {
        let map: AHashMap<String, FunctionEntry> = entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        Registry { entries: RwLock::new(Arc::new(map)) }
    }

    pub fn lookup(&self, name: &str) -> Option<FunctionEntry> {
        self.entries.read().unwrap().get(name).cloned()
    }

    pub fn all_entries(&self) -> Arc<AHashMap<String, FunctionEntry>> {
        self.entries.read().unwrap().clone()
    }

    /// Atomic swap of the backing map.
    pub fn reload(&self, entries: impl IntoIterator<Item = FunctionEntry>) {
        let map: AHashMap<String, FunctionEntry> = entries.into_iter().map(|e| (e.name.clone(), e)).collect();
        *self.entries.write().unwrap() = Arc::new(map);
    }

    pub fn block_entries(&self) -> Vec<FunctionEntry> {
        self.all_entries().values().filter(|e| e.block_operator.is_some()).cloned().collect()
    }

    pub fn dimension_entries(&self) -> Vec<FunctionEntry> {
        self.all_entries().values().filter(|e| e.shape == Shape::Dimension).cloned().collect()
    }

    pub fn inline_entries(&self) -> Vec<FunctionEntry> {
        self.all_entries()
            .values()
            .filter(|e| e.block_operator.is_none() && e.shape != Shape::Dimension)
            .cloned()
            .collect()
    }

    /// Derived index: leading operator keyword/phrase -> entries, for fast scan in C7 pass A.
    pub fn operator_patterns(&self) -> Vec<(String, FunctionEntry)> {
        let mut out: Vec<(String, FunctionEntry)> = self
            .all_entries()
            .values()
            .flat_map(|e| e.operators.iter().map(move |op| (op.pattern.clone(), e.clone())))
            .collect();
        // Longest phrase first so e.g. "RELEVANCE TO" wins over a bare "RELEVANCE".
        out.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}
