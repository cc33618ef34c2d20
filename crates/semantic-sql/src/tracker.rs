//! Query-lifecycle tracker (C14): fingerprinting, lifecycle rows, and
//! per-caller counters.
//!
//! There's no host-parser dependency in this crate (§1, see [`crate::sql_shape`]'s
//! module docs), so fingerprinting works off the same lossless token stream as
//! the rewrite passes: string and numeric literals are normalized to `?` to
//! build a stable template, and calls to a known set of semantic UDF names are
//! harvested for classification.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::token::{tokenize, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Running,
    Completed,
    Error,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Running => "running",
            QueryStatus::Completed => "completed",
            QueryStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryLogRow {
    pub query_id: String,
    pub caller_id: String,
    pub query_raw: String,
    pub query_fingerprint: String,
    pub query_template: String,
    pub query_type: String,
    pub udf_types: Vec<String>,
    pub udf_count: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub duration_ms: Option<f64>,
    pub rows_output: Option<u64>,
    pub total_cost: Option<f64>,
    pub total_tokens_in: Option<u64>,
    pub total_tokens_out: Option<u64>,
    pub llm_calls_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub error_message: Option<String>,
    pub protocol: String,
}

/// External collaborator: the persistent query-log table (§1, §4.14). This
/// crate only depends on the trait; the host engine owns the actual storage.
pub trait QueryLogStore: Send + Sync {
    fn insert(&self, row: QueryLogRow);
    #[allow(clippy::too_many_arguments)]
    fn update_complete(
        &self,
        query_id: &str,
        rows_output: Option<u64>,
        duration_ms: Option<f64>,
        total_cost: Option<f64>,
        total_tokens_in: Option<u64>,
        total_tokens_out: Option<u64>,
        llm_calls_count: Option<u64>,
    );
    fn update_error(&self, query_id: &str, error_message: &str);
    fn increment_cache_hit(&self, caller_id: &str);
    fn increment_cache_miss(&self, caller_id: &str);
    fn increment_llm_call(&self, caller_id: &str);
    fn get(&self, query_id: &str) -> Option<QueryLogRow>;
}

/// External collaborator: the unified-log table the cost rollup reads from
/// (§4.14 "cost rollup"); out of scope for this crate (§1).
pub trait CostLedger: Send + Sync {
    fn aggregate_for_caller(&self, caller_id: &str) -> CostTotals;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostTotals {
    pub total_cost: f64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub llm_calls_count: u64,
}

/// Names of UDFs the fingerprinter recognizes for classification (§4.14).
pub const KNOWN_UDF_NAMES: &[&str] = &[
    "semantic_udf",
    "semantic_cascade_udf",
    "semantic_run",
    "semantic_run_batch",
    "semantic_run_parallel_batch",
    "semantic_map_parallel_exec",
    "semantic_summarize",
    "semantic_classify",
    "semantic_sentiment",
    "semantic_themes",
    "semantic_agg",
    "semantic_matches",
    "semantic_score",
    "semantic_match_pair",
    "semantic_match_template",
    "semantic_case",
];

/// Builds `(fingerprint, template, udf_types)` for `sql`. `fingerprint` is the
/// first 16 hex characters of `md5(template)`; `template` replaces string and
/// numeric literals with `?`; `udf_types` is the sorted, deduplicated set of
/// known UDF names called at the top level of the statement.
pub fn fingerprint_query(sql: &str) -> (String, String, Vec<String>) {
    let tokens = tokenize(sql);
    let mut udf_types: Vec<String> = Vec::new();
    let mut template = String::new();

    for (i, tok) in tokens.iter().enumerate() {
        if tok.kind == TokenKind::Ident {
            let lower = tok.lexeme.to_ascii_lowercase();
            if KNOWN_UDF_NAMES.contains(&lower.as_str()) {
                let after = skip_ws(&tokens, i + 1);
                if tokens.get(after).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(") && !udf_types.contains(&lower) {
                    udf_types.push(lower);
                }
            }
        }
        if tok.kind == TokenKind::String || is_numeric_literal(tok) {
            template.push('?');
        } else {
            template.push_str(&tok.lexeme);
        }
    }

    udf_types.sort();
    let digest = md5::compute(template.as_bytes());
    let fingerprint = format!("{digest:x}")[..16].to_string();
    (fingerprint, template, udf_types)
}

fn is_numeric_literal(tok: &Token) -> bool {
    tok.kind == TokenKind::Ident && tok.lexeme.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn skip_ws(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && tokens[i].is_noncode() {
        i += 1;
    }
    i
}

/// Classification priority (§4.14): `rvbbit_cascade_udf > rvbbit_map >
/// rvbbit_udf > llm_aggregate > semantic_op > first(udf_types) > plain_sql`,
/// with two structural phrase fallbacks checked before giving up.
pub fn classify_query_type(udf_types: &[String], sql: &str) -> String {
    let has = |n: &str| udf_types.iter().any(|u| u == n);

    if has("semantic_cascade_udf") || has("semantic_run") {
        return "rvbbit_cascade_udf".to_string();
    }
    if has("semantic_run_parallel_batch") || has("semantic_map_parallel_exec") || has("semantic_run_batch") {
        return "rvbbit_map".to_string();
    }
    if has("semantic_udf") {
        return "rvbbit_udf".to_string();
    }
    if ["semantic_summarize", "semantic_classify", "semantic_sentiment", "semantic_themes", "semantic_agg"].iter().any(|n| has(n)) {
        return "llm_aggregate".to_string();
    }
    if ["semantic_matches", "semantic_score", "semantic_match_pair", "semantic_match_template", "semantic_case"].iter().any(|n| has(n)) {
        return "semantic_op".to_string();
    }

    let upper = sql.to_ascii_uppercase();
    if upper.contains("RVBBIT MAP") {
        return "rvbbit_map".to_string();
    }
    if upper.contains("RVBBIT RUN") {
        return "rvbbit_run".to_string();
    }

    if let Some(first) = udf_types.first() {
        return first.clone();
    }
    "plain_sql".to_string()
}

pub struct QueryTracker {
    store: Arc<dyn QueryLogStore>,
}

impl QueryTracker {
    pub fn new(store: Arc<dyn QueryLogStore>) -> Self {
        QueryTracker { store }
    }

    pub fn log_query_start(&self, caller_id: &str, query_raw: &str, protocol: &str) -> String {
        let query_id = Uuid::new_v4().to_string();
        let (fingerprint, template, udf_types) = fingerprint_query(query_raw);
        let query_type = classify_query_type(&udf_types, query_raw);
        self.store.insert(QueryLogRow {
            query_id: query_id.clone(),
            caller_id: caller_id.to_string(),
            query_raw: query_raw.to_string(),
            query_fingerprint: fingerprint,
            query_template: template,
            query_type,
            udf_count: udf_types.len(),
            udf_types,
            started_at: Utc::now(),
            completed_at: None,
            status: QueryStatus::Running.as_str().to_string(),
            duration_ms: None,
            rows_output: None,
            total_cost: None,
            total_tokens_in: None,
            total_tokens_out: None,
            llm_calls_count: 0,
            cache_hits: 0,
            cache_misses: 0,
            error_message: None,
            protocol: protocol.to_string(),
        });
        query_id
    }

    pub fn log_query_complete(&self, query_id: &str, rows_output: Option<u64>, duration_ms: Option<f64>, cost: Option<CostTotals>) {
        let (total_cost, tokens_in, tokens_out, calls) = match cost {
            Some(c) => (Some(c.total_cost), Some(c.total_tokens_in), Some(c.total_tokens_out), Some(c.llm_calls_count)),
            None => (None, None, None, None),
        };
        self.store.update_complete(query_id, rows_output, duration_ms, total_cost, tokens_in, tokens_out, calls);
    }

    pub fn log_query_error(&self, query_id: &str, error_message: &str) {
        self.store.update_error(query_id, error_message);
    }

    pub fn increment_cache_hit(&self, caller_id: &str) {
        self.store.increment_cache_hit(caller_id);
    }

    pub fn increment_cache_miss(&self, caller_id: &str) {
        self.store.increment_cache_miss(caller_id);
    }

    pub fn increment_llm_call(&self, caller_id: &str) {
        self.store.increment_llm_call(caller_id);
    }

    pub fn get(&self, query_id: &str) -> Option<QueryLogRow> {
        self.store.get(query_id)
    }
}

/// Reference in-memory [`QueryLogStore`] for tests and host integrations
/// that haven't wired a real store yet.
#[derive(Default)]
pub struct InMemoryQueryLogStore {
    rows: Mutex<Vec<QueryLogRow>>,
    cache_hits: Mutex<std::collections::HashMap<String, u64>>,
    cache_misses: Mutex<std::collections::HashMap<String, u64>>,
    llm_calls: Mutex<std::collections::HashMap<String, u64>>,
}

impl InMemoryQueryLogStore {
    pub fn new() -> Self {
        InMemoryQueryLogStore::default()
    }

    pub fn cache_hit_count(&self, caller_id: &str) -> u64 {
        *self.cache_hits.lock().unwrap().get(caller_id).unwrap_or(&0)
    }

    pub fn cache_miss_count(&self, caller_id: &str) -> u64 {
        *self.cache_misses.lock().unwrap().get(caller_id).unwrap_or(&0)
    }

    pub fn llm_call_count(&self, caller_id: &str) -> u64 {
        *self.llm_calls.lock().unwrap().get(caller_id).unwrap_or(&0)
    }
}

impl QueryLogStore for InMemoryQueryLogStore {
    fn insert(&self, row: QueryLogRow) {
        self.rows.lock().unwrap().push(row);
    }

    fn update_complete(
        &self,
        query_id: &str,
        rows_output: Option<u64>,
        duration_ms: Option<f64>,
        total_cost: Option<f64>,
        total_tokens_in: Option<u64>,
        total_tokens_out: Option<u64>,
        llm_calls_count: Option<u64>,
    ) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|r| r.query_id == query_id) {
            row.status = QueryStatus::Completed.as_str().to_string();
            row.completed_at = Some(Utc::now());
            row.rows_output = rows_output;
            row.duration_ms = duration_ms;
            row.total_cost = total_cost;
            row.total_tokens_in = total_tokens_in;
            row.total_tokens_out = total_tokens_out;
            if let Some(calls) = llm_calls_count {
                row.llm_calls_count = calls;
            }
        }
    }

    fn update_error(&self, query_id: &str, error_message: &str) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|r| r.query_id == query_id) {
            row.status = QueryStatus::Error.as_str().to_string();
            row.completed_at = Some(Utc::now());
            row.error_message = Some(error_message.to_string());
        }
    }

    fn increment_cache_hit(&self, caller_id: &str) {
        *self.cache_hits.lock().unwrap().entry(caller_id.to_string()).or_insert(0) += 1;
    }

    fn increment_cache_miss(&self, caller_id: &str) {
        *self.cache_misses.lock().unwrap().entry(caller_id.to_string()).or_insert(0) += 1;
    }

    fn increment_llm_call(&self, caller_id: &str) {
        *self.llm_calls.lock().unwrap().entry(caller_id.to_string()).or_insert(0) += 1;
    }

    fn get(&self, query_id: &str) -> Option<QueryLogRow> {
        self.rows.lock().unwrap().iter().find(|r| r.query_id == query_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fingerprint_normalizes_literals() {
        let (_, template, _) = fingerprint_query("SELECT * FROM t WHERE a = 'x' AND b = 1");
        assert_eq!(template, "SELECT * FROM t WHERE a = ? AND b = ?");
    }

    #[test]
    fn same_shape_different_literals_share_fingerprint() {
        let (fp1, _, _) = fingerprint_query("SELECT * FROM t WHERE a = 'x'");
        let (fp2, _, _) = fingerprint_query("SELECT * FROM t WHERE a = 'y'");
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn harvests_known_udf_calls() {
        let (_, _, udfs) = fingerprint_query("SELECT semantic_matches(a, 'x') FROM t");
        assert_eq!(udfs, vec!["semantic_matches".to_string()]);
    }

    #[test]
    fn ignores_identifiers_that_merely_share_a_udf_name_without_a_call() {
        let (_, _, udfs) = fingerprint_query("SELECT semantic_matches FROM t");
        assert!(udfs.is_empty());
    }

    #[test]
    fn classifies_cascade_udf_highest_priority() {
        let udfs = vec!["semantic_cascade_udf".to_string(), "semantic_matches".to_string()];
        assert_eq!(classify_query_type(&udfs, ""), "rvbbit_cascade_udf");
    }

    #[test]
    fn classifies_semantic_op() {
        let udfs = vec!["semantic_matches".to_string()];
        assert_eq!(classify_query_type(&udfs, ""), "semantic_op");
    }

    #[test]
    fn classifies_plain_sql_with_no_udfs() {
        assert_eq!(classify_query_type(&[], "SELECT * FROM t"), "plain_sql");
    }

    #[test]
    fn classifies_structural_rvbbit_map_phrase() {
        assert_eq!(classify_query_type(&[], "RVBBIT MAP over t"), "rvbbit_map");
    }

    #[test]
    fn lifecycle_round_trip() {
        let store = Arc::new(InMemoryQueryLogStore::new());
        let tracker = QueryTracker::new(store.clone());
        let id = tracker.log_query_start("caller-1", "SELECT semantic_matches(a, 'x') FROM t", "cli");
        assert_eq!(store.get(&id).unwrap().status, "running");
        tracker.log_query_complete(&id, Some(10), Some(42.0), Some(CostTotals { total_cost: 0.01, total_tokens_in: 100, total_tokens_out: 50, llm_calls_count: 1 }));
        let row = store.get(&id).unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.rows_output, Some(10));
    }

    #[test]
    fn error_lifecycle() {
        let store = Arc::new(InMemoryQueryLogStore::new());
        let tracker = QueryTracker::new(store.clone());
        let id = tracker.log_query_start("caller-1", "SELECT 1", "cli");
        tracker.log_query_error(&id, "boom");
        let row = store.get(&id).unwrap();
        assert_eq!(row.status, "error");
        assert_eq!(row.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn counters_increment_per_caller() {
        let store = Arc::new(InMemoryQueryLogStore::new());
        let tracker = QueryTracker::new(store.clone());
        tracker.increment_cache_hit("caller-1");
        tracker.increment_cache_hit("caller-1");
        tracker.increment_cache_miss("caller-1");
        tracker.increment_llm_call("caller-2");
        assert_eq!(store.cache_hit_count("caller-1"), 2);
        assert_eq!(store.cache_miss_count("caller-1"), 1);
        assert_eq!(store.llm_call_count("caller-2"), 1);
    }
}
