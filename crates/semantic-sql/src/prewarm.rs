//! Prewarm analyzer (C12) and sidecar (C13): a "race to warm the cache"
//! optimization that never changes query semantics. While the caller executes
//! a query's scalar semantic functions serially, an optional background
//! sidecar fans out over the distinct argument values ahead of time so the
//! serial path gets cache hits instead of cascade calls.
//!
//! Argument extraction is token-based rather than AST-based (this crate has
//! no host SQL parser dependency, §1): a call is recognised wherever a
//! `semantic_*`-prefixed identifier is directly followed by `(`, anywhere in
//! the token stream, mirroring the source's `find_all(exp.Anonymous)` walk.
//! Only the function's first argument is captured — the one column-shaped
//! argument every scalar semantic cascade takes its subject from; any
//! additional declared arguments fall back to their registry default when
//! dispatched (see [`crate::dispatcher::Dispatcher::dispatch`]).

use std::collections::HashSet;
use std::panic;
use std::sync::Arc;

use rayon::prelude::*;
use serde_json::Value;

use crate::caller_context;
use crate::dispatcher::Dispatcher;
use crate::sql_shape;
use crate::token::{tokenize, Token, TokenKind};

const DISTINCT_VALUE_LIMIT: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrewarmSpec {
    pub function: String,
    pub arg_sql: String,
    pub distinct_query: String,
    pub cascade_path: String,
    pub input_key: String,
}

/// Walks `sql` for scalar semantic function calls and builds a prewarm spec
/// for each distinct `(function, arg_sql)` pair. Returns an empty list if the
/// query has no top-level `SELECT` shape (best-effort, not a full parser —
/// see [`crate::sql_shape`]'s module docs) or no eligible calls.
pub fn analyze_query_for_prewarm(sql: &str) -> Vec<PrewarmSpec> {
    analyze_query_for_prewarm_with_limit(sql, DISTINCT_VALUE_LIMIT)
}

/// Same as [`analyze_query_for_prewarm`] but with an explicit `LIMIT` for the
/// generated `distinct_query` (§4.12), sourced from
/// [`crate::config::Config::distinct_query_limit`] rather than the default.
pub fn analyze_query_for_prewarm_with_limit(sql: &str, distinct_limit: u32) -> Vec<PrewarmSpec> {
    let Some(shape) = sql_shape::parse_select(sql) else {
        return Vec::new();
    };

    let tokens = tokenize(sql);
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut specs = Vec::new();

    let mut i = 0usize;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.kind == TokenKind::Ident && tok.lexeme.to_ascii_lowercase().starts_with("semantic_") {
            let after_name = skip_ws(&tokens, i + 1);
            if tokens.get(after_name).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(") {
                if let Some(arg_sql) = first_arg(&tokens, after_name) {
                    let function = tok.lexeme.to_ascii_lowercase();
                    let key = (function.clone(), arg_sql.clone());
                    if seen.insert(key) {
                        let cascade_name = function.strip_prefix("semantic_").unwrap_or(&function);
                        specs.push(PrewarmSpec {
                            function: function.clone(),
                            arg_sql: arg_sql.clone(),
                            distinct_query: shape.render_distinct_projection(&arg_sql, distinct_limit),
                            cascade_path: format!("cascades/semantic_sql/{cascade_name}.cascade.yaml"),
                            input_key: "text".to_string(),
                        });
                    }
                }
            }
        }
        i += 1;
    }

    specs
}

fn skip_ws(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && tokens[i].is_noncode() {
        i += 1;
    }
    i
}

fn first_arg(tokens: &[Token], open_paren_idx: usize) -> Option<String> {
    let mut depth = 0i32;
    let mut i = open_paren_idx;
    let mut arg_end = open_paren_idx + 1;
    loop {
        let tok = tokens.get(i)?;
        if tok.kind == TokenKind::Punct && tok.lexeme == "(" {
            depth += 1;
        } else if tok.kind == TokenKind::Punct && tok.lexeme == ")" {
            depth -= 1;
            if depth == 0 {
                arg_end = i;
                break;
            }
        } else if tok.kind == TokenKind::Punct && tok.lexeme == "," && depth == 1 {
            arg_end = i;
            break;
        }
        i += 1;
    }
    let arg = crate::token::join(&tokens[open_paren_idx + 1..arg_end]).trim().to_string();
    if arg.is_empty() {
        None
    } else {
        Some(arg)
    }
}

/// Generates the `RVBBIT MAP PARALLEL` form of a prewarm spec (used for
/// diagnostics/logging; the sidecar itself dispatches through [`Dispatcher`]
/// directly rather than re-entering the SQL engine).
pub fn generate_prewarm_map_sql(spec: &PrewarmSpec, parallel: usize) -> String {
    format!("RVBBIT MAP PARALLEL {parallel} '{}'\nUSING ({})\nWITH (cache='1d');", spec.cascade_path, spec.distinct_query)
}

/// Heuristic gate on whether pre-warming a spec is worth it. The source this
/// crate was distilled from stubs this to always return `true` and defers the
/// real count-based decision to the caller, who has already executed
/// `distinct_query` and knows the row count; this mirrors that.
pub fn should_prewarm(distinct_count: usize, min_distinct: usize, max_distinct: usize) -> bool {
    distinct_count >= min_distinct && distinct_count <= max_distinct
}

/// One function's worth of distinct values to prewarm, fetched by the caller
/// (running `spec.distinct_query` is the host engine's job, out of scope
/// here, §1).
pub struct PrewarmBatch {
    pub spec: PrewarmSpec,
    pub values: Vec<String>,
}

/// Runs the prewarm sidecar: for each batch, dispatches every distinct value
/// through `dispatcher` using a worker pool sized to `parallel`. Errors from
/// an individual dispatch are swallowed — this is a best-effort cache warm,
/// never allowed to affect the main query's correctness (§4.13).
pub fn run_prewarm_sidecar(batches: Vec<PrewarmBatch>, parallel: usize, caller_id: &str, dispatcher: Arc<Dispatcher>) {
    let captured = caller_context::with_caller(caller_id, None, caller_context::capture);

    for batch in batches {
        let Ok(pool) = rayon::ThreadPoolBuilder::new().num_threads(parallel.max(1)).build() else {
            continue;
        };
        let dispatcher = Arc::clone(&dispatcher);
        let function = batch.spec.function.clone();
        pool.install(|| {
            batch.values.par_iter().for_each(|value| {
                let captured = captured.clone();
                let dispatcher = Arc::clone(&dispatcher);
                let function = function.clone();
                let value = value.clone();
                let _ = panic::catch_unwind(panic::AssertUnwindSafe(move || {
                    caller_context::run_with_captured(captured, || {
                        dispatcher.dispatch(&function, &[Value::String(value)]);
                    });
                }));
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_single_call_and_builds_distinct_query() {
        let specs = analyze_query_for_prewarm("SELECT semantic_clean_year(year_field), name FROM products WHERE status = 'active'");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].function, "semantic_clean_year");
        assert_eq!(specs[0].arg_sql, "year_field");
        assert_eq!(specs[0].distinct_query, "SELECT DISTINCT year_field FROM products WHERE status = 'active' LIMIT 500");
        assert_eq!(specs[0].cascade_path, "cascades/semantic_sql/clean_year.cascade.yaml");
    }

    #[test]
    fn dedupes_repeated_calls_on_the_same_argument() {
        let specs = analyze_query_for_prewarm("SELECT semantic_clean_year(year_field) FROM t WHERE semantic_clean_year(year_field) = '2020'");
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn distinct_calls_on_different_arguments_each_get_a_spec() {
        let specs = analyze_query_for_prewarm("SELECT semantic_clean_year(year_field), semantic_clean_year(other_field) FROM t");
        assert_eq!(specs.len(), 2);
    }

    #[test]
    fn ignores_non_semantic_functions() {
        let specs = analyze_query_for_prewarm("SELECT UPPER(name), COUNT(*) FROM t");
        assert!(specs.is_empty());
    }

    #[test]
    fn not_a_select_yields_no_specs() {
        let specs = analyze_query_for_prewarm("DELETE FROM t");
        assert!(specs.is_empty());
    }

    #[test]
    fn map_sql_has_expected_shape() {
        let spec = PrewarmSpec {
            function: "semantic_clean_year".to_string(),
            arg_sql: "year_field".to_string(),
            distinct_query: "SELECT DISTINCT year_field FROM products LIMIT 500".to_string(),
            cascade_path: "cascades/semantic_sql/clean_year.cascade.yaml".to_string(),
            input_key: "text".to_string(),
        };
        let sql = generate_prewarm_map_sql(&spec, 5);
        assert!(sql.starts_with("RVBBIT MAP PARALLEL 5 'cascades/semantic_sql/clean_year.cascade.yaml'"));
        assert!(sql.contains("USING (SELECT DISTINCT year_field FROM products LIMIT 500)"));
    }

    #[test]
    fn should_prewarm_respects_bounds() {
        assert!(!should_prewarm(5, 10, 500));
        assert!(should_prewarm(50, 10, 500));
        assert!(!should_prewarm(1000, 10, 500));
    }
}
