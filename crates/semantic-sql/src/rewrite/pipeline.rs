//! Unified rewriter (C9): orchestrates C4–C8 and the legacy/aggregate passes
//! in a fixed phase order.
//!
//! Order (§4.9): directive strip -> vector search -> block -> dimension ->
//! inline (infix pass A, source-injection pass B, legacy clause-level passes,
//! aggregate sugar). Block patterns resolve before inline rewrites to avoid
//! substring matches; dimension rewrites produce CTEs that later passes must
//! still be able to traverse as ordinary tokens; source-context injection
//! depends on the aliases pass A introduces.
//!
//! Each pass only ever substitutes whole spans with a single opaque
//! [`crate::token::Token::other`], so a later pass in the same `rewrite()`
//! call can't re-match text a previous pass just produced — this is what
//! keeps one pipeline invocation idempotent against its own output.

use crate::directive::{strip_directive, Directive};
use crate::registry::Registry;
use crate::rewrite::{aggregate, block, dimension, infix, legacy, vector_search};
use crate::token::{join, tokenize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutput {
    /// The rewritten inner SQL, directive-free. Re-running `rewrite()` on this
    /// string is a no-op: idempotent by construction (see module docs).
    pub sql: String,
    pub directive: Option<Directive>,
}

/// Runs the full rewrite pipeline against a single SQL statement.
pub fn rewrite(sql: &str, registry: &Registry) -> RewriteOutput {
    let tokens = tokenize(sql);
    let (tokens, directive) = strip_directive(&tokens);

    let tokens =
        if vector_search::has_vector_search_calls(&tokens) { vector_search::rewrite_vector_search(tokens) } else { tokens };

    let block_entries = registry.block_entries();
    let tokens = block::rewrite_blocks(tokens, &block_entries);

    let dimension_entries = registry.dimension_entries();
    let tokens = if dimension::has_dimension_calls(&tokens, &dimension_entries) {
        dimension::rewrite_dimensions(tokens, &dimension_entries)
    } else {
        tokens
    };

    let tokens = infix::rewrite_infix(tokens, registry);
    let tokens = infix::inject_source_context(tokens, registry);

    let tokens = legacy::rewrite_semantic_join(tokens);
    let all_entries: Vec<_> = registry.all_entries().values().cloned().collect();
    let tokens = legacy::rewrite_group_by_meaning(tokens, &all_entries);

    let inline_entries = registry.inline_entries();
    let tokens = aggregate::rewrite_aggregates(tokens, &inline_entries);

    RewriteOutput { sql: join(&tokens).trim().to_string(), directive }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ArgSpec, ReturnType, Shape};
    use crate::registry::{BlockOperator, FunctionEntry, StructureNode};

    fn matches_entry() -> FunctionEntry {
        FunctionEntry {
            name: "semantic_matches".to_string(),
            cascade_path: "cascades/semantic_matches.cascade.yaml".to_string(),
            shape: Shape::Scalar,
            returns: ReturnType::Boolean,
            args: vec![],
            operators: vec![],
            cache_enabled: true,
            cache_ttl_seconds: None,
            block_operator: None,
            dimension_mode: None,
            dimension_extractor_fn: None,
            dimension_classifier_fn: None,
        }
    }

    fn summarize_entry() -> FunctionEntry {
        FunctionEntry {
            name: "summarize".to_string(),
            cascade_path: "cascades/summarize.cascade.yaml".to_string(),
            shape: Shape::Aggregate,
            returns: ReturnType::Varchar,
            args: vec![],
            operators: vec![],
            cache_enabled: true,
            cache_ttl_seconds: None,
            block_operator: None,
            dimension_mode: None,
            dimension_extractor_fn: None,
            dimension_classifier_fn: None,
        }
    }

    fn sentiment_dimension_entry() -> FunctionEntry {
        FunctionEntry {
            name: "topics".to_string(),
            cascade_path: "cascades/topics.cascade.yaml".to_string(),
            shape: Shape::Dimension,
            returns: ReturnType::Varchar,
            args: vec![ArgSpec { name: "text".to_string(), sql_type: "VARCHAR".to_string(), default: None, is_dimension_source: true }],
            operators: vec![],
            cache_enabled: true,
            cache_ttl_seconds: None,
            block_operator: None,
            dimension_mode: Some(crate::registry::DimensionMode::Mapping),
            dimension_extractor_fn: None,
            dimension_classifier_fn: None,
        }
    }

    #[test]
    fn rewrites_a_full_statement_across_phases() {
        let registry = Registry::from_entries([matches_entry(), summarize_entry()]);
        let out = rewrite("SELECT state, SUMMARIZE(review) FROM r WHERE review MEANS 'eco-friendly' GROUP BY state", &registry);
        assert!(out.directive.is_none());
        assert!(out.sql.contains("semantic_matches(review,"));
        assert!(out.sql.contains("semantic_summarize_impl(LIST(review)::VARCHAR)"));
    }

    #[test]
    fn strips_background_directive_and_still_rewrites_inner_sql() {
        let registry = Registry::from_entries([matches_entry()]);
        let out = rewrite("BACKGROUND SELECT * FROM t WHERE a MEANS 'x'", &registry);
        assert_eq!(out.directive, Some(Directive::Background));
        assert!(out.sql.contains("semantic_matches(a,"));
        assert!(!out.sql.to_ascii_uppercase().contains("BACKGROUND"));
    }

    #[test]
    fn dimension_phase_runs_before_inline_phase() {
        let registry = Registry::from_entries([sentiment_dimension_entry()]);
        let out = rewrite("SELECT topics(review) FROM r", &registry);
        assert!(out.sql.starts_with("WITH\n_"));
        assert!(out.sql.contains("FROM _dim_classified"));
    }

    #[test]
    fn vector_search_runs_before_infix_so_dotted_arg_is_not_mis_parsed() {
        let registry = Registry::new();
        let out = rewrite("SELECT * FROM VECTOR_SEARCH('eco', reviews.text, 5)", &registry);
        assert!(out.sql.contains("vector_search_json_3('eco', 'reviews', 5)"));
        assert!(out.sql.contains("metadata.column_name = 'text'"));
    }

    #[test]
    fn plain_sql_with_no_registered_functions_passes_through() {
        let registry = Registry::new();
        let out = rewrite("SELECT * FROM t WHERE a = 1", &registry);
        assert_eq!(out.sql, "SELECT * FROM t WHERE a = 1");
        assert!(out.directive.is_none());
    }

    #[test]
    fn rewrite_is_idempotent_on_its_own_output() {
        let registry = Registry::from_entries([matches_entry()]);
        let first = rewrite("SELECT * FROM t WHERE a MEANS 'x'", &registry);
        let second = rewrite(&first.sql, &registry);
        assert_eq!(first.sql, second.sql);
        assert!(second.directive.is_none());
    }

    #[test]
    fn semantic_join_runs_in_legacy_phase() {
        let registry = Registry::new();
        let out = rewrite("SELECT * FROM a SEMANTIC JOIN b ON a.x ~ b.y", &registry);
        assert!(out.sql.contains("CROSS JOIN b WHERE semantic_match_pair(a.x, b.y, 'same entity')"));
    }

    #[test]
    fn block_entries_do_not_collide_with_semantic_case_unused_here() {
        // Sanity check that registering a block operator entry with no match
        // in the query leaves everything else untouched.
        let mut entry = matches_entry();
        entry.block_operator = Some(BlockOperator {
            start_keyword: "SEMANTIC_CASE".to_string(),
            end_keyword: "END".to_string(),
            structure: vec![StructureNode::Capture { name: "expr".to_string(), quoted: false }],
            output_args: vec!["expr".to_string()],
            array_args: vec![],
        });
        let registry = Registry::from_entries([entry]);
        let out = rewrite("SELECT * FROM t WHERE a = 1", &registry);
        assert_eq!(out.sql, "SELECT * FROM t WHERE a = 1");
    }
}
