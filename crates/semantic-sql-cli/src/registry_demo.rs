//! A small, hard-coded set of [`FunctionEntry`] registrations the CLI ships
//! with so `rewrite` has something to show for the block/dimension/aggregate
//! passes without a cascade source directory to scan -- that scan is the host
//! integration's job and out of scope for this crate (spec §1, §3). `MEANS`,
//! `ABOUT`, `RELEVANCE TO`, and `~` need no registry entry at all (C7 pass A
//! hard-codes them), so this demo set only covers the registry-driven forms:
//! `SUMMARIZE(...)`, `TOPICS(...)`, and `SEMANTIC_CASE ... END`.

use semantic_sql::registry::{ArgSpec, BlockOperator, DimensionMode, FunctionEntry, Registry, ReturnType, Shape, StructureNode};

pub(crate) fn build() -> Registry {
    Registry::from_entries([summarize_entry(), topics_entry(), semantic_case_entry()])
}

fn summarize_entry() -> FunctionEntry {
    FunctionEntry {
        name: "summarize".to_string(),
        cascade_path: "cascades/semantic_sql/summarize.cascade.yaml".to_string(),
        shape: Shape::Aggregate,
        returns: ReturnType::Varchar,
        args: vec![ArgSpec { name: "items".to_string(), sql_type: "VARCHAR".to_string(), default: None, is_dimension_source: false }],
        operators: vec![],
        cache_enabled: true,
        cache_ttl_seconds: None,
        block_operator: None,
        dimension_mode: None,
        dimension_extractor_fn: None,
        dimension_classifier_fn: None,
    }
}

fn topics_entry() -> FunctionEntry {
    FunctionEntry {
        name: "topics".to_string(),
        cascade_path: "cascades/semantic_sql/topics.cascade.yaml".to_string(),
        shape: Shape::Dimension,
        returns: ReturnType::Varchar,
        args: vec![ArgSpec { name: "text".to_string(), sql_type: "VARCHAR".to_string(), default: None, is_dimension_source: true }],
        operators: vec![],
        cache_enabled: true,
        cache_ttl_seconds: Some(86_400),
        block_operator: None,
        dimension_mode: Some(DimensionMode::Mapping),
        dimension_extractor_fn: None,
        dimension_classifier_fn: None,
    }
}

fn semantic_case_entry() -> FunctionEntry {
    FunctionEntry {
        name: "semantic_case".to_string(),
        cascade_path: "cascades/semantic_sql/case.cascade.yaml".to_string(),
        shape: Shape::Scalar,
        returns: ReturnType::Varchar,
        args: vec![],
        operators: vec![],
        cache_enabled: true,
        cache_ttl_seconds: None,
        block_operator: Some(BlockOperator {
            start_keyword: "SEMANTIC_CASE".to_string(),
            end_keyword: "END".to_string(),
            structure: vec![
                StructureNode::Capture { name: "expr".to_string(), quoted: false },
                StructureNode::Repeat {
                    min: 1,
                    pattern: Box::new(StructureNode::Sequence(vec![
                        StructureNode::Keyword("WHEN SEMANTIC".to_string()),
                        StructureNode::Capture { name: "when".to_string(), quoted: true },
                        StructureNode::Keyword("THEN".to_string()),
                        StructureNode::Capture { name: "then".to_string(), quoted: true },
                    ])),
                },
                StructureNode::Optional {
                    pattern: Box::new(StructureNode::Sequence(vec![
                        StructureNode::Keyword("ELSE".to_string()),
                        StructureNode::Capture { name: "else".to_string(), quoted: true },
                    ])),
                },
            ],
            output_args: vec!["expr".to_string(), "when".to_string(), "then".to_string(), "else".to_string()],
            array_args: vec!["when".to_string(), "then".to_string()],
        }),
        dimension_mode: None,
        dimension_extractor_fn: None,
        dimension_classifier_fn: None,
    }
}
