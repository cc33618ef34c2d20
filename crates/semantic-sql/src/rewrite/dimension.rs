//! Dimension function rewriter (C6): semantic "bucketing" functions such as
//! `sentiment(observed, 'fear')` used in `SELECT`/`GROUP BY`.
//!
//! A dimension function needs to see every value in the source before it can
//! assign any single row to a bucket, so it can't be a plain scalar UDF call.
//! Instead the call is lifted into a pair of CTEs ahead of the query:
//!
//!   - an extraction CTE that hands the cascade every distinct value at once
//!     (`mapping` mode: one cascade call returns `{value: bucket}`; the
//!     `extractor_classifier` mode instead derives a bucket list once and
//!     classifies each row against it with a second, per-row call)
//!   - a classification CTE that joins the extraction result back against the
//!     original rows, producing one bucket-label column per dimension call
//!
//! the main query is then rewritten to read `FROM _dim_classified` and to
//! reference the bucket columns instead of the original function calls.
//!
//! Locating the enclosing `SELECT`'s `FROM`/`WHERE` uses [`crate::sql_shape`],
//! which shares the same best-effort, non-parser approach as the rest of this
//! crate; a query whose `FROM` can't be located is left untouched.

use crate::registry::{DimensionMode, FunctionEntry};
use crate::sql_shape;
use crate::token::{join, tokenize, Token, TokenKind};
use indexmap::IndexMap;

/// Returns `true` if any registered dimension function name appears as a bare
/// call in `tokens` (cheap pre-check before the full rewrite).
pub fn has_dimension_calls(tokens: &[Token], entries: &[FunctionEntry]) -> bool {
    if entries.is_empty() {
        return false;
    }
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    tokens.iter().enumerate().any(|(i, tok)| {
        if tok.kind != TokenKind::Ident || !names.iter().any(|n| n.eq_ignore_ascii_case(&tok.lexeme)) {
            return false;
        }
        let after = sql_shape::skip_ws(tokens, i + 1);
        tokens.get(after).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(")
    })
}

/// A parsed occurrence of a dimension function call in the query text.
struct DimensionExpr {
    func_name: String,
    source_col: String,
    scalar_args: Vec<String>,
    alias: Option<String>,
    id: String,
    start: usize,
    end: usize,
    entry: FunctionEntry,
}

/// Rewrites every dimension-function call in `tokens` into CTE-backed bucket
/// columns. Returns `tokens` unchanged if no dimension entries are registered,
/// none match, or the enclosing `FROM` can't be located.
pub fn rewrite_dimensions(tokens: Vec<Token>, entries: &[FunctionEntry]) -> Vec<Token> {
    let dim_entries: Vec<&FunctionEntry> = entries.iter().filter(|e| e.shape == crate::registry::Shape::Dimension).collect();
    if dim_entries.is_empty() {
        return tokens;
    }

    let exprs = find_dimension_exprs(&tokens, &dim_entries);
    if exprs.is_empty() {
        return tokens;
    }

    let select_base = sql_shape::with_list_end(&tokens).unwrap_or(0);
    let Some((from_start, from_kw_end)) = sql_shape::find_top_level(&tokens, select_base, &["SELECT"])
        .and_then(|(_, select_kw_end)| sql_shape::find_top_level(&tokens, select_kw_end, &["FROM"]))
    else {
        return tokens;
    };
    let _ = from_start;
    let from_body_start = sql_shape::skip_ws(&tokens, from_kw_end);
    let clause_candidates: &[&[&str]] = &[&["WHERE"], &["GROUP", "BY"], &["HAVING"], &["ORDER", "BY"], &["LIMIT"]];
    let from_body_end = sql_shape::find_next_clause(&tokens, from_body_start, clause_candidates).map(|(s, _)| s).unwrap_or(tokens.len());
    let source = sql_shape::text_between(&tokens, from_body_start, from_body_end);

    let where_clause = sql_shape::find_top_level(&tokens, from_body_end, &["WHERE"])
        .filter(|(s, _)| *s == from_body_end)
        .map(|(_, kw_end)| {
            let body_start = sql_shape::skip_ws(&tokens, kw_end);
            let body_end = sql_shape::find_next_clause(&tokens, body_start, &[&["GROUP", "BY"], &["HAVING"], &["ORDER", "BY"], &["LIMIT"]])
                .map(|(s, _)| s)
                .unwrap_or(tokens.len());
            format!("WHERE {}", sql_shape::text_between(&tokens, body_start, body_end))
        })
        .unwrap_or_default();

    let ctes = generate_ctes(&exprs, &source, &where_clause);

    let mut spans: Vec<(usize, usize, String)> = exprs
        .iter()
        .map(|e| {
            let replacement = match &e.alias {
                Some(a) => format!("{} AS {}", e.id, a),
                None => e.id.clone(),
            };
            (e.start, e.end, replacement)
        })
        .collect();
    spans.push((from_body_start, from_body_end, "_dim_classified".to_string()));
    spans.sort_by_key(|(s, _, _)| *s);

    let (rewritten, select_marker) = apply_spans(&tokens, &spans, Some(select_base));

    let final_sql = match sql_shape::with_list_end(&tokens) {
        Some(_) => {
            let with_kw = sql_shape::skip_ws(&tokens, 0);
            let after_with = sql_shape::skip_ws(&tokens, with_kw + 1);
            let existing = sql_shape::text_between(&tokens, after_with, select_base);
            let existing = existing.trim().trim_end_matches(',');
            let rest = join(&rewritten[select_marker.unwrap_or(0)..]).trim().to_string();
            format!("WITH {existing}, \n{ctes}\n{rest}")
        }
        None => {
            let rest = join(&rewritten).trim().to_string();
            format!("WITH\n{ctes}\n{rest}")
        }
    };

    tokenize(&final_sql)
}

fn find_dimension_exprs(tokens: &[Token], entries: &[&FunctionEntry]) -> Vec<DimensionExpr> {
    let mut exprs = Vec::new();
    let mut seen: IndexMap<String, ()> = IndexMap::new();
    let mut i = 0usize;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.kind != TokenKind::Ident {
            i += 1;
            continue;
        }
        let Some(entry) = entries.iter().find(|e| e.name.eq_ignore_ascii_case(&tok.lexeme)) else {
            i += 1;
            continue;
        };
        let after_name = sql_shape::skip_ws(tokens, i + 1);
        if !tokens.get(after_name).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(") {
            i += 1;
            continue;
        }

        let open = after_name;
        let mut depth = 0i32;
        let mut close = open;
        for (offset, t) in tokens[open..].iter().enumerate() {
            if t.kind == TokenKind::Punct && t.lexeme == "(" {
                depth += 1;
            } else if t.kind == TokenKind::Punct && t.lexeme == ")" {
                depth -= 1;
                if depth == 0 {
                    close = open + offset;
                    break;
                }
            }
        }
        if close == open {
            i += 1;
            continue;
        }

        let args = split_top_level_args(&tokens[open + 1..close]);
        if args.is_empty() {
            i += 1;
            continue;
        }
        let mut source_col = args[0].trim().to_string();
        if !(source_col.starts_with('\'') || source_col.starts_with('"')) {
            source_col = source_col.trim_matches(|c| c == '`' || c == '"').to_string();
        }
        let scalar_args: Vec<String> = args[1..].iter().map(|a| a.trim().to_string()).collect();

        let mut end = close + 1;
        let mut alias = None;
        let after_close = sql_shape::skip_ws(tokens, close + 1);
        if sql_shape::ident_at(tokens, after_close, "AS") {
            let alias_idx = sql_shape::skip_ws(tokens, after_close + 1);
            if let Some(t) = tokens.get(alias_idx) {
                if t.kind == TokenKind::Ident {
                    alias = Some(t.lexeme.clone());
                    end = alias_idx + 1;
                }
            }
        }

        let id = make_dimension_id(&entry.name, &source_col, &scalar_args);
        seen.insert(id.clone(), ());
        exprs.push(DimensionExpr {
            func_name: entry.name.clone(),
            source_col,
            scalar_args,
            alias,
            id,
            start: i,
            end,
            entry: (*entry).clone(),
        });

        i = end;
    }
    exprs
}

fn split_top_level_args(tokens: &[Token]) -> Vec<String> {
    let mut args = Vec::new();
    let mut depth = 0i32;
    let mut current = String::new();
    for tok in tokens {
        if tok.kind == TokenKind::Punct && tok.lexeme == "(" {
            depth += 1;
        }
        if tok.kind == TokenKind::Punct && tok.lexeme == ")" {
            depth -= 1;
        }
        if tok.kind == TokenKind::Punct && tok.lexeme == "," && depth == 0 {
            args.push(std::mem::take(&mut current));
            continue;
        }
        current.push_str(&tok.lexeme);
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current);
    }
    args.into_iter().map(|a| a.trim().to_string()).filter(|a| !a.is_empty()).collect()
}

fn sanitize_col_name(col: &str) -> String {
    let col = col.rsplit('.').next().unwrap_or(col);
    col.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

fn make_dimension_id(func_name: &str, source_col: &str, scalar_args: &[String]) -> String {
    let id_base = format!("{}:{}:{}", func_name, source_col, scalar_args.join(":"));
    let digest = md5::compute(id_base.as_bytes());
    let hash = format!("{digest:x}");
    format!("__dim_{}_{}_{}", func_name, sanitize_col_name(source_col), &hash[..8])
}

fn generate_ctes(exprs: &[DimensionExpr], source: &str, where_clause: &str) -> String {
    let mut unique: IndexMap<&str, &DimensionExpr> = IndexMap::new();
    for e in exprs {
        unique.insert(&e.id, e);
    }

    let mut ctes = Vec::new();
    for (id, expr) in &unique {
        let mode = expr.entry.dimension_mode.unwrap_or(DimensionMode::Mapping);
        let scalar_args_str =
            if expr.scalar_args.is_empty() { String::new() } else { format!(", {}", expr.scalar_args.join(", ")) };
        let total_arity = 1 + expr.scalar_args.len();
        let compute_func =
            if total_arity == 1 { format!("{}_compute", expr.func_name) } else { format!("{}_compute_{}", expr.func_name, total_arity) };

        match mode {
            DimensionMode::Mapping => ctes.push(format!(
                "_{id}_mapping AS (\n    SELECT {compute_func}(\n        to_json(LIST({})){scalar_args_str}\n    ) as _result\n    FROM {source}\n    {where_clause}\n)",
                expr.source_col
            )),
            DimensionMode::ExtractorClassifier => {
                let extractor_func = expr.entry.dimension_extractor_fn.clone().unwrap_or_else(|| format!("{}_extract", expr.func_name));
                ctes.push(format!(
                    "_{id}_buckets AS (\n    SELECT {extractor_func}(\n        to_json(LIST({})){scalar_args_str}\n    ) as _buckets\n    FROM {source}\n    {where_clause}\n)",
                    expr.source_col
                ))
            }
        }
    }

    let mut classify_cols = Vec::new();
    let mut cross_joins = Vec::new();
    for (id, expr) in &unique {
        let mode = expr.entry.dimension_mode.unwrap_or(DimensionMode::Mapping);
        match mode {
            DimensionMode::Mapping => {
                classify_cols.push(format!(
                    "COALESCE(\n            (SELECT TRIM(BOTH '\"' FROM value::VARCHAR)\n             FROM json_each(_{id}_mapping._result->'mapping')\n             WHERE key = _source.{}\n             LIMIT 1),\n            'Unknown'\n        ) as {id}",
                    expr.source_col
                ));
                cross_joins.push(format!("_{id}_mapping"));
            }
            DimensionMode::ExtractorClassifier => {
                let classifier_func = expr.entry.dimension_classifier_fn.clone().unwrap_or_else(|| format!("{}_classify", expr.func_name));
                classify_cols.push(format!(
                    "{classifier_func}(\n            _source.{},\n            (SELECT _buckets FROM _{id}_buckets)\n        ) as {id}",
                    expr.source_col
                ));
            }
        }
    }

    let cross_join_str = if cross_joins.is_empty() { String::new() } else { format!(", {}", cross_joins.join(", ")) };
    ctes.push(format!(
        "_dim_classified AS (\n    SELECT _source.*,\n        {}\n    FROM {source} AS _source{cross_join_str}\n    {where_clause}\n)",
        classify_cols.join(",\n        ")
    ));

    ctes.join(",\n")
}

/// Walks `tokens`, substituting each `(start, end)` span (must be sorted and
/// non-overlapping) with a single `Token::other(replacement)`. If `marker` is
/// given and falls outside every span, returns its position in the new vec.
fn apply_spans(tokens: &[Token], spans: &[(usize, usize, String)], marker: Option<usize>) -> (Vec<Token>, Option<usize>) {
    let mut out = Vec::with_capacity(tokens.len());
    let mut marker_new = None;
    let mut i = 0usize;
    let mut span_idx = 0usize;
    while i < tokens.len() {
        if marker.is_some_and(|m| m == i) {
            marker_new = Some(out.len());
        }
        if span_idx < spans.len() && spans[span_idx].0 == i {
            out.push(Token::other(spans[span_idx].2.clone()));
            i = spans[span_idx].1;
            span_idx += 1;
            continue;
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    if marker.is_some_and(|m| m == tokens.len()) {
        marker_new = Some(out.len());
    }
    (out, marker_new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ArgSpec, ReturnType, Shape};

    fn dim_entry(mode: DimensionMode) -> FunctionEntry {
        FunctionEntry {
            name: "sentiment".to_string(),
            cascade_path: "cascades/sentiment.cascade.yaml".to_string(),
            shape: Shape::Dimension,
            returns: ReturnType::Varchar,
            args: vec![
                ArgSpec { name: "text".to_string(), sql_type: "VARCHAR".to_string(), default: None, is_dimension_source: true },
                ArgSpec { name: "focus".to_string(), sql_type: "VARCHAR".to_string(), default: Some("NULL".to_string()), is_dimension_source: false },
            ],
            operators: vec![],
            cache_enabled: true,
            cache_ttl_seconds: None,
            block_operator: None,
            dimension_mode: Some(mode),
            dimension_extractor_fn: None,
            dimension_classifier_fn: None,
        }
    }

    #[test]
    fn rewrites_mapping_dimension_in_group_by() {
        let sql = "SELECT state, sentiment(observed, 'fear') as mood, COUNT(*) FROM bigfoot_vw GROUP BY state, sentiment(observed, 'fear')";
        let tokens = tokenize(sql);
        let out = rewrite_dimensions(tokens, &[dim_entry(DimensionMode::Mapping)]);
        let result = join(&out);
        assert!(result.starts_with("WITH\n_"));
        assert!(result.contains("_mapping AS ("));
        assert!(result.contains("sentiment_compute_2("));
        assert!(result.contains("FROM _dim_classified"));
        assert!(result.contains("AS mood"));
        // Same expression used twice (SELECT + GROUP BY) shares one bucket id.
        let id_count = result.matches("__dim_sentiment_observed_").count();
        assert!(id_count >= 2);
    }

    #[test]
    fn extractor_classifier_mode_uses_two_stage_ctes() {
        let sql = "SELECT sentiment(observed) FROM t";
        let tokens = tokenize(sql);
        let out = rewrite_dimensions(tokens, &[dim_entry(DimensionMode::ExtractorClassifier)]);
        let result = join(&out);
        assert!(result.contains("_buckets AS ("));
        assert!(result.contains("sentiment_extract("));
        assert!(result.contains("sentiment_classify("));
        assert!(result.contains("sentiment_compute") == false);
    }

    #[test]
    fn no_dimension_entries_leaves_query_untouched() {
        let sql = "SELECT * FROM t";
        let tokens = tokenize(sql);
        let out = rewrite_dimensions(tokens, &[]);
        assert_eq!(join(&out), sql);
    }

    #[test]
    fn no_matching_call_leaves_query_untouched() {
        let sql = "SELECT * FROM t WHERE a = 1";
        let tokens = tokenize(sql);
        let out = rewrite_dimensions(tokens, &[dim_entry(DimensionMode::Mapping)]);
        assert_eq!(join(&out), sql);
    }

    #[test]
    fn where_clause_propagates_into_ctes() {
        let sql = "SELECT sentiment(observed) FROM t WHERE region = 'west'";
        let tokens = tokenize(sql);
        let out = rewrite_dimensions(tokens, &[dim_entry(DimensionMode::Mapping)]);
        let result = join(&out);
        assert!(result.matches("WHERE region = 'west'").count() >= 2);
    }
}
