//! Infix / function rewriter (C7): `MEANS`, `ABOUT`, `RELEVANCE TO`, `~`, and
//! registered multi-word phrases (pass A), plus source-context injection into
//! semantic function calls (pass B).

use crate::annotation::{parse_annotation_comment, Annotation};
use crate::registry::{FunctionEntry, Registry, ReturnType};
use crate::token::{Token, TokenKind};
use std::collections::HashSet;

const ROW_EXPR: &str = "CAST((ROW_NUMBER() OVER () - 1) AS VARCHAR)";

/// Pass A: infix phrase desugaring plus annotation/takes/source injection into the
/// RHS string literal those rewrites produce.
pub fn rewrite_infix(tokens: Vec<Token>, registry: &Registry) -> Vec<Token> {
    let patterns = registry.operator_patterns();
    let mut out = Vec::with_capacity(tokens.len());
    let mut pending = Annotation::default();
    let mut i = 0usize;

    while i < tokens.len() {
        let tok = &tokens[i];

        if tok.kind == TokenKind::CommentLine {
            if let Some(ann) = parse_annotation_comment(&tok.lexeme) {
                pending.merge(ann);
            }
            out.push(tok.clone());
            i += 1;
            continue;
        }
        if tok.is_literal_like() {
            out.push(tok.clone());
            i += 1;
            continue;
        }

        if let Some((end, rewritten)) = match_order_by_relevance(&tokens, i) {
            out.push(Token::other(rewritten));
            i = end;
            continue;
        }

        if let Some((end, rewritten, consumes_rhs_literal)) = match_about(&tokens, i, pending.threshold) {
            let rewritten = if consumes_rhs_literal { apply_pending(&rewritten, &mut pending, None) } else { rewritten };
            out.push(Token::other(rewritten));
            i = end;
            continue;
        }

        if let Some((end, lhs, rhs, negate)) = match_phrase(&tokens, i, "MEANS", true) {
            let injected = apply_pending(&rhs, &mut pending, Some(&lhs));
            let call = format!("semantic_matches({}, {})", lhs.trim(), injected.trim());
            out.push(Token::other(if negate { format!("NOT {call}") } else { call }));
            i = end;
            continue;
        }

        if let Some((end, lhs, rhs)) = match_tilde(&tokens, i) {
            let injected = apply_pending(&rhs, &mut pending, Some(&lhs));
            let call = format!("semantic_match_pair({}, {}, 'same entity')", lhs.trim(), injected.trim());
            out.push(Token::other(call));
            i = end;
            continue;
        }

        if let Some((end, lhs, rhs)) = match_not_tilde(&tokens, i) {
            let injected = apply_pending(&rhs, &mut pending, Some(&lhs));
            let call = format!("semantic_match_pair({}, {}, 'same entity')", lhs.trim(), injected.trim());
            out.push(Token::other(format!("NOT {call}")));
            i = end;
            continue;
        }

        if let Some((end, lhs, rhs, negate, entry)) = match_registered_phrase(&tokens, i, &patterns) {
            let injected = apply_pending(&rhs, &mut pending, Some(&lhs));
            let call = format!("{}({}, {})", entry.name, lhs.trim(), injected.trim());
            let negatable = entry.returns == ReturnType::Boolean;
            out.push(Token::other(if negate && negatable { format!("NOT {call}") } else { call }));
            i = end;
            continue;
        }

        out.push(tok.clone());
        i += 1;
    }

    out
}

fn skip_ws(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && tokens[i].is_noncode() {
        i += 1;
    }
    i
}

fn is_ident_kw(tokens: &[Token], i: usize, word: &str) -> bool {
    tokens.get(i).is_some_and(|t| t.kind == TokenKind::Ident && t.lexeme.eq_ignore_ascii_case(word))
}

/// A dotted identifier chain: `a`, `a.b`, `t.col`.
fn match_dotted_ident(tokens: &[Token], start: usize) -> Option<(usize, String)> {
    let mut i = skip_ws(tokens, start);
    let tok = tokens.get(i)?;
    if tok.kind != TokenKind::Ident {
        return None;
    }
    let text_start = i;
    i += 1;
    loop {
        if tokens.get(i).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == ".")
            && tokens.get(i + 1).is_some_and(|t| t.kind == TokenKind::Ident)
        {
            i += 2;
        } else {
            break;
        }
    }
    let text = tokens[text_start..i].iter().map(|t| t.lexeme.as_str()).collect();
    Some((i, text))
}

fn match_string_literal(tokens: &[Token], start: usize) -> Option<(usize, String)> {
    let i = skip_ws(tokens, start);
    let tok = tokens.get(i)?;
    if tok.kind == TokenKind::String {
        Some((i + 1, tok.lexeme.clone()))
    } else {
        None
    }
}

/// `a MEANS 'x'` / `a NOT MEANS 'x'`.
fn match_phrase(tokens: &[Token], start: usize, phrase: &str, rhs_must_be_string: bool) -> Option<(usize, String, String, bool)> {
    let (after_lhs, lhs) = match_dotted_ident(tokens, start)?;
    let mut i = skip_ws(tokens, after_lhs);
    let mut negate = false;
    if is_ident_kw(tokens, i, "NOT") {
        negate = true;
        i = skip_ws(tokens, i + 1);
    }
    if !is_ident_kw(tokens, i, phrase) {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    if rhs_must_be_string {
        let (end, rhs) = match_string_literal(tokens, i)?;
        Some((end, lhs, rhs, negate))
    } else {
        let (end, rhs) = match_dotted_ident(tokens, i)?;
        Some((end, lhs, rhs, negate))
    }
}

/// `a ABOUT 'x'`, `a ABOUT 'x' > 0.7`, `a NOT ABOUT 'x'`. A pending `-- @ threshold:`
/// annotation overrides the default `0.5` comparator value when the SQL text
/// itself doesn't specify an explicit comparator.
fn match_about(tokens: &[Token], start: usize, pending_threshold: Option<f64>) -> Option<(usize, String, bool)> {
    let (after_lhs, lhs) = match_dotted_ident(tokens, start)?;
    let mut i = skip_ws(tokens, after_lhs);
    let mut negate = false;
    if is_ident_kw(tokens, i, "NOT") {
        negate = true;
        i = skip_ws(tokens, i + 1);
    }
    if !is_ident_kw(tokens, i, "ABOUT") {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    let (mut end, rhs) = match_string_literal(tokens, i)?;

    // Optional explicit comparator: `> 0.7`, `< 0.3`, etc.
    let mut explicit_comparator: Option<(&str, String)> = None;
    let after_rhs = skip_ws(tokens, end);
    if let Some(op_tok) = tokens.get(after_rhs) {
        if op_tok.kind == TokenKind::Punct && matches!(op_tok.lexeme.as_str(), ">" | "<" | ">=" | "<=") {
            let num_start = skip_ws(tokens, after_rhs + 1);
            if let Some(num_tok) = tokens.get(num_start) {
                if num_tok.kind == TokenKind::Ident && num_tok.lexeme.chars().next().is_some_and(|c| c.is_ascii_digit()) {
                    explicit_comparator = Some((op_tok.lexeme.as_str(), num_tok.lexeme.clone()));
                    end = num_start + 1;
                }
            }
        }
    }

    let default_threshold = pending_threshold.unwrap_or(0.5);
    let call = format!("semantic_score({}, {})", lhs.trim(), rhs.trim());
    let rewritten = match (negate, explicit_comparator) {
        (false, None) => format!("{call} > {default_threshold}"),
        (false, Some((op, n))) => format!("{call} {op} {n}"),
        (true, None) => format!("{call} <= {default_threshold}"),
        (true, Some((op, n))) => format!("{call} {} {n}", invert_comparator(op)),
    };
    Some((end, rewritten, true))
}

fn invert_comparator(op: &str) -> &'static str {
    match op {
        ">" => "<=",
        "<" => ">=",
        ">=" => "<",
        "<=" => ">",
        _ => op_fallback(),
    }
}

fn op_fallback() -> &'static str {
    "<="
}

/// `ORDER BY e [NOT] RELEVANCE TO 's' [ASC|DESC]`.
fn match_order_by_relevance(tokens: &[Token], start: usize) -> Option<(usize, String)> {
    if !is_ident_kw(tokens, start, "ORDER") {
        return None;
    }
    let mut i = skip_ws(tokens, start + 1);
    if !is_ident_kw(tokens, i, "BY") {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    let (after_expr, expr) = match_dotted_ident(tokens, i)?;
    i = skip_ws(tokens, after_expr);
    let mut negate = false;
    if is_ident_kw(tokens, i, "NOT") {
        negate = true;
        i = skip_ws(tokens, i + 1);
    }
    if !is_ident_kw(tokens, i, "RELEVANCE") {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    if !is_ident_kw(tokens, i, "TO") {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    let (mut end, rhs) = match_string_literal(tokens, i)?;

    let default_dir = if negate { "ASC" } else { "DESC" };
    let after_rhs = skip_ws(tokens, end);
    let explicit_dir = if is_ident_kw(tokens, after_rhs, "ASC") {
        end = after_rhs + 1;
        Some("ASC")
    } else if is_ident_kw(tokens, after_rhs, "DESC") {
        end = after_rhs + 1;
        Some("DESC")
    } else {
        None
    };
    let dir = explicit_dir.unwrap_or(default_dir);

    Some((end, format!("ORDER BY semantic_score({}, {}) {dir}", expr.trim(), rhs.trim())))
}

/// `a ~ b`.
fn match_tilde(tokens: &[Token], start: usize) -> Option<(usize, String, String)> {
    let (after_lhs, lhs) = match_dotted_ident(tokens, start)?;
    let i = skip_ws(tokens, after_lhs);
    let tok = tokens.get(i)?;
    if tok.kind != TokenKind::Punct || tok.lexeme != "~" {
        return None;
    }
    // Don't consume `!~` here; that's handled by `match_not_tilde`.
    let j = skip_ws(tokens, i + 1);
    let (end, rhs) = match_rhs_value(tokens, j)?;
    Some((end, lhs, rhs))
}

/// `a !~ b`.
fn match_not_tilde(tokens: &[Token], start: usize) -> Option<(usize, String, String)> {
    let (after_lhs, lhs) = match_dotted_ident(tokens, start)?;
    let i = skip_ws(tokens, after_lhs);
    let bang = tokens.get(i)?;
    let tilde = tokens.get(i + 1)?;
    if bang.kind != TokenKind::Punct || bang.lexeme != "!" || tilde.kind != TokenKind::Punct || tilde.lexeme != "~" {
        return None;
    }
    let j = skip_ws(tokens, i + 2);
    let (end, rhs) = match_rhs_value(tokens, j)?;
    Some((end, lhs, rhs))
}

fn match_rhs_value(tokens: &[Token], i: usize) -> Option<(usize, String)> {
    match_string_literal(tokens, i).or_else(|| match_dotted_ident(tokens, i))
}

/// Generic fallback for registry-declared multi-word phrases (longest-first).
/// Excludes the clause-level phrases handled by specialized matchers above.
fn match_registered_phrase<'a>(
    tokens: &[Token],
    start: usize,
    patterns: &'a [(String, FunctionEntry)],
) -> Option<(usize, String, String, bool, &'a FunctionEntry)> {
    const EXCLUDED: &[&str] = &["RELEVANCE TO", "SEMANTIC JOIN", "SEMANTIC DISTINCT", "MEANS", "ABOUT", "~"];
    let (after_lhs, lhs) = match_dotted_ident(tokens, start)?;
    let mut i = skip_ws(tokens, after_lhs);
    let mut negate = false;
    let negate_checkpoint = i;
    if is_ident_kw(tokens, i, "NOT") {
        negate = true;
        i = skip_ws(tokens, i + 1);
    }

    for (phrase, entry) in patterns {
        let phrase_upper = phrase.to_ascii_uppercase();
        if EXCLUDED.contains(&phrase_upper.as_str()) {
            continue;
        }
        let words: Vec<&str> = phrase.split_whitespace().collect();
        if let Some(end_of_phrase) = match_word_seq(tokens, i, &words) {
            let j = skip_ws(tokens, end_of_phrase);
            if let Some((end, rhs)) = match_rhs_value(tokens, j) {
                return Some((end, lhs.clone(), rhs, negate, entry));
            }
        }
    }
    let _ = negate_checkpoint;
    None
}

fn match_word_seq(tokens: &[Token], start: usize, words: &[&str]) -> Option<usize> {
    let mut i = start;
    for (wi, word) in words.iter().enumerate() {
        if wi > 0 {
            i = skip_ws(tokens, i);
        }
        let tok = tokens.get(i)?;
        if tok.kind != TokenKind::Ident || !tok.lexeme.eq_ignore_ascii_case(word) {
            return None;
        }
        i += 1;
    }
    Some(i)
}

/// Injects, in order: source marker, prompt prefix, takes marker — the source
/// marker leftmost, the prompt prefix adjacent to the literal text it
/// annotates. Only applies to a string-literal RHS (`rhs` includes its
/// surrounding quotes); a bare expression RHS is returned unchanged. Consumes
/// (clears) the pending annotation state.
fn apply_pending(rhs: &str, pending: &mut Annotation, lhs_column: Option<&str>) -> String {
    if !rhs.starts_with('\'') {
        return rhs.to_string();
    }
    let mut prefix = String::new();
    if let Some(col) = lhs_column {
        let marker = serde_json::json!({"column": col.trim(), "row": ROW_EXPR});
        prefix.push_str(&format!("__RVBBIT_SOURCE:{}__ ", crate::json_compat::dumps(&marker)));
    }
    if !pending.prompt_prefix.is_empty() {
        prefix.push_str(&std::mem::take(&mut pending.prompt_prefix));
    }
    if let Some(takes) = pending.takes.take() {
        let json = crate::json_compat::dumps(&serde_json::Value::Object(takes));
        prefix.push_str(&format!("__RVBBIT_TAKES:{json}__ "));
    }
    pending.threshold = None;
    if prefix.is_empty() {
        return rhs.to_string();
    }
    inject_prefix_into_string_literal(rhs, &prefix)
}

fn inject_prefix_into_string_literal(literal: &str, prefix: &str) -> String {
    let inner = literal.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')).unwrap_or(literal);
    format!("'{}{}'", prefix, inner)
}

/// Pass B: inject source context into calls to registered scalar semantic
/// functions that weren't produced via pass A (i.e. written directly by hand).
pub fn inject_source_context(tokens: Vec<Token>, registry: &Registry) -> Vec<Token> {
    let scalar_names: HashSet<String> = registry
        .all_entries()
        .values()
        .filter(|e| e.shape == crate::registry::Shape::Scalar)
        .map(|e| e.name.clone())
        .collect();
    if scalar_names.is_empty() {
        return tokens;
    }

    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0usize;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.kind == TokenKind::Ident && scalar_names.contains(&tok.lexeme.to_ascii_lowercase()) {
            let after_name = skip_ws(tokens.as_slice(), i + 1);
            if tokens.get(after_name).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(") {
                if let Some((end, rewritten_call)) = rewrite_call_with_source(&tokens, i, after_name) {
                    out.push(Token::other(rewritten_call));
                    i = end;
                    continue;
                }
            }
        }
        out.push(tok.clone());
        i += 1;
    }
    out
}

fn rewrite_call_with_source(tokens: &[Token], name_idx: usize, open_paren_idx: usize) -> Option<(usize, String)> {
    let mut depth = 0i32;
    let mut close = open_paren_idx;
    for (offset, tok) in tokens[open_paren_idx..].iter().enumerate() {
        if tok.kind == TokenKind::Punct && tok.lexeme == "(" {
            depth += 1;
        } else if tok.kind == TokenKind::Punct && tok.lexeme == ")" {
            depth -= 1;
            if depth == 0 {
                close = open_paren_idx + offset;
                break;
            }
        }
    }
    if close == open_paren_idx {
        return None;
    }

    let name = tokens[name_idx].lexeme.clone();
    let arg_tokens = &tokens[open_paren_idx + 1..close];
    let args = split_top_level_args(arg_tokens);
    if args.is_empty() {
        return None;
    }

    if args[0].contains("__RVBBIT_SOURCE:") {
        return None;
    }

    let column = args[0].trim().to_string();
    let marker = serde_json::json!({"column": column, "row": ROW_EXPR});
    let marker_text = format!("__RVBBIT_SOURCE:{}__ ", crate::json_compat::dumps(&marker));

    let has_string_arg = args.iter().any(|a| a.trim().starts_with('\''));
    let new_args: Vec<String> = if has_string_arg {
        args.iter()
            .map(|a| {
                let trimmed = a.trim();
                if trimmed.starts_with('\'') && !trimmed.contains("__RVBBIT_SOURCE:") {
                    inject_prefix_into_string_literal(trimmed, &marker_text)
                } else {
                    a.clone()
                }
            })
            .collect()
    } else if args.len() == 1 {
        let mut v = args.clone();
        v.push(quote_sql(&marker_text));
        v
    } else {
        args.clone()
    };

    Some((close + 1, format!("{name}({})", new_args.join(", "))))
}

fn quote_sql(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
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
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::token::{join, tokenize};

    fn empty_registry() -> Registry {
        Registry::new()
    }

    #[test]
    fn rewrites_means() {
        let tokens = tokenize("SELECT * FROM t WHERE col MEANS 'eco'");
        let out = rewrite_infix(tokens, &empty_registry());
        let rendered = join(&out);
        assert!(rendered.contains("semantic_matches(col, '__RVBBIT_SOURCE:{\"column\": \"col\", \"row\": "));
        assert!(rendered.ends_with("__ eco')"));
    }

    #[test]
    fn rewrites_not_means() {
        let tokens = tokenize("SELECT * FROM t WHERE col NOT MEANS 'eco'");
        let out = rewrite_infix(tokens, &empty_registry());
        assert!(join(&out).contains("NOT semantic_matches(col,"));
    }

    #[test]
    fn rewrites_about_default_threshold() {
        let tokens = tokenize("SELECT * FROM t WHERE a ABOUT 'x'");
        let out = rewrite_infix(tokens, &empty_registry());
        assert!(join(&out).contains("semantic_score(a, 'x') > 0.5"));
    }

    #[test]
    fn rewrites_about_explicit_threshold() {
        let tokens = tokenize("SELECT * FROM t WHERE a ABOUT 'x' > 0.7");
        let out = rewrite_infix(tokens, &empty_registry());
        assert!(join(&out).contains("semantic_score(a, 'x') > 0.7"));
    }

    #[test]
    fn rewrites_not_about_inverts_comparator() {
        let tokens = tokenize("SELECT * FROM t WHERE a NOT ABOUT 'x' > 0.7");
        let out = rewrite_infix(tokens, &empty_registry());
        assert!(join(&out).contains("semantic_score(a, 'x') <= 0.7"));
    }

    #[test]
    fn rewrites_order_by_relevance() {
        let tokens = tokenize("SELECT * FROM t ORDER BY a RELEVANCE TO 'z'");
        let out = rewrite_infix(tokens, &empty_registry());
        assert!(join(&out).contains("ORDER BY semantic_score(a, 'z') DESC"));
    }

    #[test]
    fn rewrites_not_relevance_defaults_asc() {
        let tokens = tokenize("SELECT * FROM t ORDER BY a NOT RELEVANCE TO 'z'");
        let out = rewrite_infix(tokens, &empty_registry());
        assert!(join(&out).contains("ORDER BY semantic_score(a, 'z') ASC"));
    }

    #[test]
    fn rewrites_tilde() {
        let tokens = tokenize("SELECT * FROM t WHERE a ~ b");
        let out = rewrite_infix(tokens, &empty_registry());
        assert!(join(&out).contains("semantic_match_pair(a, b, 'same entity')"));
    }

    #[test]
    fn rewrites_not_tilde() {
        let tokens = tokenize("SELECT * FROM t WHERE a !~ b");
        let out = rewrite_infix(tokens, &empty_registry());
        assert!(join(&out).contains("NOT semantic_match_pair(a, b, 'same entity')"));
    }

    #[test]
    fn threshold_annotation_overrides_default_comparator() {
        let tokens = tokenize("-- @ threshold: 0.8\nSELECT * FROM t WHERE a ABOUT 'x'");
        let out = rewrite_infix(tokens, &empty_registry());
        let rendered = join(&out);
        assert!(rendered.contains("semantic_score(a, 'x') > 0.8"));
    }

    #[test]
    fn threshold_annotation_does_not_leak_into_next_rewrite() {
        let tokens = tokenize("-- @ threshold: 0.8\nSELECT * FROM t WHERE a ABOUT 'x' OR b ABOUT 'y'");
        let out = rewrite_infix(tokens, &empty_registry());
        let rendered = join(&out);
        assert!(rendered.contains("semantic_score(a, 'x') > 0.8"));
        assert!(rendered.contains("semantic_score(b, 'y') > 0.5"));
    }

    #[test]
    fn explicit_comparator_wins_over_pending_threshold() {
        let tokens = tokenize("-- @ threshold: 0.8\nSELECT * FROM t WHERE a ABOUT 'x' > 0.9");
        let out = rewrite_infix(tokens, &empty_registry());
        let rendered = join(&out);
        assert!(rendered.contains("semantic_score(a, 'x') > 0.9"));
    }

    #[test]
    fn never_rewrites_inside_string_literal() {
        let tokens = tokenize("SELECT 'col MEANS x' FROM t");
        let out = rewrite_infix(tokens, &empty_registry());
        assert_eq!(join(&out), "SELECT 'col MEANS x' FROM t");
    }

    #[test]
    fn source_marker_precedes_model_annotation_prefix_which_precedes_text() {
        let tokens = tokenize("-- @ model: fast\nSELECT * FROM t WHERE a MEANS 'y'");
        let out = rewrite_infix(tokens, &empty_registry());
        let rendered = join(&out);
        let source_pos = rendered.find("__RVBBIT_SOURCE:").unwrap();
        let prompt_pos = rendered.find("Use fast - ").unwrap();
        assert!(source_pos < prompt_pos, "source marker must precede the prompt prefix");
        assert!(rendered[prompt_pos..].starts_with("Use fast - y"), "prompt prefix must be contiguous with the literal text");
    }
}
