//! Legacy clause-level passes: `SEMANTIC JOIN ... ON a ~ b [AS '...']` and
//! `GROUP BY MEANING(col)`.
//!
//! Both predate the phrase-driven infix rewriter (C7) and operate on whole
//! clauses rather than single expressions, so they run after pass A/B rather
//! than being folded into [`crate::rewrite::infix`]'s phrase table.

use crate::registry::FunctionEntry;
use crate::token::{Token, TokenKind};

/// `SEMANTIC JOIN <table> ON <a> ~ <b> [AS '<relationship>']` ->
/// `CROSS JOIN <table> WHERE semantic_match_pair(a, b, '<relationship>')`.
/// Default relationship is `'same entity'`, matching the bare `~` operator (C7).
pub fn rewrite_semantic_join(tokens: Vec<Token>) -> Vec<Token> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0usize;
    while i < tokens.len() {
        if let Some((end, rewritten)) = match_semantic_join(&tokens, i) {
            out.push(Token::other(rewritten));
            i = end;
            continue;
        }
        out.push(tokens[i].clone());
        i += 1;
    }
    out
}

/// `GROUP BY MEANING(col)` -> `GROUP BY semantic_meaning(col)`, gated on a
/// dimension entry literally named `semantic_meaning` being registered — an
/// ordinary column named `MEANING` used elsewhere must not be disturbed.
pub fn rewrite_group_by_meaning(tokens: Vec<Token>, entries: &[FunctionEntry]) -> Vec<Token> {
    if !entries.iter().any(|e| e.name.eq_ignore_ascii_case("semantic_meaning")) {
        return tokens;
    }

    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0usize;
    while i < tokens.len() {
        if let Some((end, rewritten)) = match_meaning_call(&tokens, i) {
            out.push(Token::other(rewritten));
            i = end;
            continue;
        }
        out.push(tokens[i].clone());
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

fn match_semantic_join(tokens: &[Token], start: usize) -> Option<(usize, String)> {
    if !is_ident_kw(tokens, start, "SEMANTIC") {
        return None;
    }
    let mut i = skip_ws(tokens, start + 1);
    if !is_ident_kw(tokens, i, "JOIN") {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    let (after_table, table) = match_dotted_ident(tokens, i)?;
    i = skip_ws(tokens, after_table);
    if !is_ident_kw(tokens, i, "ON") {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    let (after_a, a) = match_dotted_ident(tokens, i)?;
    i = skip_ws(tokens, after_a);
    let tilde = tokens.get(i)?;
    if tilde.kind != TokenKind::Punct || tilde.lexeme != "~" {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    let (after_b, b) = match_dotted_ident(tokens, i)?;
    let mut end = after_b;

    let mut relationship = "same entity".to_string();
    let after = skip_ws(tokens, after_b);
    if is_ident_kw(tokens, after, "AS") {
        let rel_start = skip_ws(tokens, after + 1);
        if let Some((rel_end, rel)) = match_string_literal(tokens, rel_start) {
            relationship = rel.trim_matches('\'').to_string();
            end = rel_end;
        }
    }

    Some((end, format!("CROSS JOIN {table} WHERE semantic_match_pair({a}, {b}, '{relationship}')")))
}

fn match_meaning_call(tokens: &[Token], start: usize) -> Option<(usize, String)> {
    if !is_ident_kw(tokens, start, "MEANING") {
        return None;
    }
    let open = skip_ws(tokens, start + 1);
    let open_tok = tokens.get(open)?;
    if open_tok.kind != TokenKind::Punct || open_tok.lexeme != "(" {
        return None;
    }

    let mut depth = 0i32;
    let mut close = open;
    for (offset, tok) in tokens[open..].iter().enumerate() {
        if tok.kind == TokenKind::Punct && tok.lexeme == "(" {
            depth += 1;
        } else if tok.kind == TokenKind::Punct && tok.lexeme == ")" {
            depth -= 1;
            if depth == 0 {
                close = open + offset;
                break;
            }
        }
    }
    if close == open {
        return None;
    }

    let inner: String = tokens[open + 1..close].iter().map(|t| t.lexeme.as_str()).collect();
    Some((close + 1, format!("semantic_meaning({inner})")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ReturnType, Shape};
    use crate::token::{join, tokenize};

    #[test]
    fn rewrites_semantic_join_default_relationship() {
        let tokens = tokenize("SELECT * FROM people SEMANTIC JOIN companies ON people.name ~ companies.name");
        let out = rewrite_semantic_join(tokens);
        assert_eq!(
            join(&out),
            "SELECT * FROM people CROSS JOIN companies WHERE semantic_match_pair(people.name, companies.name, 'same entity')"
        );
    }

    #[test]
    fn rewrites_semantic_join_explicit_relationship() {
        let tokens = tokenize("SELECT * FROM a SEMANTIC JOIN b ON a.x ~ b.y AS 'is a subsidiary of'");
        let out = rewrite_semantic_join(tokens);
        assert!(join(&out).contains("semantic_match_pair(a.x, b.y, 'is a subsidiary of')"));
    }

    #[test]
    fn leaves_unrelated_sql_untouched() {
        let tokens = tokenize("SELECT * FROM t JOIN u ON t.id = u.id");
        let out = rewrite_semantic_join(tokens);
        assert_eq!(join(&out), "SELECT * FROM t JOIN u ON t.id = u.id");
    }

    fn meaning_entry() -> FunctionEntry {
        FunctionEntry {
            name: "semantic_meaning".to_string(),
            cascade_path: "cascades/semantic_meaning.cascade.yaml".to_string(),
            shape: Shape::Dimension,
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

    #[test]
    fn rewrites_group_by_meaning_when_registered() {
        let tokens = tokenize("SELECT topics FROM t GROUP BY MEANING(topics)");
        let out = rewrite_group_by_meaning(tokens, &[meaning_entry()]);
        assert_eq!(join(&out), "SELECT topics FROM t GROUP BY semantic_meaning(topics)");
    }

    #[test]
    fn leaves_meaning_untouched_when_not_registered() {
        let tokens = tokenize("SELECT topics FROM t GROUP BY MEANING(topics)");
        let out = rewrite_group_by_meaning(tokens, &[]);
        assert_eq!(join(&out), "SELECT topics FROM t GROUP BY MEANING(topics)");
    }

    #[test]
    fn does_not_disturb_a_plain_column_named_meaning() {
        let tokens = tokenize("SELECT meaning FROM t GROUP BY meaning");
        let out = rewrite_group_by_meaning(tokens, &[meaning_entry()]);
        assert_eq!(join(&out), "SELECT meaning FROM t GROUP BY meaning");
    }
}
