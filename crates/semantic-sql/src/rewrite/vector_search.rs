//! Vector search rewriter (C8): `VECTOR_SEARCH(...)` / `HYBRID_SEARCH(...)`
//! sugar into a call to an internal JSON-producing table function.
//!
//! Must run before pass A/B (see [`crate::rewrite::infix`]): its `t.col`
//! argument would otherwise be mis-parsed as an infix LHS by those passes.
//!
//! Published contract: `VECTOR_SEARCH('q', t.col, k[, opts...])` rewrites to
//!
//! ```text
//! (SELECT * FROM read_json_auto(vector_search_json_N('q', 't', k[, opts...]))
//!  WHERE metadata.column_name = 'col')
//! ```
//!
//! `N` is the arity of the synthesised call, counting the table name (not the
//! dotted `t.col` pair) as a single argument — so `N` equals the number of
//! arguments written at the call site. The dropped `col` half becomes the
//! `metadata.column_name` predicate instead of a positional argument.
//! `HYBRID_SEARCH` follows the same shape against `hybrid_search_json_N`.

use crate::token::{Token, TokenKind};

const FUNCTIONS: &[(&str, &str)] = &[("VECTOR_SEARCH", "vector_search_json"), ("HYBRID_SEARCH", "hybrid_search_json")];

pub fn rewrite_vector_search(tokens: Vec<Token>) -> Vec<Token> {
    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0usize;

    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.is_literal_like() {
            out.push(tok.clone());
            i += 1;
            continue;
        }

        if tok.kind == TokenKind::Ident {
            if let Some((_, target_fn)) = FUNCTIONS.iter().find(|(name, _)| tok.lexeme.eq_ignore_ascii_case(name)) {
                let after_name = skip_ws(&tokens, i + 1);
                if tokens.get(after_name).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(") {
                    if let Some((end, rewritten)) = rewrite_call(&tokens, after_name, target_fn) {
                        out.push(Token::other(rewritten));
                        i = end;
                        continue;
                    }
                }
            }
        }

        out.push(tok.clone());
        i += 1;
    }

    out
}

/// Cheap pre-check so [`crate::rewrite::pipeline`] can skip this pass entirely
/// on the common case of a query with no vector search calls.
pub fn has_vector_search_calls(tokens: &[Token]) -> bool {
    tokens.iter().any(|t| t.kind == TokenKind::Ident && FUNCTIONS.iter().any(|(name, _)| t.lexeme.eq_ignore_ascii_case(name)))
}

fn skip_ws(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && tokens[i].is_noncode() {
        i += 1;
    }
    i
}

fn rewrite_call(tokens: &[Token], open_paren_idx: usize, target_fn: &str) -> Option<(usize, String)> {
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

    let args = split_top_level_args(&tokens[open_paren_idx + 1..close]);
    if args.len() < 3 {
        return None;
    }

    let query = args[0].trim();
    let (table, column) = split_table_column(args[1].trim())?;
    let rest: Vec<&str> = args[2..].iter().map(|a| a.trim()).collect();

    let mut call_args = vec![query.to_string(), quote(&table)];
    call_args.extend(rest.iter().map(|s| s.to_string()));
    let arity = call_args.len();

    let rewritten = format!(
        "(SELECT * FROM read_json_auto({target_fn}_{arity}({})) WHERE metadata.column_name = {})",
        call_args.join(", "),
        quote(&column)
    );
    Some((close + 1, rewritten))
}

/// Splits a bare `table.column` reference (not a string literal) into its parts.
fn split_table_column(text: &str) -> Option<(String, String)> {
    let mut parts = text.rsplitn(2, '.');
    let column = parts.next()?.trim().to_string();
    let table = parts.next()?.trim().to_string();
    if table.is_empty() || column.is_empty() {
        return None;
    }
    Some((table, column))
}

fn quote(s: &str) -> String {
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
