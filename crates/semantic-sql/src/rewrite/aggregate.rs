//! Aggregate-sugar pass: rewrites calls to registered `Shape::Aggregate`
//! functions that have no `block_operator` (e.g. `SUMMARIZE`, `CLASSIFY`) into
//! DuckDB-executable `LIST(...)::VARCHAR` aggregation calls.
//!
//! The source this crate was distilled from left this transform only
//! implicitly specified (spec §10 notes it as underdocumented), so this pass
//! publishes an explicit contract: for a registered entry named `name`,
//!
//! ```text
//! name(col[, extra...]) -> semantic_{name}_impl(LIST(col)::VARCHAR[, extra...])
//! ```
//!
//! There's no true DuckDB aggregate UDF here — `LIST()` collects every row's
//! value for the group, the cast serializes that list to a JSON string, and
//! the `_impl` function is an ordinary scalar cascade-backed UDF (C11) that
//! receives the whole group at once.

use crate::registry::{FunctionEntry, Shape};
use crate::token::{Token, TokenKind};

pub fn rewrite_aggregates(tokens: Vec<Token>, entries: &[FunctionEntry]) -> Vec<Token> {
    let agg_entries: Vec<&FunctionEntry> = entries.iter().filter(|e| e.shape == Shape::Aggregate && e.block_operator.is_none()).collect();
    if agg_entries.is_empty() {
        return tokens;
    }

    let mut out = Vec::with_capacity(tokens.len());
    let mut i = 0usize;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.kind == TokenKind::Ident {
            if let Some(entry) = agg_entries.iter().find(|e| e.name.eq_ignore_ascii_case(&tok.lexeme)) {
                let after_name = skip_ws(&tokens, i + 1);
                if tokens.get(after_name).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(") {
                    if let Some((end, rewritten)) = rewrite_call(&tokens, after_name, entry) {
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

fn skip_ws(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && tokens[i].is_noncode() {
        i += 1;
    }
    i
}

fn rewrite_call(tokens: &[Token], open_paren_idx: usize, entry: &FunctionEntry) -> Option<(usize, String)> {
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
    if args.is_empty() {
        return None;
    }

    let mut call_args = vec![format!("LIST({})::VARCHAR", args[0].trim())];
    call_args.extend(args[1..].iter().map(|a| a.trim().to_string()));

    Some((close + 1, format!("semantic_{}_impl({})", entry.name, call_args.join(", "))))
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
