//! Block operator rewriter (C5): `SEMANTIC_CASE ... END`-shaped constructs.

use crate::registry::{BlockOperator, FunctionEntry, StructureNode};
use crate::token::{Token, TokenKind};
use std::collections::HashMap;

/// Run every registered block operator against `tokens` until no further match is
/// found (a rewrite can't introduce a new match for *this* pass, since block
/// operators don't nest across different names, but we loop defensively per spec).
pub fn rewrite_blocks(tokens: Vec<Token>, entries: &[FunctionEntry]) -> Vec<Token> {
    let mut current = tokens;
    loop {
        let mut changed = false;
        for entry in entries {
            let Some(block) = &entry.block_operator else { continue };
            if let Some(next) = try_rewrite_one(&current, entry, block) {
                current = next;
                changed = true;
                break;
            }
        }
        if !changed {
            return current;
        }
    }
}

fn try_rewrite_one(tokens: &[Token], entry: &FunctionEntry, block: &BlockOperator) -> Option<Vec<Token>> {
    let start_idx = find_bare_ident(tokens, 0, &block.start_keyword)?;
    let end_idx = find_matching_end(tokens, start_idx, block)?;

    let inner = &tokens[start_idx + 1..end_idx];
    let mut caps: HashMap<String, Vec<Capture>> = HashMap::new();
    let consumed = match_seq(&block.structure, inner, 0, &mut caps)?;
    if !only_noncode(&inner[consumed..]) {
        return None;
    }

    let call = synthesize_call(&entry.name, block, &caps);

    let mut out = Vec::with_capacity(tokens.len());
    out.extend_from_slice(&tokens[..start_idx]);
    out.push(Token::other(call));
    out.extend_from_slice(&tokens[end_idx + 1..]);
    Some(out)
}

fn only_noncode(tokens: &[Token]) -> bool {
    tokens.iter().all(|t| t.is_noncode())
}

/// Finds a bare (not-in-string/comment) identifier matching `keyword`, a possibly
/// multi-word phrase, starting search at `from`.
fn find_bare_ident(tokens: &[Token], from: usize, keyword: &str) -> Option<usize> {
    let words: Vec<&str> = keyword.split_whitespace().collect();
    let mut i = from;
    while i < tokens.len() {
        if tokens[i].kind == TokenKind::Ident && word_seq_matches_at(tokens, i, &words).is_some() {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn word_seq_matches_at(tokens: &[Token], start: usize, words: &[&str]) -> Option<usize> {
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

/// Finds the end keyword matching the start at `start_idx`, respecting nested
/// occurrences of the same start keyword.
fn find_matching_end(tokens: &[Token], start_idx: usize, block: &BlockOperator) -> Option<usize> {
    let mut depth = 1i32;
    let mut i = start_idx + 1;
    while i < tokens.len() {
        if tokens[i].kind == TokenKind::Ident {
            if let Some(_end) = word_seq_matches_at(tokens, i, &[&block.start_keyword]) {
                depth += 1;
            } else if let Some(_end) = word_seq_matches_at(tokens, i, &[&block.end_keyword]) {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

fn skip_ws(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && tokens[i].is_noncode() {
        i += 1;
    }
    i
}

/// A single captured value plus whether it came from a quoted (string-literal)
/// capture slot, so `synthesize_call` knows whether to re-wrap it as a SQL
/// string literal or emit it as a bare expression.
#[derive(Debug, Clone)]
struct Capture {
    text: String,
    quoted: bool,
}

fn match_seq(nodes: &[StructureNode], toks: &[Token], pos: usize, caps: &mut HashMap<String, Vec<Capture>>) -> Option<usize> {
    let mut p = pos;
    for node in nodes {
        p = match_node(node, toks, p, caps)?;
    }
    Some(p)
}

fn match_node(node: &StructureNode, toks: &[Token], pos: usize, caps: &mut HashMap<String, Vec<Capture>>) -> Option<usize> {
    match node {
        StructureNode::Keyword(kw) => {
            let p = skip_ws(toks, pos);
            let words: Vec<&str> = kw.split_whitespace().collect();
            word_seq_matches_at(toks, p, &words)
        }
        StructureNode::Capture { name, quoted } => match_capture(name, *quoted, toks, pos, caps),
        StructureNode::Sequence(inner) => match_seq(inner, toks, pos, caps),
        StructureNode::Repeat { min, pattern } => {
            let mut count = 0usize;
            let mut p = pos;
            loop {
                let mut trial = caps.clone();
                let try_pos = skip_ws(toks, p);
                match match_node(pattern, toks, try_pos, &mut trial) {
                    Some(new_pos) if new_pos > p => {
                        *caps = trial;
                        p = new_pos;
                        count += 1;
                    }
                    _ => break,
                }
            }
            if count >= *min { Some(p) } else { None }
        }
        StructureNode::Optional { pattern } => {
            let mut trial = caps.clone();
            let try_pos = skip_ws(toks, pos);
            match match_node(pattern, toks, try_pos, &mut trial) {
                Some(new_pos) => {
                    *caps = trial;
                    Some(new_pos)
                }
                None => Some(pos),
            }
        }
    }
}

fn match_capture(name: &str, quoted: bool, toks: &[Token], pos: usize, caps: &mut HashMap<String, Vec<Capture>>) -> Option<usize> {
    let p = skip_ws(toks, pos);
    let tok = toks.get(p)?;
    if quoted {
        if tok.kind != TokenKind::String {
            return None;
        }
        let content = unquote_single(&tok.lexeme);
        caps.entry(name.to_string()).or_default().push(Capture { text: content, quoted: true });
        Some(p + 1)
    } else {
        // A dotted-identifier expression: IDENT ('.' IDENT)*
        if tok.kind != TokenKind::Ident {
            return None;
        }
        let mut end = p + 1;
        loop {
            if end < toks.len() && toks[end].kind == TokenKind::Punct && toks[end].lexeme == "." {
                if end + 1 < toks.len() && toks[end + 1].kind == TokenKind::Ident {
                    end += 2;
                    continue;
                }
            }
            break;
        }
        let text: String = toks[p..end].iter().map(|t| t.lexeme.as_str()).collect();
        caps.entry(name.to_string()).or_default().push(Capture { text, quoted: false });
        Some(end)
    }
}

fn unquote_single(lexeme: &str) -> String {
    let inner = lexeme.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')).unwrap_or(lexeme);
    inner.replace("''", "'")
}

fn synthesize_call(fn_name: &str, block: &BlockOperator, caps: &HashMap<String, Vec<Capture>>) -> String {
    let mut args = Vec::with_capacity(block.output_args.len());
    for name in &block.output_args {
        let is_array = block.array_args.iter().any(|a| a == name);
        match caps.get(name) {
            None => args.push("NULL".to_string()),
            Some(values) if is_array => {
                let texts: Vec<&str> = values.iter().map(|c| c.text.as_str()).collect();
                let json = serde_json::to_string(&texts).unwrap_or_else(|_| "[]".to_string());
                args.push(quote_sql_string(&json));
            }
            Some(values) => {
                // Scalar capture: emit the single captured value in its original form.
                // Quoted captures are re-wrapped as SQL string literals; bare
                // expressions are emitted unquoted.
                let Some(value) = values.last() else {
                    args.push("NULL".to_string());
                    continue;
                };
                if value.quoted {
                    args.push(quote_sql_string(&value.text));
                } else {
                    args.push(value.text.clone());
                }
            }
        }
    }
    format!("{fn_name}({})", args.join(", "))
}

fn quote_sql_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ReturnType, Shape};
    use crate::token::tokenize;

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

    #[test]
    fn rewrites_semantic_case_block() {
        let sql = "SELECT SEMANTIC_CASE x WHEN SEMANTIC 'a' THEN 'p' WHEN SEMANTIC 'b' THEN 'q' ELSE 'r' END FROM t";
        let tokens = tokenize(sql);
        let out = rewrite_blocks(tokens, &[semantic_case_entry()]);
        let result = crate::token::join(&out);
        assert_eq!(result, "SELECT semantic_case(x, '[\"a\",\"b\"]', '[\"p\",\"q\"]', 'r') FROM t");
    }

    #[test]
    fn else_is_null_when_absent() {
        let sql = "SELECT SEMANTIC_CASE x WHEN SEMANTIC 'a' THEN 'p' END FROM t";
        let tokens = tokenize(sql);
        let out = rewrite_blocks(tokens, &[semantic_case_entry()]);
        let result = crate::token::join(&out);
        assert_eq!(result, "SELECT semantic_case(x, '[\"a\"]', '[\"p\"]', NULL) FROM t");
    }

    #[test]
    fn no_match_leaves_sql_untouched() {
        let sql = "SELECT * FROM t";
        let tokens = tokenize(sql);
        let out = rewrite_blocks(tokens, &[semantic_case_entry()]);
        assert_eq!(crate::token::join(&out), sql);
    }
}
