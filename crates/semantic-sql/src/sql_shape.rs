//! Lightweight SELECT-statement shape scanner shared by the dimension rewriter
//! (C6), the prewarm analyzer (C12), and query fingerprinting (C14).
//!
//! The host SQL engine's own parser is out of scope for this crate (§1); rather
//! than vendor a full dialect grammar, clause boundaries are found by scanning
//! the token stream for top-level keywords (honoring paren depth and
//! string/comment literals). This is the same trade-off the source project
//! makes for its regex-based `WHERE` extraction — best-effort, not a full
//! parser. See the dimension rewriter's module docs for the resulting limit
//! with subqueries that carry their own `GROUP BY`.

use crate::token::{tokenize, Token, TokenKind};

#[derive(Debug, Clone, Default)]
pub struct Cte {
    pub name: String,
    /// Body text, without the wrapping parens.
    pub body: String,
}

/// The clause-level shape of a single (outermost) `SELECT` statement.
#[derive(Debug, Clone, Default)]
pub struct SelectShape {
    pub ctes: Vec<Cte>,
    pub distinct: bool,
    pub select_list: String,
    pub from_clause: String,
    pub where_clause: Option<String>,
    pub group_by: Option<String>,
    pub having: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<String>,
}

impl SelectShape {
    /// Render `SELECT DISTINCT <select_list> FROM <from_clause> [WHERE ...]`,
    /// stripping `ORDER BY` / `LIMIT` / `GROUP BY` / `HAVING` and CTEs, used
    /// by the prewarm analyzer to build a bounded "distinct values" query.
    pub fn render_distinct_projection(&self, projection: &str, row_limit: u32) -> String {
        let mut out = String::new();
        if !self.ctes.is_empty() {
            out.push_str("WITH ");
            let parts: Vec<String> = self.ctes.iter().map(|c| format!("{} AS ({})", c.name, c.body)).collect();
            out.push_str(&parts.join(", "));
            out.push(' ');
        }
        out.push_str("SELECT DISTINCT ");
        out.push_str(projection.trim());
        out.push_str(" FROM ");
        out.push_str(self.from_clause.trim());
        if let Some(w) = &self.where_clause {
            out.push_str(" WHERE ");
            out.push_str(w.trim());
        }
        out.push_str(&format!(" LIMIT {row_limit}"));
        out
    }

    /// Names of CTEs actually referenced in `from_clause` — used to decide
    /// whether a cloned query needs to carry the `WITH` clause along.
    pub fn referenced_cte_names(&self) -> Vec<&str> {
        self.ctes.iter().map(|c| c.name.as_str()).filter(|name| self.from_clause.contains(name)).collect()
    }
}

pub(crate) fn skip_ws(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && tokens[i].is_noncode() {
        i += 1;
    }
    i
}

pub(crate) fn ident_at(tokens: &[Token], i: usize, word: &str) -> bool {
    tokens.get(i).is_some_and(|t| t.kind == TokenKind::Ident && t.lexeme.eq_ignore_ascii_case(word))
}

/// Scans for a (possibly multi-word) keyword sequence at paren depth 0, never
/// descending into string/comment tokens. Returns `(start, end)` token indices
/// of the first match at or after `from`.
pub(crate) fn find_top_level(tokens: &[Token], from: usize, words: &[&str]) -> Option<(usize, usize)> {
    let mut i = from;
    let mut depth = 0i32;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.kind == TokenKind::Punct && tok.lexeme == "(" {
            depth += 1;
            i += 1;
            continue;
        }
        if tok.kind == TokenKind::Punct && tok.lexeme == ")" {
            depth -= 1;
            i += 1;
            continue;
        }
        if depth == 0 && tok.kind == TokenKind::Ident {
            let mut j = i;
            let mut ok = true;
            for (wi, w) in words.iter().enumerate() {
                if wi > 0 {
                    j = skip_ws(tokens, j);
                }
                if !ident_at(tokens, j, w) {
                    ok = false;
                    break;
                }
                j += 1;
            }
            if ok {
                return Some((i, j));
            }
        }
        i += 1;
    }
    None
}

/// Finds the first of several candidate clause keywords at or after `from`,
/// returning the match with the smallest start position.
pub(crate) fn find_next_clause(tokens: &[Token], from: usize, candidates: &[&[&str]]) -> Option<(usize, usize)> {
    candidates.iter().filter_map(|words| find_top_level(tokens, from, words)).min_by_key(|(start, _)| *start)
}

pub(crate) fn text_between(tokens: &[Token], start: usize, end: usize) -> String {
    crate::token::join(&tokens[start..end]).trim().to_string()
}

/// If `tokens` begins (after whitespace) with a `WITH <cte-list>` prefix, returns
/// the token index where the top-level `SELECT` begins, just past the CTE list.
/// Used by the dimension rewriter to splice its own CTEs into an existing `WITH`
/// instead of nesting a second one.
pub(crate) fn with_list_end(tokens: &[Token]) -> Option<usize> {
    let mut i = skip_ws(tokens, 0);
    if !ident_at(tokens, i, "WITH") {
        return None;
    }
    i = skip_ws(tokens, i + 1);
    loop {
        if !tokens.get(i).is_some_and(|t| t.kind == TokenKind::Ident) {
            return None;
        }
        i = skip_ws(tokens, i + 1);
        if !ident_at(tokens, i, "AS") {
            return None;
        }
        i = skip_ws(tokens, i + 1);
        if !(tokens.get(i).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(")) {
            return None;
        }
        let open = i;
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
        i = skip_ws(tokens, close + 1);
        if tokens.get(i).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == ",") {
            i = skip_ws(tokens, i + 1);
            continue;
        }
        break;
    }
    Some(i)
}

/// Parses the outermost `[WITH ...] SELECT ...` shape out of `sql`. Returns
/// `None` if no top-level `SELECT` is found (e.g. the statement is not a
/// query, or parsing the CTE list failed).
pub fn parse_select(sql: &str) -> Option<SelectShape> {
    let tokens = tokenize(sql);
    let mut i = skip_ws(&tokens, 0);

    let mut ctes = Vec::new();
    if ident_at(&tokens, i, "WITH") {
        i = skip_ws(&tokens, i + 1);
        loop {
            let name_tok = tokens.get(i)?;
            if name_tok.kind != TokenKind::Ident {
                return None;
            }
            let name = name_tok.lexeme.clone();
            i = skip_ws(&tokens, i + 1);
            if !ident_at(&tokens, i, "AS") {
                return None;
            }
            i = skip_ws(&tokens, i + 1);
            if !(tokens.get(i).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == "(")) {
                return None;
            }
            let open = i;
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
            let body = text_between(&tokens, open + 1, close);
            ctes.push(Cte { name, body });
            i = skip_ws(&tokens, close + 1);
            if tokens.get(i).is_some_and(|t| t.kind == TokenKind::Punct && t.lexeme == ",") {
                i = skip_ws(&tokens, i + 1);
                continue;
            }
            break;
        }
    }

    if !ident_at(&tokens, i, "SELECT") {
        return None;
    }
    i = skip_ws(&tokens, i + 1);
    let distinct = if ident_at(&tokens, i, "DISTINCT") {
        i = skip_ws(&tokens, i + 1);
        true
    } else {
        false
    };
    let select_start = i;

    let (from_kw_start, from_kw_end) = find_top_level(&tokens, select_start, &["FROM"])?;
    let select_list = text_between(&tokens, select_start, from_kw_start);
    let from_start = skip_ws(&tokens, from_kw_end);

    let clause_candidates: &[&[&str]] = &[&["WHERE"], &["GROUP", "BY"], &["HAVING"], &["ORDER", "BY"], &["LIMIT"]];
    let next = find_next_clause(&tokens, from_start, clause_candidates);
    let from_end = next.map(|(s, _)| s).unwrap_or(tokens.len());
    let from_clause = text_between(&tokens, from_start, from_end);

    let mut shape = SelectShape {
        ctes,
        distinct,
        select_list,
        from_clause,
        where_clause: None,
        group_by: None,
        having: None,
        order_by: None,
        limit: None,
    };

    let named_candidates: &[(&str, &[&str])] =
        &[("WHERE", &["WHERE"]), ("GROUP BY", &["GROUP", "BY"]), ("HAVING", &["HAVING"]), ("ORDER BY", &["ORDER", "BY"]), ("LIMIT", &["LIMIT"])];

    let mut cursor = from_end;
    while cursor < tokens.len() {
        let found = named_candidates
            .iter()
            .filter_map(|(name, words)| find_top_level(&tokens, cursor, words).map(|(s, e)| (*name, s, e)))
            .filter(|(_, s, _)| *s == cursor)
            .next();
        let Some((kind, _, kw_end)) = found else { break };
        let body_start = skip_ws(&tokens, kw_end);
        let body_end = find_next_clause(&tokens, body_start, clause_candidates).map(|(s, _)| s).unwrap_or(tokens.len());
        let body = text_between(&tokens, body_start, body_end);
        match kind {
            "WHERE" => shape.where_clause = Some(body),
            "GROUP BY" => shape.group_by = Some(body),
            "HAVING" => shape.having = Some(body),
            "ORDER BY" => shape.order_by = Some(body),
            "LIMIT" => shape.limit = Some(body),
            _ => {}
        }
        cursor = body_end;
    }

    Some(shape)
}
