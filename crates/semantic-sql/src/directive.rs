//! Directive stripping (C4): peels a leading `BACKGROUND` or `ANALYZE '...'` prefix.

use crate::token::{Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Background,
    Analyze { prompt: String },
}

/// Token-aware detection. Never raises: if the leading tokens don't match a known
/// directive shape, the input is returned unchanged with `directive = None`.
pub fn strip_directive(tokens: &[Token]) -> (Vec<Token>, Option<Directive>) {
    let mut idx = skip_ws(tokens, 0);

    let Some(first) = tokens.get(idx) else {
        return (tokens.to_vec(), None);
    };
    if first.kind != TokenKind::Ident {
        return (tokens.to_vec(), None);
    }

    if first.lexeme.eq_ignore_ascii_case("BACKGROUND") {
        idx += 1;
        let rest = tokens[idx..].to_vec();
        return (trim_ws(&rest), Some(Directive::Background));
    }

    if first.lexeme.eq_ignore_ascii_case("ANALYZE") {
        let mut j = skip_ws(tokens, idx + 1);
        if let Some(tok) = tokens.get(j) {
            if tok.kind == TokenKind::String {
                let prompt = unquote(&tok.lexeme);
                j += 1;
                let rest = tokens[j..].to_vec();
                return (trim_ws(&rest), Some(Directive::Analyze { prompt }));
            }
        }
        // `ANALYZE` without a following string literal is not a directive — fall through.
        return (tokens.to_vec(), None);
    }

    (tokens.to_vec(), None)
}

fn skip_ws(tokens: &[Token], mut i: usize) -> usize {
    while i < tokens.len() && tokens[i].is_noncode() {
        i += 1;
    }
    i
}

fn trim_ws(tokens: &[Token]) -> Vec<Token> {
    let start = tokens.iter().position(|t| !t.is_noncode()).unwrap_or(tokens.len());
    tokens[start..].to_vec()
}

fn unquote(lexeme: &str) -> String {
    let inner = lexeme.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')).unwrap_or(lexeme);
    inner.replace("''", "'")
}
