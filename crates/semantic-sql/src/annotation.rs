//! `-- @ ...` hint comment parsing (C2).

use serde_json::{Map, Value};

use crate::token::{tokenize, TokenKind};

/// Scans every `-- @ ...` comment in `sql` and returns the last `parallel: N`
/// hint seen, mirroring the accumulate-then-consume discipline successive
/// annotation comments follow elsewhere in the pipeline (§4.2). Used by the
/// prewarm sidecar gate (§4.13, testable property 8) on the *raw* query, since
/// the hint is a structural one the rewriter itself ignores.
pub fn scan_parallel_hint(sql: &str) -> Option<u32> {
    let mut parallel = None;
    for tok in tokenize(sql) {
        if tok.kind != TokenKind::CommentLine {
            continue;
        }
        if let Some(ann) = parse_annotation_comment(&tok.lexeme) {
            if ann.parallel.is_some() {
                parallel = ann.parallel;
            }
        }
    }
    parallel
}

/// Accumulates across successive `-- @ ...` comments until consumed by the next
/// semantic rewrite. `takes` and the prefix/threshold are cleared independently —
/// see [`Annotation::take_prompt_and_threshold`] and [`Annotation::take_takes`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Annotation {
    pub prompt_prefix: String,
    pub threshold: Option<f64>,
    pub takes: Option<Map<String, Value>>,
    /// Structural hints read by the sidecar, ignored by the rewriter.
    pub parallel: Option<u32>,
    pub batch_size: Option<u32>,
    pub parallel_scope: Option<String>,
}

impl Annotation {
    pub fn is_empty(&self) -> bool {
        self.prompt_prefix.is_empty()
            && self.threshold.is_none()
            && self.takes.is_none()
            && self.parallel.is_none()
            && self.batch_size.is_none()
            && self.parallel_scope.is_none()
    }

    /// Merge another annotation's fields into this one, as successive `-- @` comments do.
    pub fn merge(&mut self, other: Annotation) {
        self.prompt_prefix.push_str(&other.prompt_prefix);
        if other.threshold.is_some() {
            self.threshold = other.threshold;
        }
        if let Some(takes) = other.takes {
            self.takes.get_or_insert_with(Map::new).extend(takes);
        }
        if other.parallel.is_some() {
            self.parallel = other.parallel;
        }
        if other.batch_size.is_some() {
            self.batch_size = other.batch_size;
        }
        if other.parallel_scope.is_some() {
            self.parallel_scope = other.parallel_scope;
        }
    }
}

/// Parse the body of a `-- @ ...` comment. Returns `None` if the comment is not
/// an annotation comment (doesn't start with `-- @`).
pub fn parse_annotation_comment(comment_text: &str) -> Option<Annotation> {
    let trimmed = comment_text.trim_start_matches('-').trim();
    let rest = trimmed.strip_prefix('@')?.trim();
    if rest.is_empty() {
        return Some(Annotation::default());
    }

    let mut ann = Annotation::default();

    if let Some((key, value)) = split_key_value(rest) {
        match key {
            "threshold" => {
                if let Ok(v) = value.parse::<f64>() {
                    ann.threshold = Some(v);
                }
                return Some(ann);
            }
            "model" => {
                ann.prompt_prefix = format!("Use {value} - ");
                return Some(ann);
            }
            "prompt" => {
                ann.prompt_prefix = format!("{value} - ");
                return Some(ann);
            }
            "parallel" => {
                ann.parallel = value.parse::<u32>().ok();
                return Some(ann);
            }
            "batch_size" => {
                ann.batch_size = value.parse::<u32>().ok();
                return Some(ann);
            }
            "parallel_scope" => {
                ann.parallel_scope = Some(value.to_string());
                return Some(ann);
            }
            "models" => {
                let models = parse_bracket_list(value);
                let factor = models.len();
                let mut takes = Map::new();
                takes.insert(
                    "multi_model".to_string(),
                    Value::Array(models.into_iter().map(Value::String).collect()),
                );
                takes.insert("factor".to_string(), Value::from(factor));
                ann.takes = Some(takes);
                return Some(ann);
            }
            _ if key.starts_with("takes.") => {
                let sub = &key["takes.".len()..];
                let mut takes = Map::new();
                takes.insert(sub.to_string(), coerce_takes_value(sub, value));
                ann.takes = Some(takes);
                return Some(ann);
            }
            _ => {
                // Any other colon-bearing free text becomes a prompt prefix.
                ann.prompt_prefix = format!("{rest} - ");
                return Some(ann);
            }
        }
    }

    // Bare text (no colon) becomes a prompt prefix.
    ann.prompt_prefix = format!("{rest} - ");
    Some(ann)
}

fn split_key_value(rest: &str) -> Option<(&str, &str)> {
    let idx = rest.find(':')?;
    let key = rest[..idx].trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let value = rest[idx + 1..].trim();
    Some((key, value))
}

fn parse_bracket_list(value: &str) -> Vec<String> {
    let inner = value.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(|s| s.trim().trim_matches('"').trim_matches('\'').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn coerce_takes_value(sub_key: &str, value: &str) -> Value {
    match sub_key {
        "factor" | "max_parallel" | "reforge" => {
            value.parse::<i64>().map(Value::from).unwrap_or_else(|_| Value::String(value.to_string()))
        }
        "mutate" => value
            .parse::<bool>()
            .map(Value::Bool)
            .unwrap_or_else(|_| Value::String(value.to_string())),
        _ => Value::String(value.to_string()),
    }
}
