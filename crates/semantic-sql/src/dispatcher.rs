//! Cascade UDF dispatcher (C11): the callback a registered semantic function
//! invokes at execution time.
//!
//! Flow per call (§4.11): resolve the function in the registry (unknown name
//! -> an error-shaped JSON string, never a panic) → consult the cache → on
//! miss, mint a session id and invoke the cascade through [`CascadeRunner`]
//! (an external collaborator — the cascade runtime itself is out of scope,
//! §1) → extract the useful payload out of whatever shape the cascade
//! returned → coerce it to the function's declared SQL type → write through
//! the cache → return.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::cache::SemanticCache;
use crate::caller_context;
use crate::registry::{FunctionEntry, Registry, ReturnType};
use crate::tracker::QueryTracker;

/// External collaborator: runs a cascade synchronously and returns its raw
/// result object (a `{lineage, history, result}`-shaped value, §4.11 step 5).
/// The cascade runtime is out of scope for this crate (§1).
pub trait CascadeRunner: Send + Sync {
    fn run(&self, cascade_path: &str, session_id: &str, args: &Map<String, Value>, caller_id: Option<&str>) -> Result<Value, String>;
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    cache: Arc<SemanticCache>,
    tracker: Arc<QueryTracker>,
    runner: Arc<dyn CascadeRunner>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, cache: Arc<SemanticCache>, tracker: Arc<QueryTracker>, runner: Arc<dyn CascadeRunner>) -> Self {
        Dispatcher { registry, cache, tracker, runner }
    }

    /// `positional_args` are the SQL call's arguments in declared order; any
    /// trailing args missing from the call fall back to the entry's declared
    /// default.
    pub fn dispatch(&self, name: &str, positional_args: &[Value]) -> Value {
        let Some(entry) = self.registry.lookup(name) else {
            return error_value(&format!("unknown function: {name}"));
        };

        let args = build_args_map(&entry, positional_args);
        let caller_id = caller_context::get_caller_id();

        if entry.cache_enabled {
            let lookup = self.cache.get(name, &args);
            if lookup.hit {
                if let Some(id) = &caller_id {
                    self.tracker.increment_cache_hit(id);
                }
                return lookup.result.map(|v| coerce(v, entry.returns)).unwrap_or(Value::Null);
            }
        }
        if let Some(id) = &caller_id {
            self.tracker.increment_cache_miss(id);
        }

        let nonce = Uuid::new_v4().simple().to_string();
        let session_id = format!("sql_fn_{name}_{nonce}");

        if let Some(id) = &caller_id {
            self.tracker.increment_llm_call(id);
        }

        let raw = match self.runner.run(&entry.cascade_path, &session_id, &args, caller_id.as_deref()) {
            Ok(v) => v,
            Err(e) => return error_value(&e),
        };

        let extracted = extract_cascade_output(&raw);
        let unwrapped = if entry.returns == ReturnType::Json { extracted } else { unwrap_single_value(extracted) };
        let coerced = coerce(unwrapped, entry.returns);

        if entry.cache_enabled {
            self.cache.set(name, &args, coerced.clone(), return_type_name(entry.returns), entry.cache_ttl_seconds.unwrap_or(0), &session_id, caller_id.as_deref().unwrap_or(""));
        }

        coerced
    }
}

fn error_value(message: &str) -> Value {
    Value::String(serde_json::json!({ "error": message }).to_string())
}

fn build_args_map(entry: &FunctionEntry, positional_args: &[Value]) -> Map<String, Value> {
    let mut map = Map::new();
    for (idx, spec) in entry.args.iter().enumerate() {
        let value = positional_args
            .get(idx)
            .cloned()
            .or_else(|| spec.default.as_ref().map(|d| Value::String(d.clone())))
            .unwrap_or(Value::Null);
        map.insert(spec.name.clone(), value);
    }
    map
}

pub fn return_type_name(returns: ReturnType) -> &'static str {
    match returns {
        ReturnType::Boolean => "BOOLEAN",
        ReturnType::Double => "DOUBLE",
        ReturnType::Integer => "INTEGER",
        ReturnType::Varchar => "VARCHAR",
        ReturnType::Json => "JSON",
    }
}

/// §4.11 step 5: unwrap the cascade's result envelope in priority order —
/// the last lineage step's output, else the last meaningful history message,
/// else a top-level `result`/`output` field, else the raw value itself.
/// String payloads then have markdown fences stripped and are JSON-parsed
/// when they look like a JSON literal.
pub fn extract_cascade_output(raw: &Value) -> Value {
    if let Some(lineage) = raw.get("lineage").and_then(Value::as_array) {
        if let Some(last) = lineage.last() {
            if let Some(output) = last.get("output") {
                return finish_extraction(unwrap_nested_result(output.clone()));
            }
        }
    }

    if let Some(history) = raw.get("history").and_then(Value::as_array) {
        for message in history.iter().rev() {
            let role = message.get("role").and_then(Value::as_str).unwrap_or("");
            if matches!(role, "system" | "cell_complete" | "structure") {
                continue;
            }
            if let Some(content_json) = message.get("content_json") {
                return finish_extraction(content_json.clone());
            }
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                if content.starts_with("Cell:") || content.starts_with("Cascade:") {
                    continue;
                }
                return finish_extraction(Value::String(content.to_string()));
            }
        }
    }

    if let Some(result) = raw.get("result") {
        return finish_extraction(result.clone());
    }
    if let Some(output) = raw.get("output") {
        return finish_extraction(output.clone());
    }

    finish_extraction(raw.clone())
}

fn unwrap_nested_result(value: Value) -> Value {
    if let Value::Object(map) = &value {
        if let Some(result) = map.get("result") {
            return result.clone();
        }
    }
    value
}

fn finish_extraction(value: Value) -> Value {
    let Value::String(text) = &value else { return value };
    let stripped = strip_markdown_fences(text);
    let trimmed = stripped.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str(trimmed) {
            return parsed;
        }
    }
    Value::String(stripped)
}

static FENCE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^```(?:[A-Za-z]*)\s*\n?(.*?)\n?```$").unwrap());

pub fn strip_markdown_fences(text: &str) -> String {
    let trimmed = text.trim();
    match FENCE_RE.captures(trimmed) {
        Some(caps) => caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_else(|| trimmed.to_string()),
        None => trimmed.to_string(),
    }
}

/// §4.11 step 6: unwrap a single-key `{"value": ...}` / `{"result": ...}` /
/// `{"output": ...}` envelope for scalar return types (JSON returns are left
/// as-is by the caller).
pub fn unwrap_single_value(value: Value) -> Value {
    if let Value::Object(map) = &value {
        if map.len() == 1 {
            for key in ["value", "result", "output"] {
                if let Some(inner) = map.get(key) {
                    return inner.clone();
                }
            }
        }
    }
    value
}

/// §4.11 step 7 coercion. `BOOLEAN`: case-insensitive `true`/`yes`/`1` ->
/// true, else falls back to the value's own truthiness. `DOUBLE`/`INTEGER`:
/// parse through `f64` (matching the source's `int(float(x))`), defaulting
/// to `0.0`/`0` on failure. `VARCHAR`: stringifies arrays/objects, else uses
/// the value as text. `JSON` passes through untouched.
pub fn coerce(value: Value, returns: ReturnType) -> Value {
    match returns {
        ReturnType::Json => value,
        ReturnType::Boolean => Value::Bool(coerce_bool(&value)),
        ReturnType::Double => Value::from(coerce_f64(&value)),
        ReturnType::Integer => Value::from(coerce_f64(&value) as i64),
        ReturnType::Varchar => Value::String(coerce_varchar(&value)),
    }
}

fn coerce_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1"),
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn coerce_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(b) => if *b { 1.0 } else { 0.0 },
        _ => 0.0,
    }
}

fn coerce_varchar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use crate::cache::SemanticCache;
    use crate::registry::{ArgSpec, Shape};
    use crate::tracker::{InMemoryQueryLogStore, QueryTracker};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn matches_entry() -> FunctionEntry {
        FunctionEntry {
            name: "semantic_matches".to_string(),
            cascade_path: "cascades/semantic_sql/matches.cascade.yaml".to_string(),
            shape: Shape::Scalar,
            returns: ReturnType::Boolean,
            args: vec![
                ArgSpec { name: "text".to_string(), sql_type: "VARCHAR".to_string(), default: None, is_dimension_source: false },
                ArgSpec { name: "description".to_string(), sql_type: "VARCHAR".to_string(), default: None, is_dimension_source: false },
            ],
            operators: vec![],
            cache_enabled: true,
            cache_ttl_seconds: None,
            block_operator: None,
            dimension_mode: None,
            dimension_extractor_fn: None,
            dimension_classifier_fn: None,
        }
    }

    struct FakeRunner {
        calls: AtomicUsize,
        response: Mutex<Value>,
    }

    impl FakeRunner {
        fn new(response: Value) -> Self {
            FakeRunner { calls: AtomicUsize::new(0), response: Mutex::new(response) }
        }
    }

    impl CascadeRunner for FakeRunner {
        fn run(&self, _cascade_path: &str, _session_id: &str, _args: &Map<String, Value>, _caller_id: Option<&str>) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.response.lock().unwrap().clone())
        }
    }

    fn build_dispatcher(runner: Arc<FakeRunner>) -> (Dispatcher, Arc<SemanticCache>) {
        let registry = Arc::new(Registry::from_entries([matches_entry()]));
        let cache = Arc::new(SemanticCache::new(None));
        let tracker = Arc::new(QueryTracker::new(Arc::new(InMemoryQueryLogStore::new())));
        (Dispatcher::new(registry, Arc::clone(&cache), tracker, runner), cache)
    }

    #[test]
    fn unknown_function_returns_error_json_string() {
        let runner = Arc::new(FakeRunner::new(json!({"result": "x"})));
        let (dispatcher, _cache) = build_dispatcher(runner);
        let out = dispatcher.dispatch("not_registered", &[]);
        match out {
            Value::String(s) => assert!(s.contains("\"error\"")),
            other => panic!("expected error string, got {other:?}"),
        }
    }

    #[test]
    fn cache_hit_skips_the_runner() {
        let runner = Arc::new(FakeRunner::new(json!({"result": "true"})));
        let (dispatcher, _cache) = build_dispatcher(Arc::clone(&runner));
        let args = [json!("eco"), json!("green things")];
        let first = dispatcher.dispatch("semantic_matches", &args);
        let second = dispatcher.dispatch("semantic_matches", &args);
        assert_eq!(first, second);
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn extracts_from_lineage_last_output() {
        let raw = json!({"lineage": [{"output": {"result": "eco-friendly"}}]});
        assert_eq!(extract_cascade_output(&raw), json!("eco-friendly"));
    }

    #[test]
    fn extracts_from_history_skipping_system_messages() {
        let raw = json!({
            "history": [
                {"role": "system", "content": "setup"},
                {"role": "assistant", "content": "Cell: intermediate"},
                {"role": "assistant", "content": "true"}
            ]
        });
        assert_eq!(extract_cascade_output(&raw), json!(true));
    }

    #[test]
    fn strips_fences_and_parses_json() {
        let text = "```json\n{\"score\": 0.9}\n```";
        assert_eq!(strip_markdown_fences(text), "{\"score\": 0.9}");
        assert_eq!(finish_extraction(Value::String(text.to_string())), json!({"score": 0.9}));
    }

    #[test]
    fn unwraps_single_value_envelope() {
        assert_eq!(unwrap_single_value(json!({"value": 42})), json!(42));
        assert_eq!(unwrap_single_value(json!({"a": 1, "b": 2})), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn coerces_boolean_from_string_variants() {
        assert_eq!(coerce(json!("yes"), ReturnType::Boolean), json!(true));
        assert_eq!(coerce(json!("No"), ReturnType::Boolean), json!(false));
        assert_eq!(coerce(json!("1"), ReturnType::Boolean), json!(true));
    }

    #[test]
    fn coerces_integer_through_float_parse() {
        assert_eq!(coerce(json!("3.9"), ReturnType::Integer), json!(3));
        assert_eq!(coerce(json!("not a number"), ReturnType::Integer), json!(0));
    }

    #[test]
    fn coerces_double_defaults_to_zero_on_failure() {
        assert_eq!(coerce(json!("nope"), ReturnType::Double), json!(0.0));
        assert_eq!(coerce(json!("2.5"), ReturnType::Double), json!(2.5));
    }

    #[test]
    fn coerces_varchar_stringifies_containers() {
        assert_eq!(coerce(json!([1, 2]), ReturnType::Varchar), json!("[1,2]"));
        assert_eq!(coerce(json!("already text"), ReturnType::Varchar), json!("already text"));
    }
}
