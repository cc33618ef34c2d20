//! Minimal re-implementation of Python's `json.dumps` default separators
//! (`", "` and `": "`) for the `__RVBBIT_SOURCE:...__` / `__RVBBIT_TAKES:...__`
//! markers, whose exact spacing the cascades downstream pattern-match on.

use serde_json::Value;

pub fn dumps(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(dumps).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Object(map) => {
            let parts: Vec<String> = map.iter().map(|(k, v)| format!("{}: {}", serde_json::to_string(k).unwrap_or_default(), dumps(v))).collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn matches_python_default_separators() {
        assert_eq!(dumps(&json!({"column": "col"})), "{\"column\": \"col\"}");
        assert_eq!(dumps(&json!(["a", "b"])), "[\"a\", \"b\"]");
    }
}
