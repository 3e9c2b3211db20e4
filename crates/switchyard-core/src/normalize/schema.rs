use serde_json::{json, Map, Value};

/// Rewrite a JSON schema into the subset Gemini accepts.
///
/// Enums must be strings, arrays must declare `items`, and `required` may
/// only name declared properties. Applied recursively.
pub fn sanitize_gemini_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(obj) => Value::Object(sanitize_object(obj)),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_gemini_schema).collect()),
        other => other.clone(),
    }
}

fn sanitize_object(obj: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in obj {
        let value = match key.as_str() {
            "enum" => match value {
                Value::Array(values) => Value::Array(values.iter().map(enum_to_string).collect()),
                other => other.clone(),
            },
            "properties" => match value {
                Value::Object(props) => Value::Object(
                    props
                        .iter()
                        .map(|(name, prop)| (name.clone(), sanitize_gemini_schema(prop)))
                        .collect(),
                ),
                other => other.clone(),
            },
            _ => sanitize_gemini_schema(value),
        };
        out.insert(key.clone(), value);
    }

    if out.contains_key("enum") && matches!(type_name(&out), Some("integer" | "number")) {
        out.insert("type".into(), json!("string"));
    }

    if type_name(&out) == Some("array") && !out.contains_key("items") {
        out.insert("items".into(), json!({}));
    }

    if let Some(Value::Array(required)) = out.get("required") {
        let kept: Vec<Value> = match out.get("properties") {
            Some(Value::Object(props)) => required
                .iter()
                .filter(|r| r.as_str().is_some_and(|name| props.contains_key(name)))
                .cloned()
                .collect(),
            _ => Vec::new(),
        };
        if kept.is_empty() {
            out.remove("required");
        } else {
            out.insert("required".into(), Value::Array(kept));
        }
    }

    out
}

fn type_name(obj: &Map<String, Value>) -> Option<&str> {
    obj.get("type").and_then(Value::as_str)
}

fn enum_to_string(v: &Value) -> Value {
    match v {
        Value::String(_) => v.clone(),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        other => Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_enum_becomes_string() {
        let schema = json!({"type": "integer", "enum": [1, 2, 3]});
        assert_eq!(
            sanitize_gemini_schema(&schema),
            json!({"type": "string", "enum": ["1", "2", "3"]})
        );
    }

    #[test]
    fn test_nested_fixes() {
        let schema = json!({
            "type": "object",
            "properties": {
                "tags": {"type": "array"},
                "level": {"type": "number", "enum": [0.5, 1]},
                "nested": {
                    "type": "object",
                    "properties": {"a": {"type": "string"}},
                    "required": ["a", "b"]
                }
            },
            "required": ["tags", "missing"]
        });
        let out = sanitize_gemini_schema(&schema);
        assert_eq!(out["properties"]["tags"]["items"], json!({}));
        assert_eq!(out["properties"]["level"]["type"], "string");
        assert_eq!(out["properties"]["level"]["enum"], json!(["0.5", "1"]));
        assert_eq!(out["properties"]["nested"]["required"], json!(["a"]));
        assert_eq!(out["required"], json!(["tags"]));
    }

    #[test]
    fn test_dangling_required_removed() {
        let out = sanitize_gemini_schema(&json!({"type": "object", "required": ["x"]}));
        assert!(out.get("required").is_none());
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let schema = json!({
            "type": "object",
            "properties": {"list": {"type": "array", "items": {"type": "integer", "enum": [1]}}},
            "required": ["list", "nope"]
        });
        let once = sanitize_gemini_schema(&schema);
        assert_eq!(sanitize_gemini_schema(&once), once);
    }
}
