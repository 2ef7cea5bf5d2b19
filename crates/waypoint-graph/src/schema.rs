//! Validation of node and tool payloads against a JSON Schema subset.
//!
//! Supported keywords: `type` (string or list), `required`, `properties`,
//! `additionalProperties: false`, `enum`, `items`, `minimum`, `maximum`,
//! `minLength`, `maxLength`, `minItems`, `maxItems`. Unknown keywords are
//! ignored.

use serde_json::Value;

use waypoint_core::error::{Result, WaypointError};

/// Validate `value`, returning a [`WaypointError::SchemaValidation`] naming `subject`.
pub fn validate(schema: &Value, value: &Value, subject: &str) -> Result<()> {
    check(schema, value, "$")
        .map_err(|message| WaypointError::SchemaValidation(format!("{subject}: {message}")))
}

fn check(schema: &Value, value: &Value, path: &str) -> std::result::Result<(), String> {
    let Some(schema) = schema.as_object() else {
        // `true` / `{}` / anything non-object accepts everything
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(ts) => ts.iter().filter_map(Value::as_str).collect(),
            _ => vec![],
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| type_matches(t, value)) {
            return Err(format!(
                "{path}: expected {}, got {}",
                allowed.join(" or "),
                type_name(value)
            ));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            return Err(format!("{path}: value {value} is not one of the allowed values"));
        }
    }

    match value {
        Value::Object(map) => {
            if let Some(Value::Array(required)) = schema.get("required") {
                for key in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(key) {
                        return Err(format!("{path}: missing required property '{key}'"));
                    }
                }
            }
            let properties = schema.get("properties").and_then(Value::as_object);
            if let Some(properties) = properties {
                for (key, sub) in properties {
                    if let Some(v) = map.get(key) {
                        check(sub, v, &format!("{path}.{key}"))?;
                    }
                }
            }
            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                for key in map.keys() {
                    if !properties.is_some_and(|p| p.contains_key(key)) {
                        return Err(format!("{path}: unexpected property '{key}'"));
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if (items.len() as u64) < min {
                    return Err(format!("{path}: expected at least {min} items"));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if items.len() as u64 > max {
                    return Err(format!("{path}: expected at most {max} items"));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{path}[{i}]"))?;
                }
            }
        }
        Value::String(s) => {
            let len = s.chars().count() as u64;
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if len < min {
                    return Err(format!("{path}: shorter than {min} characters"));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if len > max {
                    return Err(format!("{path}: longer than {max} characters"));
                }
            }
        }
        Value::Number(n) => {
            let n = n.as_f64().unwrap_or_default();
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    return Err(format!("{path}: {n} is below minimum {min}"));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    return Err(format!("{path}: {n} is above maximum {max}"));
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["path"],
            "properties": {
                "path": { "type": "string", "minLength": 1 },
                "mode": { "enum": ["read", "write"] },
                "lines": { "type": "array", "items": { "type": "integer", "minimum": 0 } }
            }
        })
    }

    #[test]
    fn test_valid_payload() {
        let value = json!({"path": "a.txt", "mode": "read", "lines": [1, 2]});
        assert!(validate(&schema(), &value, "input").is_ok());
    }

    #[test]
    fn test_missing_required() {
        let err = validate(&schema(), &json!({"mode": "read"}), "input").unwrap_err();
        assert!(matches!(err, WaypointError::SchemaValidation(_)));
        assert!(err.to_string().contains("missing required property 'path'"));
    }

    #[test]
    fn test_wrong_type_reports_path() {
        let err = validate(&schema(), &json!({"path": "a", "lines": [1, "x"]}), "input")
            .unwrap_err()
            .to_string();
        assert!(err.contains("$.lines[1]"), "{err}");
        assert!(err.contains("expected integer"), "{err}");
    }

    #[test]
    fn test_enum_and_bounds() {
        assert!(validate(&schema(), &json!({"path": "a", "mode": "delete"}), "x").is_err());
        assert!(validate(&schema(), &json!({"path": ""}), "x").is_err());
        assert!(validate(&schema(), &json!({"path": "a", "lines": [-1]}), "x").is_err());
    }

    #[test]
    fn test_additional_properties() {
        let strict = json!({"type": "object", "properties": {"a": {}}, "additionalProperties": false});
        assert!(validate(&strict, &json!({"a": 1}), "x").is_ok());
        assert!(validate(&strict, &json!({"a": 1, "b": 2}), "x").is_err());
    }

    #[test]
    fn test_type_union_and_empty_schema() {
        let nullable = json!({"type": ["string", "null"]});
        assert!(validate(&nullable, &json!(null), "x").is_ok());
        assert!(validate(&nullable, &json!(3), "x").is_err());
        assert!(validate(&json!({}), &json!({"anything": true}), "x").is_ok());
    }
}
