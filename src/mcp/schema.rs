//! A small JSON-Schema subset validator.
//!
//! Supports `type`, `properties`, `required`, `additionalProperties`, `items`,
//! and `enum` — enough to validate tool input/output shapes without pulling
//! in a full schema crate. No remote `$ref` resolution.

use serde_json::Value;

/// Validate `instance` against `schema`. Returns a list of dotted-path error
/// messages; an empty list means the instance is valid.
pub fn validate(schema: &Value, instance: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_at("$", schema, instance, &mut errors);
    errors
}

fn validate_at(path: &str, schema: &Value, instance: &Value, errors: &mut Vec<String>) {
    let Some(schema_obj) = schema.as_object() else {
        return;
    };

    if let Some(expected_type) = schema_obj.get("type").and_then(|t| t.as_str()) {
        if !type_matches(expected_type, instance) {
            errors.push(format!(
                "{path}: expected type {expected_type}, got {}",
                type_name(instance)
            ));
            return;
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(instance) {
            errors.push(format!("{path}: value is not one of the allowed enum values"));
        }
    }

    match instance {
        Value::Object(instance_map) => {
            if let Some(required) = schema_obj.get("required").and_then(|r| r.as_array()) {
                for req in required {
                    if let Some(name) = req.as_str() {
                        if !instance_map.contains_key(name) {
                            errors.push(format!("{path}.{name}: missing required property"));
                        }
                    }
                }
            }

            let properties = schema_obj.get("properties").and_then(|p| p.as_object());
            if let Some(properties) = properties {
                for (key, value) in instance_map {
                    if let Some(prop_schema) = properties.get(key) {
                        validate_at(&format!("{path}.{key}"), prop_schema, value, errors);
                    }
                }
            }

            let additional_allowed = schema_obj
                .get("additionalProperties")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            if !additional_allowed {
                let known: std::collections::HashSet<&str> = properties
                    .map(|p| p.keys().map(|k| k.as_str()).collect())
                    .unwrap_or_default();
                for key in instance_map.keys() {
                    if !known.contains(key.as_str()) {
                        errors.push(format!("{path}.{key}: additional property not allowed"));
                    }
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema_obj.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_at(&format!("{path}[{i}]"), item_schema, item, errors);
                }
            }
        }
        _ => {}
    }
}

fn type_matches(expected: &str, instance: &Value) -> bool {
    match expected {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "integer" => instance.is_i64() || instance.is_u64(),
        "number" => instance.is_number(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        _ => true,
    }
}

fn type_name(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
