//! Minimal JSON-schema checking for values crossing the model boundary:
//! tool-call arguments and structured model output.

use serde_json::Value;

/// Validate a value against a JSON schema.
/// Returns a list of validation error strings (empty if valid).
pub fn validate_params(params: &Value, schema: &Value) -> Vec<String> {
    let mut errors = Vec::new();
    validate_value(params, schema, schema, "", &mut errors);
    errors
}

/// Follow a local `#/definitions/X` (or `#/$defs/X`) reference.
fn resolve<'a>(schema: &'a Value, root: &'a Value) -> &'a Value {
    let Some(reference) = schema.get("$ref").and_then(|r| r.as_str()) else {
        return schema;
    };
    let name = reference
        .strip_prefix("#/definitions/")
        .map(|n| ("definitions", n))
        .or_else(|| reference.strip_prefix("#/$defs/").map(|n| ("$defs", n)));
    match name {
        Some((section, name)) => root
            .get(section)
            .and_then(|d| d.get(name))
            .unwrap_or(schema),
        None => schema,
    }
}

fn type_matches(val: &Value, expected: &str) -> bool {
    match expected {
        "object" => val.is_object(),
        "array" => val.is_array(),
        "string" => val.is_string(),
        "integer" => val.is_i64() || val.is_u64(),
        "number" => val.is_number(),
        "boolean" => val.is_boolean(),
        "null" => val.is_null(),
        _ => true,
    }
}

fn validate_value(val: &Value, schema: &Value, root: &Value, path: &str, errors: &mut Vec<String>) {
    let schema = resolve(schema, root);
    let display_path = if path.is_empty() { "root" } else { path };

    // schemars wraps described references in a single-element allOf
    if let Some(all) = schema.get("allOf").and_then(|a| a.as_array()) {
        for sub in all {
            validate_value(val, sub, root, path, errors);
        }
    }

    if let Some(any) = schema.get("anyOf").and_then(|a| a.as_array()) {
        let ok = any.iter().any(|sub| {
            let mut sub_errors = Vec::new();
            validate_value(val, sub, root, path, &mut sub_errors);
            sub_errors.is_empty()
        });
        if !ok {
            errors.push(format!("{display_path}: no alternative matched"));
            return;
        }
    }

    // Check type (single name or list of names)
    let type_ok = match schema.get("type") {
        Some(Value::String(t)) => Some((type_matches(val, t), t.clone())),
        Some(Value::Array(ts)) => {
            let names: Vec<&str> = ts.iter().filter_map(|t| t.as_str()).collect();
            Some((
                names.iter().any(|t| type_matches(val, t)),
                names.join("|"),
            ))
        }
        _ => None,
    };
    if let Some((false, expected_type)) = type_ok {
        errors.push(format!("{display_path}: expected type '{expected_type}'"));
        return;
    }

    // Check enum
    if let Some(allowed) = schema.get("enum").and_then(|e| e.as_array()) {
        if !allowed.contains(val) {
            errors.push(format!("{display_path}: value not in allowed enum"));
        }
    }

    // Numeric constraints
    if let Some(n) = val.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(|m| m.as_f64()) {
            if n < min {
                errors.push(format!("{display_path}: value {n} < minimum {min}"));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(|m| m.as_f64()) {
            if n > max {
                errors.push(format!("{display_path}: value {n} > maximum {max}"));
            }
        }
    }

    // String constraints
    if let Some(s) = val.as_str() {
        if let Some(min_len) = schema.get("minLength").and_then(|m| m.as_u64()) {
            if (s.chars().count() as u64) < min_len {
                errors.push(format!(
                    "{display_path}: string length {} < minLength {min_len}",
                    s.chars().count()
                ));
            }
        }
        if let Some(max_len) = schema.get("maxLength").and_then(|m| m.as_u64()) {
            if (s.chars().count() as u64) > max_len {
                errors.push(format!(
                    "{display_path}: string length {} > maxLength {max_len}",
                    s.chars().count()
                ));
            }
        }
    }

    // Object: check required fields and validate properties
    if let Some(obj) = val.as_object() {
        if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
            for req in required {
                if let Some(field) = req.as_str() {
                    if !obj.contains_key(field) {
                        let field_path = if path.is_empty() {
                            field.to_string()
                        } else {
                            format!("{path}.{field}")
                        };
                        errors.push(format!("{field_path}: required field missing"));
                    }
                }
            }
        }
        if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
            for (key, prop_schema) in props {
                if let Some(prop_val) = obj.get(key) {
                    let prop_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    validate_value(prop_val, prop_schema, root, &prop_path, errors);
                }
            }
        }
    }

    // Array: validate items
    if let Some(arr) = val.as_array() {
        if let Some(items_schema) = schema.get("items") {
            for (i, item) in arr.iter().enumerate() {
                let item_path = format!("{display_path}[{i}]");
                validate_value(item, items_schema, root, &item_path, errors);
            }
        }
    }
}
