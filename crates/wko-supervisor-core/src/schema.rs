// ABOUTME: Structural checks of a configuration document against an optional JSON schema.
// ABOUTME: Supports the keyword subset used by worker config schemas.

use crate::error::ConfigError;
use serde_json::Value;
use std::fmt;
use std::path::Path;

/// A loaded schema document.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    root: Value,
}

/// First place where a document departs from the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl Schema {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    /// Load a schema from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root = serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self { root })
    }

    pub fn check(&self, document: &Value) -> Result<(), SchemaViolation> {
        check_node(&self.root, document, "$")
    }
}

fn violation(path: &str, message: impl Into<String>) -> SchemaViolation {
    SchemaViolation {
        path: path.to_string(),
        message: message.into(),
    }
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => true,
    }
}

fn check_node(schema: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    let Some(schema) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(t) => vec![t.as_str()],
            Value::Array(types) => types.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| matches_type(t, value)) {
            return Err(violation(
                path,
                format!("{} is not of type {}", value, allowed.join(" or ")),
            ));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            return Err(violation(
                path,
                format!("{} is not one of the allowed values", value),
            ));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(minimum) = schema.get("minimum").and_then(Value::as_f64) {
            if number < minimum {
                return Err(violation(
                    path,
                    format!("{} is less than the minimum of {}", value, minimum),
                ));
            }
        }
        if let Some(maximum) = schema.get("maximum").and_then(Value::as_f64) {
            if number > maximum {
                return Err(violation(
                    path,
                    format!("{} is greater than the maximum of {}", value, maximum),
                ));
            }
        }
    }

    if let (Some(text), Some(min_len)) = (
        value.as_str(),
        schema.get("minLength").and_then(Value::as_u64),
    ) {
        if (text.chars().count() as u64) < min_len {
            return Err(violation(path, format!("{:?} is too short", text)));
        }
    }

    if let Some(object) = value.as_object() {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(key) {
                    return Err(violation(
                        path,
                        format!("'{}' is a required property", key),
                    ));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        for (key, child) in object {
            let child_path = format!("{}.{}", path, key);
            match properties.and_then(|p| p.get(key)) {
                Some(child_schema) => check_node(child_schema, child, &child_path)?,
                None => match schema.get("additionalProperties") {
                    Some(Value::Bool(false)) => {
                        return Err(violation(
                            path,
                            format!("additional property '{}' is not allowed", key),
                        ));
                    }
                    Some(extra @ Value::Object(_)) => check_node(extra, child, &child_path)?,
                    _ => {}
                },
            }
        }
    }

    if let (Some(items), Some(item_schema)) = (value.as_array(), schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            check_node(item_schema, item, &format!("{}[{}]", path, index))?;
        }
    }

    Ok(())
}
