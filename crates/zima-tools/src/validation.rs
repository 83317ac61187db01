//! Argument validation against a tool's declared parameters.
//!
//! Runs before the handler so a malformed call fails fast with a message the
//! client can act on.

use serde_json::{Map, Value};
use zima_core::ToolDefinition;

/// Check `args` against the definition and return them with defaults filled
/// in. Unknown keys pass through untouched.
pub fn validate_arguments(definition: &ToolDefinition, args: Value) -> Result<Value, String> {
    let mut obj = match args {
        Value::Object(obj) => obj,
        Value::Null => Map::new(),
        other => {
            return Err(format!(
                "arguments must be a JSON object, got {}",
                json_kind(&other)
            ));
        }
    };

    for param in &definition.parameters {
        match obj.get(&param.name) {
            None | Some(Value::Null) => {
                if let Some(default) = &param.default {
                    obj.insert(param.name.clone(), default.clone());
                } else if param.required {
                    return Err(format!("{}: required parameter is missing", param.name));
                }
            }
            Some(value) => {
                if !param.param_type.accepts(value) {
                    return Err(format!(
                        "{}: expected {}, got {} ({})",
                        param.name,
                        param.param_type.as_str(),
                        json_kind(value),
                        preview(value)
                    ));
                }
                if !param.enum_values.is_empty() {
                    let allowed = value
                        .as_str()
                        .is_some_and(|s| param.enum_values.iter().any(|v| v == s));
                    if !allowed {
                        return Err(format!(
                            "{}: must be one of: {}",
                            param.name,
                            param.enum_values.join(", ")
                        ));
                    }
                }
            }
        }
    }
    Ok(Value::Object(obj))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn preview(value: &Value) -> String {
    value.to_string().chars().take(50).collect()
}
