use serde_json::{Map, Value};

use crate::errors::ValidationError;
use crate::tools::ToolSpec;

/// How to treat type mismatches on scalar string values.
///
/// The RPC surface always delivers arguments as strings or JSON, so it
/// validates leniently (`"5"` coerces to `5` for an integer field);
/// in-process callers get strict typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Coercion {
    #[default]
    Strict,
    Lenient,
}

/// Check a call's argument map against the tool's parameter spec.
///
/// Verifies that every required field is present and that each provided
/// field matches its declared type tag
/// (`string|integer|number|boolean|array|object`). Returns the normalized
/// argument map (with lenient coercions applied) or the first violation.
pub fn validate_arguments(
    spec: &ToolSpec,
    arguments: &Value,
    coercion: Coercion,
) -> Result<Value, ValidationError> {
    let args = match arguments {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(ValidationError::new(
                "arguments",
                "object",
                type_name(other),
                vec!["Pass arguments as a JSON object of parameter name to value".to_string()],
            ));
        }
    };

    let properties = spec
        .parameter
        .get("properties")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    if let Some(required) = spec.parameter.get("required").and_then(Value::as_array) {
        for entry in required {
            let Some(field) = entry.as_str() else { continue };
            if !args.contains_key(field) || args.get(field) == Some(&Value::Null) {
                let expected = properties
                    .get(field)
                    .and_then(|p| p.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("value");
                return Err(ValidationError::new(
                    field,
                    expected,
                    "missing",
                    vec![
                        format!("Provide the required field '{}'", field),
                        format!("See the '{}' tool schema for the full parameter list", spec.name),
                    ],
                ));
            }
        }
    }

    let mut normalized = Map::new();
    for (field, value) in args {
        let Some(declared) = properties
            .get(&field)
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
        else {
            // Undeclared fields pass through untouched; tools may accept
            // extensions the schema does not model.
            normalized.insert(field, value);
            continue;
        };
        let checked = check_type(&spec.name, &field, declared, value, coercion)?;
        normalized.insert(field, checked);
    }

    Ok(Value::Object(normalized))
}

fn check_type(
    tool: &str,
    field: &str,
    declared: &str,
    value: Value,
    coercion: Coercion,
) -> Result<Value, ValidationError> {
    let matches = match declared {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // Unknown type tags are treated as unconstrained.
        _ => true,
    };
    if matches {
        return Ok(value);
    }

    if coercion == Coercion::Lenient
        && let Value::String(raw) = &value
        && let Some(coerced) = coerce_scalar(declared, raw)
    {
        return Ok(coerced);
    }

    Err(ValidationError::new(
        field,
        declared,
        type_name(&value),
        vec![
            format!("Pass '{}' as a JSON {}", field, declared),
            format!("Check the '{}' tool schema via tools/list", tool),
        ],
    ))
}

/// Lenient coercion of scalar strings: `"5"` → 5, `"2.5"` → 2.5,
/// `"true"` → true. Arrays and objects are never coerced.
fn coerce_scalar(declared: &str, raw: &str) -> Option<Value> {
    match declared {
        "integer" => raw.trim().parse::<i64>().ok().map(Value::from),
        "number" => raw.trim().parse::<f64>().ok().map(Value::from),
        "boolean" => match raw.trim().to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                "integer"
            } else {
                "number"
            }
        }
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
