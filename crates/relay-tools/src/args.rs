//! Schema-driven argument checks run before a tool executes.
//!
//! Arguments parsed out of model text arrive as strings. Each property whose
//! schema declares `integer`, `number`, `boolean` or `string` is coerced to that
//! type, and every `required` property must be present and non-null.

use serde_json::{Map, Number, Value};

use relay_core::error::{RelayError, Result};

/// Coerce `args` to the property types in `schema` and check required keys.
///
/// Properties the schema does not describe are passed through untouched.
pub fn prepare_arguments(tool: &str, schema: &Value, mut args: Map<String, Value>) -> Result<Map<String, Value>> {
    let invalid = |message: String| RelayError::ToolValidation {
        tool: tool.to_string(),
        message,
    };

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args.iter_mut() {
            let Some(kind) = properties.get(key).and_then(|p| p.get("type")).and_then(Value::as_str) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            *value = coerce(value, kind).map_err(|e| invalid(format!("parameter '{key}': {e}")))?;
        }
    }

    let missing: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .filter(|name| args.get(*name).map_or(true, Value::is_null))
        .collect();
    if !missing.is_empty() {
        return Err(invalid(format!("missing required parameter(s): {}", missing.join(", "))));
    }

    Ok(args)
}

fn coerce(value: &Value, kind: &str) -> std::result::Result<Value, String> {
    match kind {
        "integer" => coerce_integer(value).map(Value::from),
        "number" => coerce_number(value),
        "boolean" => coerce_bool(value).map(Value::Bool),
        "string" => Ok(Value::String(coerce_string(value))),
        _ => Ok(value.clone()),
    }
}

pub fn coerce_integer(value: &Value) -> std::result::Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| format!("{n} is not an integer")),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("cannot parse {s:?} as integer")),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("cannot coerce {} to integer", type_name(other))),
    }
}

fn coerce_number(value: &Value) -> std::result::Result<Value, String> {
    let f = match value {
        Value::Number(_) => return Ok(value.clone()),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("cannot parse {s:?} as number"))?,
        other => return Err(format!("cannot coerce {} to number", type_name(other))),
    };
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("{f} is not a finite number"))
}

pub fn coerce_bool(value: &Value) -> std::result::Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" | "enabled" => Ok(true),
            "false" | "no" | "0" | "off" | "disabled" => Ok(false),
            _ => Err(format!("cannot parse {s:?} as boolean")),
        },
        other => Err(format!("cannot coerce {} to boolean", type_name(other))),
    }
}

fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
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
            "properties": {
                "count": {"type": "integer"},
                "ratio": {"type": "number"},
                "verbose": {"type": "boolean"},
                "label": {"type": "string"}
            },
            "required": ["count"]
        })
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn text_arguments_take_schema_types() {
        let out = prepare_arguments(
            "calc",
            &schema(),
            args(json!({"count": "42", "ratio": "0.5", "verbose": "yes", "label": 7, "extra": "x"})),
        )
        .unwrap();
        assert_eq!(out["count"], json!(42));
        assert_eq!(out["ratio"], json!(0.5));
        assert_eq!(out["verbose"], json!(true));
        assert_eq!(out["label"], json!("7"));
        assert_eq!(out["extra"], json!("x"));
    }

    #[test]
    fn missing_required_parameter_is_rejected() {
        let err = prepare_arguments("calc", &schema(), args(json!({"verbose": true}))).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Tool input validation failed: calc: missing required parameter(s): count"
        );

        let err = prepare_arguments("calc", &schema(), args(json!({"count": null}))).unwrap_err();
        assert!(err.to_string().contains("count"));
    }

    #[test]
    fn uncoercible_values_name_the_parameter() {
        let err = prepare_arguments("calc", &schema(), args(json!({"count": "many"}))).unwrap_err();
        assert!(err.to_string().contains("parameter 'count': cannot parse \"many\" as integer"));

        let err = prepare_arguments("calc", &schema(), args(json!({"count": 1, "verbose": "maybe"}))).unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn scalar_coercions() {
        assert_eq!(coerce_integer(&json!(3.0)), Ok(3));
        assert!(coerce_integer(&json!(3.5)).is_err());
        assert_eq!(coerce_integer(&json!(" -7 ")), Ok(-7));
        assert_eq!(coerce_bool(&json!("OFF")), Ok(false));
        assert_eq!(coerce_bool(&json!(0)), Ok(false));
    }

    #[test]
    fn schema_without_properties_passes_through() {
        let out = prepare_arguments("any", &json!({"type": "object"}), args(json!({"a": "1"}))).unwrap();
        assert_eq!(out["a"], json!("1"));
    }
}
