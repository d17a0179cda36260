//! Best-effort conversions between JSON values. Anything that cannot be
//! converted without guessing is an error.

use serde_json::{Map, Value};

use crate::error::CoerceError;

fn fail(value: &Value, target: &'static str) -> CoerceError {
    CoerceError {
        value: value.to_string(),
        target,
    }
}

pub fn to_string(value: &Value) -> Result<String, CoerceError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Ok(String::new()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).map_err(|_| fail(value, "string")),
    }
}

pub fn to_integer(value: &Value) -> Result<i64, CoerceError> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if let Some(f) = n.as_f64() {
                if f.fract() == 0.0 && f.is_finite() {
                    Ok(f as i64)
                } else {
                    Err(fail(value, "integer"))
                }
            } else {
                Err(fail(value, "integer"))
            }
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Ok(i);
            }
            match s.parse::<f64>() {
                Ok(f) if f.fract() == 0.0 && f.is_finite() => Ok(f as i64),
                _ => Err(fail(value, "integer")),
            }
        }
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::Null => Ok(0),
        _ => Err(fail(value, "integer")),
    }
}

pub fn to_float(value: &Value) -> Result<f64, CoerceError> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| fail(value, "float")),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| fail(value, "float")),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Null => Ok(0.0),
        _ => Err(fail(value, "float")),
    }
}

pub fn to_boolean(value: &Value) -> Result<bool, CoerceError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|f| f != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => Err(fail(value, "boolean")),
        },
        Value::Null => Ok(false),
        _ => Err(fail(value, "boolean")),
    }
}

pub fn to_object(value: &Value) -> Result<Map<String, Value>, CoerceError> {
    match value {
        Value::Object(map) => Ok(map.clone()),
        Value::Null => Ok(Map::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(map),
            _ => Err(fail(value, "object")),
        },
        _ => Err(fail(value, "object")),
    }
}

pub fn to_array(value: &Value) -> Result<Vec<Value>, CoerceError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::Null => Ok(Vec::new()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Array(items)) => Ok(items),
            _ => Ok(vec![value.clone()]),
        },
        other => Ok(vec![other.clone()]),
    }
}
