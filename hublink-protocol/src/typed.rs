//! Typed value encoding.
//!
//! Payload fields that carry application values are prefixed with a type
//! letter: `S` string, `N` number (decimal text), `O` JSON document or
//! array, `T` true, `F` false, `L` null, `U` undefined. `U` decodes to an
//! explicit [`TypedValue::Undefined`] sentinel; record patches use it to
//! delete the value at a path, which JSON null cannot express.

use serde_json::Value;

use crate::error::ParseError;

/// A decoded typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Value(Value),
    Undefined,
}

impl TypedValue {
    /// The inner JSON value, if present.
    pub fn into_value(self) -> Option<Value> {
        match self {
            TypedValue::Value(v) => Some(v),
            TypedValue::Undefined => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, TypedValue::Undefined)
    }
}

impl From<Value> for TypedValue {
    fn from(value: Value) -> Self {
        TypedValue::Value(value)
    }
}

/// Encode a JSON value to its typed wire form.
pub fn to_typed(value: &Value) -> String {
    match value {
        Value::String(s) => format!("S{s}"),
        Value::Number(n) => format!("N{n}"),
        Value::Bool(true) => "T".to_string(),
        Value::Bool(false) => "F".to_string(),
        Value::Null => "L".to_string(),
        Value::Object(_) | Value::Array(_) => format!("O{value}"),
    }
}

/// Encode the undefined sentinel.
pub fn undefined() -> String {
    "U".to_string()
}

/// Decode a typed wire field.
pub fn from_typed(field: &str) -> Result<TypedValue, ParseError> {
    let mut chars = field.chars();
    let prefix = chars.next().ok_or(ParseError::EmptyTyped)?;
    let payload = chars.as_str();
    Ok(match prefix {
        'S' => TypedValue::Value(Value::String(payload.to_string())),
        'N' => {
            let number: serde_json::Number = serde_json::from_str(payload)
                .map_err(|_| ParseError::InvalidNumber(payload.to_string()))?;
            TypedValue::Value(Value::Number(number))
        }
        'O' => {
            let value: Value = serde_json::from_str(payload)
                .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
            TypedValue::Value(value)
        }
        'T' => TypedValue::Value(Value::Bool(true)),
        'F' => TypedValue::Value(Value::Bool(false)),
        'L' => TypedValue::Value(Value::Null),
        'U' => TypedValue::Undefined,
        other => return Err(ParseError::UnknownTypePrefix(other)),
    })
}
