pub mod coerce;
pub mod mapper;
pub mod resolver;
pub mod scope;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::CoerceError;

/// Declared type of an attribute. Values are stored as JSON and coerced
/// to the declared type whenever they are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AttrType {
    #[default]
    Any,
    String,
    #[serde(alias = "int", alias = "long")]
    Integer,
    #[serde(alias = "float", alias = "double", alias = "number")]
    Float,
    #[serde(alias = "bool")]
    Boolean,
    Object,
    Array,
}

impl AttrType {
    pub fn coerce(&self, value: Value) -> Result<Value, CoerceError> {
        match self {
            AttrType::Any => Ok(value),
            AttrType::String => coerce::to_string(&value).map(Value::String),
            AttrType::Integer => coerce::to_integer(&value).map(Value::from),
            AttrType::Float => coerce::to_float(&value).map(Value::from),
            AttrType::Boolean => coerce::to_boolean(&value).map(Value::Bool),
            AttrType::Object => coerce::to_object(&value).map(Value::Object),
            AttrType::Array => coerce::to_array(&value).map(Value::Array),
        }
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrType::Any => "any",
            AttrType::String => "string",
            AttrType::Integer => "integer",
            AttrType::Float => "float",
            AttrType::Boolean => "boolean",
            AttrType::Object => "object",
            AttrType::Array => "array",
        };
        f.write_str(name)
    }
}

/// A named, typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type", default)]
    pub attr_type: AttrType,
    #[serde(default)]
    pub value: Value,
}

impl Attribute {
    /// Builds an attribute, coercing `value` to `attr_type`.
    pub fn new(name: impl Into<String>, attr_type: AttrType, value: Value) -> Result<Self, CoerceError> {
        let value = if value.is_null() { value } else { attr_type.coerce(value)? };
        Ok(Self {
            name: name.into(),
            attr_type,
            value,
        })
    }

    pub fn any(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            attr_type: AttrType::Any,
            value,
        }
    }

    pub fn set_value(&mut self, value: Value) -> Result<(), CoerceError> {
        self.value = if value.is_null() { value } else { self.attr_type.coerce(value)? };
        Ok(())
    }
}
