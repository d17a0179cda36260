use serde_json::Value;
use std::collections::HashMap;

use crate::data::Attribute;
use crate::error::CoerceError;

/// Lookup and mutation surface for named attributes.
pub trait Scope: Send + Sync {
    fn get_attr(&self, name: &str) -> Option<&Attribute>;

    /// Writes `value`, coercing it to the attribute's declared type when the
    /// attribute already exists.
    fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), CoerceError>;

    fn attr_names(&self) -> Vec<String>;
}

/// Plain map-backed scope, used for activity outputs and ad-hoc resolution.
#[derive(Debug, Clone, Default)]
pub struct SimpleScope {
    attrs: HashMap<String, Attribute>,
}

impl SimpleScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        let attrs = values
            .into_iter()
            .map(|(name, value)| (name.clone(), Attribute::any(name, value)))
            .collect();
        Self { attrs }
    }

    pub fn insert(&mut self, attr: Attribute) {
        self.attrs.insert(attr.name.clone(), attr);
    }
}

impl Scope for SimpleScope {
    fn get_attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name)
    }

    fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), CoerceError> {
        match self.attrs.get_mut(name) {
            Some(attr) => attr.set_value(value),
            None => {
                self.attrs.insert(name.to_string(), Attribute::any(name, value));
                Ok(())
            }
        }
    }

    fn attr_names(&self) -> Vec<String> {
        self.attrs.keys().cloned().collect()
    }
}
