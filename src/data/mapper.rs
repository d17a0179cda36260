use serde_json::Value;
use std::collections::HashMap;

use crate::data::resolver::Resolver;
use crate::data::scope::Scope;
use crate::error::ResolveError;

/// Source of one mapped value.
#[derive(Debug, Clone, PartialEq)]
pub enum MapSource {
    Literal(Value),
    /// Resolved through the `Resolver` at mapping time.
    Expression(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub target: String,
    pub source: MapSource,
}

/// Ordered set of mappings computing a task's inputs (from the flow scope)
/// or the flow's attributes (from an activity's outputs).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mapper {
    mappings: Vec<Mapping>,
}

impl Mapper {
    pub fn new(mappings: Vec<Mapping>) -> Self {
        Self { mappings }
    }

    /// Builds a mapper from the object form `{ "target": value }`, where a
    /// string starting with `=` is an expression and anything else a literal.
    pub fn from_object(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mappings = values
            .into_iter()
            .map(|(target, value)| {
                let source = match value {
                    Value::String(s) if s.starts_with('=') => MapSource::Expression(s[1..].trim().to_string()),
                    other => MapSource::Literal(other),
                };
                Mapping { target, source }
            })
            .collect();
        Self { mappings }
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    pub fn apply(&self, resolver: &dyn Resolver, scope: &dyn Scope) -> Result<HashMap<String, Value>, ResolveError> {
        let mut out = HashMap::with_capacity(self.mappings.len());
        for mapping in &self.mappings {
            let value = match &mapping.source {
                MapSource::Literal(v) => v.clone(),
                MapSource::Expression(expr) => resolver.resolve(expr, scope)?,
            };
            out.insert(mapping.target.clone(), value);
        }
        Ok(out)
    }
}
