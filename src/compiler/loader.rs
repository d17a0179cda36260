use anyhow::{Context as AnyhowContext, Result};
use std::fs;
use std::path::Path;

use crate::dsl::DefinitionRep;

/// Reads a serialized definition. `.json` files are parsed as JSON,
/// everything else as YAML (a superset of JSON).
pub fn load_definition(path: impl AsRef<Path>) -> Result<DefinitionRep> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read definition file from {}", path.display()))?;

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to deserialize JSON content from {}", path.display()))
    } else {
        parse_definition(&content).with_context(|| format!("Failed to deserialize YAML content from {}", path.display()))
    }
}

pub fn parse_definition(content: &str) -> Result<DefinitionRep> {
    Ok(serde_yaml::from_str(content)?)
}
