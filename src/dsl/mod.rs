pub mod builder;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

use crate::data::Attribute;

/// Serialized flow definition: the only wire format the engine accepts for a
/// compiled task graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionRep {
    pub name: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub explicit_reply: bool,
    #[serde(default)]
    pub metadata: MetadataRep,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    pub root_task: TaskRep,
    #[serde(default)]
    pub error_handler_task: Option<TaskRep>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetadataRep {
    #[serde(default)]
    pub input: Vec<Attribute>,
    #[serde(default)]
    pub output: Vec<Attribute>,
}

/// Ids may be written as strings or numbers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RepId {
    Number(i64),
    Text(String),
}

impl fmt::Display for RepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepId::Number(n) => write!(f, "{}", n),
            RepId::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for RepId {
    fn from(s: &str) -> Self {
        RepId::Text(s.to_string())
    }
}

impl From<i64> for RepId {
    fn from(n: i64) -> Self {
        RepId::Number(n)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRep {
    #[serde(default)]
    pub id: Option<RepId>,
    #[serde(rename = "type", default)]
    pub type_tag: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "ref", alias = "activityType")]
    pub activity_ref: Option<String>,
    #[serde(default)]
    pub settings: HashMap<String, Value>,
    #[serde(default, alias = "inputMappings")]
    pub input: Option<MappingsRep>,
    #[serde(default, alias = "outputMappings")]
    pub output: Option<MappingsRep>,
    #[serde(default)]
    pub tasks: Vec<TaskRep>,
    #[serde(default)]
    pub links: Vec<LinkRep>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkRep {
    #[serde(default)]
    pub id: Option<RepId>,
    #[serde(rename = "type", default)]
    pub link_type: Option<LinkTypeRep>,
    pub from: RepId,
    pub to: RepId,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Link type as a legacy numeric code (0..=3) or a name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum LinkTypeRep {
    Code(u8),
    Name(String),
}

/// Either `{ "target": value }` or the legacy `[{type, value, mapTo}]` list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MappingsRep {
    List(Vec<MappingRep>),
    Object(Map<String, Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MappingRep {
    #[serde(rename = "type")]
    pub map_type: MapTypeRep,
    pub value: Value,
    pub map_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MapTypeRep {
    Code(u8),
    Name(String),
}
