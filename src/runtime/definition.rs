use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use crate::activities::Activity;
use crate::behaviors::TaskBehavior;
use crate::data::Attribute;
use crate::data::mapper::Mapper;

pub const DEFAULT_TASK_TYPE: &str = "basic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    Dependency,
    Expression,
    Label,
    Error,
}

impl LinkType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LinkType::Dependency),
            1 => Some(LinkType::Expression),
            2 => Some(LinkType::Label),
            3 => Some(LinkType::Error),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "dependency" | "default" | "" => Some(LinkType::Dependency),
            "expression" | "expr" => Some(LinkType::Expression),
            "label" => Some(LinkType::Label),
            "error" => Some(LinkType::Error),
            _ => None,
        }
    }
}

/// Graph edge. `from`/`to` are ids of tasks in the same Definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub id: String,
    pub link_type: LinkType,
    pub value: String,
    pub from: String,
    pub to: String,
    pub name: Option<String>,
    /// Closes a cycle; set by the compiler.
    pub loop_back: bool,
}

/// Graph node. Immutable once the owning Definition is built.
pub struct Task {
    pub id: String,
    pub type_tag: String,
    pub name: String,
    pub activity_ref: Option<String>,
    pub settings: HashMap<String, Value>,
    pub parent: Option<String>,
    pub children: Vec<String>,
    pub to_links: Vec<String>,
    pub from_links: Vec<String>,
    pub input_mapper: Option<Mapper>,
    pub output_mapper: Option<Mapper>,
    pub(crate) activity: Option<Arc<dyn Activity>>,
    pub(crate) behavior: Arc<dyn TaskBehavior>,
}

impl Task {
    pub fn activity(&self) -> Option<&Arc<dyn Activity>> {
        self.activity.as_ref()
    }

    pub fn behavior(&self) -> &Arc<dyn TaskBehavior> {
        &self.behavior
    }

    pub fn is_scope(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.settings.get(key)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("type_tag", &self.type_tag)
            .field("activity_ref", &self.activity_ref)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("to_links", &self.to_links)
            .field("from_links", &self.from_links)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowMetadata {
    pub input: Vec<Attribute>,
    pub output: Vec<Attribute>,
}

/// Compiled, immutable task graph shared by every instance of a flow.
#[derive(Debug)]
pub struct Definition {
    pub name: String,
    pub model_id: String,
    pub explicit_reply: bool,
    pub metadata: FlowMetadata,
    pub attributes: HashMap<String, Attribute>,
    pub root_task: Arc<Task>,
    pub error_handler_task: Option<Arc<Task>>,
    pub tasks: BTreeMap<String, Arc<Task>>,
    pub links: BTreeMap<String, Arc<Link>>,
}

impl Definition {
    /// Looks up any task, including the root and error handler scopes.
    pub fn task(&self, id: &str) -> Option<&Arc<Task>> {
        if self.root_task.id == id {
            return Some(&self.root_task);
        }
        if let Some(handler) = &self.error_handler_task {
            if handler.id == id {
                return Some(handler);
            }
        }
        self.tasks.get(id)
    }

    pub fn link(&self, id: &str) -> Option<&Arc<Link>> {
        self.links.get(id)
    }

    pub fn to_links<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = &'a Arc<Link>> + 'a {
        task.to_links.iter().filter_map(move |id| self.links.get(id))
    }

    pub fn from_links<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = &'a Arc<Link>> + 'a {
        task.from_links.iter().filter_map(move |id| self.links.get(id))
    }

    /// Children of `scope` with no incoming links, in declaration order.
    pub fn leading_tasks<'a>(&'a self, scope: &'a Task) -> impl Iterator<Item = &'a Arc<Task>> + 'a {
        scope
            .children
            .iter()
            .filter_map(move |id| self.tasks.get(id))
            .filter(|task| task.from_links.is_empty())
    }

    /// True for the root and error handler scopes, whose completion is the
    /// flow's completion.
    pub fn is_top_level_scope(&self, id: &str) -> bool {
        self.root_task.id == id || self.error_handler_task.as_ref().is_some_and(|h| h.id == id)
    }
}
