use serde_json::{Map, Value};

use crate::data::{AttrType, Attribute};
use crate::dsl::{DefinitionRep, LinkRep, LinkTypeRep, MappingsRep, MetadataRep, RepId, TaskRep};

/// Fluent construction of a `DefinitionRep`, mostly for tests and embedding.
///
/// Tasks and links go to the root scope until `on_error` is called; after
/// that they go to the error handler scope.
pub struct DefinitionBuilder {
    name: String,
    model: Option<String>,
    explicit_reply: bool,
    metadata: MetadataRep,
    attributes: Vec<Attribute>,
    root: TaskRep,
    error_handler: Option<TaskRep>,
    in_error_handler: bool,
}

impl DefinitionBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            model: None,
            explicit_reply: false,
            metadata: MetadataRep::default(),
            attributes: Vec::new(),
            root: TaskRep {
                id: Some(RepId::from("root")),
                ..TaskRep::default()
            },
            error_handler: None,
            in_error_handler: false,
        }
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn explicit_reply(mut self) -> Self {
        self.explicit_reply = true;
        self
    }

    pub fn input(mut self, name: &str, attr_type: AttrType) -> Self {
        self.metadata.input.push(Attribute {
            name: name.to_string(),
            attr_type,
            value: Value::Null,
        });
        self
    }

    pub fn input_default(mut self, name: &str, attr_type: AttrType, value: impl Into<Value>) -> Self {
        self.metadata.input.push(Attribute {
            name: name.to_string(),
            attr_type,
            value: value.into(),
        });
        self
    }

    pub fn output(mut self, name: &str, attr_type: AttrType) -> Self {
        self.metadata.output.push(Attribute {
            name: name.to_string(),
            attr_type,
            value: Value::Null,
        });
        self
    }

    pub fn attribute(mut self, name: &str, attr_type: AttrType, value: impl Into<Value>) -> Self {
        self.attributes.push(Attribute {
            name: name.to_string(),
            attr_type,
            value: value.into(),
        });
        self
    }

    /// Switches subsequent tasks and links to the error handler scope.
    pub fn on_error(mut self) -> Self {
        self.error_handler.get_or_insert_with(|| TaskRep {
            id: Some(RepId::from("error_handler")),
            ..TaskRep::default()
        });
        self.in_error_handler = true;
        self
    }

    pub fn task(self, id: &str, activity_ref: &str) -> TaskBuilder {
        TaskBuilder::new(self, id, Some(activity_ref), None)
    }

    /// A task without an activity; evaluates to Done immediately.
    pub fn noop(self, id: &str) -> TaskBuilder {
        TaskBuilder::new(self, id, None, None)
    }

    pub fn iterator(self, id: &str, activity_ref: &str, iterate: impl Into<Value>) -> TaskBuilder {
        TaskBuilder::new(self, id, Some(activity_ref), Some("iterator")).setting("iterate", iterate)
    }

    pub fn connect(self, from: &str, to: &str) -> Self {
        self.push_link(from, to, None, None)
    }

    pub fn connect_if(self, from: &str, to: &str, condition: &str) -> Self {
        self.push_link(from, to, Some("expression"), Some(condition))
    }

    pub fn connect_error(self, from: &str, to: &str) -> Self {
        self.push_link(from, to, Some("error"), None)
    }

    fn push_link(mut self, from: &str, to: &str, link_type: Option<&str>, value: Option<&str>) -> Self {
        let link = LinkRep {
            id: None,
            link_type: link_type.map(|t| LinkTypeRep::Name(t.to_string())),
            from: RepId::from(from),
            to: RepId::from(to),
            value: value.map(str::to_string),
            name: None,
        };
        self.scope_mut().links.push(link);
        self
    }

    fn scope_mut(&mut self) -> &mut TaskRep {
        match (self.in_error_handler, self.error_handler.as_mut()) {
            (true, Some(handler)) => handler,
            _ => &mut self.root,
        }
    }

    pub fn build(self) -> DefinitionRep {
        DefinitionRep {
            name: self.name,
            model: self.model,
            explicit_reply: self.explicit_reply,
            metadata: self.metadata,
            attributes: self.attributes,
            root_task: self.root,
            error_handler_task: self.error_handler,
        }
    }
}

pub struct TaskBuilder {
    definition_builder: DefinitionBuilder,
    rep: TaskRep,
    input: Map<String, Value>,
    output: Map<String, Value>,
}

impl TaskBuilder {
    fn new(definition_builder: DefinitionBuilder, id: &str, activity_ref: Option<&str>, type_tag: Option<&str>) -> Self {
        Self {
            definition_builder,
            rep: TaskRep {
                id: Some(RepId::from(id)),
                type_tag: type_tag.map(str::to_string),
                activity_ref: activity_ref.map(str::to_string),
                ..TaskRep::default()
            },
            input: Map::new(),
            output: Map::new(),
        }
    }

    pub fn name(mut self, name: &str) -> Self {
        self.rep.name = Some(name.to_string());
        self
    }

    pub fn type_tag(mut self, type_tag: &str) -> Self {
        self.rep.type_tag = Some(type_tag.to_string());
        self
    }

    pub fn setting(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.rep.settings.insert(key.to_string(), value.into());
        self
    }

    /// Input mapping; a string starting with `=` is resolved at run time.
    pub fn input(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.input.insert(key.to_string(), value.into());
        self
    }

    /// Output mapping from the activity's outputs into the flow scope.
    pub fn output(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.output.insert(key.to_string(), value.into());
        self
    }

    /// Nested tasks and links, turning this task into a scope.
    pub fn children(mut self, tasks: Vec<TaskRep>, links: Vec<LinkRep>) -> Self {
        self.rep.tasks = tasks;
        self.rep.links = links;
        self
    }

    pub fn build(mut self) -> DefinitionBuilder {
        if !self.input.is_empty() {
            self.rep.input = Some(MappingsRep::Object(self.input));
        }
        if !self.output.is_empty() {
            self.rep.output = Some(MappingsRep::Object(self.output));
        }
        let mut builder = self.definition_builder;
        builder.scope_mut().tasks.push(self.rep);
        builder
    }
}
