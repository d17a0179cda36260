use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

use crate::activities::ActivityRegistry;
use crate::behaviors::{BehaviorRegistry, Model, SIMPLE_MODEL};
use crate::data::Attribute;
use crate::data::mapper::{MapSource, Mapper, Mapping};
use crate::dsl::{DefinitionRep, LinkRep, LinkTypeRep, MapTypeRep, MappingRep, MappingsRep, RepId, TaskRep};
use crate::error::DefinitionError;
use crate::runtime::definition::{DEFAULT_TASK_TYPE, Definition, FlowMetadata, Link, LinkType, Task};

pub const ROOT_TASK_ID: &str = "root";
pub const ERROR_HANDLER_TASK_ID: &str = "error_handler";

/// Turns a `DefinitionRep` into an immutable `Definition`, resolving every
/// activity and task behavior up front so a bad flow never starts.
pub struct Compiler<'a> {
    activities: &'a ActivityRegistry,
    behaviors: &'a BehaviorRegistry,
    default_model: String,
}

struct TaskDraft<'r> {
    rep: &'r TaskRep,
    parent: Option<String>,
    children: Vec<String>,
    to_links: Vec<String>,
    from_links: Vec<String>,
}

/// Flat indices built while walking the nested representation.
#[derive(Default)]
struct Graph<'r> {
    tasks: BTreeMap<String, TaskDraft<'r>>,
    links: BTreeMap<String, Link>,
    link_order: Vec<String>,
}

impl<'a> Compiler<'a> {
    pub fn new(activities: &'a ActivityRegistry, behaviors: &'a BehaviorRegistry) -> Self {
        Self {
            activities,
            behaviors,
            default_model: SIMPLE_MODEL.to_string(),
        }
    }

    pub fn with_default_model(mut self, model: &str) -> Self {
        self.default_model = model.to_string();
        self
    }

    pub fn compile(&self, rep: &DefinitionRep) -> Result<Definition, DefinitionError> {
        let model_id = rep.model.clone().unwrap_or_else(|| self.default_model.clone());
        let model = self
            .behaviors
            .get(&model_id)
            .ok_or_else(|| DefinitionError::UnknownModel(model_id.clone()))?;

        // 1. Index tasks and links scope by scope
        let mut graph = Graph::default();
        let root_id = scope_id(&rep.root_task, ROOT_TASK_ID)?;
        graph.add_scope(&root_id, &rep.root_task)?;

        let handler_id = match &rep.error_handler_task {
            Some(handler) => {
                let id = scope_id(handler, ERROR_HANDLER_TASK_ID)?;
                graph.add_scope(&id, handler)?;
                Some(id)
            }
            None => None,
        };

        // 2. Wire and validate the graph
        graph.wire()?;
        graph.check_entry_points()?;
        graph.mark_loop_backs();

        // 3. Resolve activities, behaviors and mappings
        let mut explicit_reply = rep.explicit_reply;
        let mut tasks = BTreeMap::new();
        for (id, draft) in &graph.tasks {
            let task = self.build_task(id, draft, &model, &mut explicit_reply)?;
            tasks.insert(id.clone(), Arc::new(task));
        }

        let root_task = tasks
            .remove(&root_id)
            .ok_or_else(|| DefinitionError::InvalidId(root_id.clone()))?;
        let error_handler_task = match handler_id {
            Some(id) => Some(tasks.remove(&id).ok_or(DefinitionError::InvalidId(id))?),
            None => None,
        };

        let links = graph
            .links
            .into_iter()
            .map(|(id, link)| (id, Arc::new(link)))
            .collect();

        let attributes = build_attributes(&rep.attributes)?
            .into_iter()
            .map(|a| (a.name.clone(), a))
            .collect::<HashMap<_, _>>();
        let metadata = FlowMetadata {
            input: build_attributes(&rep.metadata.input)?,
            output: build_attributes(&rep.metadata.output)?,
        };

        debug!(flow = %rep.name, tasks = tasks.len(), model = %model_id, "Compiled definition");

        Ok(Definition {
            name: rep.name.clone(),
            model_id,
            explicit_reply,
            metadata,
            attributes,
            root_task,
            error_handler_task,
            tasks,
            links,
        })
    }

    fn build_task(
        &self,
        id: &str,
        draft: &TaskDraft<'_>,
        model: &Model,
        explicit_reply: &mut bool,
    ) -> Result<Task, DefinitionError> {
        let rep = draft.rep;
        let type_tag = rep
            .type_tag
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| DEFAULT_TASK_TYPE.to_string());
        let behavior = model
            .task_behavior(&type_tag)
            .cloned()
            .ok_or_else(|| DefinitionError::UnknownTaskType {
                task: id.to_string(),
                type_tag: type_tag.clone(),
                model: model.name().to_string(),
            })?;

        let activity_ref = rep.activity_ref.clone().filter(|r| !r.is_empty());
        let activity = match &activity_ref {
            Some(name) => {
                let activity = self
                    .activities
                    .get(name)
                    .ok_or_else(|| DefinitionError::UnknownActivity {
                        task: id.to_string(),
                        activity: name.clone(),
                    })?;
                activity
                    .validate(&rep.settings)
                    .map_err(|e| DefinitionError::InvalidSettings {
                        task: id.to_string(),
                        activity: name.clone(),
                        message: format!("{:#}", e),
                    })?;
                if activity.produces_reply() {
                    *explicit_reply = true;
                }
                Some(activity)
            }
            None => None,
        };

        Ok(Task {
            id: id.to_string(),
            type_tag,
            name: rep.name.clone().unwrap_or_else(|| id.to_string()),
            activity_ref,
            settings: rep.settings.clone(),
            parent: draft.parent.clone(),
            children: draft.children.clone(),
            to_links: draft.to_links.clone(),
            from_links: draft.from_links.clone(),
            input_mapper: build_mapper(id, rep.input.as_ref())?,
            output_mapper: build_mapper(id, rep.output.as_ref())?,
            activity,
            behavior,
        })
    }
}

impl<'r> Graph<'r> {
    /// Registers a top-level scope and everything nested in it.
    fn add_scope(&mut self, id: &str, rep: &'r TaskRep) -> Result<(), DefinitionError> {
        self.add_task(id, None, rep)?;
        self.walk(id, rep)
    }

    fn add_task(&mut self, id: &str, parent: Option<&str>, rep: &'r TaskRep) -> Result<(), DefinitionError> {
        if self.tasks.contains_key(id) {
            return Err(DefinitionError::DuplicateTask(id.to_string()));
        }
        if let Some(parent) = parent {
            if let Some(scope) = self.tasks.get_mut(parent) {
                scope.children.push(id.to_string());
            }
        }
        self.tasks.insert(
            id.to_string(),
            TaskDraft {
                rep,
                parent: parent.map(str::to_string),
                children: Vec::new(),
                to_links: Vec::new(),
                from_links: Vec::new(),
            },
        );
        Ok(())
    }

    /// Children first (depth first), then the links of this scope, which may
    /// only join two of its direct children.
    fn walk(&mut self, scope: &str, rep: &'r TaskRep) -> Result<(), DefinitionError> {
        for child in &rep.tasks {
            let id = match &child.id {
                Some(id) => rep_id(id)?,
                None => return Err(DefinitionError::InvalidId(format!("task without id in scope {}", scope))),
            };
            self.add_task(&id, Some(scope), child)?;
            self.walk(&id, child)?;
        }

        for (idx, link) in rep.links.iter().enumerate() {
            let link = self.build_link(scope, idx, link)?;
            if self.links.contains_key(&link.id) {
                return Err(DefinitionError::DuplicateLink(link.id));
            }
            self.link_order.push(link.id.clone());
            self.links.insert(link.id.clone(), link);
        }
        Ok(())
    }

    fn build_link(&self, scope: &str, idx: usize, rep: &LinkRep) -> Result<Link, DefinitionError> {
        let id = match &rep.id {
            Some(id) => rep_id(id)?,
            None => format!("{}:{}", scope, idx),
        };
        let from = rep_id(&rep.from)?;
        let to = rep_id(&rep.to)?;

        for end in [&from, &to] {
            match self.tasks.get(end) {
                None => {
                    return Err(DefinitionError::UnknownTask {
                        link: id,
                        task: end.clone(),
                    });
                }
                Some(draft) if draft.parent.as_deref() != Some(scope) => {
                    return Err(DefinitionError::CrossScopeLink { link: id });
                }
                Some(_) => {}
            }
        }

        let link_type = match &rep.link_type {
            None => LinkType::Dependency,
            Some(LinkTypeRep::Code(code)) => {
                LinkType::from_code(*code).ok_or_else(|| DefinitionError::InvalidLinkType(code.to_string()))?
            }
            Some(LinkTypeRep::Name(name)) => {
                LinkType::from_name(name).ok_or_else(|| DefinitionError::InvalidLinkType(name.clone()))?
            }
        };

        let value = rep.value.clone().unwrap_or_default();
        if link_type == LinkType::Expression && value.trim().is_empty() {
            return Err(DefinitionError::EmptyExpression { link: id });
        }

        Ok(Link {
            id,
            link_type,
            value,
            from,
            to,
            name: rep.name.clone(),
            loop_back: false,
        })
    }

    fn wire(&mut self) -> Result<(), DefinitionError> {
        for link_id in &self.link_order {
            let Some(link) = self.links.get(link_id) else {
                continue;
            };
            if let Some(from) = self.tasks.get_mut(&link.from) {
                from.to_links.push(link.id.clone());
            }
            if let Some(to) = self.tasks.get_mut(&link.to) {
                to.from_links.push(link.id.clone());
            }
        }

        for (id, draft) in &self.tasks {
            let error_links = draft
                .to_links
                .iter()
                .filter(|l| self.links.get(*l).is_some_and(|l| l.link_type == LinkType::Error))
                .count();
            if error_links > 1 {
                return Err(DefinitionError::MultipleErrorLinks { task: id.clone() });
            }
        }
        Ok(())
    }

    fn check_entry_points(&self) -> Result<(), DefinitionError> {
        for (id, draft) in &self.tasks {
            if draft.children.is_empty() {
                continue;
            }
            let has_entry = draft
                .children
                .iter()
                .any(|c| self.tasks.get(c).is_some_and(|t| t.from_links.is_empty()));
            if !has_entry {
                return Err(DefinitionError::NoEntryPoints(id.clone()));
            }
        }
        Ok(())
    }

    /// Depth-first search per scope, starting from the entry tasks in
    /// declaration order. Links reaching a task still on the stack close a
    /// cycle and are marked as loop-back links.
    fn mark_loop_backs(&mut self) {
        let mut visited: HashSet<String> = HashSet::new();
        let mut back_links = Vec::new();

        for draft in self.tasks.values() {
            if draft.children.is_empty() {
                continue;
            }
            let entries = draft
                .children
                .iter()
                .filter(|c| self.tasks.get(*c).is_some_and(|t| t.from_links.is_empty()));
            let starts: Vec<&String> = entries.chain(draft.children.iter()).collect();

            for start in starts {
                if !visited.insert(start.clone()) {
                    continue;
                }
                let mut on_stack: HashSet<String> = HashSet::from([start.clone()]);
                let mut stack: Vec<(String, usize)> = vec![(start.clone(), 0)];

                while let Some((node, idx)) = stack.last().cloned() {
                    let next = self.tasks.get(&node).and_then(|t| t.to_links.get(idx));
                    let Some(link_id) = next else {
                        on_stack.remove(&node);
                        stack.pop();
                        continue;
                    };
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let Some(link) = self.links.get(link_id) else {
                        continue;
                    };
                    if on_stack.contains(&link.to) {
                        back_links.push(link_id.clone());
                    } else if visited.insert(link.to.clone()) {
                        on_stack.insert(link.to.clone());
                        stack.push((link.to.clone(), 0));
                    }
                }
            }
        }

        for id in back_links {
            if let Some(link) = self.links.get_mut(&id) {
                link.loop_back = true;
            }
        }
    }
}

fn rep_id(id: &RepId) -> Result<String, DefinitionError> {
    match id {
        RepId::Number(n) => Ok(n.to_string()),
        RepId::Text(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Err(DefinitionError::InvalidId("empty id".to_string()));
            }
            Ok(s.to_string())
        }
    }
}

fn scope_id(rep: &TaskRep, default: &str) -> Result<String, DefinitionError> {
    match &rep.id {
        Some(id) => rep_id(id),
        None => Ok(default.to_string()),
    }
}

fn build_mapper(task: &str, rep: Option<&MappingsRep>) -> Result<Option<Mapper>, DefinitionError> {
    match rep {
        None => Ok(None),
        Some(MappingsRep::Object(values)) => Ok(Some(Mapper::from_object(values.clone()))),
        Some(MappingsRep::List(list)) => {
            let mappings = list
                .iter()
                .map(|m| build_mapping(task, m))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Some(Mapper::new(mappings)))
        }
    }
}

/// Legacy list entry: type 1 (assign) and 3 (expression) resolve their
/// value, type 2 (literal) copies it.
fn build_mapping(task: &str, rep: &MappingRep) -> Result<Mapping, DefinitionError> {
    let invalid = |message: String| DefinitionError::InvalidMapping {
        task: task.to_string(),
        message,
    };

    if rep.map_to.trim().is_empty() {
        return Err(invalid("mapping without target".to_string()));
    }

    let code = match &rep.map_type {
        MapTypeRep::Code(code) => *code,
        MapTypeRep::Name(name) => match name.to_ascii_lowercase().as_str() {
            "assign" => 1,
            "literal" => 2,
            "expression" | "expr" => 3,
            _ => 0,
        },
    };

    let source = match code {
        1 | 3 => match &rep.value {
            Value::String(s) => {
                let expr = s.strip_prefix('=').unwrap_or(s).trim();
                if expr.is_empty() {
                    return Err(invalid(format!("empty expression for {}", rep.map_to)));
                }
                MapSource::Expression(expr.to_string())
            }
            other => return Err(invalid(format!("expression for {} must be a string, got {}", rep.map_to, other))),
        },
        2 => MapSource::Literal(rep.value.clone()),
        _ => return Err(invalid(format!("unknown mapping type {:?} for {}", rep.map_type, rep.map_to))),
    };

    Ok(Mapping {
        target: rep.map_to.clone(),
        source,
    })
}

fn build_attributes(attrs: &[Attribute]) -> Result<Vec<Attribute>, DefinitionError> {
    attrs
        .iter()
        .map(|a| {
            Attribute::new(a.name.clone(), a.attr_type, a.value.clone()).map_err(|e| DefinitionError::InvalidAttribute {
                name: a.name.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}
