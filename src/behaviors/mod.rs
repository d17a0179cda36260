use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::error::{RegistryError, TaskError};
use crate::runtime::context::TaskContext;
use crate::runtime::definition::{DEFAULT_TASK_TYPE, Definition, Task};
use crate::runtime::instance::Instance;
use crate::runtime::state::TaskEntry;

pub mod basic;
pub mod flow;
pub mod iterator;

pub use basic::BasicBehavior;
pub use flow::SimpleFlowBehavior;
pub use iterator::IteratorBehavior;

pub const SIMPLE_MODEL: &str = "simple";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnterResult {
    /// Some incoming link is still unresolved; stay Entered.
    NotReady,
    /// Ready to evaluate.
    Eval,
    /// Every incoming link resolved and none is True.
    Skip,
}

/// Outcome of a successful `eval`/`post_eval`. Failure is the `Err` side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStatus {
    Done,
    /// Evaluate again (iteration, retry).
    Repeat,
    /// Finishes out of band; `post_eval` follows.
    Wait,
}

/// Result of `done`/`skip`: successors to enqueue, or a request to let the
/// parent scope decide whether it is finished.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub notify_parent: bool,
    pub entries: Vec<TaskEntry>,
}

impl Completion {
    pub fn notify_parent() -> Self {
        Self {
            notify_parent: true,
            entries: Vec::new(),
        }
    }

    pub fn enqueue(entries: Vec<TaskEntry>) -> Self {
        Self {
            notify_parent: false,
            entries,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ErrorOutcome {
    /// Recovered through an error link; continue with these entries.
    Handled(Vec<TaskEntry>),
    Unhandled,
}

/// Per-task-type state machine driven by the execution loop.
#[async_trait]
pub trait TaskBehavior: Send + Sync + Debug {
    fn enter(&self, ctx: &mut TaskContext<'_>) -> EnterResult;

    /// Only called when the task is Ready. On `Err` the task is Failed and
    /// the error goes to `error`.
    async fn eval(&self, ctx: &mut TaskContext<'_>) -> Result<EvalStatus, TaskError>;

    /// Called once a Waiting task's work signals completion.
    async fn post_eval(&self, ctx: &mut TaskContext<'_>, data: Value) -> Result<EvalStatus, TaskError>;

    fn done(&self, ctx: &mut TaskContext<'_>) -> Completion;

    fn skip(&self, ctx: &mut TaskContext<'_>) -> Completion;

    fn error(&self, ctx: &mut TaskContext<'_>, err: &TaskError) -> ErrorOutcome;
}

/// Flow-level behavior: where execution starts and when it is finished.
pub trait FlowBehavior: Send + Sync + Debug {
    fn start(&self, definition: &Definition) -> Vec<TaskEntry>;

    /// Entries needed to continue a previously suspended instance.
    fn resume(&self, definition: &Definition, instance: &Instance) -> Vec<TaskEntry>;

    fn start_error_handler(&self, definition: &Definition) -> Vec<TaskEntry>;

    /// Whether every task of `scope` that was reached is finished.
    fn tasks_done(&self, definition: &Definition, instance: &Instance, scope: &Task) -> bool;
}

/// A named execution model: one flow behavior plus task behaviors keyed by
/// task type tag.
#[derive(Debug)]
pub struct Model {
    name: String,
    flow_behavior: Arc<dyn FlowBehavior>,
    task_behaviors: HashMap<String, Arc<dyn TaskBehavior>>,
}

impl Model {
    pub fn new(name: &str, flow_behavior: Arc<dyn FlowBehavior>) -> Self {
        Self {
            name: name.to_string(),
            flow_behavior,
            task_behaviors: HashMap::new(),
        }
    }

    /// The "simple" model: basic and iterator task behaviors.
    pub fn simple() -> Self {
        let basic = Arc::new(BasicBehavior);
        let mut model = Self::new(SIMPLE_MODEL, Arc::new(SimpleFlowBehavior));
        model.task_behaviors.insert(DEFAULT_TASK_TYPE.to_string(), basic.clone());
        model
            .task_behaviors
            .insert(iterator::ITERATOR_TYPE.to_string(), Arc::new(IteratorBehavior::new(basic)));
        model
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register_task_behavior(&mut self, type_tag: &str, behavior: Arc<dyn TaskBehavior>) -> Result<(), RegistryError> {
        if self.task_behaviors.contains_key(type_tag) {
            return Err(RegistryError::DuplicateTaskBehavior {
                model: self.name.clone(),
                type_tag: type_tag.to_string(),
            });
        }
        self.task_behaviors.insert(type_tag.to_string(), behavior);
        Ok(())
    }

    pub fn flow_behavior(&self) -> &Arc<dyn FlowBehavior> {
        &self.flow_behavior
    }

    pub fn task_behavior(&self, type_tag: &str) -> Option<&Arc<dyn TaskBehavior>> {
        self.task_behaviors.get(type_tag)
    }
}

/// Catalogue of models, built once at startup and shared by reference.
#[derive(Debug, Default)]
pub struct BehaviorRegistry {
    models: HashMap<String, Arc<Model>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the "simple" model.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.models.insert(SIMPLE_MODEL.to_string(), Arc::new(Model::simple()));
        registry
    }

    pub fn register(&mut self, model: Model) -> Result<(), RegistryError> {
        if self.models.contains_key(model.name()) {
            return Err(RegistryError::DuplicateModel(model.name().to_string()));
        }
        self.models.insert(model.name().to_string(), Arc::new(model));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Model>> {
        self.models.get(name).cloned()
    }
}
