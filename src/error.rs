use std::time::Duration;
use thiserror::Error;

/// Raised while turning a `DefinitionRep` into a `Definition`.
/// A flow that fails here never produces an instance.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("duplicate link id: {0}")]
    DuplicateLink(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("link {link} references unknown task {task}")]
    UnknownTask { link: String, task: String },

    #[error("link {link} connects tasks of different scopes")]
    CrossScopeLink { link: String },

    #[error("invalid link type: {0}")]
    InvalidLinkType(String),

    #[error("expression link {link} has no expression")]
    EmptyExpression { link: String },

    #[error("task {task} has more than one error link")]
    MultipleErrorLinks { task: String },

    #[error("task {task} references unknown activity {activity}")]
    UnknownActivity { task: String, activity: String },

    #[error("invalid settings for activity {activity} on task {task}: {message}")]
    InvalidSettings {
        task: String,
        activity: String,
        message: String,
    },

    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("task {task} has type {type_tag} which model {model} does not provide")]
    UnknownTaskType {
        task: String,
        type_tag: String,
        model: String,
    },

    #[error("scope {0} has tasks but no entry point (every task has incoming links)")]
    NoEntryPoints(String),

    #[error("invalid mapping on task {task}: {message}")]
    InvalidMapping { task: String, message: String },

    #[error("invalid attribute {name}: {message}")]
    InvalidAttribute { name: String, message: String },
}

/// A failure local to one task. Recovered at the task boundary through the
/// task behavior's `error` step, or escalated.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("activity failed in task {task}: {message}")]
    Activity { task: String, message: String },

    #[error("task {task} timed out after {after:?}")]
    Timeout { task: String, after: Duration },

    #[error("mapping failed in task {task}: {message}")]
    Mapping { task: String, message: String },

    #[error("cannot iterate in task {task}: {message}")]
    Iterate { task: String, message: String },
}

impl TaskError {
    pub fn task_id(&self) -> &str {
        match self {
            TaskError::Activity { task, .. }
            | TaskError::Timeout { task, .. }
            | TaskError::Mapping { task, .. }
            | TaskError::Iterate { task, .. } => task,
        }
    }
}

/// Instance-level failure, delivered through the `ResultHandler`.
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("invalid input {name}: {message}")]
    InvalidInput { name: String, message: String },

    #[error("unhandled task error: {0}")]
    Unhandled(#[from] TaskError),

    #[error("step limit of {steps} exhausted before the flow completed")]
    StepLimitExceeded { steps: u64 },

    #[error("task {0} is not part of the flow")]
    UnknownTask(String),

    #[error("instance {0} cannot be resumed: {1}")]
    NotResumable(String, String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model already registered: {0}")]
    DuplicateModel(String),

    #[error("activity already registered: {0}")]
    DuplicateActivity(String),

    #[error("model {model} already has a behavior for task type {type_tag}")]
    DuplicateTaskBehavior { model: String, type_tag: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    #[error("unresolved reference: {0}")]
    Unresolved(String),

    #[error("invalid path reference: {0}")]
    InvalidPath(String),

    #[error("expression '{expr}' failed: {message}")]
    Expression { expr: String, message: String },
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("cannot coerce {value} to {target}")]
pub struct CoerceError {
    pub value: String,
    pub target: &'static str,
}
