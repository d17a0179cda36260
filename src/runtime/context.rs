use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::activities::{ActivityContext, ActivityOutcome};
use crate::data::coerce;
use crate::data::resolver::Resolver;
use crate::data::scope::{Scope, SimpleScope};
use crate::error::{ResolveError, TaskError};
use crate::runtime::definition::{Definition, Link, LinkType, Task};
use crate::runtime::handler::ReplySink;
use crate::runtime::instance::Instance;
use crate::runtime::state::{EnterCode, LinkState, TaskEntry, TaskState};

/// Flow attribute holding details of the most recent task failure.
pub const ERROR_ATTR: &str = "_E";

/// Messages into an instance's worker from outside the step loop.
#[derive(Debug)]
pub enum InstanceEvent {
    Completed {
        task_id: String,
        result: Result<Value, String>,
    },
}

/// Per-instance services shared by every step.
pub(crate) struct ExecEnv {
    pub(crate) resolver: Arc<dyn Resolver>,
    pub(crate) reply: ReplySink,
    pub(crate) events: mpsc::UnboundedSender<InstanceEvent>,
    pub(crate) task_timeout: Duration,
}

/// What a task behavior sees of the instance while handling one task.
pub struct TaskContext<'a> {
    task: &'a Arc<Task>,
    definition: &'a Definition,
    instance: &'a mut Instance,
    env: &'a ExecEnv,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(task: &'a Arc<Task>, definition: &'a Definition, instance: &'a mut Instance, env: &'a ExecEnv) -> Self {
        Self {
            task,
            definition,
            instance,
            env,
        }
    }

    pub fn task(&self) -> &Arc<Task> {
        self.task
    }

    pub fn definition(&self) -> &Definition {
        self.definition
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance.id
    }

    pub fn state(&self) -> Option<TaskState> {
        self.instance.task_state(&self.task.id)
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.instance.set_task_state(&self.task.id, state);
    }

    /// Incoming links with their current state, in declaration order.
    pub fn from_links(&self) -> Vec<(Arc<Link>, LinkState)> {
        self.definition
            .from_links(self.task)
            .map(|link| (link.clone(), self.instance.link_state(&link.id)))
            .collect()
    }

    pub fn to_links(&self) -> Vec<Arc<Link>> {
        self.definition.to_links(self.task).cloned().collect()
    }

    pub fn link_state(&self, link_id: &str) -> LinkState {
        self.instance.link_state(link_id)
    }

    pub fn set_link_state(&mut self, link_id: &str, state: LinkState) {
        self.instance.set_link_state(link_id, state);
    }

    /// Evaluates whether `link` should be followed. Expression links that
    /// cannot be resolved to a boolean evaluate to false.
    pub fn eval_link(&self, link: &Link) -> bool {
        match link.link_type {
            LinkType::Dependency | LinkType::Label => true,
            LinkType::Error => false,
            LinkType::Expression => {
                let value = match self.resolve(&link.value) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(instance_id = %self.instance.id, link = %link.id, error = %e, "Link condition unresolved, treating as false");
                        return false;
                    }
                };
                match coerce::to_boolean(&value) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(instance_id = %self.instance.id, link = %link.id, error = %e, "Link condition is not a boolean, treating as false");
                        false
                    }
                }
            }
        }
    }

    pub fn resolve(&self, reference: &str) -> Result<Value, ResolveError> {
        self.env.resolver.resolve(reference, &*self.instance)
    }

    pub fn working_value(&self, key: &str) -> Option<&Value> {
        self.instance.working_value(key)
    }

    pub fn set_working_value(&mut self, key: &str, value: Value) {
        self.instance.set_working_value(key, value);
    }

    pub fn remove_working_value(&mut self, key: &str) -> Option<Value> {
        self.instance.remove_working_value(key)
    }

    /// Working-data key private to this task.
    pub fn task_key(&self, prefix: &str) -> String {
        format!("__{}:{}", prefix, self.task.id)
    }

    /// Entries for the leading children of this (scope) task.
    pub fn leading_children(&self) -> Vec<TaskEntry> {
        self.definition
            .leading_tasks(self.task)
            .map(|child| TaskEntry::new(child.id.clone(), EnterCode::Start))
            .collect()
    }

    pub fn enqueue(&mut self, entries: impl IntoIterator<Item = TaskEntry>) {
        self.instance.enqueue(entries);
    }

    /// Publishes the failure under `_E` so error links and the error
    /// handler can inspect it.
    pub fn record_error(&mut self, err: &TaskError) {
        let info = json!({
            "message": err.to_string(),
            "task": self.task.id,
            "activity": self.task.activity_ref,
        });
        if let Err(e) = self.instance.set_attr_value(ERROR_ATTR, info) {
            warn!(instance_id = %self.instance.id, error = %e, "Cannot record task error");
        }
    }

    fn map_inputs(&self) -> Result<HashMap<String, Value>, TaskError> {
        match &self.task.input_mapper {
            Some(mapper) => mapper
                .apply(self.env.resolver.as_ref(), &*self.instance)
                .map_err(|e| TaskError::Mapping {
                    task: self.task.id.clone(),
                    message: e.to_string(),
                }),
            None => Ok(HashMap::new()),
        }
    }

    /// Runs the task's activity with its mapped inputs and, when it finishes
    /// synchronously, maps its outputs into the flow scope. Tasks without an
    /// activity are done immediately.
    pub async fn eval_activity(&mut self) -> Result<ActivityOutcome, TaskError> {
        let task: &'a Arc<Task> = self.task;
        let Some(activity) = task.activity() else {
            return Ok(ActivityOutcome::Done);
        };

        let inputs = self.map_inputs()?;
        let env: &'a ExecEnv = self.env;
        let mut actx = ActivityContext::new(self.instance.id, task, inputs, &env.reply, &env.events);

        debug!(instance_id = %self.instance.id, task = %task.id, activity = %activity.name(), "Evaluating activity");
        let outcome = match timeout(env.task_timeout, activity.eval(&mut actx)).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                return Err(TaskError::Activity {
                    task: task.id.clone(),
                    message: format!("{:#}", e),
                });
            }
            Err(_) => {
                return Err(TaskError::Timeout {
                    task: task.id.clone(),
                    after: env.task_timeout,
                });
            }
        };

        if outcome == ActivityOutcome::Done {
            self.apply_outputs(actx.into_outputs())?;
        }
        Ok(outcome)
    }

    /// Finishes a pending activity with the data its `AsyncHandle` sent.
    pub async fn post_eval_activity(&mut self, data: Value) -> Result<(), TaskError> {
        let task: &'a Arc<Task> = self.task;
        let Some(activity) = task.activity() else {
            return Ok(());
        };

        let inputs = self.map_inputs()?;
        let env: &'a ExecEnv = self.env;
        let mut actx = ActivityContext::new(self.instance.id, task, inputs, &env.reply, &env.events);

        match timeout(env.task_timeout, activity.post_eval(&mut actx, data)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(TaskError::Activity {
                    task: task.id.clone(),
                    message: format!("{:#}", e),
                });
            }
            Err(_) => {
                return Err(TaskError::Timeout {
                    task: task.id.clone(),
                    after: env.task_timeout,
                });
            }
        }
        self.apply_outputs(actx.into_outputs())
    }

    fn apply_outputs(&mut self, outputs: HashMap<String, Value>) -> Result<(), TaskError> {
        let mapping_error = |message: String| TaskError::Mapping {
            task: self.task.id.clone(),
            message,
        };

        let values = match &self.task.output_mapper {
            Some(mapper) => {
                let scope = SimpleScope::from_values(outputs);
                mapper
                    .apply(self.env.resolver.as_ref(), &scope)
                    .map_err(|e| mapping_error(e.to_string()))?
            }
            None => outputs,
        };

        for (name, value) in values {
            self.instance
                .set_attr_value(&name, value)
                .map_err(|e| mapping_error(format!("{}: {}", name, e)))?;
        }
        Ok(())
    }
}
