use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::error::RegistryError;
use crate::runtime::context::InstanceEvent;
use crate::runtime::definition::Task;
use crate::runtime::handler::ReplySink;

pub mod builtin;
pub mod http;

/// What an activity's `eval` reports back to its task behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutcome {
    Done,
    /// The activity finishes out of band through an `AsyncHandle`.
    Pending,
}

/// Unit of work invoked by a task. All plug-in activities implement this.
#[async_trait]
pub trait Activity: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Whether the activity may reply to the trigger before the flow completes.
    fn produces_reply(&self) -> bool {
        false
    }

    /// Checked once when a Definition referencing the activity is compiled.
    fn validate(&self, _settings: &HashMap<String, Value>) -> Result<()> {
        Ok(())
    }

    async fn eval(&self, ctx: &mut ActivityContext<'_>) -> Result<ActivityOutcome>;

    /// Called with the data an `AsyncHandle` completed with. The default
    /// copies the fields of an object payload into the outputs.
    async fn post_eval(&self, ctx: &mut ActivityContext<'_>, data: Value) -> Result<()> {
        if let Value::Object(map) = data {
            for (k, v) in map {
                ctx.set_output(&k, v);
            }
        }
        Ok(())
    }
}

/// Per-call view an activity gets of its task.
pub struct ActivityContext<'a> {
    instance_id: Uuid,
    task: &'a Task,
    inputs: HashMap<String, Value>,
    outputs: HashMap<String, Value>,
    reply: &'a ReplySink,
    events: &'a mpsc::UnboundedSender<InstanceEvent>,
}

impl<'a> ActivityContext<'a> {
    pub(crate) fn new(
        instance_id: Uuid,
        task: &'a Task,
        inputs: HashMap<String, Value>,
        reply: &'a ReplySink,
        events: &'a mpsc::UnboundedSender<InstanceEvent>,
    ) -> Self {
        Self {
            instance_id,
            task,
            inputs,
            outputs: HashMap::new(),
            reply,
            events,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    pub fn task_name(&self) -> &str {
        &self.task.name
    }

    pub fn setting(&self, key: &str) -> Option<&Value> {
        self.task.settings.get(key)
    }

    pub fn settings(&self) -> &HashMap<String, Value> {
        &self.task.settings
    }

    pub fn input(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key)
    }

    /// Input if mapped, else the task setting of the same name.
    pub fn input_or_setting(&self, key: &str) -> Option<&Value> {
        self.inputs.get(key).or_else(|| self.task.settings.get(key))
    }

    pub fn inputs(&self) -> &HashMap<String, Value> {
        &self.inputs
    }

    pub fn set_output(&mut self, key: &str, value: Value) {
        self.outputs.insert(key.to_string(), value);
    }

    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    pub(crate) fn into_outputs(self) -> HashMap<String, Value> {
        self.outputs
    }

    /// Replies to the trigger ahead of flow completion.
    pub fn reply(&self, attrs: HashMap<String, Value>) {
        self.reply.reply(attrs);
    }

    /// Handle for completing this task later when `eval` returns `Pending`.
    pub fn async_handle(&self) -> AsyncHandle {
        AsyncHandle {
            task_id: self.task.id.clone(),
            events: self.events.clone(),
        }
    }
}

/// Completes a pending activity by messaging the owning instance's worker.
#[derive(Debug, Clone)]
pub struct AsyncHandle {
    task_id: String,
    events: mpsc::UnboundedSender<InstanceEvent>,
}

impl AsyncHandle {
    pub fn complete(self, data: Value) {
        self.send(Ok(data));
    }

    pub fn fail(self, message: impl Into<String>) {
        self.send(Err(message.into()));
    }

    fn send(self, result: std::result::Result<Value, String>) {
        let event = InstanceEvent::Completed {
            task_id: self.task_id,
            result,
        };
        if let Err(e) = self.events.send(event) {
            warn!("Async completion dropped, instance no longer running: {}", e);
        }
    }
}

/// Catalogue of activities, looked up by reference when compiling.
#[derive(Debug, Default, Clone)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every builtin activity.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: Vec<Arc<dyn Activity>> = vec![
            Arc::new(builtin::LogActivity),
            Arc::new(builtin::AssignActivity),
            Arc::new(builtin::ReplyActivity),
            Arc::new(builtin::ErrorActivity),
            Arc::new(builtin::DelayActivity),
            Arc::new(http::HttpActivity::new()),
        ];
        for activity in builtins {
            registry.activities.insert(activity.name().to_string(), activity);
        }
        registry
    }

    pub fn register(&mut self, activity: Arc<dyn Activity>) -> std::result::Result<(), RegistryError> {
        let name = activity.name().to_string();
        if self.activities.contains_key(&name) {
            return Err(RegistryError::DuplicateActivity(name));
        }
        self.activities.insert(name, activity);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }
}
