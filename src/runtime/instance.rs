use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::data::Attribute;
use crate::data::scope::Scope;
use crate::error::CoerceError;
use crate::runtime::state::{FlowStatus, LinkInst, LinkState, TaskEntry, TaskInst, TaskState};

/// Changes made during the current step, drained by the state recorder.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepChanges {
    pub tasks: Vec<(String, TaskState)>,
    pub links: Vec<(String, LinkState)>,
    pub attrs: Vec<String>,
}

impl StepChanges {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty() && self.links.is_empty() && self.attrs.is_empty()
    }
}

/// All mutable state of one flow execution. Owned by exactly one worker
/// while it is being stepped; serializable for recording, resume and restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub flow_uri: String,
    pub status: FlowStatus,
    pub step_count: u64,
    pub attrs: HashMap<String, Attribute>,
    pub task_insts: HashMap<String, TaskInst>,
    pub link_insts: HashMap<String, LinkInst>,
    pub working_data: HashMap<String, Attribute>,
    pub pending: VecDeque<TaskEntry>,
    #[serde(default)]
    pub handling_error: bool,
    #[serde(skip)]
    changes: StepChanges,
}

impl Instance {
    pub fn new(id: Uuid, flow_uri: impl Into<String>) -> Self {
        Self {
            id,
            flow_uri: flow_uri.into(),
            status: FlowStatus::Created,
            step_count: 0,
            attrs: HashMap::new(),
            task_insts: HashMap::new(),
            link_insts: HashMap::new(),
            working_data: HashMap::new(),
            pending: VecDeque::new(),
            handling_error: false,
            changes: StepChanges::default(),
        }
    }

    pub fn task_state(&self, task_id: &str) -> Option<TaskState> {
        self.task_insts.get(task_id).map(|t| t.state)
    }

    pub fn set_task_state(&mut self, task_id: &str, state: TaskState) {
        match self.task_insts.get_mut(task_id) {
            Some(inst) => inst.state = state,
            None => {
                self.task_insts.insert(
                    task_id.to_string(),
                    TaskInst {
                        task_id: task_id.to_string(),
                        state,
                    },
                );
            }
        }
        self.changes.tasks.push((task_id.to_string(), state));
    }

    /// Drops the task's state so its next entry starts fresh.
    pub fn reset_task(&mut self, task_id: &str) {
        self.task_insts.remove(task_id);
    }

    pub fn link_state(&self, link_id: &str) -> LinkState {
        self.link_insts.get(link_id).map(|l| l.state).unwrap_or_default()
    }

    pub fn set_link_state(&mut self, link_id: &str, state: LinkState) {
        self.link_insts.insert(
            link_id.to_string(),
            LinkInst {
                link_id: link_id.to_string(),
                state,
            },
        );
        self.changes.links.push((link_id.to_string(), state));
    }

    pub fn reset_link(&mut self, link_id: &str) {
        self.link_insts.remove(link_id);
    }

    pub fn enqueue(&mut self, entries: impl IntoIterator<Item = TaskEntry>) {
        self.pending.extend(entries);
    }

    pub fn has_waiting(&self) -> bool {
        self.task_insts.values().any(|t| t.state == TaskState::Waiting)
    }

    pub fn waiting_tasks(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .task_insts
            .values()
            .filter(|t| t.state == TaskState::Waiting)
            .map(|t| t.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn attr_value(&self, name: &str) -> Option<&Value> {
        self.attrs.get(name).map(|a| &a.value)
    }

    pub fn working_value(&self, name: &str) -> Option<&Value> {
        self.working_data.get(name).map(|a| &a.value)
    }

    pub fn set_working_value(&mut self, name: &str, value: Value) {
        self.working_data.insert(name.to_string(), Attribute::any(name, value));
    }

    pub fn remove_working_value(&mut self, name: &str) -> Option<Value> {
        self.working_data.remove(name).map(|a| a.value)
    }

    pub(crate) fn take_changes(&mut self) -> StepChanges {
        std::mem::take(&mut self.changes)
    }
}

impl Scope for Instance {
    fn get_attr(&self, name: &str) -> Option<&Attribute> {
        self.attrs.get(name).or_else(|| self.working_data.get(name))
    }

    fn set_attr_value(&mut self, name: &str, value: Value) -> Result<(), CoerceError> {
        match self.attrs.get_mut(name) {
            Some(attr) => attr.set_value(value)?,
            None => {
                self.attrs.insert(name.to_string(), Attribute::any(name, value));
            }
        }
        self.changes.attrs.push(name.to_string());
        Ok(())
    }

    fn attr_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.attrs.keys().cloned().collect();
        names.extend(self.working_data.keys().filter(|k| !self.attrs.contains_key(*k)).cloned());
        names
    }
}
