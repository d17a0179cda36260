use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FlowStatus {
    Created,
    Active,
    Completed,
    Failed,
}

impl FlowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowStatus::Completed | FlowStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Entered,
    Ready,
    Skipped,
    Waiting,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Skipped | TaskState::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkState {
    #[default]
    Unknown,
    True,
    False,
    Skipped,
}

impl LinkState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, LinkState::Unknown)
    }
}

/// How a task was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnterCode {
    /// Leading task of a scope.
    Start,
    /// Via a link that resolved True.
    True,
    /// Via a link that resolved False.
    False,
    /// Via a link of a skipped predecessor.
    Skip,
    /// Evaluate again without entering (iteration, retry).
    Repeat,
    /// Post-evaluate a scope task whose children finished.
    PostEval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub task_id: String,
    pub enter_code: EnterCode,
    #[serde(default)]
    pub via_link: Option<String>,
}

impl TaskEntry {
    pub fn new(task_id: impl Into<String>, enter_code: EnterCode) -> Self {
        Self {
            task_id: task_id.into(),
            enter_code,
            via_link: None,
        }
    }

    pub fn via(task_id: impl Into<String>, enter_code: EnterCode, link_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            enter_code,
            via_link: Some(link_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInst {
    pub task_id: String,
    pub state: TaskState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkInst {
    pub link_id: String,
    pub state: LinkState,
}
