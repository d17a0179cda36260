use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::runtime::instance::{Instance, StepChanges};
use crate::runtime::state::{EnterCode, FlowStatus};

/// One completed step of an instance and the state it changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub instance_id: Uuid,
    pub flow_uri: String,
    pub step: u64,
    pub task_id: String,
    pub enter_code: EnterCode,
    pub status: FlowStatus,
    pub changes: StepChanges,
}

/// Observer of instance execution. Failures are logged by the engine and
/// never change how the instance runs.
#[async_trait]
pub trait StateRecorder: Send + Sync {
    async fn record_snapshot(&self, instance: &Instance) -> Result<()>;
    async fn record_step(&self, step: &StepRecord) -> Result<()>;
}

/// Keeps the latest snapshot and every step per instance in memory.
#[derive(Default)]
pub struct InMemoryStateRecorder {
    snapshots: DashMap<Uuid, Instance>,
    steps: DashMap<Uuid, Vec<StepRecord>>,
}

impl InMemoryStateRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self, instance_id: Uuid) -> Option<Instance> {
        self.snapshots.get(&instance_id).map(|s| s.value().clone())
    }

    pub fn steps(&self, instance_id: Uuid) -> Vec<StepRecord> {
        self.steps
            .get(&instance_id)
            .map(|s| s.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StateRecorder for InMemoryStateRecorder {
    async fn record_snapshot(&self, instance: &Instance) -> Result<()> {
        self.snapshots.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn record_step(&self, step: &StepRecord) -> Result<()> {
        self.steps.entry(step.instance_id).or_default().push(step.clone());
        Ok(())
    }
}
