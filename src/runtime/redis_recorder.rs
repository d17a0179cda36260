use anyhow::Result;
use async_trait::async_trait;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::runtime::instance::Instance;
use crate::runtime::recorder::{StateRecorder, StepRecord};

/// Records snapshots as JSON strings and steps as a JSON list per instance.
pub struct RedisStateRecorder {
    client: redis::Client,
    prefix: String,
}

impl RedisStateRecorder {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            prefix: "flowgate".to_string(),
        }
    }

    pub fn with_prefix(client: redis::Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: prefix.to_string(),
        }
    }

    fn snapshot_key(&self, instance_id: Uuid) -> String {
        format!("{}:inst:{}:snapshot", self.prefix, instance_id)
    }

    fn steps_key(&self, instance_id: Uuid) -> String {
        format!("{}:inst:{}:steps", self.prefix, instance_id)
    }

    /// Latest recorded snapshot, for resuming or restarting an instance.
    pub async fn load_snapshot(&self, instance_id: Uuid) -> Result<Option<Instance>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Option<String> = conn.get(self.snapshot_key(instance_id)).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn load_steps(&self, instance_id: Uuid) -> Result<Vec<StepRecord>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Vec<String> = conn.lrange(self.steps_key(instance_id), 0, -1).await?;
        let mut steps = Vec::with_capacity(raw.len());
        for s in raw {
            steps.push(serde_json::from_str(&s)?);
        }
        Ok(steps)
    }
}

#[async_trait]
impl StateRecorder for RedisStateRecorder {
    async fn record_snapshot(&self, instance: &Instance) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(instance)?;
        let _: () = conn.set(self.snapshot_key(instance.id), serialized).await?;
        Ok(())
    }

    async fn record_step(&self, step: &StepRecord) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let serialized = serde_json::to_string(step)?;
        let _: () = conn.rpush(self.steps_key(step.instance_id), serialized).await?;
        Ok(())
    }
}
