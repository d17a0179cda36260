use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::behaviors::SIMPLE_MODEL;

pub const ENV_MAX_STEP_COUNT: &str = "FLOWGATE_MAX_STEP_COUNT";
pub const ENV_TASK_TIMEOUT_MS: &str = "FLOWGATE_TASK_TIMEOUT_MS";
pub const ENV_RECORD_STEPS: &str = "FLOWGATE_RECORD_STEPS";
pub const ENV_RECORD_SNAPSHOTS: &str = "FLOWGATE_RECORD_SNAPSHOTS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Steps one instance may take before the loop stops stepping it.
    pub max_step_count: u64,
    /// Ceiling for one activity evaluation and for waiting on an async one.
    pub task_timeout_ms: u64,
    pub record_steps: bool,
    pub record_snapshots: bool,
    /// Model used by definitions that do not name one.
    pub default_model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_count: 10_000_000,
            task_timeout_ms: 60_000,
            record_steps: false,
            record_snapshots: false,
            default_model: SIMPLE_MODEL.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Invalid engine config")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
    }

    /// Overrides fields from `FLOWGATE_*` environment variables.
    pub fn apply_env(mut self) -> Result<Self> {
        self.apply_vars(|key| std::env::var(key).ok())?;
        Ok(self)
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup(ENV_MAX_STEP_COUNT) {
            self.max_step_count = v.trim().parse().with_context(|| format!("{} must be an integer", ENV_MAX_STEP_COUNT))?;
        }
        if let Some(v) = lookup(ENV_TASK_TIMEOUT_MS) {
            self.task_timeout_ms = v.trim().parse().with_context(|| format!("{} must be an integer", ENV_TASK_TIMEOUT_MS))?;
        }
        if let Some(v) = lookup(ENV_RECORD_STEPS) {
            self.record_steps = parse_flag(ENV_RECORD_STEPS, &v)?;
        }
        if let Some(v) = lookup(ENV_RECORD_SNAPSHOTS) {
            self.record_snapshots = parse_flag(ENV_RECORD_SNAPSHOTS, &v)?;
        }
        Ok(())
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{} must be a boolean, got {:?}", key, other),
    }
}
