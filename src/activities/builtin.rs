use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

use crate::activities::{Activity, ActivityContext, ActivityOutcome};
use crate::data::coerce;

#[derive(Debug)]
pub struct LogActivity;

#[async_trait]
impl Activity for LogActivity {
    fn name(&self) -> &str {
        "log"
    }

    async fn eval(&self, ctx: &mut ActivityContext<'_>) -> Result<ActivityOutcome> {
        match ctx.input_or_setting("message") {
            Some(Value::String(msg)) => info!(task = %ctx.task_id(), "[LOG] {}", msg),
            Some(other) => info!(task = %ctx.task_id(), "[LOG] {}", other),
            None => info!(task = %ctx.task_id(), "[LOG] {:?}", ctx.inputs()),
        }
        Ok(ActivityOutcome::Done)
    }
}

/// Copies every input to an output of the same name; with no output
/// mapping this writes them straight into the flow scope.
#[derive(Debug)]
pub struct AssignActivity;

#[async_trait]
impl Activity for AssignActivity {
    fn name(&self) -> &str {
        "assign"
    }

    async fn eval(&self, ctx: &mut ActivityContext<'_>) -> Result<ActivityOutcome> {
        let inputs: Vec<(String, Value)> = ctx.inputs().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (k, v) in inputs {
            ctx.set_output(&k, v);
        }
        Ok(ActivityOutcome::Done)
    }
}

/// Replies to the trigger with its inputs, ahead of flow completion.
#[derive(Debug)]
pub struct ReplyActivity;

#[async_trait]
impl Activity for ReplyActivity {
    fn name(&self) -> &str {
        "reply"
    }

    fn produces_reply(&self) -> bool {
        true
    }

    async fn eval(&self, ctx: &mut ActivityContext<'_>) -> Result<ActivityOutcome> {
        let attrs: HashMap<String, Value> = ctx.inputs().clone();
        ctx.reply(attrs);
        Ok(ActivityOutcome::Done)
    }
}

/// Fails with the `message` input. Used to raise flow errors on purpose.
#[derive(Debug)]
pub struct ErrorActivity;

#[async_trait]
impl Activity for ErrorActivity {
    fn name(&self) -> &str {
        "error"
    }

    async fn eval(&self, ctx: &mut ActivityContext<'_>) -> Result<ActivityOutcome> {
        let message = match ctx.input_or_setting("message") {
            Some(v) => coerce::to_string(v)?,
            None => "error raised by flow".to_string(),
        };
        Err(anyhow!(message))
    }
}

/// Completes asynchronously after `millis`, echoing its inputs as outputs.
#[derive(Debug)]
pub struct DelayActivity;

#[async_trait]
impl Activity for DelayActivity {
    fn name(&self) -> &str {
        "delay"
    }

    fn validate(&self, settings: &HashMap<String, Value>) -> Result<()> {
        if let Some(millis) = settings.get("millis") {
            coerce::to_integer(millis)?;
        }
        Ok(())
    }

    async fn eval(&self, ctx: &mut ActivityContext<'_>) -> Result<ActivityOutcome> {
        let millis = match ctx.input_or_setting("millis") {
            Some(v) => coerce::to_integer(v)?.max(0) as u64,
            None => 0,
        };
        let mut payload = serde_json::Map::new();
        for (k, v) in ctx.inputs() {
            if k != "millis" {
                payload.insert(k.clone(), v.clone());
            }
        }
        payload.insert("delayed_ms".to_string(), json!(millis));

        let handle = ctx.async_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            handle.complete(Value::Object(payload));
        });
        Ok(ActivityOutcome::Pending)
    }
}
