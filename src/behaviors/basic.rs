use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::activities::ActivityOutcome;
use crate::behaviors::{Completion, EnterResult, ErrorOutcome, EvalStatus, TaskBehavior};
use crate::data::coerce;
use crate::error::TaskError;
use crate::runtime::context::TaskContext;
use crate::runtime::definition::LinkType;
use crate::runtime::state::{EnterCode, LinkState, TaskEntry, TaskState};

pub const RETRY_SETTING: &str = "retryOnError";

/// Default task behavior: AND-join on incoming links, one activity call per
/// evaluation, conditional fan-out on completion.
#[derive(Debug, Default)]
pub struct BasicBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetryPolicy {
    count: i64,
    interval: Duration,
}

impl RetryPolicy {
    fn from_setting(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let count = obj.get("count").and_then(|v| coerce::to_integer(v).ok()).unwrap_or(0);
        let interval = obj.get("interval").and_then(|v| coerce::to_integer(v).ok()).unwrap_or(0);
        if count <= 0 {
            return None;
        }
        Some(Self {
            count,
            interval: Duration::from_millis(interval.max(0) as u64),
        })
    }
}

impl BasicBehavior {
    /// Decides whether a failed evaluation is retried. Attempts are counted
    /// in working data so the count survives Repeat entries.
    async fn retry(&self, ctx: &mut TaskContext<'_>, err: &TaskError) -> bool {
        let Some(policy) = ctx.task().setting(RETRY_SETTING).and_then(RetryPolicy::from_setting) else {
            return false;
        };
        let key = ctx.task_key("retry");
        let attempts = ctx.working_value(&key).and_then(|v| v.as_i64()).unwrap_or(0);
        if attempts >= policy.count {
            ctx.remove_working_value(&key);
            return false;
        }

        warn!(
            instance_id = %ctx.instance_id(),
            task = %ctx.task().id,
            attempt = attempts + 1,
            max = policy.count,
            error = %err,
            "Task failed, retrying"
        );
        ctx.set_working_value(&key, Value::from(attempts + 1));
        if !policy.interval.is_zero() {
            tokio::time::sleep(policy.interval).await;
        }
        true
    }
}

#[async_trait]
impl TaskBehavior for BasicBehavior {
    fn enter(&self, ctx: &mut TaskContext<'_>) -> EnterResult {
        ctx.set_state(TaskState::Entered);

        // Loop-back links that have not fired yet never hold up the first pass.
        let states: Vec<LinkState> = ctx
            .from_links()
            .into_iter()
            .filter(|(link, state)| !(link.loop_back && *state == LinkState::Unknown))
            .map(|(_, state)| state)
            .collect();

        let result = if states.is_empty() {
            EnterResult::Eval
        } else if states.iter().any(|s| *s == LinkState::Unknown) {
            EnterResult::NotReady
        } else if states.iter().any(|s| *s == LinkState::True) {
            EnterResult::Eval
        } else {
            EnterResult::Skip
        };

        match result {
            EnterResult::Eval => ctx.set_state(TaskState::Ready),
            EnterResult::Skip => ctx.set_state(TaskState::Skipped),
            EnterResult::NotReady => {}
        }
        result
    }

    async fn eval(&self, ctx: &mut TaskContext<'_>) -> Result<EvalStatus, TaskError> {
        if ctx.task().is_scope() {
            let children = ctx.leading_children();
            debug!(instance_id = %ctx.instance_id(), task = %ctx.task().id, children = children.len(), "Entering scope");
            ctx.enqueue(children);
            ctx.set_state(TaskState::Waiting);
            return Ok(EvalStatus::Wait);
        }

        match ctx.eval_activity().await {
            Ok(ActivityOutcome::Done) => Ok(EvalStatus::Done),
            Ok(ActivityOutcome::Pending) => {
                ctx.set_state(TaskState::Waiting);
                Ok(EvalStatus::Wait)
            }
            Err(e) => {
                if self.retry(ctx, &e).await {
                    Ok(EvalStatus::Repeat)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn post_eval(&self, ctx: &mut TaskContext<'_>, data: Value) -> Result<EvalStatus, TaskError> {
        // A scope is post-evaluated once its children are finished.
        if !ctx.task().is_scope() {
            ctx.post_eval_activity(data).await?;
        }
        Ok(EvalStatus::Done)
    }

    fn done(&self, ctx: &mut TaskContext<'_>) -> Completion {
        ctx.set_state(TaskState::Done);
        let key = ctx.task_key("retry");
        ctx.remove_working_value(&key);

        let mut entries = Vec::new();
        for link in ctx.to_links() {
            if link.link_type == LinkType::Error {
                ctx.set_link_state(&link.id, LinkState::False);
                continue;
            }
            let (state, code) = if ctx.eval_link(&link) {
                (LinkState::True, EnterCode::True)
            } else {
                (LinkState::False, EnterCode::False)
            };
            ctx.set_link_state(&link.id, state);
            entries.push(TaskEntry::via(link.to.clone(), code, link.id.clone()));
        }

        if entries.is_empty() {
            Completion::notify_parent()
        } else {
            Completion::enqueue(entries)
        }
    }

    fn skip(&self, ctx: &mut TaskContext<'_>) -> Completion {
        ctx.set_state(TaskState::Skipped);

        let mut entries = Vec::new();
        for link in ctx.to_links() {
            ctx.set_link_state(&link.id, LinkState::Skipped);
            if link.link_type != LinkType::Error {
                entries.push(TaskEntry::via(link.to.clone(), EnterCode::Skip, link.id.clone()));
            }
        }

        if entries.is_empty() {
            Completion::notify_parent()
        } else {
            Completion::enqueue(entries)
        }
    }

    fn error(&self, ctx: &mut TaskContext<'_>, _err: &TaskError) -> ErrorOutcome {
        let links = ctx.to_links();
        let Some(error_link) = links.iter().find(|l| l.link_type == LinkType::Error).cloned() else {
            return ErrorOutcome::Unhandled;
        };

        for link in &links {
            let state = if link.id == error_link.id {
                LinkState::True
            } else {
                LinkState::False
            };
            ctx.set_link_state(&link.id, state);
        }
        debug!(instance_id = %ctx.instance_id(), task = %ctx.task().id, link = %error_link.id, "Following error link");
        ErrorOutcome::Handled(vec![TaskEntry::via(
            error_link.to.clone(),
            EnterCode::True,
            error_link.id.clone(),
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_policy_parsing() {
        let policy = RetryPolicy::from_setting(&json!({"count": 2, "interval": 50})).unwrap();
        assert_eq!(policy.count, 2);
        assert_eq!(policy.interval, Duration::from_millis(50));

        let policy = RetryPolicy::from_setting(&json!({"count": "3"})).unwrap();
        assert_eq!(policy.count, 3);
        assert!(policy.interval.is_zero());

        assert!(RetryPolicy::from_setting(&json!({"count": 0})).is_none());
        assert!(RetryPolicy::from_setting(&json!(5)).is_none());
    }
}
