use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::activities::ActivityOutcome;
use crate::behaviors::{BasicBehavior, Completion, EnterResult, ErrorOutcome, EvalStatus, TaskBehavior};
use crate::data::coerce;
use crate::error::TaskError;
use crate::runtime::context::TaskContext;
use crate::runtime::state::TaskState;

pub const ITERATOR_TYPE: &str = "iterator";
pub const ITERATE_SETTING: &str = "iterate";
/// Working-data attribute holding the current `{key, value}`.
pub const ITERATION_ATTR: &str = "iteration";

/// Position over the items resolved from the `iterate` setting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Cursor {
    items: Vec<(Value, Value)>,
    position: usize,
    /// The current item's activity is pending and has not been post-evaluated.
    #[serde(default)]
    in_flight: bool,
}

impl Cursor {
    pub(crate) fn new(items: Vec<(Value, Value)>) -> Self {
        Self {
            items,
            position: 0,
            in_flight: false,
        }
    }

    /// Moves to the next item; false once past the end.
    pub(crate) fn advance(&mut self) -> bool {
        if self.position < self.items.len() {
            self.position += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn current(&self) -> Option<&(Value, Value)> {
        self.position.checked_sub(1).and_then(|i| self.items.get(i))
    }

    pub(crate) fn has_next(&self) -> bool {
        self.position < self.items.len()
    }
}

/// Flattens an iterate source into ordered `(key, value)` pairs.
pub(crate) fn items_of(value: &Value) -> Result<Vec<(Value, Value)>, String> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Number(_) => {
            let count = coerce::to_integer(value).map_err(|e| e.to_string())?;
            Ok((0..count.max(0)).map(|i| (json!(i), json!(i))).collect())
        }
        Value::Array(items) => Ok(items
            .iter()
            .enumerate()
            .map(|(i, v)| (json!(i), v.clone()))
            .collect()),
        Value::Object(map) => Ok(map.iter().map(|(k, v)| (json!(k), v.clone())).collect()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed @ (Value::Array(_) | Value::Object(_) | Value::Number(_))) => items_of(&parsed),
            _ => Err(format!("cannot iterate over string {:?}", s)),
        },
        Value::Bool(_) => Err("cannot iterate over a boolean".to_string()),
    }
}

/// Repeats the wrapped behavior's activity once per item of its `iterate`
/// setting. Everything other than evaluation is delegated.
#[derive(Debug)]
pub struct IteratorBehavior {
    inner: Arc<BasicBehavior>,
}

impl IteratorBehavior {
    pub fn new(inner: Arc<BasicBehavior>) -> Self {
        Self { inner }
    }

    fn iterate_error(ctx: &TaskContext<'_>, message: impl Into<String>) -> TaskError {
        TaskError::Iterate {
            task: ctx.task().id.clone(),
            message: message.into(),
        }
    }

    fn init_cursor(ctx: &TaskContext<'_>) -> Result<Cursor, TaskError> {
        let setting = ctx
            .task()
            .setting(ITERATE_SETTING)
            .cloned()
            .ok_or_else(|| Self::iterate_error(ctx, "missing iterate setting"))?;

        let source = match &setting {
            Value::String(s) if s.starts_with('=') => ctx
                .resolve(&s[1..])
                .map_err(|e| Self::iterate_error(ctx, e.to_string()))?,
            Value::String(s) if s.starts_with('$') => ctx
                .resolve(s)
                .map_err(|e| Self::iterate_error(ctx, e.to_string()))?,
            other => other.clone(),
        };

        let items = items_of(&source).map_err(|e| Self::iterate_error(ctx, e))?;
        Ok(Cursor::new(items))
    }

    fn load_cursor(ctx: &TaskContext<'_>) -> Result<Cursor, TaskError> {
        let key = ctx.task_key(ITERATOR_TYPE);
        match ctx.working_value(&key) {
            Some(value) => {
                serde_json::from_value(value.clone()).map_err(|e| Self::iterate_error(ctx, e.to_string()))
            }
            None => Self::init_cursor(ctx),
        }
    }

    fn store_cursor(ctx: &mut TaskContext<'_>, cursor: &Cursor) -> Result<(), TaskError> {
        let key = ctx.task_key(ITERATOR_TYPE);
        let value = serde_json::to_value(cursor).map_err(|e| Self::iterate_error(ctx, e.to_string()))?;
        ctx.set_working_value(&key, value);
        Ok(())
    }
}

#[async_trait]
impl TaskBehavior for IteratorBehavior {
    fn enter(&self, ctx: &mut TaskContext<'_>) -> EnterResult {
        self.inner.enter(ctx)
    }

    async fn eval(&self, ctx: &mut TaskContext<'_>) -> Result<EvalStatus, TaskError> {
        let mut cursor = Self::load_cursor(ctx)?;

        // An item whose pending result was never post-evaluated (the instance
        // was suspended and resumed) is issued again rather than skipped.
        if cursor.in_flight {
            debug!(instance_id = %ctx.instance_id(), task = %ctx.task().id, "Re-issuing in-flight item");
        } else if !cursor.advance() {
            debug!(instance_id = %ctx.instance_id(), task = %ctx.task().id, "Iteration finished");
            let key = ctx.task_key(ITERATOR_TYPE);
            ctx.remove_working_value(&key);
            return Ok(EvalStatus::Done);
        }

        if let Some((key, value)) = cursor.current() {
            ctx.set_working_value(ITERATION_ATTR, json!({ "key": key, "value": value }));
        }
        cursor.in_flight = false;
        Self::store_cursor(ctx, &cursor)?;

        match ctx.eval_activity().await? {
            ActivityOutcome::Done => Ok(EvalStatus::Repeat),
            ActivityOutcome::Pending => {
                cursor.in_flight = true;
                Self::store_cursor(ctx, &cursor)?;
                ctx.set_state(TaskState::Waiting);
                Ok(EvalStatus::Wait)
            }
        }
    }

    async fn post_eval(&self, ctx: &mut TaskContext<'_>, data: Value) -> Result<EvalStatus, TaskError> {
        ctx.post_eval_activity(data).await?;
        let mut cursor = Self::load_cursor(ctx)?;
        cursor.in_flight = false;
        Self::store_cursor(ctx, &cursor)?;
        if cursor.has_next() {
            Ok(EvalStatus::Repeat)
        } else {
            Ok(EvalStatus::Done)
        }
    }

    fn done(&self, ctx: &mut TaskContext<'_>) -> Completion {
        let key = ctx.task_key(ITERATOR_TYPE);
        ctx.remove_working_value(&key);
        self.inner.done(ctx)
    }

    fn skip(&self, ctx: &mut TaskContext<'_>) -> Completion {
        self.inner.skip(ctx)
    }

    fn error(&self, ctx: &mut TaskContext<'_>, err: &TaskError) -> ErrorOutcome {
        let key = ctx.task_key(ITERATOR_TYPE);
        ctx.remove_working_value(&key);
        self.inner.error(ctx, err)
    }
}
