use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::FlowError;

pub type FlowResult = Result<HashMap<String, Value>, FlowError>;

/// Receives the outcome of a flow instance.
///
/// `handle_result` is called once with either an early (explicit) reply or
/// the final result. `done` is called exactly once when the worker stepping
/// the instance finishes, whatever the outcome.
pub trait ResultHandler: Send + Sync {
    fn handle_result(&self, result: FlowResult);
    fn done(&self);
}

/// Delivers explicit replies and remembers whether one was sent.
#[derive(Clone)]
pub struct ReplySink {
    handler: Arc<dyn ResultHandler>,
    replied: Arc<AtomicBool>,
}

impl ReplySink {
    pub(crate) fn new(handler: Arc<dyn ResultHandler>) -> Self {
        Self {
            handler,
            replied: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn reply(&self, attrs: HashMap<String, Value>) {
        if !self.deliver(Ok(attrs)) {
            warn!("Flow already replied, ignoring additional reply");
        }
    }

    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    /// Hands `result` to the handler unless something was already delivered.
    pub(crate) fn deliver(&self, result: FlowResult) -> bool {
        if self.replied.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.handler.handle_result(result);
        true
    }
}

/// Calls `done` on drop so it fires even if the worker panics.
pub(crate) struct DoneGuard(pub(crate) Arc<dyn ResultHandler>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.done();
    }
}

#[derive(Debug)]
pub enum HandlerEvent {
    Result(FlowResult),
    Done,
}

/// `ResultHandler` that forwards everything into a channel.
pub struct ChannelResultHandler {
    tx: mpsc::UnboundedSender<HandlerEvent>,
}

impl ResultHandler for ChannelResultHandler {
    fn handle_result(&self, result: FlowResult) {
        let _ = self.tx.send(HandlerEvent::Result(result));
    }

    fn done(&self) {
        let _ = self.tx.send(HandlerEvent::Done);
    }
}

/// Everything a `ChannelResultHandler` saw once every copy of it is gone.
#[derive(Debug, Default)]
pub struct Finished {
    pub results: Vec<FlowResult>,
    pub done_calls: usize,
}

pub struct ResultReceiver {
    rx: mpsc::UnboundedReceiver<HandlerEvent>,
    seen_done: usize,
}

impl ResultReceiver {
    /// Next delivered result, or None once the handler is gone.
    pub async fn next_result(&mut self) -> Option<FlowResult> {
        while let Some(event) = self.rx.recv().await {
            match event {
                HandlerEvent::Result(result) => return Some(result),
                HandlerEvent::Done => self.seen_done += 1,
            }
        }
        None
    }

    /// Waits until every handle to the handler has been dropped.
    pub async fn finish(mut self) -> Finished {
        let mut finished = Finished {
            results: Vec::new(),
            done_calls: self.seen_done,
        };
        while let Some(event) = self.rx.recv().await {
            match event {
                HandlerEvent::Result(result) => finished.results.push(result),
                HandlerEvent::Done => finished.done_calls += 1,
            }
        }
        finished
    }
}

pub fn result_channel() -> (Arc<ChannelResultHandler>, ResultReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChannelResultHandler { tx }), ResultReceiver { rx, seen_done: 0 })
}
