//! Element — a single pipeline stage: its transform plus its channels.
//!
//! One trait, a small lifecycle hook set, `as_any()` for typed downcast.
//! Each stage reads one message, writes zero or more messages, and
//! repeats — the worker-per-stage model the Pipeline's DAG chain runs.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::bus::Bus;
use crate::error::PipelineError;
use crate::message::PipelineMessage;

/// An Element's lifecycle state. Transitions are monotonic once Started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Initialized,
    Started,
    Stopping,
    Stopped,
    Failed,
}

/// Context handed to an element at `init()` — carries a weak
/// back-reference to the owning Pipeline's Bus, installed at
/// `add_element` time.
#[derive(Clone)]
pub struct ElementContext {
    bus: std::sync::Weak<Bus>,
    pub session_id: Option<uuid::Uuid>,
    cancel: watch::Receiver<bool>,
}

impl ElementContext {
    pub fn new(bus: &Arc<Bus>, session_id: Option<uuid::Uuid>, cancel: watch::Receiver<bool>) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            session_id,
            cancel,
        }
    }

    /// Upgrade to a strong reference for the duration of a publish call.
    /// Returns `None` if the owning Pipeline has already been torn down —
    /// a dropped publish in that case is correct, not an error.
    pub fn bus(&self) -> Option<Arc<Bus>> {
        self.bus.upgrade()
    }

    /// Cancellation signal propagated from `Pipeline::stop`. Elements that
    /// spawn their own I/O tasks (streaming recognizer/TTS sessions) should
    /// race this against their network reads so they tear down promptly.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

/// The one trait every pipeline stage implements.
///
/// Contract: read one message from input, apply the transform, write
/// zero or more messages to output, loop. On input EOF, flush, close
/// output, exit. On fatal transform error, publish `pipeline.error`,
/// close output, exit — the *element* decides fatal vs recoverable;
/// structural errors are handled one level up, by `Pipeline::start`.
#[async_trait]
pub trait Element: Send + Sync + Any {
    /// Stable, unique-within-a-pipeline name.
    fn name(&self) -> &str;

    /// Called once, in insertion order, before any worker is spawned.
    /// A failing `init` aborts `Pipeline::start` atomically.
    async fn init(&mut self, ctx: ElementContext) -> Result<(), String>;

    /// Apply this stage's transform to one input message, returning zero
    /// or more output messages. Called by the element's worker loop in
    /// `Pipeline::start`. Implementations must not block on anything but
    /// their own suspension points (no CPU-bound work holding a lock
    /// across a network call, etc).
    ///
    /// Returning `Err` is a *fatal* transform error: the worker publishes
    /// it on the Bus and closes its output. Recoverable errors (a remote
    /// outage) must be handled inside the element — publish
    /// `pipeline.error` via `ElementContext::bus` and return `Ok(vec![])`.
    async fn process(&mut self, msg: PipelineMessage) -> Result<Vec<PipelineMessage>, PipelineError>;

    /// Called once on clean input EOF, after the last `process()` call,
    /// to flush any buffered output before the worker closes its output
    /// edge and exits.
    async fn flush(&mut self) -> Result<Vec<PipelineMessage>, PipelineError> {
        Ok(vec![])
    }

    /// Graceful teardown, called during `Pipeline::stop` or when `init`
    /// fails for a later element (reverse-order unwind).
    async fn shutdown(&mut self) {}

    fn as_any(&self) -> &dyn Any;
}
