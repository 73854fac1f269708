//! Crate-wide error taxonomy.
//!
//! Every subsystem (VAD, ASR, TTS, segmenter, pipeline) defines its own
//! `thiserror` enum for precise local matching, then maps into [`ErrorKind`]
//! at the point where it crosses onto the Bus as a `pipeline.error` event.
//! Transforms never surface errors through the data channel — only through
//! the Bus (see `bus.rs`).

use thiserror::Error;

/// The coarse error classification carried on `pipeline.error` Bus events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing/invalid required options, surfaced at construction. Fatal.
    Config,
    /// Malformed or truncated audio. Recoverable (drop frame).
    Audio,
    /// Credentials rejected by a provider. Fatal for that element's session.
    Auth,
    /// Rate limit or quota exceeded. Same handling as Auth.
    Quota,
    /// Transient transport failure. Triggers reconnection backoff.
    Network,
    /// Remote returned an error event. Logged, Bus-reported, non-fatal.
    Provider,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Audio => "audio",
            ErrorKind::Auth => "auth",
            ErrorKind::Quota => "quota",
            ErrorKind::Network => "network",
            ErrorKind::Provider => "provider",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// A classified error as it appears on the Bus.
#[derive(Debug, Clone)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub message: String,
    pub element: Option<String>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            element: None,
        }
    }

    pub fn from_element(kind: ErrorKind, element: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            element: Some(element.to_string()),
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.element {
            Some(e) => write!(f, "[{}] {:?}: {}", e, self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Errors raised while building or driving the graph itself (structural,
/// not per-stage transform errors — those stay inside the element and are
/// reported on the Bus instead).
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("element '{0}' is already owned by a pipeline")]
    AlreadyOwned(String),

    #[error("pipeline already started; cannot add elements")]
    AlreadyStarted,

    #[error("element '{0}' not found in this pipeline")]
    UnknownElement(String),

    #[error("linking '{src}' -> '{dst}' would create a cycle")]
    WouldCreateCycle { src: String, dst: String },

    #[error("element '{0}' already has an inbound edge")]
    AlreadyLinked(String),

    #[error("element '{0}' failed to initialize: {1}")]
    InitFailed(String, String),
}
