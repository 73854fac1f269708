//! Streaming & batch ASR provider contract.
//!
//! A small capability set sits behind one trait so multiple ASR backends
//! can plug in: batch recognition, opening a streaming session, and
//! reporting what languages/modes a given backend supports.

pub mod batch;
pub mod element;
pub mod realtime;
pub mod scribe;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone)]
pub enum ASRError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("quota or rate limit exceeded: {0}")]
    Quota(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider error: {0}")]
    Provider(String),
    #[error("malformed or truncated audio: {0}")]
    Audio(String),
}

impl ASRError {
    pub fn to_error_kind(&self) -> crate::error::ErrorKind {
        use crate::error::ErrorKind;
        match self {
            ASRError::Config(_) => ErrorKind::Config,
            ASRError::Auth(_) => ErrorKind::Auth,
            ASRError::Quota(_) => ErrorKind::Quota,
            ASRError::Network(_) => ErrorKind::Network,
            ASRError::Provider(_) => ErrorKind::Provider,
            ASRError::Audio(_) => ErrorKind::Audio,
        }
    }
}

pub type ASRResult<T> = Result<T, ASRError>;

/// A single recognition result, partial or final.
#[derive(Debug, Clone)]
pub struct RecognitionResult {
    pub text: String,
    pub is_final: bool,
    pub confidence: f32,
    pub words: Vec<WordTiming>,
}

#[derive(Debug, Clone)]
pub struct WordTiming {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub confidence: f32,
}

/// Recognizer session lifecycle: Connecting -> Ready -> Closed. One-way
/// once Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognizerState {
    Connecting,
    Ready,
    Closed,
}

/// A per-call streaming recognizer instance, owned by an [`AsrElement`](element::AsrElement).
#[async_trait]
pub trait StreamingRecognizer: Send {
    /// Forward raw PCM to the recognizer. Dropped silently (with a
    /// warning) if the session is not yet Ready.
    async fn send_audio(&mut self, pcm: &[u8]) -> ASRResult<()>;

    /// Explicit manual-commit signal, delimiting an utterance.
    async fn commit(&mut self) -> ASRResult<()>;

    /// Hand ownership of the results channel to the caller. Called
    /// exactly once, right after the session is created, so the owning
    /// element's result-fan-out task can `recv().await` on it without
    /// contending with `send_audio`/`commit` for a shared lock.
    fn take_results(&mut self) -> mpsc::Receiver<RecognitionResult>;

    fn state(&self) -> RecognizerState;

    async fn close(&mut self);
}

/// The polymorphic provider plug-in point.
#[async_trait]
pub trait AsrProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Buffered batch recognition.
    async fn recognize(&self, pcm: &[u8], sample_rate: u32, channels: u16) -> ASRResult<RecognitionResult>;

    /// Open a new streaming session.
    async fn streaming_recognize(&self, sample_rate: u32, channels: u16, language: &str) -> ASRResult<Box<dyn StreamingRecognizer>>;

    fn supports_streaming(&self) -> bool;

    fn supported_languages(&self) -> Vec<String>;
}
