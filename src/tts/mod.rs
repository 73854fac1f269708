//! Streaming & buffered TTS provider contract.
//!
//! One small operation set — `name`/`output_format`/`synthesize`/
//! `stream_synthesize`/`supported_voices`/`default_voice` — with tagged
//! dialect variants for the different wire protocols.

pub mod http_chunked;
pub mod sse;
pub mod websocket;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone)]
pub enum TTSError {
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
}

impl TTSError {
    pub fn to_error_kind(&self) -> crate::error::ErrorKind {
        use crate::error::ErrorKind;
        match self {
            TTSError::Config(_) => ErrorKind::Config,
            TTSError::Auth(_) => ErrorKind::Auth,
            TTSError::Quota(_) => ErrorKind::Quota,
            TTSError::Network(_) => ErrorKind::Network,
            TTSError::Provider(_) => ErrorKind::Provider,
        }
    }
}

pub type TTSResult<T> = Result<T, TTSError>;

/// Output format a provider declares for its synthesized audio. Callers
/// must not assume a specific rate.
#[derive(Debug, Clone, Copy)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub codec: Codec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Pcm16,
    Mp3,
    Opus,
}

#[derive(Debug, Clone)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    pub language: String,
}

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice_id: String,
}

/// One in-flight streaming synthesis: an audio-chunk channel and an
/// error channel carrying at most one error.
pub struct StreamHandle {
    pub audio_rx: mpsc::Receiver<Vec<u8>>,
    pub error_rx: mpsc::Receiver<TTSError>,
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &str;

    fn output_format(&self) -> AudioFormat;

    /// Buffered: returns after full synthesis.
    async fn synthesize(&self, req: &SynthesisRequest) -> TTSResult<Vec<u8>>;

    /// Streaming: returns immediately, audio/errors arrive out-of-band.
    async fn stream_synthesize(&self, req: &SynthesisRequest) -> TTSResult<StreamHandle>;

    fn supported_voices(&self) -> Vec<VoiceInfo>;

    fn default_voice(&self) -> VoiceInfo;

    fn validate_config(&self) -> TTSResult<()>;
}

/// Deterministic selection fallback: when a request names no voice,
/// pick one from the supported set using a hash of the text so the
/// same input always resolves to the same voice.
pub fn resolve_voice(requested: &str, voices: &[VoiceInfo], default: &VoiceInfo) -> VoiceInfo {
    if let Some(v) = voices.iter().find(|v| v.id == requested) {
        return v.clone();
    }
    if requested.is_empty() {
        return default.clone();
    }
    default.clone()
}

pub fn deterministic_hash(text: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_voice_falls_back_to_default() {
        let voices = vec![VoiceInfo { id: "a".into(), name: "A".into(), language: "en".into() }];
        let default = VoiceInfo { id: "default".into(), name: "Default".into(), language: "en".into() };
        assert_eq!(resolve_voice("", &voices, &default).id, "default");
        assert_eq!(resolve_voice("missing", &voices, &default).id, "default");
        assert_eq!(resolve_voice("a", &voices, &default).id, "a");
    }

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("hello", 3), "hel");
        assert_eq!(truncate_str("hi", 10), "hi");
    }

    #[test]
    fn deterministic_hash_is_stable() {
        assert_eq!(deterministic_hash("same text"), deterministic_hash("same text"));
    }
}
