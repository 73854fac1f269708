//! Configuration structs for every element/provider.
//!
//! Plain Rust structs, constructed by the embedding application — no
//! `.env`/CLI parsing here. Every provider validates its own config at
//! construction time, synchronously, rather than lazily on first use.

use crate::error::{ErrorKind, PipelineError};

fn config_error(message: impl Into<String>) -> PipelineError {
    PipelineError::new(ErrorKind::Config, message)
}

/// Shared across every remote ASR/TTS provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    /// Provider-specific model id. Empty means "use the provider default".
    pub model: String,
    /// ISO-639-1 code or `"auto"`. Normalized per provider — pinned to
    /// strip-region + lowercase, see `normalize_language`.
    pub language: String,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.api_key.trim().is_empty() {
            return Err(config_error("api_key is required"));
        }
        Ok(())
    }
}

/// Strip a region subtag and lowercase, e.g. `zh-CN` -> `zh`, `EN-us` ->
/// `en`. Applied uniformly by every provider rather than a divergent
/// per-vendor scheme.
pub fn normalize_language(language: &str) -> String {
    let lower = language.trim().to_lowercase();
    match lower.split_once(['-', '_']) {
        Some((base, _region)) => base.to_string(),
        None => lower,
    }
}

/// Audio format options. Scribe-style streaming ASR requires
/// `sample_rate == 16000 && channels == 1 && bits_per_sample == 16` —
/// validated at construction.
#[derive(Debug, Clone, Copy)]
pub struct AudioFormatConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl Default for AudioFormatConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            bits_per_sample: 16,
        }
    }
}

/// Configuration shared by every streaming ASR element.
#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub provider: ProviderConfig,
    pub audio: AudioFormatConfig,
    pub enable_partial_results: bool,
    /// Whether the ASR element subscribes to `vad.speech.end` to drive
    /// commits. When false, the element never commits on its own.
    pub vad_enabled: bool,
    /// Reconnection policy: initial backoff, cap, attempt count.
    pub reconnect_initial_backoff_ms: u64,
    pub reconnect_backoff_cap_ms: u64,
    pub reconnect_max_attempts: u32,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                api_key: String::new(),
                model: String::new(),
                language: "auto".to_string(),
            },
            audio: AudioFormatConfig::default(),
            enable_partial_results: true,
            vad_enabled: true,
            reconnect_initial_backoff_ms: 1_000,
            reconnect_backoff_cap_ms: 10_000,
            reconnect_max_attempts: 3,
        }
    }
}

impl AsrConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.provider.validate()
    }

    /// Scribe-style dialect rejects anything but 16 kHz mono 16-bit at
    /// construction.
    pub fn validate_scribe_format(&self) -> Result<(), PipelineError> {
        self.validate()?;
        let a = self.audio;
        if a.sample_rate != 16_000 || a.channels != 1 || a.bits_per_sample != 16 {
            return Err(config_error(format!(
                "scribe-style recognizer requires 16000/1/16, got {}/{}/{}",
                a.sample_rate, a.channels, a.bits_per_sample
            )));
        }
        Ok(())
    }
}

/// VAD tuning.
#[derive(Debug, Clone, Copy)]
pub struct VadConfig {
    pub threshold: f32,
    pub min_silence_dur_ms: u64,
    pub speech_pad_ms: u64,
    /// Audio retained from before a detected speech start and delivered
    /// alongside it, so downstream consumers see the onset rather than
    /// a window starting partway into the utterance.
    pub pre_roll_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_silence_dur_ms: 500,
            speech_pad_ms: 200,
            pre_roll_ms: 0,
        }
    }
}

impl VadConfig {
    /// Hysteresis margin below `threshold` required before a Speech ->
    /// Silence transition is considered.
    pub const HYSTERESIS: f32 = 0.15;

    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(config_error("vad threshold must be in [0.0, 1.0]"));
        }
        Ok(())
    }

    pub fn silence_threshold(&self) -> f32 {
        (self.threshold - Self::HYSTERESIS).max(0.0)
    }
}

/// Segmenter mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmenterMode {
    Sentence,
    Phrase,
    Hybrid,
}

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub mode: SegmenterMode,
    pub look_ahead: usize,
    pub min_segment_len: usize,
    pub max_segment_len: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            mode: SegmenterMode::Sentence,
            look_ahead: 32,
            min_segment_len: 5,
            max_segment_len: 1000,
        }
    }
}

impl SegmenterConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.min_segment_len == 0 || self.min_segment_len > self.max_segment_len {
            return Err(config_error("invalid min/max segment length"));
        }
        if self.look_ahead == 0 {
            return Err(config_error("look_ahead must be > 0"));
        }
        Ok(())
    }
}

/// TTS voice/style parameters. Not every dialect consumes every field —
/// e.g. `chunk_length_schedule` is WS-only.
#[derive(Debug, Clone, Default)]
pub struct VoiceStyleConfig {
    pub voice_id: String,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub stability: Option<f32>,
    pub similarity_boost: Option<f32>,
    pub latency_optimization: Option<u8>,
    pub instructions: Option<String>,
    pub chunk_length_schedule: Option<Vec<u32>>,
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: ProviderConfig,
    pub voice: VoiceStyleConfig,
}

impl TtsConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.provider.validate()
    }
}

/// Chat/LLM element configuration.
#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub provider: ProviderConfig,
    pub max_history_turns: usize,
    pub system_prompt: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                api_key: String::new(),
                model: String::new(),
                language: "auto".to_string(),
            },
            max_history_turns: 10,
            system_prompt: None,
        }
    }
}

impl ChatConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.provider.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_normalization_strips_region_and_lowercases() {
        assert_eq!(normalize_language("zh-CN"), "zh");
        assert_eq!(normalize_language("EN-us"), "en");
        assert_eq!(normalize_language("fr"), "fr");
        assert_eq!(normalize_language("auto"), "auto");
    }

    #[test]
    fn scribe_format_rejects_non_16k_mono() {
        let mut cfg = AsrConfig {
            provider: ProviderConfig {
                api_key: "k".into(),
                model: String::new(),
                language: "en".into(),
            },
            ..AsrConfig::default()
        };
        cfg.audio.sample_rate = 48_000;
        assert!(cfg.validate_scribe_format().is_err());
        cfg.audio.sample_rate = 16_000;
        assert!(cfg.validate_scribe_format().is_ok());
    }

    #[test]
    fn missing_api_key_is_config_error() {
        let cfg = AsrConfig::default();
        assert!(matches!(
            cfg.validate(),
            Err(PipelineError { kind: ErrorKind::Config, .. })
        ));
    }
}
