//! Voice-activity detection element.
//!
//! A pluggable per-frame probability source drives a hysteresis state
//! machine; this crate bundles an RMS-energy-over-noise-floor estimator
//! rather than a Silero/WebRTC acoustic model, but any `SpeechProbability`
//! implementation can be swapped in behind it.

use std::collections::VecDeque;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::audio::constants::{BYTES_PER_SAMPLE_S16LE, VAD_FRAME_SIZE};
use crate::bus::topics;
use crate::config::VadConfig;
use crate::element::{Element, ElementContext};
use crate::error::{ErrorKind, PipelineError};
use crate::message::{MediaType, MessageType, PipelineMessage};

#[derive(Debug, Error)]
pub enum VADError {
    #[error("invalid vad configuration: {0}")]
    Config(String),
}

/// Hysteresis state machine driving speech-start/speech-end events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VadState {
    Silence,
    MaybeSpeech,
    Speech,
    MaybeSilence,
}

/// A pluggable per-frame speech-probability source. Exists so the
/// element's state machine is testable without a real acoustic model.
pub trait SpeechProbability: Send {
    fn probability(&mut self, frame: &[i16]) -> f32;
}

/// Energy-based heuristic probability estimator: normalized RMS energy
/// of the frame against a running noise floor. Stands in for a bundled
/// acoustic model, behind the same pluggable trait any real backend
/// plugs into.
pub struct EnergyProbability {
    /// Running noise floor estimate, updated with an exponential moving
    /// average so quiet rooms don't read as constant "maybe speech".
    noise_floor: f32,
}

impl Default for EnergyProbability {
    fn default() -> Self {
        Self { noise_floor: 50.0 }
    }
}

impl SpeechProbability for EnergyProbability {
    fn probability(&mut self, frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }
        let rms = {
            let sum_sq: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
            (sum_sq / frame.len() as f64).sqrt() as f32
        };
        self.noise_floor = self.noise_floor * 0.99 + rms.min(self.noise_floor * 4.0 + 1.0) * 0.01;
        let snr = rms / self.noise_floor.max(1.0);
        // Map SNR onto (0, 1) with a soft knee so the probability doesn't
        // saturate at 1.0 for merely loud (vs. speech-shaped) audio.
        (snr / (snr + 4.0)).clamp(0.0, 1.0)
    }
}

/// Gating VAD: messages are forwarded, but while in Silence/MaybeSpeech
/// they are held in a bounded pre-roll window instead of passing
/// straight through, so that when speech starts the caller also
/// receives the audio leading up to it.
pub struct VadElement {
    name: String,
    config: VadConfig,
    probability: Box<dyn SpeechProbability>,
    state: VadState,
    /// Accumulated S16LE samples not yet long enough for one analysis frame.
    frame_buffer: Vec<i16>,
    /// Consecutive below-silence-threshold duration while in Speech/MaybeSilence.
    below_threshold_ms: u64,
    now_ms: u64,
    ctx: Option<ElementContext>,
    /// Messages held during Silence/MaybeSpeech, each tagged with its
    /// audio duration, kept trimmed to `config.pre_roll_ms` total.
    pre_roll: VecDeque<(PipelineMessage, u64)>,
    pre_roll_duration_ms: u64,
}

impl VadElement {
    pub fn new(name: impl Into<String>, config: VadConfig) -> Self {
        Self::with_probability(name, config, Box::new(EnergyProbability::default()))
    }

    pub fn with_probability(name: impl Into<String>, config: VadConfig, probability: Box<dyn SpeechProbability>) -> Self {
        Self {
            name: name.into(),
            config,
            probability,
            state: VadState::Silence,
            frame_buffer: Vec::new(),
            below_threshold_ms: 0,
            now_ms: 0,
            ctx: None,
            pre_roll: VecDeque::new(),
            pre_roll_duration_ms: 0,
        }
    }

    fn frame_duration_ms(sample_rate: u32) -> u64 {
        (VAD_FRAME_SIZE as u64 * 1000) / sample_rate.max(1) as u64
    }

    fn publish(&self, topic: &str, payload: serde_json::Value) {
        if let Some(ctx) = &self.ctx {
            if let Some(bus) = ctx.bus() {
                bus.publish(topic, payload, self.now_ms, ctx.session_id);
            }
        }
    }

    /// Process one analysis frame, returning `true` if this frame
    /// transitioned Silence/MaybeSpeech -> Speech.
    fn on_frame(&mut self, frame: &[i16], frame_duration_ms: u64) -> bool {
        let prob = self.probability.probability(frame);
        self.now_ms += frame_duration_ms;

        match self.state {
            VadState::Silence | VadState::MaybeSpeech => {
                if prob >= self.config.threshold {
                    self.state = VadState::Speech;
                    self.below_threshold_ms = 0;
                    let ts = self
                        .now_ms
                        .saturating_sub(self.config.speech_pad_ms)
                        .saturating_sub(self.config.pre_roll_ms);
                    info!(element = self.name.as_str(), prob, "vad speech start");
                    self.publish(topics::VAD_SPEECH_START, serde_json::json!({"timestamp": ts}));
                    return true;
                }
                self.state = VadState::Silence;
            }
            VadState::Speech | VadState::MaybeSilence => {
                if prob < self.config.silence_threshold() {
                    self.below_threshold_ms += frame_duration_ms;
                    self.state = VadState::MaybeSilence;
                    if self.below_threshold_ms >= self.config.min_silence_dur_ms {
                        self.state = VadState::Silence;
                        let ts = self.now_ms + self.config.speech_pad_ms;
                        info!(element = self.name.as_str(), prob, "vad speech end");
                        self.publish(topics::VAD_SPEECH_END, serde_json::json!({"timestamp": ts}));
                        self.below_threshold_ms = 0;
                    }
                } else {
                    self.state = VadState::Speech;
                    self.below_threshold_ms = 0;
                }
            }
        }
        false
    }
}

#[async_trait]
impl Element for VadElement {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, ctx: ElementContext) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.config.threshold) {
            return Err(VADError::Config("threshold must be in [0.0, 1.0]".into()).to_string());
        }
        self.ctx = Some(ctx);
        debug!(element = self.name.as_str(), "vad element initialized");
        Ok(())
    }

    async fn process(&mut self, msg: PipelineMessage) -> Result<Vec<PipelineMessage>, PipelineError> {
        if msg.msg_type != MessageType::Audio {
            return Ok(vec![msg]);
        }
        let Some(audio) = msg.audio.as_ref() else {
            return Ok(vec![msg]);
        };
        if audio.media_type != MediaType::RawPcmS16Le {
            return Ok(vec![msg]);
        }
        if !audio.is_well_formed() {
            return Err(PipelineError::new(ErrorKind::Audio, "malformed PCM buffer"));
        }

        let samples: Vec<i16> = audio
            .bytes
            .chunks_exact(BYTES_PER_SAMPLE_S16LE)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        self.frame_buffer.extend(samples);

        let frame_duration_ms = Self::frame_duration_ms(audio.sample_rate);
        let msg_duration_ms = (samples.len() as u64 * 1000) / (audio.sample_rate as u64).max(1);
        let mut speech_started = false;
        while self.frame_buffer.len() >= VAD_FRAME_SIZE {
            let frame: Vec<i16> = self.frame_buffer.drain(..VAD_FRAME_SIZE).collect();
            if self.on_frame(&frame, frame_duration_ms) {
                speech_started = true;
            }
        }

        if self.config.pre_roll_ms == 0 {
            return Ok(vec![msg]);
        }

        if speech_started {
            let mut out: Vec<PipelineMessage> = self.pre_roll.drain(..).map(|(m, _)| m).collect();
            self.pre_roll_duration_ms = 0;
            out.push(msg);
            return Ok(out);
        }

        if matches!(self.state, VadState::Speech | VadState::MaybeSilence) {
            // Already speaking: never swallow audio, pass straight through.
            return Ok(vec![msg]);
        }

        // Silence/MaybeSpeech: hold in the pre-roll window, releasing
        // whatever falls outside it so nothing is lost, just delayed.
        self.pre_roll.push_back((msg, msg_duration_ms));
        self.pre_roll_duration_ms += msg_duration_ms;
        let mut out = Vec::new();
        while self.pre_roll_duration_ms > self.config.pre_roll_ms {
            let Some((old_msg, old_dur)) = self.pre_roll.pop_front() else { break };
            self.pre_roll_duration_ms = self.pre_roll_duration_ms.saturating_sub(old_dur);
            out.push(old_msg);
        }
        Ok(out)
    }

    async fn flush(&mut self) -> Result<Vec<PipelineMessage>, PipelineError> {
        self.pre_roll_duration_ms = 0;
        Ok(self.pre_roll.drain(..).map(|(m, _)| m).collect())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::message::AudioData;

    struct ScriptedProbability {
        values: std::vec::IntoIter<f32>,
    }

    impl SpeechProbability for ScriptedProbability {
        fn probability(&mut self, _frame: &[i16]) -> f32 {
            self.values.next().unwrap_or(0.0)
        }
    }

    fn test_ctx() -> ElementContext {
        let bus = std::sync::Arc::new(crate::bus::Bus::new());
        let (_tx, rx) = tokio::sync::watch::channel(false);
        ElementContext::new(&bus, None, rx)
    }

    fn silence_frame() -> Vec<u8> {
        vec![0u8; VAD_FRAME_SIZE * 2]
    }

    #[tokio::test]
    async fn emits_start_then_end_with_hysteresis() {
        // 1 frame above threshold (speech), then enough below-silence
        // frames to cross min_silence_dur_ms.
        let cfg = VadConfig {
            threshold: 0.5,
            min_silence_dur_ms: 64, // 2 frames at 32ms/frame
            speech_pad_ms: 0,
            pre_roll_ms: 0,
        };
        let probs = ScriptedProbability {
            values: vec![0.9, 0.1, 0.1, 0.1].into_iter(),
        };
        let bus = std::sync::Arc::new(crate::bus::Bus::new());
        let (_tx, rx) = tokio::sync::watch::channel(false);
        let ctx = ElementContext::new(&bus, None, rx);
        let (mut start_rx, _) = bus.subscribe(topics::VAD_SPEECH_START);
        let (mut end_rx, _) = bus.subscribe(topics::VAD_SPEECH_END);

        let mut el = VadElement::with_probability("vad", cfg, Box::new(probs));
        el.init(ctx).await.unwrap();

        for _ in 0..4 {
            let audio = AudioData {
                bytes: silence_frame(),
                sample_rate: 16_000,
                channels: 1,
                media_type: MediaType::RawPcmS16Le,
                timestamp: 0,
                sequence: None,
            };
            let out = el.process(PipelineMessage::audio(audio, None)).await.unwrap();
            assert_eq!(out.len(), 1, "passthrough must never swallow audio");
        }

        assert!(start_rx.try_recv().is_ok());
        assert!(end_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn pre_roll_window_releases_audio_leading_up_to_speech_start() {
        // Each frame is 32ms; a 64ms pre-roll window holds at most 2.
        let cfg = VadConfig {
            threshold: 0.5,
            min_silence_dur_ms: 10_000,
            speech_pad_ms: 0,
            pre_roll_ms: 64,
        };
        let probs = ScriptedProbability {
            values: vec![0.1, 0.1, 0.1, 0.9].into_iter(),
        };
        let ctx = test_ctx();
        let mut el = VadElement::with_probability("vad", cfg, Box::new(probs));
        el.init(ctx).await.unwrap();

        let mut received = Vec::new();
        for _ in 0..4 {
            let audio = AudioData {
                bytes: silence_frame(),
                sample_rate: 16_000,
                channels: 1,
                media_type: MediaType::RawPcmS16Le,
                timestamp: 0,
                sequence: None,
            };
            let out = el.process(PipelineMessage::audio(audio, None)).await.unwrap();
            received.push(out.len());
        }

        // Frames 1-2 held in the window, frame 3 pushed frame 1 out, and
        // speech start on frame 4 flushes the remaining window (frames
        // 2-3) plus frame 4 itself.
        assert_eq!(received, vec![0, 0, 1, 3]);
    }

    #[test]
    fn silence_threshold_applies_hysteresis_margin() {
        let cfg = VadConfig {
            threshold: 0.5,
            ..VadConfig::default()
        };
        assert_relative_eq!(cfg.silence_threshold(), 0.35, epsilon = 1e-6);
    }
}
