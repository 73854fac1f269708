//! Sample-rate and channel conversion element.
//!
//! Drives `rubato::FftFixedInOut` for deterministic, band-limited rate
//! conversion, layering channel mixing before/after the rubato resample
//! so it can serve multi-channel ingress/egress as well as mono.

use async_trait::async_trait;
use rubato::{FftFixedInOut, Resampler};
use tracing::debug;

use crate::audio::constants::BYTES_PER_SAMPLE_S16LE;
use crate::element::{Element, ElementContext};
use crate::error::{ErrorKind, PipelineError};
use crate::message::{AudioData, MediaType, MessageType, PipelineMessage};

/// Samples handed to the rubato resampler per call. Smaller means lower
/// latency through this stage, larger means fewer FFT calls.
const CHUNK_FRAMES: usize = 1024;

pub struct AudioResampleElement {
    name: String,
    src_rate: u32,
    dst_rate: u32,
    src_channels: u16,
    dst_channels: u16,
    resampler: Option<FftFixedInOut<f32>>,
    /// Interleaved-to-mono input accumulator, in post-channel-mix f32
    /// samples, awaiting a full `CHUNK_FRAMES` chunk for the resampler.
    pending: Vec<f32>,
}

impl AudioResampleElement {
    pub fn new(name: impl Into<String>, src_rate: u32, dst_rate: u32, src_channels: u16, dst_channels: u16) -> Self {
        Self {
            name: name.into(),
            src_rate,
            dst_rate,
            src_channels,
            dst_channels,
            resampler: None,
            pending: Vec::new(),
        }
    }

    fn needs_rate_conversion(&self) -> bool {
        self.src_rate != self.dst_rate
    }

    /// Mono-reduce/expand before resampling: average for down-mix, copy
    /// the single channel for up-mix.
    fn mix_to_mono(&self, samples: &[i16]) -> Vec<f32> {
        if self.src_channels <= 1 {
            return samples.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
        }
        let ch = self.src_channels as usize;
        samples
            .chunks(ch)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum as f32 / frame.len() as f32) / i16::MAX as f32
            })
            .collect()
    }

    /// Expand mono f32 back out to `dst_channels` by copying.
    fn mix_from_mono(&self, mono: &[f32]) -> Vec<i16> {
        let scale = i16::MAX as f32;
        let mut out = Vec::with_capacity(mono.len() * self.dst_channels.max(1) as usize);
        for &s in mono {
            let sample = (s * scale).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            for _ in 0..self.dst_channels.max(1) {
                out.push(sample);
            }
        }
        out
    }

    fn pcm_bytes_to_i16(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn i16_to_pcm_bytes(samples: &[i16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE_S16LE);
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// Resample whatever mono f32 samples are fully chunked; leaves any
    /// remainder under `CHUNK_FRAMES` in `self.pending` for next call.
    fn resample_ready_chunks(&mut self, drain_all: bool) -> Result<Vec<f32>, PipelineError> {
        let Some(resampler) = self.resampler.as_mut() else {
            // No rate conversion configured: pass through unchanged.
            return Ok(std::mem::take(&mut self.pending));
        };

        let mut output = Vec::new();
        loop {
            if self.pending.len() < CHUNK_FRAMES {
                if drain_all && !self.pending.is_empty() {
                    // Pad the final partial chunk with silence so rubato's
                    // fixed-size resampler can still process it.
                    self.pending.resize(CHUNK_FRAMES, 0.0);
                } else {
                    break;
                }
            }
            let chunk: Vec<f32> = self.pending.drain(..CHUNK_FRAMES).collect();
            let waves_in = vec![chunk];
            let waves_out = resampler
                .process(&waves_in, None)
                .map_err(|e| PipelineError::new(ErrorKind::Audio, format!("resample failed: {e}")))?;
            if let Some(mono_out) = waves_out.into_iter().next() {
                output.extend(mono_out);
            }
            if drain_all && self.pending.is_empty() {
                break;
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Element for AudioResampleElement {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, _ctx: ElementContext) -> Result<(), String> {
        if self.needs_rate_conversion() {
            let resampler = FftFixedInOut::<f32>::new(
                self.src_rate as usize,
                self.dst_rate as usize,
                CHUNK_FRAMES,
                1,
            )
            .map_err(|e| format!("failed to build resampler {}->{}: {e}", self.src_rate, self.dst_rate))?;
            self.resampler = Some(resampler);
        }
        debug!(
            element = self.name.as_str(),
            src_rate = self.src_rate,
            dst_rate = self.dst_rate,
            "resample element initialized"
        );
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
            // Only S16LE PCM is convertible here; pass through
            // compressed/opaque formats unchanged.
            return Ok(vec![msg]);
        }
        if !audio.is_well_formed() {
            return Err(PipelineError::new(ErrorKind::Audio, "malformed PCM buffer"));
        }

        let samples = Self::pcm_bytes_to_i16(&audio.bytes);
        let mono = self.mix_to_mono(&samples);
        self.pending.extend(mono);

        let resampled = self.resample_ready_chunks(false)?;
        if resampled.is_empty() {
            return Ok(vec![]);
        }
        let out_samples = self.mix_from_mono(&resampled);
        let out_audio = AudioData {
            bytes: Self::i16_to_pcm_bytes(&out_samples),
            sample_rate: self.dst_rate,
            channels: self.dst_channels,
            media_type: MediaType::RawPcmS16Le,
            timestamp: audio.timestamp,
            sequence: audio.sequence,
        };
        Ok(vec![PipelineMessage::audio(out_audio, msg.session_id)])
    }

    async fn flush(&mut self) -> Result<Vec<PipelineMessage>, PipelineError> {
        let resampled = self.resample_ready_chunks(true)?;
        if resampled.is_empty() {
            return Ok(vec![]);
        }
        let out_samples = self.mix_from_mono(&resampled);
        let out_audio = AudioData {
            bytes: Self::i16_to_pcm_bytes(&out_samples),
            sample_rate: self.dst_rate,
            channels: self.dst_channels,
            media_type: MediaType::RawPcmS16Le,
            timestamp: 0,
            sequence: None,
        };
        Ok(vec![PipelineMessage::audio(out_audio, None)])
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_wave_pcm(num_samples: usize, freq: f32, rate: u32) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(num_samples * 2);
        for n in 0..num_samples {
            let t = n as f32 / rate as f32;
            let v = (std::f32::consts::TAU * freq * t).sin();
            let s = (v * i16::MAX as f32) as i16;
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    #[tokio::test]
    async fn passthrough_when_rates_match() {
        let mut el = AudioResampleElement::new("resample", 16_000, 16_000, 1, 1);
        el.init(test_ctx()).await.unwrap();
        let bytes = sine_wave_pcm(1600, 440.0, 16_000);
        let audio = AudioData {
            bytes: bytes.clone(),
            sample_rate: 16_000,
            channels: 1,
            media_type: MediaType::RawPcmS16Le,
            timestamp: 0,
            sequence: None,
        };
        let out = el.process(PipelineMessage::audio(audio, None)).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].audio.as_ref().unwrap().bytes, bytes);
    }

    #[tokio::test]
    async fn deterministic_across_runs() {
        let bytes = sine_wave_pcm(4096, 440.0, 16_000);
        let run = || async {
            let mut el = AudioResampleElement::new("resample", 16_000, 8_000, 1, 1);
            el.init(test_ctx()).await.unwrap();
            let audio = AudioData {
                bytes: bytes.clone(),
                sample_rate: 16_000,
                channels: 1,
                media_type: MediaType::RawPcmS16Le,
                timestamp: 0,
                sequence: None,
            };
            let mut out = el.process(PipelineMessage::audio(audio, None)).await.unwrap();
            out.extend(el.flush().await.unwrap());
            out.into_iter()
                .flat_map(|m| m.audio.unwrap().bytes)
                .collect::<Vec<u8>>()
        };
        let a = run().await;
        let b = run().await;
        assert_eq!(a, b);
        assert!(!a.is_empty());
    }

    #[tokio::test]
    async fn downmix_stereo_averages_channels() {
        let mut el = AudioResampleElement::new("resample", 16_000, 16_000, 2, 1);
        el.init(test_ctx()).await.unwrap();
        // L=+1000, R=-1000 for every frame -> average ~= 0.
        let mut bytes = Vec::new();
        for _ in 0..100 {
            bytes.extend_from_slice(&1000i16.to_le_bytes());
            bytes.extend_from_slice(&(-1000i16).to_le_bytes());
        }
        let audio = AudioData {
            bytes,
            sample_rate: 16_000,
            channels: 2,
            media_type: MediaType::RawPcmS16Le,
            timestamp: 0,
            sequence: None,
        };
        let out = el.process(PipelineMessage::audio(audio, None)).await.unwrap();
        let out_audio = &out[0].audio.as_ref().unwrap();
        assert_eq!(out_audio.channels, 1);
        let samples = AudioResampleElement::pcm_bytes_to_i16(&out_audio.bytes);
        assert!(samples.iter().all(|&s| s.abs() < 10));
    }

    fn test_ctx() -> ElementContext {
        let bus = std::sync::Arc::new(crate::bus::Bus::new());
        let (_tx, rx) = tokio::sync::watch::channel(false);
        ElementContext::new(&bus, None, rx)
    }
}
