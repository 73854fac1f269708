//! Batch ASR provider: finite buffer in, one final result out.
//!
//! Frames raw PCM as canonical WAV and POSTs multipart to a REST
//! endpoint.

use async_trait::async_trait;
use reqwest::multipart;
use tracing::warn;

use super::{ASRError, ASRResult, AsrProvider, RecognitionResult, StreamingRecognizer};
use crate::audio::wav::pcm_to_wav;
use crate::config::ProviderConfig;

/// Audio shorter than this is rejected with an AudioError rather than
/// sent to the remote endpoint.
const MIN_AUDIO_MS: u64 = 100;

pub struct BatchAsrProvider {
    config: ProviderConfig,
    endpoint: String,
    http: reqwest::Client,
}

impl BatchAsrProvider {
    pub fn new(config: ProviderConfig, endpoint: impl Into<String>) -> ASRResult<Self> {
        config.validate().map_err(|e| ASRError::Config(e.message))?;
        Ok(Self {
            config,
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
        })
    }

    fn min_audio_bytes(sample_rate: u32, channels: u16) -> usize {
        let bytes_per_ms = (sample_rate as u64 * channels as u64 * 2) / 1000;
        (bytes_per_ms * MIN_AUDIO_MS) as usize
    }
}

#[async_trait]
impl AsrProvider for BatchAsrProvider {
    fn name(&self) -> &str {
        "batch"
    }

    async fn recognize(&self, pcm: &[u8], sample_rate: u32, channels: u16) -> ASRResult<RecognitionResult> {
        if pcm.is_empty() || pcm.len() < Self::min_audio_bytes(sample_rate, channels) {
            return Err(ASRError::Audio(format!(
                "audio shorter than minimum {MIN_AUDIO_MS}ms accepted by batch ASR"
            )));
        }

        let wav = pcm_to_wav(pcm, sample_rate, channels, 16).map_err(|e| ASRError::Audio(e.message))?;
        let part = multipart::Part::bytes(wav).file_name("audio.wav").mime_str("audio/wav").map_err(|e| ASRError::Provider(e.to_string()))?;
        let form = multipart::Form::new().part("audio", part);

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ASRError::Network(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ASRError::Auth("batch ASR rejected credentials".into()));
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ASRError::Quota("batch ASR rate limited".into()));
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(ASRError::Provider(format!("batch ASR returned {status}: {body}")));
        }

        #[derive(serde::Deserialize)]
        struct BatchResponse {
            text: String,
            #[serde(default)]
            confidence: f32,
        }
        let parsed: BatchResponse = resp.json().await.map_err(|e| ASRError::Provider(e.to_string()))?;
        Ok(RecognitionResult {
            text: parsed.text,
            is_final: true,
            confidence: if parsed.confidence > 0.0 { parsed.confidence } else { 0.9 },
            words: vec![],
        })
    }

    async fn streaming_recognize(&self, _sample_rate: u32, _channels: u16, _language: &str) -> ASRResult<Box<dyn StreamingRecognizer>> {
        warn!("batch provider does not support streaming");
        Err(ASRError::Provider("batch provider does not support streaming".into()))
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["auto".into()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_audio_is_rejected() {
        let provider = BatchAsrProvider::new(
            ProviderConfig { api_key: "k".into(), model: String::new(), language: "en".into() },
            "https://example.invalid/v1/recognize",
        )
        .unwrap();
        let err = provider.recognize(&[], 16_000, 1).await.unwrap_err();
        assert!(matches!(err, ASRError::Audio(_)));
    }

    #[tokio::test]
    async fn short_audio_below_100ms_is_rejected() {
        let provider = BatchAsrProvider::new(
            ProviderConfig { api_key: "k".into(), model: String::new(), language: "en".into() },
            "https://example.invalid/v1/recognize",
        )
        .unwrap();
        let short_pcm = vec![0u8; 100]; // well under 100ms @16kHz mono S16LE (3200 bytes)
        let err = provider.recognize(&short_pcm, 16_000, 1).await.unwrap_err();
        assert!(matches!(err, ASRError::Audio(_)));
    }
}
