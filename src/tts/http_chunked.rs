//! HTTP-chunked streaming TTS dialect.
//!
//! POST JSON with voice settings; output format selected via query
//! string; on 2xx, stream the response body in ~4 KB reads, emitting
//! each read as a chunk.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;

use super::{AudioFormat, StreamHandle, SynthesisRequest, TTSError, TTSResult, TtsProvider, VoiceInfo};
use crate::audio::constants::TTS_HTTP_CHUNK_BYTES;
use crate::config::{ProviderConfig, VoiceStyleConfig};

pub struct HttpChunkedTtsProvider {
    provider: ProviderConfig,
    voice: VoiceStyleConfig,
    endpoint: String,
    output_format_query: String,
    format: AudioFormat,
    http: reqwest::Client,
}

impl HttpChunkedTtsProvider {
    pub fn new(
        provider: ProviderConfig,
        voice: VoiceStyleConfig,
        endpoint: impl Into<String>,
        output_format_query: impl Into<String>,
        format: AudioFormat,
    ) -> TTSResult<Self> {
        if provider.api_key.trim().is_empty() {
            return Err(TTSError::Config("api_key is required".into()));
        }
        Ok(Self {
            provider,
            voice,
            endpoint: endpoint.into(),
            output_format_query: output_format_query.into(),
            format,
            http: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl TtsProvider for HttpChunkedTtsProvider {
    fn name(&self) -> &str {
        "tts-http-chunked"
    }

    fn output_format(&self) -> AudioFormat {
        self.format
    }

    async fn synthesize(&self, req: &SynthesisRequest) -> TTSResult<Vec<u8>> {
        let mut handle = self.stream_synthesize(req).await?;
        let mut audio = Vec::new();
        while let Some(chunk) = handle.audio_rx.recv().await {
            audio.extend(chunk);
        }
        if let Ok(e) = handle.error_rx.try_recv() {
            return Err(e);
        }
        Ok(audio)
    }

    async fn stream_synthesize(&self, req: &SynthesisRequest) -> TTSResult<StreamHandle> {
        let url = format!("{}?output_format={}", self.endpoint, self.output_format_query);
        let body = json!({
            "text": req.text,
            "model": self.provider.model,
            "voice_settings": {
                "stability": self.voice.stability,
                "similarity_boost": self.voice.similarity_boost,
                "speed": self.voice.speed,
            }
        });

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.provider.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| TTSError::Network(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(TTSError::Auth("tts provider rejected credentials".into()));
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TTSError::Quota("tts provider rate limited".into()));
        }
        if !resp.status().is_success() {
            return Err(TTSError::Provider(format!("tts provider returned {}", resp.status())));
        }

        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut buf = Vec::new();
            while let Some(chunk) = byte_stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        buf.extend_from_slice(&bytes);
                        while buf.len() >= TTS_HTTP_CHUNK_BYTES {
                            let rest = buf.split_off(TTS_HTTP_CHUNK_BYTES);
                            if audio_tx.send(buf).await.is_err() {
                                return;
                            }
                            buf = rest;
                        }
                    }
                    Err(e) => {
                        let _ = error_tx.send(TTSError::Network(e.to_string())).await;
                        return;
                    }
                }
            }
            if !buf.is_empty() {
                let _ = audio_tx.send(buf).await;
            }
        });

        Ok(StreamHandle { audio_rx, error_rx })
    }

    fn supported_voices(&self) -> Vec<VoiceInfo> {
        vec![]
    }

    fn default_voice(&self) -> VoiceInfo {
        VoiceInfo {
            id: self.voice.voice_id.clone(),
            name: self.voice.voice_id.clone(),
            language: "auto".into(),
        }
    }

    fn validate_config(&self) -> TTSResult<()> {
        if self.provider.api_key.trim().is_empty() {
            return Err(TTSError::Config("api_key is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_api_key_at_construction() {
        let provider = ProviderConfig { api_key: String::new(), model: String::new(), language: "en".into() };
        let voice = VoiceStyleConfig::default();
        let format = AudioFormat { sample_rate: 16_000, channels: 1, codec: super::Codec::Pcm16 };
        let result = HttpChunkedTtsProvider::new(provider, voice, "https://example.invalid", "pcm_16000", format);
        assert!(result.is_err());
    }
}
