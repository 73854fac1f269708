//! Server-sent-events line framing, shared by the TTS SSE dialect and
//! the chat/LLM element's streaming-completion client — one line-buffer
//! helper serves both rather than a second hand-rolled parser.
//!
//! Accumulate raw bytes, split on `\n`, strip a `data: ` prefix, skip
//! blank/comment lines.

/// Incrementally reassembles `data: {...}` lines out of a raw byte
/// stream that may split UTF-8 text at arbitrary chunk boundaries.
#[derive(Default)]
pub struct SseLineBuffer {
    carry: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk, returning zero or more fully-reassembled
    /// `data:` payloads (the part after the prefix, trimmed). Lines that
    /// don't start with `data:` are skipped with a warning by the
    /// caller.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);
        let mut out = Vec::new();

        loop {
            let Some(pos) = self.carry.iter().position(|&b| b == b'\n') else { break };
            let line_bytes: Vec<u8> = self.carry.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            if let Some(payload) = line.strip_prefix("data:") {
                out.push(payload.trim_start().to_string());
            }
            // Lines without a `data:` prefix (SSE `event:`/`id:`/comments)
            // are intentionally ignored here; the caller decides whether
            // an unrecognized non-empty line warrants a warning.
        }
        out
    }

    /// Whatever bytes remain unterminated by a newline, for callers that
    /// want to surface a final partial line at stream end.
    pub fn remainder(&self) -> String {
        String::from_utf8_lossy(&self.carry).to_string()
    }
}

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;

use super::{AudioFormat, Codec, StreamHandle, SynthesisRequest, TTSError, TTSResult, TtsProvider, VoiceInfo};
use crate::audio::constants::TTS_HTTP_CHUNK_BYTES;
use crate::config::{ProviderConfig, VoiceStyleConfig};

#[derive(Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum SseEvent {
    #[serde(rename = "speech.audio.delta")]
    SpeechAudioDelta { audio: String },
    #[serde(rename = "speech.audio.done")]
    SpeechAudioDone,
    #[serde(other)]
    Unknown,
}

/// HTTP-SSE streaming TTS dialect. A `stream_format=sse` POST whose
/// response is either `text/event-stream` (parsed here) or raw audio
/// bytes, in which case this falls back to HTTP-chunked behavior.
pub struct SseTtsProvider {
    provider: ProviderConfig,
    voice: VoiceStyleConfig,
    endpoint: String,
    format: AudioFormat,
    http: reqwest::Client,
}

impl SseTtsProvider {
    pub fn new(provider: ProviderConfig, voice: VoiceStyleConfig, endpoint: impl Into<String>, format: AudioFormat) -> TTSResult<Self> {
        if provider.api_key.trim().is_empty() {
            return Err(TTSError::Config("api_key is required".into()));
        }
        Ok(Self {
            provider,
            voice,
            endpoint: endpoint.into(),
            format,
            http: reqwest::Client::new(),
        })
    }

    fn request_body(&self, req: &SynthesisRequest) -> serde_json::Value {
        json!({
            "text": req.text,
            "model": self.provider.model,
            "voice_id": req.voice_id,
            "stream_format": "sse",
            "voice_settings": {
                "stability": self.voice.stability,
                "similarity_boost": self.voice.similarity_boost,
                "speed": self.voice.speed,
            }
        })
    }
}

#[async_trait]
impl TtsProvider for SseTtsProvider {
    fn name(&self) -> &str {
        "tts-sse"
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
        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.provider.api_key)
            .header("Accept", "text/event-stream")
            .json(&self.request_body(req))
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

        let is_sse = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            if !is_sse {
                // Raw audio fallback: forward reads verbatim.
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
                return;
            }

            let mut lines = SseLineBuffer::new();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = error_tx.send(TTSError::Network(e.to_string())).await;
                        return;
                    }
                };
                for payload in lines.push(&bytes) {
                    if payload == "[DONE]" {
                        return;
                    }
                    let event: SseEvent = match serde_json::from_str(&payload) {
                        Ok(e) => e,
                        Err(_) => {
                            warn!(raw = payload.as_str(), "skipping invalid sse line");
                            continue;
                        }
                    };
                    match event {
                        SseEvent::SpeechAudioDelta { audio } => {
                            match base64::engine::general_purpose::STANDARD.decode(&audio) {
                                Ok(bytes) => {
                                    if audio_tx.send(bytes).await.is_err() {
                                        return;
                                    }
                                }
                                Err(e) => warn!(error = %e, "invalid base64 audio in sse delta"),
                            }
                        }
                        SseEvent::SpeechAudioDone => return,
                        SseEvent::Unknown => {}
                    }
                }
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
mod sse_dialect_tests {
    use super::*;

    #[tokio::test]
    async fn parses_delta_then_done() {
        let mut lines = SseLineBuffer::new();
        let payloads = lines.push(b"data: {\"type\":\"speech.audio.delta\",\"audio\":\"AAAA\"}\ndata: {\"type\":\"speech.audio.done\"}\n");
        assert_eq!(payloads.len(), 2);
        let first: SseEvent = serde_json::from_str(&payloads[0]).unwrap();
        match first {
            SseEvent::SpeechAudioDelta { audio } => {
                let decoded = base64::engine::general_purpose::STANDARD.decode(&audio).unwrap();
                assert_eq!(decoded, vec![0u8, 0, 0]);
            }
            _ => panic!("expected delta"),
        }
        let second: SseEvent = serde_json::from_str(&payloads[1]).unwrap();
        assert!(matches!(second, SseEvent::SpeechAudioDone));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reassembles_lines_split_across_chunks() {
        let mut buf = SseLineBuffer::new();
        let mut out = buf.push(b"data: {\"a\":");
        assert!(out.is_empty());
        out = buf.push(b"1}\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn handles_multiple_lines_in_one_chunk() {
        let mut buf = SseLineBuffer::new();
        let out = buf.push(b"data: {\"type\":\"speech.audio.delta\",\"audio\":\"AAAA\"}\ndata: {\"type\":\"speech.audio.done\"}\n");
        assert_eq!(out.len(), 2);
        assert!(out[0].contains("speech.audio.delta"));
        assert!(out[1].contains("speech.audio.done"));
    }

    #[test]
    fn ignores_non_data_lines() {
        let mut buf = SseLineBuffer::new();
        let out = buf.push(b"event: ping\n\ndata: hello\n");
        assert_eq!(out, vec!["hello".to_string()]);
    }
}
