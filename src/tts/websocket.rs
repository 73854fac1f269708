//! WebSocket streaming TTS dialect.
//!
//! Three client->server frame kinds (Initialize/SendText/Close);
//! server->client frames carry `{audio, alignment?, normalizedAlignment?}`
//! or `{isFinal: true, audio: null}`. Implementers must tolerate
//! interleaved alignment-only frames and buffered generation.

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::warn;

use super::{AudioFormat, StreamHandle, SynthesisRequest, TTSError, TTSResult, TtsProvider, VoiceInfo};
use crate::config::{ProviderConfig, VoiceStyleConfig};

#[derive(Deserialize)]
struct ServerFrame {
    #[serde(default)]
    audio: Option<String>,
    #[serde(default, rename = "isFinal")]
    is_final: bool,
}

pub struct WebSocketTtsProvider {
    provider: ProviderConfig,
    voice: VoiceStyleConfig,
    url: String,
    format: AudioFormat,
}

impl WebSocketTtsProvider {
    pub fn new(provider: ProviderConfig, voice: VoiceStyleConfig, url: impl Into<String>, format: AudioFormat) -> TTSResult<Self> {
        if provider.api_key.trim().is_empty() {
            return Err(TTSError::Config("api_key is required".into()));
        }
        Ok(Self {
            provider,
            voice,
            url: url.into(),
            format,
        })
    }
}

#[async_trait]
impl TtsProvider for WebSocketTtsProvider {
    fn name(&self) -> &str {
        "tts-websocket"
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
        let mut request = self
            .url
            .clone()
            .into_client_request()
            .map_err(|e| TTSError::Config(format!("invalid websocket url: {e}")))?;
        request
            .headers_mut()
            .insert("xi-api-key", self.provider.api_key.parse().map_err(|e| TTSError::Config(format!("{e}")))?);

        let (ws_stream, _resp) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TTSError::Network(format!("websocket handshake failed: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let init_frame = json!({
            "text": " ",
            "voice_settings": {
                "stability": self.voice.stability,
                "similarity_boost": self.voice.similarity_boost,
                "speed": self.voice.speed,
            },
            "generation_config": {
                "chunk_length_schedule": self.voice.chunk_length_schedule,
            },
            "xi_api_key": self.provider.api_key,
        });
        ws_tx
            .send(WsMessage::Text(init_frame.to_string()))
            .await
            .map_err(|e| TTSError::Network(format!("failed to send init frame: {e}")))?;

        let send_text = json!({"text": req.text, "flush": true});
        ws_tx
            .send(WsMessage::Text(send_text.to_string()))
            .await
            .map_err(|e| TTSError::Network(format!("failed to send text frame: {e}")))?;

        let close_frame = json!({"text": ""});
        ws_tx
            .send(WsMessage::Text(close_frame.to_string()))
            .await
            .map_err(|e| TTSError::Network(format!("failed to send close frame: {e}")))?;

        let (audio_tx, audio_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        let _ = error_tx.send(TTSError::Network(e.to_string())).await;
                        return;
                    }
                };
                let WsMessage::Text(text) = frame else { continue };
                let parsed: ServerFrame = match serde_json::from_str(&text) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "unparseable tts websocket frame");
                        continue;
                    }
                };
                if let Some(audio_b64) = parsed.audio {
                    match base64::engine::general_purpose::STANDARD.decode(&audio_b64) {
                        Ok(bytes) => {
                            if audio_tx.send(bytes).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(error = %e, "invalid base64 audio in tts websocket frame"),
                    }
                }
                // Alignment-only frames (no `audio` field) are tolerated
                // silently — they carry timing metadata this contract
                // doesn't surface further.
                if parsed.is_final {
                    return;
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
mod tests {
    use super::*;

    #[test]
    fn alignment_only_frame_parses_without_audio() {
        let parsed: ServerFrame = serde_json::from_str(r#"{"alignment": {"chars": ["h"]}}"#).unwrap();
        assert!(parsed.audio.is_none());
        assert!(!parsed.is_final);
    }

    #[test]
    fn final_frame_has_null_audio() {
        let parsed: ServerFrame = serde_json::from_str(r#"{"isFinal": true, "audio": null}"#).unwrap();
        assert!(parsed.is_final);
        assert!(parsed.audio.is_none());
    }
}
