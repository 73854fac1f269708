//! Realtime-session streaming ASR dialect.
//!
//! Speaks the OpenAI Realtime API's WebSocket event model: bearer auth,
//! `session.update`/`session.updated`, manual
//! `input_audio_buffer.append`/`.commit`, and
//! `conversation.item.input_audio_transcription.{text,completed}`
//! partial/final events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{ASRError, ASRResult, AsrProvider, RecognitionResult, RecognizerState, StreamingRecognizer};
use crate::config::{normalize_language, ProviderConfig};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RESULTS_QUEUE_DEPTH: usize = 256;

/// Partial/final confidences are synthesized, not reported by the wire
/// protocol.
const PARTIAL_CONFIDENCE: f32 = 0.8;
const FINAL_CONFIDENCE: f32 = 0.95;

#[derive(Serialize)]
struct SessionUpdate<'a> {
    #[serde(rename = "type")]
    event_type: &'static str,
    session: SessionConfig<'a>,
}

#[derive(Serialize)]
struct SessionConfig<'a> {
    modalities: Vec<&'static str>,
    input_audio_format: &'static str,
    input_audio_sample_rate_hz: u32,
    input_audio_channels: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
    /// Server-side turn detection is explicitly disabled: commits are
    /// manual, driven by the owning ASR element's VAD subscription.
    turn_detection: Option<()>,
}

#[derive(Deserialize)]
struct InboundEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    transcript: Option<String>,
}

pub struct RealtimeProvider {
    config: ProviderConfig,
    url_base: String,
}

impl RealtimeProvider {
    pub fn new(config: ProviderConfig, url_base: impl Into<String>) -> ASRResult<Self> {
        config.validate().map_err(|e| ASRError::Config(e.message))?;
        Ok(Self {
            config,
            url_base: url_base.into(),
        })
    }
}

#[async_trait]
impl AsrProvider for RealtimeProvider {
    fn name(&self) -> &str {
        "realtime-session"
    }

    async fn recognize(&self, _pcm: &[u8], _sample_rate: u32, _channels: u16) -> ASRResult<RecognitionResult> {
        Err(ASRError::Provider("realtime-session dialect is streaming-only; use the batch provider".into()))
    }

    async fn streaming_recognize(&self, sample_rate: u32, channels: u16, language: &str) -> ASRResult<Box<dyn StreamingRecognizer>> {
        let model = if self.config.model.is_empty() { "default" } else { &self.config.model };
        let url = format!("{}?model={model}", self.url_base);
        RealtimeRecognizer::connect(&url, &self.config.api_key, sample_rate, channels, language)
            .await
            .map(|r| Box::new(r) as Box<dyn StreamingRecognizer>)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn supported_languages(&self) -> Vec<String> {
        vec!["auto".into()]
    }
}

pub struct RealtimeRecognizer {
    outbound_tx: mpsc::Sender<WsMessage>,
    results_rx: Option<mpsc::Receiver<RecognitionResult>>,
    ready: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl RealtimeRecognizer {
    async fn connect(url: &str, api_key: &str, sample_rate: u32, channels: u16, language: &str) -> ASRResult<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ASRError::Config(format!("invalid realtime url: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {api_key}")
                .parse()
                .map_err(|e| ASRError::Config(format!("invalid api key header: {e}")))?,
        );

        let (ws_stream, _resp) = timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ASRError::Network("realtime handshake timed out".into()))?
            .map_err(|e| ASRError::Network(format!("realtime handshake failed: {e}")))?;

        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
        let (results_tx, results_rx) = mpsc::channel(RESULTS_QUEUE_DEPTH);
        let ready = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

        let norm_lang = normalize_language(language);
        let session_update = SessionUpdate {
            event_type: "session.update",
            session: SessionConfig {
                modalities: vec!["text"],
                input_audio_format: "pcm16",
                input_audio_sample_rate_hz: sample_rate,
                input_audio_channels: channels,
                language: if norm_lang == "auto" { None } else { Some(norm_lang.as_str()) },
                turn_detection: None,
            },
        };
        outbound_tx
            .send(WsMessage::Text(serde_json::to_string(&session_update).unwrap()))
            .await
            .map_err(|_| ASRError::Network("realtime outbound channel closed before handshake".into()))?;

        let writer_handle = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader_ready = ready.clone();
        let reader_closed = closed.clone();
        let reader_handle = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                let frame = match frame {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(error = %e, "realtime websocket read error");
                        break;
                    }
                };
                let WsMessage::Text(text) = frame else { continue };
                let event: InboundEvent = match serde_json::from_str(&text) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, raw = text.as_str(), "unparseable realtime event");
                        continue;
                    }
                };
                match event.event_type.as_str() {
                    "session.updated" => {
                        reader_ready.store(true, Ordering::SeqCst);
                        info!("realtime session ready");
                    }
                    "conversation.item.input_audio_transcription.text" => {
                        let text = event.transcript.unwrap_or_default();
                        if text.is_empty() {
                            continue;
                        }
                        let _ = results_tx
                            .send(RecognitionResult {
                                text,
                                is_final: false,
                                confidence: PARTIAL_CONFIDENCE,
                                words: vec![],
                            })
                            .await;
                    }
                    "conversation.item.input_audio_transcription.completed" => {
                        let text = event.transcript.unwrap_or_default();
                        let _ = results_tx
                            .send(RecognitionResult {
                                text,
                                is_final: true,
                                confidence: FINAL_CONFIDENCE,
                                words: vec![],
                            })
                            .await;
                    }
                    "conversation.item.created" => {
                        debug!("conversation.item.created (log-and-ignore)");
                    }
                    "error" => {
                        error!(raw = text.as_str(), "realtime provider error event");
                    }
                    other => {
                        debug!(event_type = other, "unhandled realtime event, ignored");
                    }
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
        });

        Ok(Self {
            outbound_tx,
            results_rx: Some(results_rx),
            ready,
            closed,
            reader_handle,
            writer_handle,
        })
    }
}

#[async_trait]
impl StreamingRecognizer for RealtimeRecognizer {
    async fn send_audio(&mut self, pcm: &[u8]) -> ASRResult<()> {
        if !self.ready.load(Ordering::SeqCst) {
            warn!("dropping audio append before realtime session ready");
            return Ok(());
        }
        let b64 = base64::engine::general_purpose::STANDARD.encode(pcm);
        let payload = json!({"type": "input_audio_buffer.append", "audio": b64});
        self.outbound_tx
            .send(WsMessage::Text(payload.to_string()))
            .await
            .map_err(|_| ASRError::Network("realtime session closed".into()))
    }

    async fn commit(&mut self) -> ASRResult<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let payload = json!({"type": "input_audio_buffer.commit"});
        self.outbound_tx
            .send(WsMessage::Text(payload.to_string()))
            .await
            .map_err(|_| ASRError::Network("realtime session closed".into()))
    }

    fn take_results(&mut self) -> mpsc::Receiver<RecognitionResult> {
        self.results_rx.take().expect("take_results called more than once")
    }

    fn state(&self) -> RecognizerState {
        if self.closed.load(Ordering::SeqCst) {
            RecognizerState::Closed
        } else if self.ready.load(Ordering::SeqCst) {
            RecognizerState::Ready
        } else {
            RecognizerState::Connecting
        }
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.writer_handle.abort();
        self.reader_handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_none_when_auto() {
        assert_eq!(normalize_language("auto"), "auto");
    }
}
