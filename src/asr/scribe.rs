//! Chunked-upload streaming ASR dialect, Scribe-style.
//!
//! Query-string carries `model_id`, `commit_strategy=manual`, and
//! optional `language_code`; a single outbound message shape
//! `input_audio_chunk`; commit is an empty chunk with `commit=true`.
//! Requires exactly 16 kHz mono, rejected at construction otherwise.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{info, warn};

use super::{ASRError, ASRResult, AsrProvider, RecognitionResult, RecognizerState, StreamingRecognizer, WordTiming};
use crate::config::{normalize_language, ProviderConfig};

const SESSION_START_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct InputAudioChunk {
    audio_base_64: String,
    commit: bool,
    sample_rate: u32,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
enum InboundMessage {
    SessionStarted,
    PartialTranscript { text: String },
    CommittedTranscript {
        text: String,
        #[serde(default)]
        words: Vec<(String, u64, u64, f32)>,
    },
    CommittedTranscriptWithTimestamps {
        text: String,
        #[serde(default)]
        words: Vec<(String, u64, u64, f32)>,
    },
    #[serde(other)]
    Unknown,
}

pub struct ScribeProvider {
    config: ProviderConfig,
    url_base: String,
}

impl ScribeProvider {
    pub fn new(config: ProviderConfig, url_base: impl Into<String>) -> ASRResult<Self> {
        config.validate().map_err(|e| ASRError::Config(e.message))?;
        Ok(Self {
            config,
            url_base: url_base.into(),
        })
    }
}

#[async_trait]
impl AsrProvider for ScribeProvider {
    fn name(&self) -> &str {
        "scribe-chunked"
    }

    async fn recognize(&self, _pcm: &[u8], _sample_rate: u32, _channels: u16) -> ASRResult<RecognitionResult> {
        Err(ASRError::Provider("scribe dialect is streaming-only; use the batch provider".into()))
    }

    async fn streaming_recognize(&self, sample_rate: u32, channels: u16, language: &str) -> ASRResult<Box<dyn StreamingRecognizer>> {
        if sample_rate != 16_000 || channels != 1 {
            return Err(ASRError::Config(format!(
                "scribe requires 16000 Hz mono, got {sample_rate} Hz / {channels} channel(s)"
            )));
        }
        let model_id = if self.config.model.is_empty() { "scribe_v1" } else { &self.config.model };
        let norm_lang = normalize_language(language);
        let mut url = format!("{}?model_id={model_id}&commit_strategy=manual", self.url_base);
        if norm_lang != "auto" {
            url.push_str(&format!("&language_code={norm_lang}"));
        }
        ScribeRecognizer::connect(&url, &self.config.api_key, sample_rate)
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

pub struct ScribeRecognizer {
    outbound_tx: mpsc::Sender<WsMessage>,
    results_rx: Option<mpsc::Receiver<RecognitionResult>>,
    sample_rate: u32,
    ready: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
    writer_handle: tokio::task::JoinHandle<()>,
}

impl ScribeRecognizer {
    async fn connect(url: &str, api_key: &str, sample_rate: u32) -> ASRResult<Self> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ASRError::Config(format!("invalid scribe url: {e}")))?;
        request
            .headers_mut()
            .insert("Authorization", format!("Bearer {api_key}").parse().map_err(|e| ASRError::Config(format!("{e}")))?);

        let (ws_stream, _resp) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ASRError::Network(format!("scribe handshake failed: {e}")))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsMessage>(64);
        let (results_tx, results_rx) = mpsc::channel(256);
        let ready = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));

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
                        warn!(error = %e, "scribe websocket read error");
                        break;
                    }
                };
                let WsMessage::Text(text) = frame else { continue };
                let msg: InboundMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(error = %e, raw = text.as_str(), "unparseable scribe message");
                        continue;
                    }
                };
                match msg {
                    InboundMessage::SessionStarted => {
                        reader_ready.store(true, Ordering::SeqCst);
                        info!("scribe session ready");
                    }
                    InboundMessage::PartialTranscript { text } => {
                        let _ = results_tx
                            .send(RecognitionResult { text, is_final: false, confidence: 0.8, words: vec![] })
                            .await;
                    }
                    InboundMessage::CommittedTranscript { text, words }
                    | InboundMessage::CommittedTranscriptWithTimestamps { text, words } => {
                        let words = words
                            .into_iter()
                            .map(|(text, start_ms, end_ms, confidence)| WordTiming { text, start_ms, end_ms, confidence })
                            .collect();
                        let _ = results_tx
                            .send(RecognitionResult { text, is_final: true, confidence: 0.95, words })
                            .await;
                    }
                    InboundMessage::Unknown => {}
                }
            }
            reader_closed.store(true, Ordering::SeqCst);
        });

        let recognizer = Self {
            outbound_tx,
            results_rx: Some(results_rx),
            sample_rate,
            ready,
            closed,
            reader_handle,
            writer_handle,
        };

        let deadline = timeout(SESSION_START_TIMEOUT, async {
            while !recognizer.ready.load(Ordering::SeqCst) && !recognizer.closed.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if deadline.is_err() {
            return Err(ASRError::Network("scribe session_started timeout".into()));
        }
        Ok(recognizer)
    }
}

#[async_trait]
impl StreamingRecognizer for ScribeRecognizer {
    async fn send_audio(&mut self, pcm: &[u8]) -> ASRResult<()> {
        if !self.ready.load(Ordering::SeqCst) {
            warn!("dropping audio chunk before scribe session ready");
            return Ok(());
        }
        let chunk = InputAudioChunk {
            audio_base_64: base64::engine::general_purpose::STANDARD.encode(pcm),
            commit: false,
            sample_rate: self.sample_rate,
        };
        self.outbound_tx
            .send(WsMessage::Text(serde_json::to_string(&chunk).unwrap()))
            .await
            .map_err(|_| ASRError::Network("scribe session closed".into()))
    }

    async fn commit(&mut self) -> ASRResult<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        let chunk = InputAudioChunk {
            audio_base_64: String::new(),
            commit: true,
            sample_rate: self.sample_rate,
        };
        self.outbound_tx
            .send(WsMessage::Text(serde_json::to_string(&chunk).unwrap()))
            .await
            .map_err(|_| ASRError::Network("scribe session closed".into()))
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

    #[tokio::test]
    async fn rejects_non_16k_mono_at_construction() {
        let provider = ScribeProvider::new(
            ProviderConfig { api_key: "k".into(), model: String::new(), language: "en".into() },
            "wss://example.invalid/v1/speech-to-text/stream",
        )
        .unwrap();
        let err = provider.streaming_recognize(48_000, 1, "en").await.unwrap_err();
        assert!(matches!(err, ASRError::Config(_)));
    }
}
