//! ASR element wrapper: subscribes to VAD events, drives provider
//! lifecycle.
//!
//! Spawns three workers per open recognizer session: *audio-forward* is
//! this element's own `process()` — the per-element worker loop the
//! Pipeline already runs is that worker, so no extra task is needed for
//! it. *event-listener* and *result-fan-out* are background tasks
//! spawned alongside each session, since they are driven by the Bus and
//! by the recognizer's own async results rather than by the data edge.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{AsrProvider, RecognitionResult, RecognizerState, StreamingRecognizer};
use crate::bus::topics;
use crate::config::AsrConfig;
use crate::element::{Element, ElementContext};
use crate::error::{ErrorKind, PipelineError};
use crate::message::{MediaType, MessageType, PipelineMessage, TextData, TextType};

type SharedRecognizer = Arc<Mutex<Box<dyn StreamingRecognizer>>>;

pub struct AsrElement {
    name: String,
    config: AsrConfig,
    provider: Arc<dyn AsrProvider>,
    sample_rate: u32,
    channels: u16,
    active: Arc<RwLock<Option<SharedRecognizer>>>,
    pending_rx: Option<mpsc::Receiver<PipelineMessage>>,
    pending_tx: mpsc::Sender<PipelineMessage>,
    supervisor: Option<JoinHandle<()>>,
    current_utterance: Arc<std::sync::Mutex<Option<Uuid>>>,
}

impl AsrElement {
    pub fn new(name: impl Into<String>, config: AsrConfig, provider: Arc<dyn AsrProvider>, sample_rate: u32, channels: u16) -> Self {
        let (pending_tx, pending_rx) = mpsc::channel(256);
        Self {
            name: name.into(),
            config,
            provider,
            sample_rate,
            channels,
            active: Arc::new(RwLock::new(None)),
            pending_rx: Some(pending_rx),
            pending_tx,
            supervisor: None,
            current_utterance: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    fn drain_pending(pending_rx: &mut mpsc::Receiver<PipelineMessage>) -> Vec<PipelineMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = pending_rx.try_recv() {
            out.push(msg);
        }
        out
    }
}

/// Spawn the result-fan-out worker: reads `RecognitionResult`s from the
/// recognizer's results channel, publishes `asr.partial`/`asr.final` on
/// the Bus, and forwards a `TextData` into the element's pending queue.
fn spawn_result_fanout(
    mut results_rx: mpsc::Receiver<RecognitionResult>,
    ctx: ElementContext,
    pending_tx: mpsc::Sender<PipelineMessage>,
    current_utterance: Arc<std::sync::Mutex<Option<Uuid>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(result) = results_rx.recv().await {
            let utterance_id = {
                let mut guard = current_utterance.lock().unwrap();
                if guard.is_none() {
                    *guard = Some(Uuid::new_v4());
                }
                *guard
            };

            let topic = if result.is_final { topics::ASR_FINAL } else { topics::ASR_PARTIAL };
            if let Some(bus) = ctx.bus() {
                bus.publish(
                    topic,
                    serde_json::json!({"text": result.text, "confidence": result.confidence}),
                    0,
                    ctx.session_id,
                );
            }

            let text_type = if result.is_final { TextType::Final } else { TextType::Partial };
            let text_data = TextData {
                bytes: result.text.into_bytes(),
                text_type,
                timestamp: 0,
                utterance_id,
            };
            let _ = pending_tx.send(PipelineMessage::text(text_data, ctx.session_id)).await;

            if result.is_final {
                *current_utterance.lock().unwrap() = None;
            }
        }
    })
}

/// Spawn the event-listener worker: subscribes to `vad.speech.end` and
/// calls `Commit` on the recognizer.
fn spawn_event_listener(ctx: ElementContext, recognizer: SharedRecognizer) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(bus) = ctx.bus() else { return };
        let (mut rx, _dropped) = bus.subscribe(topics::VAD_SPEECH_END);
        while rx.recv().await.is_some() {
            let mut guard = recognizer.lock().await;
            if let Err(e) = guard.commit().await {
                warn!(error = %e, "commit failed");
                break;
            }
        }
    })
}

fn backoff_delay(attempt: u32, initial_ms: u64, cap_ms: u64) -> Duration {
    let scaled = initial_ms.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(scaled.min(cap_ms))
}

#[async_trait]
impl Element for AsrElement {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, ctx: ElementContext) -> Result<(), String> {
        self.config.validate().map_err(|e| e.message)?;

        let provider = self.provider.clone();
        let active = self.active.clone();
        let pending_tx = self.pending_tx.clone();
        let current_utterance = self.current_utterance.clone();
        let sample_rate = self.sample_rate;
        let channels = self.channels;
        let language = self.config.provider.language.clone();
        let vad_enabled = self.config.vad_enabled;
        let initial_backoff = self.config.reconnect_initial_backoff_ms;
        let backoff_cap = self.config.reconnect_backoff_cap_ms;
        let max_attempts = self.config.reconnect_max_attempts;
        let mut cancel = ctx.cancel_signal();
        let supervisor_ctx = ctx;

        let supervisor = tokio::spawn(async move {
            let attempts = Arc::new(AtomicU32::new(0));
            loop {
                if *cancel.borrow() {
                    return;
                }
                let session = provider.streaming_recognize(sample_rate, channels, &language).await;
                let mut recognizer = match session {
                    Ok(r) => {
                        attempts.store(0, Ordering::SeqCst);
                        r
                    }
                    Err(e) => {
                        let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                        error!(error = %e, attempt = n, "asr recognizer connect failed");
                        if let Some(bus) = supervisor_ctx.bus() {
                            bus.publish(
                                topics::PIPELINE_ERROR,
                                serde_json::json!({"kind": "network", "message": e.to_string()}),
                                0,
                                supervisor_ctx.session_id,
                            );
                        }
                        if n >= max_attempts {
                            return;
                        }
                        tokio::select! {
                            _ = tokio::time::sleep(backoff_delay(n - 1, initial_backoff, backoff_cap)) => continue,
                            _ = cancel.changed() => return,
                        }
                    }
                };

                let results_rx = recognizer.take_results();
                let shared: SharedRecognizer = Arc::new(Mutex::new(recognizer));
                *active.write().await = Some(shared.clone());

                let fanout = spawn_result_fanout(results_rx, supervisor_ctx.clone(), pending_tx.clone(), current_utterance.clone());
                let listener = if vad_enabled {
                    Some(spawn_event_listener(supervisor_ctx.clone(), shared.clone()))
                } else {
                    None
                };

                // Poll session liveness until it closes or we're cancelled.
                loop {
                    if *cancel.borrow() {
                        shared.lock().await.close().await;
                        fanout.abort();
                        if let Some(l) = &listener {
                            l.abort();
                        }
                        return;
                    }
                    if shared.lock().await.state() == RecognizerState::Closed {
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {},
                        _ = cancel.changed() => {},
                    }
                }

                *active.write().await = None;
                fanout.abort();
                if let Some(l) = listener {
                    l.abort();
                }

                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(attempt = n, "asr recognizer session closed unexpectedly, reconnecting");
                if let Some(bus) = supervisor_ctx.bus() {
                    bus.publish(
                        topics::PIPELINE_ERROR,
                        serde_json::json!({"kind": "network", "message": "asr session lost"}),
                        0,
                        supervisor_ctx.session_id,
                    );
                }
                if n >= max_attempts {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff_delay(n - 1, initial_backoff, backoff_cap)) => {},
                    _ = cancel.changed() => return,
                }
            }
        });

        self.supervisor = Some(supervisor);
        info!(element = self.name.as_str(), "asr element initialized");
        Ok(())
    }

    async fn process(&mut self, msg: PipelineMessage) -> Result<Vec<PipelineMessage>, PipelineError> {
        let mut outputs = if let Some(rx) = self.pending_rx.as_mut() {
            Self::drain_pending(rx)
        } else {
            Vec::new()
        };

        if msg.msg_type == MessageType::Audio {
            if let Some(audio) = msg.audio.as_ref() {
                if audio.media_type != MediaType::RawPcmS16Le {
                    return Err(PipelineError::new(ErrorKind::Audio, "asr element requires raw PCM S16LE input"));
                }
                let active = self.active.clone();
                let bytes = audio.bytes.clone();
                let recognizer = active.read().await.clone();
                if let Some(recognizer) = recognizer {
                    let mut guard = recognizer.lock().await;
                    if let Err(e) = guard.send_audio(&bytes).await {
                        warn!(error = %e, "send_audio failed, dropping frame");
                    }
                }
                // During reconnection (no active session) audio is dropped,
                // not buffered, to avoid unbounded growth.
            }
        }

        // The element's output edge carries transcripts, not the raw
        // audio it consumed.
        Ok(outputs)
    }

    async fn flush(&mut self) -> Result<Vec<PipelineMessage>, PipelineError> {
        let outputs = if let Some(rx) = self.pending_rx.as_mut() {
            Self::drain_pending(rx)
        } else {
            Vec::new()
        };
        Ok(outputs)
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            handle.abort();
        }
        if let Some(recognizer) = self.active.write().await.take() {
            recognizer.lock().await.close().await;
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
