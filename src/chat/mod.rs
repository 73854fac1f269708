//! Chat/LLM element: a streaming completion client plus bounded
//! conversation history, translating finalized ASR transcripts into
//! streamed `TextData(Delta)` messages and `llm.delta` Bus events.
//!
//! POST with `stream: true` and `Accept: text/event-stream`, read the
//! body as a byte stream, split on `data:` lines, parse per-line delta
//! JSON, stop on `[DONE]`. Reuses [`crate::tts::sse::SseLineBuffer`]
//! rather than a second hand-rolled line splitter.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::bus::topics;
use crate::config::ChatConfig;
use crate::element::{Element, ElementContext};
use crate::error::{ErrorKind, PipelineError};
use crate::message::{PipelineMessage, TextData, TextType};
use crate::tts::sse::SseLineBuffer;

#[derive(Debug, Error, Clone)]
pub enum ChatError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("quota or rate limit exceeded: {0}")]
    Quota(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("provider error: {0}")]
    Provider(String),
}

impl ChatError {
    pub fn to_error_kind(&self) -> ErrorKind {
        match self {
            ChatError::Config(_) => ErrorKind::Config,
            ChatError::Auth(_) => ErrorKind::Auth,
            ChatError::Quota(_) => ErrorKind::Quota,
            ChatError::Network(_) => ErrorKind::Network,
            ChatError::Provider(_) => ErrorKind::Provider,
        }
    }
}

pub type ChatResult<T> = Result<T, ChatError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    fn as_wire(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// One in-flight streaming completion: text-delta channel plus an error
/// channel carrying at most one error, mirroring [`crate::tts::StreamHandle`].
pub struct ChatStreamHandle {
    pub delta_rx: mpsc::Receiver<String>,
    pub error_rx: mpsc::Receiver<ChatError>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream_completion(&self, messages: &[ChatMessage]) -> ChatResult<ChatStreamHandle>;
}

#[derive(Deserialize)]
struct DeltaChoice {
    delta: DeltaContent,
}

#[derive(Deserialize, Default)]
struct DeltaContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct CompletionChunk {
    choices: Vec<DeltaChoice>,
}

/// OpenAI-chat-completions-style streaming client, the dialect seen
/// throughout the retrieval pack's chat clients.
pub struct OpenAiCompatProvider {
    config: ChatConfig,
    endpoint: String,
    http: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(config: ChatConfig, endpoint: impl Into<String>) -> ChatResult<Self> {
        if config.provider.api_key.trim().is_empty() {
            return Err(ChatError::Config("api_key is required".into()));
        }
        Ok(Self {
            config,
            endpoint: endpoint.into(),
            http: reqwest::Client::new(),
        })
    }
}

#[async_trait]
impl ChatProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "chat-completions"
    }

    async fn stream_completion(&self, messages: &[ChatMessage]) -> ChatResult<ChatStreamHandle> {
        let wire_messages: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| json!({"role": m.role.as_wire(), "content": m.content}))
            .collect();
        let body = json!({
            "model": self.config.provider.model,
            "messages": wire_messages,
            "stream": true,
        });

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.config.provider.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ChatError::Network(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ChatError::Auth("chat provider rejected credentials".into()));
        }
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChatError::Quota("chat provider rate limited".into()));
        }
        if !resp.status().is_success() {
            return Err(ChatError::Provider(format!("chat provider returned {}", resp.status())));
        }

        let (delta_tx, delta_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            let mut byte_stream = resp.bytes_stream();
            let mut lines = SseLineBuffer::new();
            while let Some(chunk) = byte_stream.next().await {
                let bytes = match chunk {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = error_tx.send(ChatError::Network(e.to_string())).await;
                        return;
                    }
                };
                for payload in lines.push(&bytes) {
                    if payload == "[DONE]" {
                        return;
                    }
                    let parsed: CompletionChunk = match serde_json::from_str(&payload) {
                        Ok(p) => p,
                        Err(_) => {
                            warn!(raw = payload.as_str(), "skipping invalid chat completion sse line");
                            continue;
                        }
                    };
                    for choice in parsed.choices {
                        if let Some(text) = choice.delta.content {
                            if !text.is_empty() && delta_tx.send(text).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(ChatStreamHandle { delta_rx, error_rx })
    }
}

/// Translates finalized ASR transcripts (or any incoming `TextData(Final)`)
/// into a streamed completion, forwarding deltas downstream and onto the
/// Bus. Errors are handled fire-and-forget: a failed completion publishes
/// `pipeline.error` and leaves the pipeline running.
pub struct ChatElement {
    name: String,
    config: ChatConfig,
    provider: std::sync::Arc<dyn ChatProvider>,
    history: VecDeque<ChatMessage>,
    ctx: Option<ElementContext>,
}

impl ChatElement {
    pub fn new(name: impl Into<String>, config: ChatConfig, provider: std::sync::Arc<dyn ChatProvider>) -> Self {
        Self {
            name: name.into(),
            config,
            provider,
            history: VecDeque::new(),
            ctx: None,
        }
    }

    fn push_history(&mut self, message: ChatMessage) {
        self.history.push_back(message);
        // One turn == one user+assistant pair; cap at 2x turns of
        // non-system messages.
        let cap = self.config.max_history_turns.saturating_mul(2);
        while self.history.len() > cap {
            self.history.pop_front();
        }
    }

    fn messages_for_request(&self) -> Vec<ChatMessage> {
        let mut out = Vec::new();
        if let Some(system_prompt) = &self.config.system_prompt {
            out.push(ChatMessage {
                role: ChatRole::System,
                content: system_prompt.clone(),
            });
        }
        out.extend(self.history.iter().cloned());
        out
    }

    fn publish_error(&self, err: &ChatError) {
        let Some(ctx) = &self.ctx else { return };
        let Some(bus) = ctx.bus() else { return };
        let payload = serde_json::json!({
            "kind": err.to_error_kind().as_str(),
            "message": err.to_string(),
            "element": self.name,
        });
        bus.publish(topics::PIPELINE_ERROR, payload, now_ms(), ctx.session_id);
    }

    fn publish_delta(&self, text: &str, utterance_id: Option<Uuid>) {
        let Some(ctx) = &self.ctx else { return };
        let Some(bus) = ctx.bus() else { return };
        let payload = serde_json::json!({"text": text, "utterance_id": utterance_id.map(|u| u.to_string())});
        bus.publish(topics::LLM_DELTA, payload, now_ms(), ctx.session_id);
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait]
impl Element for ChatElement {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&mut self, ctx: ElementContext) -> Result<(), String> {
        self.config.validate().map_err(|e| e.message)?;
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn process(&mut self, msg: PipelineMessage) -> Result<Vec<PipelineMessage>, PipelineError> {
        let Some(text) = &msg.text else { return Ok(vec![]) };
        if text.text_type != TextType::Final {
            return Ok(vec![]);
        }
        let utterance_text = match text.as_str() {
            Ok(s) => s.to_string(),
            Err(_) => return Ok(vec![]),
        };
        let utterance_id = text.utterance_id;

        self.push_history(ChatMessage {
            role: ChatRole::User,
            content: utterance_text,
        });

        let mut handle = match self.provider.stream_completion(&self.messages_for_request()).await {
            Ok(h) => h,
            Err(e) => {
                self.publish_error(&e);
                return Ok(vec![]);
            }
        };

        let mut outputs = Vec::new();
        let mut assistant_reply = String::new();
        loop {
            tokio::select! {
                delta = handle.delta_rx.recv() => {
                    let Some(delta) = delta else { break };
                    assistant_reply.push_str(&delta);
                    self.publish_delta(&delta, utterance_id);
                    outputs.push(PipelineMessage::text(
                        TextData {
                            bytes: delta.into_bytes(),
                            text_type: TextType::Delta,
                            timestamp: now_ms(),
                            utterance_id,
                        },
                        msg.session_id,
                    ));
                }
                err = handle.error_rx.recv() => {
                    if let Some(err) = err {
                        self.publish_error(&err);
                    }
                    break;
                }
            }
        }

        if !assistant_reply.is_empty() {
            self.push_history(ChatMessage {
                role: ChatRole::Assistant,
                content: assistant_reply,
            });
        }
        Ok(outputs)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::config::ProviderConfig;
    use std::sync::Arc;
    use tokio::sync::watch;

    struct ScriptedProvider {
        chunks: Vec<&'static str>,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn stream_completion(&self, _messages: &[ChatMessage]) -> ChatResult<ChatStreamHandle> {
            let (delta_tx, delta_rx) = mpsc::channel(16);
            let (_error_tx, error_rx) = mpsc::channel(1);
            for chunk in self.chunks.clone() {
                delta_tx.send(chunk.to_string()).await.unwrap();
            }
            Ok(ChatStreamHandle { delta_rx, error_rx })
        }
    }

    fn test_ctx(bus: &Arc<Bus>) -> ElementContext {
        let (_tx, rx) = watch::channel(false);
        ElementContext::new(bus, None, rx)
    }

    #[tokio::test]
    async fn streams_deltas_and_appends_history() {
        let bus = Arc::new(Bus::new());
        let provider = Arc::new(ScriptedProvider { chunks: vec!["Hel", "lo"] });
        let mut element = ChatElement::new("chat", ChatConfig { provider: ProviderConfig { api_key: "k".into(), model: String::new(), language: "en".into() }, ..ChatConfig::default() }, provider);
        element.init(test_ctx(&bus)).await.unwrap();

        let input = PipelineMessage::text(
            TextData { bytes: b"hi there".to_vec(), text_type: TextType::Final, timestamp: 0, utterance_id: None },
            None,
        );
        let outputs = element.process(input).await.unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(element.history.len(), 2);
        assert_eq!(element.history.back().unwrap().content, "Hello");
    }

    #[tokio::test]
    async fn non_final_text_is_ignored() {
        let bus = Arc::new(Bus::new());
        let provider = Arc::new(ScriptedProvider { chunks: vec![] });
        let mut element = ChatElement::new("chat", ChatConfig { provider: ProviderConfig { api_key: "k".into(), model: String::new(), language: "en".into() }, ..ChatConfig::default() }, provider);
        element.init(test_ctx(&bus)).await.unwrap();

        let input = PipelineMessage::text(
            TextData { bytes: b"partial".to_vec(), text_type: TextType::Partial, timestamp: 0, utterance_id: None },
            None,
        );
        let outputs = element.process(input).await.unwrap();
        assert!(outputs.is_empty());
        assert!(element.history.is_empty());
    }

    #[test]
    fn history_capped_at_twice_max_turns() {
        let bus = Arc::new(Bus::new());
        let _ = bus;
        let provider = Arc::new(ScriptedProvider { chunks: vec![] });
        let mut element = ChatElement::new(
            "chat",
            ChatConfig {
                provider: ProviderConfig { api_key: "k".into(), model: String::new(), language: "en".into() },
                max_history_turns: 1,
                system_prompt: None,
            },
            provider,
        );
        for i in 0..5 {
            element.push_history(ChatMessage { role: ChatRole::User, content: format!("msg {i}") });
        }
        assert_eq!(element.history.len(), 2);
    }
}
