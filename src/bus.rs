//! Bus — topic-addressed event fan-out, independent of the data edges.
//!
//! Subscriber state lives in a `DashMap` keyed by topic rather than
//! behind a single mutex, so publishing on one topic never contends with
//! subscribing to another. Publish is best-effort per subscriber: a full
//! subscriber queue drops the event rather than blocking the publisher —
//! the data edge must keep flowing regardless of how slow a control
//! listener is.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Stable Bus topic strings.
pub mod topics {
    pub const VAD_SPEECH_START: &str = "vad.speech.start";
    pub const VAD_SPEECH_END: &str = "vad.speech.end";
    pub const ASR_PARTIAL: &str = "asr.partial";
    pub const ASR_FINAL: &str = "asr.final";
    pub const LLM_DELTA: &str = "llm.delta";
    pub const PIPELINE_ERROR: &str = "pipeline.error";
    pub const PIPELINE_STOPPED: &str = "pipeline.stopped";
}

/// Tagged event payload. `payload` carries whatever the topic's contract
/// defines (a transcript string, an alignment record, an error kind) as
/// a `serde_json::Value` so subscribers stay decoupled from each
/// provider's concrete result type.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
    pub timestamp: u64,
    pub session_id: Option<Uuid>,
}

/// Per-subscriber bounded channel. Depth is small — these are control
/// hints, not a backpressure path (the data edges carry that load).
const SUBSCRIBER_QUEUE_DEPTH: usize = 64;

struct Subscriber {
    sender: mpsc::Sender<Event>,
    dropped: Arc<AtomicU64>,
}

/// In-process, topic-addressed event fan-out.
pub struct Bus {
    subscribers: DashMap<String, Vec<Subscriber>>,
    total_dropped: AtomicU64,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            total_dropped: AtomicU64::new(0),
        }
    }

    /// Subscribe to a topic. Returns a receiver and a handle that reports
    /// how many events were dropped for this subscriber due to a full
    /// queue. Unsubscribing (dropping the receiver) drops all pending
    /// events for that subscriber — Tokio's mpsc does this for free.
    pub fn subscribe(&self, topic: &str) -> (mpsc::Receiver<Event>, Arc<AtomicU64>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                sender: tx,
                dropped: dropped.clone(),
            });
        (rx, dropped)
    }

    /// Publish is non-blocking: a full subscriber queue gets the event
    /// dropped for that subscriber only, with a counter increment and a
    /// periodic warning (every 100 drops, to avoid log spam).
    pub fn publish(&self, topic: &str, payload: Value, timestamp: u64, session_id: Option<Uuid>) {
        let event = Event {
            topic: topic.to_string(),
            payload,
            timestamp,
            session_id,
        };

        if let Some(mut subs) = self.subscribers.get_mut(topic) {
            subs.retain_mut(|sub| {
                match sub.sender.try_send(event.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        let n = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        self.total_dropped.fetch_add(1, Ordering::Relaxed);
                        if n % 100 == 1 {
                            warn!(topic, dropped = n, "bus subscriber queue full, dropping event");
                        }
                        true
                    }
                    // Receiver gone: drop this subscriber entry.
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
    }

    pub fn total_dropped(&self) -> u64 {
        self.total_dropped.load(Ordering::Relaxed)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = Bus::new();
        let (mut rx, _) = bus.subscribe(topics::VAD_SPEECH_START);
        bus.publish(topics::VAD_SPEECH_START, Value::Null, 0, None);
        let ev = rx.recv().await.expect("event delivered");
        assert_eq!(ev.topic, topics::VAD_SPEECH_START);
    }

    #[tokio::test]
    async fn full_subscriber_queue_drops_without_blocking_publish() {
        let bus = Bus::new();
        let (_rx, dropped) = bus.subscribe(topics::ASR_PARTIAL);
        // Fill past capacity; publish must never block or panic.
        for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 10) {
            bus.publish(topics::ASR_PARTIAL, Value::Null, 0, None);
        }
        assert!(dropped.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn unrelated_topic_unaffected_by_full_queue() {
        let bus = Bus::new();
        let (_rx_a, _) = bus.subscribe(topics::ASR_PARTIAL);
        for _ in 0..(SUBSCRIBER_QUEUE_DEPTH + 5) {
            bus.publish(topics::ASR_PARTIAL, Value::Null, 0, None);
        }
        let (mut rx_b, _) = bus.subscribe(topics::ASR_FINAL);
        bus.publish(topics::ASR_FINAL, Value::Null, 0, None);
        assert!(rx_b.recv().await.is_some());
    }
}
