//! Pipeline — graph wiring, lifecycle, push/pull, worker supervision.
//!
//! Owns the ordered element list and the Bus together, drives every
//! element through the same init/shutdown lifecycle, and wires a linear
//! DAG of stages joined by bounded channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{topics, Bus};
use crate::element::{Element, ElementContext, LifecycleState};
use crate::error::{ErrorKind, GraphError, PipelineError};
use crate::message::PipelineMessage;

/// Default bounded depth for an inter-element edge.
pub const DEFAULT_EDGE_DEPTH: usize = 100;

struct ElementSlot {
    name: String,
    element: Arc<Mutex<Box<dyn Element>>>,
}

/// A directed, acyclic chain of [`Element`]s plus their supervising
/// lifecycle and [`Bus`].
pub struct Pipeline {
    elements: Vec<ElementSlot>,
    name_to_index: HashMap<String, usize>,
    /// dst name -> src name (each dst has at most one inbound edge)
    edges_dst_to_src: HashMap<String, String>,
    /// src name -> dst name (each src has at most one outbound edge)
    edges_src_to_dst: HashMap<String, String>,
    /// edge depth override, keyed by dst name (the edge feeding that dst)
    edge_depth: HashMap<String, usize>,
    head_depth: usize,
    bus: Arc<Bus>,
    state: std::sync::Mutex<LifecycleState>,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    head_tx: Mutex<Option<mpsc::Sender<PipelineMessage>>>,
    tail_rx: Mutex<Option<mpsc::Receiver<PipelineMessage>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    session_id: Option<Uuid>,
    sequence: AtomicU64,
}

impl Pipeline {
    pub fn new(session_id: Option<Uuid>) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            elements: Vec::new(),
            name_to_index: HashMap::new(),
            edges_dst_to_src: HashMap::new(),
            edges_src_to_dst: HashMap::new(),
            edge_depth: HashMap::new(),
            head_depth: DEFAULT_EDGE_DEPTH,
            bus: Arc::new(Bus::new()),
            state: std::sync::Mutex::new(LifecycleState::Created),
            cancel_tx,
            cancel_rx,
            head_tx: Mutex::new(None),
            tail_rx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            session_id,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    fn is_started_or_later(&self) -> bool {
        !matches!(self.state(), LifecycleState::Created)
    }

    /// Append an element to the graph, in insertion order. Fails if the
    /// pipeline already started, or if an element with this name is
    /// already owned.
    pub fn add_element(&mut self, element: Box<dyn Element>) -> Result<(), GraphError> {
        if self.is_started_or_later() {
            return Err(GraphError::AlreadyStarted);
        }
        let name = element.name().to_string();
        if self.name_to_index.contains_key(&name) {
            return Err(GraphError::AlreadyOwned(name));
        }
        self.name_to_index.insert(name.clone(), self.elements.len());
        self.elements.push(ElementSlot {
            name,
            element: Arc::new(Mutex::new(element)),
        });
        Ok(())
    }

    /// Returns true if linking `src -> dst` would introduce a cycle, i.e.
    /// `src` is already reachable by walking forward from `dst` along
    /// existing edges. Since every node has at most one outgoing edge,
    /// "reachable from dst" is just following the chain.
    fn would_create_cycle(&self, src: &str, dst: &str) -> bool {
        if src == dst {
            return true;
        }
        let mut cur = dst.to_string();
        let mut hops = 0usize;
        while let Some(next) = self.edges_src_to_dst.get(&cur) {
            if next == src {
                return true;
            }
            cur = next.clone();
            hops += 1;
            if hops > self.elements.len() {
                // Defensive: existing structure is already inconsistent.
                return true;
            }
        }
        false
    }

    /// Bind `src`'s output as `dst`'s input, with the default edge depth.
    pub fn link(&mut self, src: &str, dst: &str) -> Result<(), GraphError> {
        self.link_with_depth(src, dst, DEFAULT_EDGE_DEPTH)
    }

    pub fn link_with_depth(&mut self, src: &str, dst: &str, depth: usize) -> Result<(), GraphError> {
        if self.is_started_or_later() {
            return Err(GraphError::AlreadyStarted);
        }
        if !self.name_to_index.contains_key(src) {
            return Err(GraphError::UnknownElement(src.to_string()));
        }
        if !self.name_to_index.contains_key(dst) {
            return Err(GraphError::UnknownElement(dst.to_string()));
        }
        if self.edges_dst_to_src.contains_key(dst) {
            return Err(GraphError::AlreadyLinked(dst.to_string()));
        }
        if self.edges_src_to_dst.contains_key(src) {
            return Err(GraphError::AlreadyLinked(src.to_string()));
        }
        if self.would_create_cycle(src, dst) {
            return Err(GraphError::WouldCreateCycle {
                src: src.to_string(),
                dst: dst.to_string(),
            });
        }
        self.edges_dst_to_src.insert(dst.to_string(), src.to_string());
        self.edges_src_to_dst.insert(src.to_string(), dst.to_string());
        self.edge_depth.insert(dst.to_string(), depth);
        Ok(())
    }

    pub fn bus(&self) -> Arc<Bus> {
        self.bus.clone()
    }

    fn head_name(&self) -> Option<&str> {
        self.elements
            .iter()
            .map(|s| s.name.as_str())
            .find(|n| !self.edges_dst_to_src.contains_key(*n))
    }

    fn tail_name(&self) -> Option<&str> {
        self.elements
            .iter()
            .map(|s| s.name.as_str())
            .find(|n| !self.edges_src_to_dst.contains_key(*n))
    }

    /// Move to Started, `Init` every element in insertion order, then
    /// spawn one worker per element. Fails atomically: if any `Init`
    /// fails, every already-initialized element is torn down in reverse
    /// order and the pipeline moves to Failed.
    pub async fn start(&self) -> Result<(), GraphError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != LifecycleState::Created {
                return Err(GraphError::AlreadyStarted);
            }
            *state = LifecycleState::Started;
        }

        if self.elements.is_empty() {
            return Ok(());
        }

        // Validate the graph is exactly one connected chain, not several
        // disjoint fragments.
        let head = self.head_name().ok_or_else(|| {
            GraphError::InitFailed("<graph>".into(), "no element without an inbound edge (cycle?)".into())
        })?.to_string();
        let tail = self.tail_name().ok_or_else(|| {
            GraphError::InitFailed("<graph>".into(), "no element without an outbound edge (cycle?)".into())
        })?.to_string();

        let mut visited = 0usize;
        let mut cur = head.clone();
        loop {
            visited += 1;
            match self.edges_src_to_dst.get(&cur) {
                Some(next) => cur = next.clone(),
                None => break,
            }
        }
        if visited != self.elements.len() {
            *self.state.lock().unwrap() = LifecycleState::Failed;
            return Err(GraphError::InitFailed(
                "<graph>".into(),
                format!(
                    "graph is not a single connected chain: reached {} of {} elements from head '{}'",
                    visited,
                    self.elements.len(),
                    head
                ),
            ));
        }

        // Init every element, in insertion order. Unwind on first failure.
        let mut initialized: Vec<usize> = Vec::new();
        for (idx, slot) in self.elements.iter().enumerate() {
            let ctx = ElementContext::new(&self.bus, self.session_id, self.cancel_rx.clone());
            let mut el = slot.element.lock().await;
            if let Err(e) = el.init(ctx).await {
                error!(element = slot.name.as_str(), error = %e, "element init failed, unwinding");
                drop(el);
                for prev_idx in initialized.into_iter().rev() {
                    self.elements[prev_idx].element.lock().await.shutdown().await;
                }
                *self.state.lock().unwrap() = LifecycleState::Failed;
                return Err(GraphError::InitFailed(slot.name.clone(), e));
            }
            initialized.push(idx);
        }

        // Wire channels: one per edge, plus the pipeline-level head/tail.
        let (head_tx, mut next_rx) = mpsc::channel::<PipelineMessage>(self.head_depth);
        *self.head_tx.lock().await = Some(head_tx);

        let mut workers = Vec::with_capacity(self.elements.len());
        let mut cur_name = head.clone();
        loop {
            let idx = self.name_to_index[&cur_name];
            let is_tail = cur_name == tail;
            let (out_tx, out_rx_for_next) = if is_tail {
                mpsc::channel::<PipelineMessage>(DEFAULT_EDGE_DEPTH)
            } else {
                let next_name = self.edges_src_to_dst[&cur_name].clone();
                let depth = *self.edge_depth.get(&next_name).unwrap_or(&DEFAULT_EDGE_DEPTH);
                mpsc::channel::<PipelineMessage>(depth)
            };

            let in_rx = std::mem::replace(&mut next_rx, out_rx_for_next);
            let bus = self.bus.clone();
            let cancel_rx = self.cancel_rx.clone();
            let element_name = cur_name.clone();

            let handle = spawn_element_worker(
                element_name.clone(),
                self.elements[idx].element.clone(),
                in_rx,
                out_tx,
                bus,
                cancel_rx,
            );
            workers.push(handle);

            if is_tail {
                *self.tail_rx.lock().await = Some(next_rx);
                break;
            }
            cur_name = self.edges_src_to_dst[&cur_name].clone();
        }

        *self.workers.lock().await = workers;
        info!(elements = self.elements.len(), "pipeline started");
        Ok(())
    }

    /// Close the head channel, let EOF propagate edge-by-edge, await
    /// worker termination, publish `pipeline.stopped`.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, LifecycleState::Stopped | LifecycleState::Stopping) {
                return;
            }
            *state = LifecycleState::Stopping;
        }
        // Drop the head sender: downstream workers see EOF once their
        // input channels drain, edge by edge.
        self.head_tx.lock().await.take();
        let _ = self.cancel_tx.send(true);

        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            let _ = handle.await;
        }
        drop(workers);

        for slot in &self.elements {
            slot.element.lock().await.shutdown().await;
        }

        *self.state.lock().unwrap() = LifecycleState::Stopped;
        self.bus.publish(topics::PIPELINE_STOPPED, json!({}), now_ms(), self.session_id);
    }

    /// Enqueue onto the head. Safe from any caller context; blocks when
    /// the head queue is full.
    pub async fn push(&self, mut msg: PipelineMessage) -> Result<(), PipelineError> {
        self.stamp_sequence(&mut msg);
        let guard = self.head_tx.lock().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(msg)
                .await
                .map_err(|_| PipelineError::new(ErrorKind::Unknown, "pipeline head closed")),
            None => Err(PipelineError::new(ErrorKind::Unknown, "pipeline not started")),
        }
    }

    /// Blocking variant for non-async callers.
    pub fn push_blocking(&self, mut msg: PipelineMessage) -> Result<(), PipelineError> {
        self.stamp_sequence(&mut msg);
        let guard = self.head_tx.blocking_lock();
        match guard.as_ref() {
            Some(tx) => tx
                .blocking_send(msg)
                .map_err(|_| PipelineError::new(ErrorKind::Unknown, "pipeline head closed")),
            None => Err(PipelineError::new(ErrorKind::Unknown, "pipeline not started")),
        }
    }

    /// Stamp a monotonic per-pipeline sequence number on audio buffers
    /// entering at the head, so tests can assert FIFO ordering across a
    /// chain of bounded channels.
    fn stamp_sequence(&self, msg: &mut PipelineMessage) {
        if let Some(audio) = msg.audio.as_mut() {
            audio.sequence = Some(self.sequence.fetch_add(1, Ordering::Relaxed));
        }
    }

    /// Dequeue from the tail. Blocks until a message is available or the
    /// tail channel is closed (`None` = EOF).
    pub async fn pull(&self) -> Option<PipelineMessage> {
        let mut guard = self.tail_rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-element worker: read one message, transform, write zero or more,
/// loop. On EOF, flush and close. On fatal error, publish and close.
fn spawn_element_worker(
    name: String,
    element: Arc<Mutex<Box<dyn Element>>>,
    mut in_rx: mpsc::Receiver<PipelineMessage>,
    out_tx: mpsc::Sender<PipelineMessage>,
    bus: Arc<Bus>,
    mut cancel_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *cancel_rx.borrow() {
                break;
            }
            let msg = tokio::select! {
                biased;
                _ = cancel_rx.changed() => break,
                m = in_rx.recv() => m,
            };

            let Some(msg) = msg else {
                let mut el = element.lock().await;
                match el.flush().await {
                    Ok(outputs) => {
                        for out in outputs {
                            if out_tx.send(out).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(element = name.as_str(), error = %e, "flush error");
                        bus.publish(
                            topics::PIPELINE_ERROR,
                            json!({"kind": e.kind.as_str(), "message": e.message, "element": name}),
                            now_ms(),
                            None,
                        );
                    }
                }
                break;
            };

            let mut el = element.lock().await;
            match el.process(msg).await {
                Ok(outputs) => {
                    for out in outputs {
                        if out_tx.send(out).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!(element = name.as_str(), error = %e, "fatal transform error, closing output");
                    bus.publish(
                        topics::PIPELINE_ERROR,
                        json!({"kind": e.kind.as_str(), "message": e.message, "element": name}),
                        now_ms(),
                        None,
                    );
                    break;
                }
            }
        }
        // out_tx drops here, propagating EOF downstream.
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioResampleElement;
    use crate::config::VadConfig;
    use crate::message::MediaType;
    use crate::vad::VadElement;

    struct Passthrough {
        name: String,
    }

    #[async_trait::async_trait]
    impl Element for Passthrough {
        fn name(&self) -> &str {
            &self.name
        }
        async fn init(&mut self, _ctx: ElementContext) -> Result<(), String> {
            Ok(())
        }
        async fn process(&mut self, msg: PipelineMessage) -> Result<Vec<PipelineMessage>, PipelineError> {
            Ok(vec![msg])
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn passthrough(name: &str) -> Box<dyn Element> {
        Box::new(Passthrough { name: name.to_string() })
    }

    #[test]
    fn linking_a_node_to_itself_is_a_cycle() {
        let mut p = Pipeline::new(None);
        p.add_element(passthrough("a")).unwrap();
        assert!(matches!(p.link("a", "a"), Err(GraphError::WouldCreateCycle { .. })));
    }

    #[test]
    fn linking_back_to_an_earlier_node_is_a_cycle() {
        let mut p = Pipeline::new(None);
        p.add_element(passthrough("a")).unwrap();
        p.add_element(passthrough("b")).unwrap();
        p.add_element(passthrough("c")).unwrap();
        p.link("a", "b").unwrap();
        p.link("b", "c").unwrap();
        assert!(matches!(p.link("c", "a"), Err(GraphError::WouldCreateCycle { .. })));
    }

    #[tokio::test]
    async fn start_rejects_disjoint_fragments() {
        // Two separate two-node chains, never joined: a->b and c->d.
        // head_name()/tail_name() each only see one end of the graph as a
        // whole, so the "is every element reached from head" walk must
        // catch this rather than silently running half the graph.
        let mut p = Pipeline::new(None);
        p.add_element(passthrough("a")).unwrap();
        p.add_element(passthrough("b")).unwrap();
        p.add_element(passthrough("c")).unwrap();
        p.add_element(passthrough("d")).unwrap();
        p.link("a", "b").unwrap();
        p.link("c", "d").unwrap();

        let result = p.start().await;
        assert!(matches!(result, Err(GraphError::InitFailed(_, _))));
        assert_eq!(p.state(), LifecycleState::Failed);
    }

    #[tokio::test]
    async fn empty_pipeline_starts_and_stops_cleanly() {
        let p = Pipeline::new(None);
        p.start().await.unwrap();
        p.stop().await;
        assert_eq!(p.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn push_blocks_once_the_bounded_edge_fills() {
        // A single-element chain with a 1-deep head edge backs onto a
        // fixed 100-deep tail edge; with nobody pulling, the combined
        // buffering is small and finite, so pushing well past it must not
        // complete within a short window.
        let mut p = Pipeline::new(None);
        p.add_element(passthrough("only")).unwrap();
        p.head_depth = 1;
        p.start().await.unwrap();

        let msg = |n: u64| {
            PipelineMessage::audio(
                AudioData {
                    bytes: vec![0u8; 2],
                    sample_rate: 16_000,
                    channels: 1,
                    media_type: MediaType::RawPcmS16Le,
                    timestamp: n,
                    sequence: None,
                },
                None,
            )
        };

        let all_pushed = tokio::time::timeout(std::time::Duration::from_millis(150), async {
            for n in 0..500u64 {
                p.push(msg(n)).await.unwrap();
            }
        })
        .await;
        assert!(all_pushed.is_err(), "500 pushes into a 1+100 deep chain should block without a consumer");

        // Draining unblocks the stalled push loop's progress.
        let _ = p.pull().await;
        let _ = p.pull().await;
        p.stop().await;
    }

    #[tokio::test]
    async fn vad_gated_chain_emits_speech_start_then_end() {
        // S1: resample -> vad, a loud tone followed by silence should
        // cross the speech threshold and then drop back under it.
        let mut p = Pipeline::new(None);
        p.add_element(Box::new(AudioResampleElement::new("resample", 16_000, 16_000, 1, 1))).unwrap();
        p.add_element(Box::new(VadElement::new("vad", VadConfig::default()))).unwrap();
        p.link("resample", "vad").unwrap();

        let bus = p.bus();
        let (mut start_rx, _) = bus.subscribe(topics::VAD_SPEECH_START);
        let (mut end_rx, _) = bus.subscribe(topics::VAD_SPEECH_END);

        p.start().await.unwrap();

        let tone = |amplitude: i16, num_samples: usize| -> Vec<u8> {
            let mut bytes = Vec::with_capacity(num_samples * 2);
            for n in 0..num_samples {
                let t = n as f32 / 16_000.0;
                let sample = (amplitude as f32 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()) as i16;
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            bytes
        };

        for (i, bytes) in [tone(20_000, 16_000), vec![0u8; 32_000]].into_iter().enumerate() {
            let audio = AudioData {
                bytes,
                sample_rate: 16_000,
                channels: 1,
                media_type: MediaType::RawPcmS16Le,
                timestamp: i as u64 * 1000,
                sequence: None,
            };
            p.push(PipelineMessage::audio(audio, None)).await.unwrap();
        }

        p.stop().await;

        assert!(start_rx.try_recv().is_ok(), "expected vad.speech.start to fire on the loud tone");
        assert!(end_rx.try_recv().is_ok(), "expected vad.speech.end to fire once silence follows");
    }
}
