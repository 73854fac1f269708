//! Smoke test: wires a small resample -> VAD chain, pushes a few seconds
//! of synthetic PCM through it, and prints the Bus events it produces.
//! Exercises the Pipeline/Element/Bus plumbing end-to-end without any
//! network-backed ASR/TTS provider.

use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use voxgraph_core::audio::AudioResampleElement;
use voxgraph_core::bus::topics;
use voxgraph_core::config::VadConfig;
use voxgraph_core::vad::VadElement;
use voxgraph_core::{AudioData, MediaType, Pipeline, PipelineMessage};

fn synthetic_tone(sample_rate: u32, duration_ms: u64, amplitude: i16) -> Vec<u8> {
    let num_samples = (sample_rate as u64 * duration_ms / 1000) as usize;
    let mut bytes = Vec::with_capacity(num_samples * 2);
    for n in 0..num_samples {
        let t = n as f32 / sample_rate as f32;
        let sample = (amplitude as f32 * (2.0 * std::f32::consts::PI * 220.0 * t).sin()) as i16;
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let session_id = Uuid::new_v4();
    let mut pipeline = Pipeline::new(Some(session_id));

    let resample = AudioResampleElement::new("resample", 16_000, 16_000, 1, 1);
    let vad = VadElement::new("vad", VadConfig::default());

    pipeline.add_element(Box::new(resample)).expect("add resample");
    pipeline.add_element(Box::new(vad)).expect("add vad");
    pipeline.link("resample", "vad").expect("link resample->vad");

    let bus = pipeline.bus();
    let (mut speech_start_rx, _) = bus.subscribe(topics::VAD_SPEECH_START);
    let (mut speech_end_rx, _) = bus.subscribe(topics::VAD_SPEECH_END);

    pipeline.start().await.expect("pipeline start");

    let loud = synthetic_tone(16_000, 500, 20_000);
    let silence = vec![0u8; 16_000 * 2];

    for (i, bytes) in [loud, silence].into_iter().enumerate() {
        let audio = AudioData {
            bytes,
            sample_rate: 16_000,
            channels: 1,
            media_type: MediaType::RawPcmS16Le,
            timestamp: i as u64 * 1000,
            sequence: None,
        };
        pipeline.push(PipelineMessage::audio(audio, Some(session_id))).await.expect("push");
    }

    pipeline.stop().await;

    while let Ok(ev) = speech_start_rx.try_recv() {
        println!("vad.speech.start: {}", ev.payload);
    }
    while let Ok(ev) = speech_end_rx.try_recv() {
        println!("vad.speech.end: {}", ev.payload);
    }
    println!("bus events dropped: {}", bus.total_dropped());
}
