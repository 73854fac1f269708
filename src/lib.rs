//! voxgraph-core: a real-time media-processing pipeline for voice
//! agents. A user assembles a chain of [`Element`]s inside a
//! [`Pipeline`]; audio enters at the head, text/control events fan out
//! on the [`Bus`], synthesized audio leaves at the tail.

pub mod asr;
pub mod audio;
pub mod bus;
pub mod chat;
pub mod config;
pub mod element;
pub mod error;
pub mod message;
pub mod pipeline;
pub mod segmenter;
pub mod tts;
pub mod vad;

pub use bus::{topics, Bus, Event};
pub use element::{Element, ElementContext, LifecycleState};
pub use error::{ErrorKind, GraphError, PipelineError};
pub use message::{AudioData, MediaType, MessageType, PipelineMessage, TextData, TextType};
pub use pipeline::Pipeline;
