//! The single envelope that crosses every pipeline edge.
//!
//! A small tagged union plus a monotonic sequence number, carrying the
//! audio/text/control split every element reads and writes.

use uuid::Uuid;

/// Audio sample encoding carried by an [`AudioData`] buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    /// Raw signed 16-bit little-endian PCM.
    RawPcmS16Le,
    MuLaw,
    ALaw,
    Opus,
    Mpeg,
    Wav,
}

/// A buffer of audio samples plus everything needed to interpret it.
#[derive(Debug, Clone)]
pub struct AudioData {
    pub bytes: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub media_type: MediaType,
    /// Monotonic capture time, milliseconds.
    pub timestamp: u64,
    /// Per-edge monotonic counter, useful for FIFO verification in tests.
    pub sequence: Option<u64>,
}

impl AudioData {
    pub fn bytes_per_sample(&self) -> usize {
        match self.media_type {
            MediaType::RawPcmS16Le => 2,
            MediaType::MuLaw | MediaType::ALaw => 1,
            // Compressed formats have no fixed bytes-per-sample; treat as opaque.
            MediaType::Opus | MediaType::Mpeg | MediaType::Wav => 1,
        }
    }

    /// Invariant: `len(bytes) % (channels * bytes_per_sample) == 0`.
    pub fn is_well_formed(&self) -> bool {
        let frame_size = self.channels as usize * self.bytes_per_sample();
        frame_size != 0 && self.bytes.len() % frame_size == 0
    }

    /// Duration is derived, never stored.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        let frame_size = (self.channels as usize * self.bytes_per_sample()).max(1);
        let num_frames = self.bytes.len() / frame_size;
        (num_frames as u64 * 1000) / self.sample_rate as u64
    }
}

/// The MIME-ish tag on a [`TextData`] payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextType {
    Partial,
    Final,
    Delta,
    /// Structured event payload, JSON-encoded in `bytes`.
    Event,
}

#[derive(Debug, Clone)]
pub struct TextData {
    pub bytes: Vec<u8>,
    pub text_type: TextType,
    pub timestamp: u64,
    /// Correlates partials/finals for the same spoken turn.
    pub utterance_id: Option<Uuid>,
}

impl TextData {
    pub fn as_str(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.bytes)
    }
}

/// Discriminates which payload a [`PipelineMessage`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Audio,
    Data,
    Control,
}

/// The single envelope that crosses every edge. Exactly one of
/// `audio`/`text` is populated for a non-control message. Immutable once
/// pushed onto an edge.
#[derive(Debug, Clone)]
pub struct PipelineMessage {
    pub msg_type: MessageType,
    pub timestamp: u64,
    pub audio: Option<AudioData>,
    pub text: Option<TextData>,
    pub session_id: Option<Uuid>,
}

impl PipelineMessage {
    pub fn audio(data: AudioData, session_id: Option<Uuid>) -> Self {
        Self {
            msg_type: MessageType::Audio,
            timestamp: data.timestamp,
            audio: Some(data),
            text: None,
            session_id,
        }
    }

    pub fn text(data: TextData, session_id: Option<Uuid>) -> Self {
        Self {
            msg_type: MessageType::Data,
            timestamp: data.timestamp,
            text: Some(data),
            audio: None,
            session_id,
        }
    }

    pub fn control(timestamp: u64, session_id: Option<Uuid>) -> Self {
        Self {
            msg_type: MessageType::Control,
            timestamp,
            audio: None,
            text: None,
            session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_well_formed_checks_frame_alignment() {
        let good = AudioData {
            bytes: vec![0u8; 8],
            sample_rate: 16000,
            channels: 2,
            media_type: MediaType::RawPcmS16Le,
            timestamp: 0,
            sequence: None,
        };
        assert!(good.is_well_formed());

        let bad = AudioData {
            bytes: vec![0u8; 7],
            ..good.clone()
        };
        assert!(!bad.is_well_formed());
    }

    #[test]
    fn audio_duration_is_derived() {
        let a = AudioData {
            bytes: vec![0u8; 16000 * 2], // 1s mono @16kHz S16LE
            sample_rate: 16000,
            channels: 1,
            media_type: MediaType::RawPcmS16Le,
            timestamp: 0,
            sequence: None,
        };
        assert_eq!(a.duration_ms(), 1000);
    }
}
