//! PCM <-> WAV framing for the batch ASR provider.
//!
//! Write canonical RIFF/WAVE via `hound::WavWriter` over an in-memory
//! cursor, read back with `hound::WavReader`.

use std::io::Cursor;

use hound::{SampleFormat, WavSpec, WavWriter};

use crate::error::{ErrorKind, PipelineError};

fn io_error(context: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::new(ErrorKind::Audio, format!("{context}: {e}"))
}

/// Frame raw S16LE PCM as a canonical RIFF/WAVE byte buffer.
pub fn pcm_to_wav(pcm: &[u8], sample_rate: u32, channels: u16, bits_per_sample: u16) -> Result<Vec<u8>, PipelineError> {
    if bits_per_sample != 16 {
        return Err(PipelineError::new(ErrorKind::Config, "only 16-bit PCM is supported for WAV framing"));
    }
    let spec = WavSpec {
        channels,
        sample_rate,
        bits_per_sample,
        sample_format: SampleFormat::Int,
    };

    let mut buf = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut buf, spec).map_err(|e| io_error("wav writer init", e))?;
        for chunk in pcm.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            writer.write_sample(sample).map_err(|e| io_error("wav sample write", e))?;
        }
        writer.finalize().map_err(|e| io_error("wav finalize", e))?;
    }
    Ok(buf.into_inner())
}

/// Recovered PCM plus the format the WAV container declared.
pub struct WavPcm {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

/// Read a canonical RIFF/WAVE buffer back into raw S16LE PCM bytes.
pub fn wav_to_pcm(wav: &[u8]) -> Result<WavPcm, PipelineError> {
    let cursor = Cursor::new(wav);
    let mut reader = hound::WavReader::new(cursor).map_err(|e| io_error("wav reader init", e))?;
    let spec = reader.spec();
    if spec.bits_per_sample != 16 || spec.sample_format != SampleFormat::Int {
        return Err(PipelineError::new(ErrorKind::Audio, "only 16-bit integer WAV is supported"));
    }

    let mut pcm = Vec::with_capacity(reader.len() as usize * 2);
    for sample in reader.samples::<i16>() {
        let sample = sample.map_err(|e| io_error("wav sample read", e))?;
        pcm.extend_from_slice(&sample.to_le_bytes());
    }

    Ok(WavPcm {
        pcm,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
        bits_per_sample: spec.bits_per_sample,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine_pcm(num_samples: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(num_samples * 2);
        for n in 0..num_samples {
            let t = n as f32 / 16_000.0;
            let v = (std::f32::consts::TAU * 440.0 * t).sin();
            let s = (v * i16::MAX as f32) as i16;
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn round_trip_preserves_pcm() {
        let pcm = sine_pcm(1600);
        let wav = pcm_to_wav(&pcm, 16_000, 1, 16).expect("encode");
        let recovered = wav_to_pcm(&wav).expect("decode");
        assert_eq!(recovered.pcm, pcm);
        assert_eq!(recovered.sample_rate, 16_000);
        assert_eq!(recovered.channels, 1);
    }

    #[test]
    fn rejects_non_16_bit_request() {
        let pcm = sine_pcm(10);
        assert!(pcm_to_wav(&pcm, 16_000, 1, 8).is_err());
    }
}
