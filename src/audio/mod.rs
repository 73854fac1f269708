//! Audio-domain building blocks: constants, resampling, WAV framing.

pub mod constants;
pub mod resample;
pub mod wav;

pub use resample::AudioResampleElement;
pub use wav::{pcm_to_wav, wav_to_pcm, WavPcm};
