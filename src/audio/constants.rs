//! Fixed audio constants shared across VAD/ASR/TTS elements.

/// Default analysis sample rate for VAD and most streaming ASR dialects.
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// VAD analysis window, in samples, at `DEFAULT_SAMPLE_RATE`: a
/// fixed-size analysis window, 512 samples at 16 kHz.
pub const VAD_FRAME_SIZE: usize = 512;

/// Derived: `VAD_FRAME_SIZE / DEFAULT_SAMPLE_RATE * 1000`.
pub const VAD_FRAME_DURATION_MS: u64 = 32;

/// S16LE is 2 bytes per sample.
pub const BYTES_PER_SAMPLE_S16LE: usize = 2;

/// Chunk size for HTTP-chunked TTS reads: stream the response body in
/// ~4 KB reads.
pub const TTS_HTTP_CHUNK_BYTES: usize = 4096;
