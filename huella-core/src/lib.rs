//! Blind spread-spectrum audio watermarking.
//!
//! A short binary payload (128 bits, or a few bits in short mode) is
//! embedded into the short-time Fourier magnitudes of a PCM signal. The
//! mark survives lossy recompression, clipping to a fragment, and small
//! playback-speed changes, and is recovered blind: only the key and the
//! watermarked audio are needed.

pub mod bands;
pub mod codec;
pub mod config;
pub mod decode;
pub mod embed;
pub mod error;
pub mod fft;
pub mod key;
pub mod limiter;
pub mod payload;
pub mod random;
pub mod resample;
pub mod shortcode;
pub mod speed;
pub mod sync;

pub use config::Config;
pub use decode::Detection;
pub use embed::EmbedResult;
pub use error::{Error, Result};
pub use key::Key;
pub use payload::Payload;
pub use speed::SpeedResult;
pub use sync::BlockType;

/// Embed a watermark into interleaved samples (in place).
pub fn embed(
    samples: &mut [f32],
    n_channels: usize,
    key: &Key,
    config: &Config,
    payload: &Payload,
) -> Result<EmbedResult> {
    embed::embed(samples, n_channels, key, config, payload)
}

/// Detect watermarks: search for full blocks first, then fall back to
/// the clip decoder for inputs holding only a fragment of a block pair.
pub fn detect(
    samples: &[f32],
    n_channels: usize,
    key: &Key,
    config: &Config,
) -> Result<Vec<Detection>> {
    match decode::decode_block_mode(key, config, samples, n_channels) {
        Ok(detections) => Ok(detections),
        Err(Error::DecodeFail) => decode::decode_clip_mode(key, config, samples, n_channels),
        Err(e) => Err(e),
    }
}

/// Detect a playback-speed change; `None` means the input is treated as
/// speed 1.0.
pub fn detect_speed(
    samples: &[f32],
    n_channels: usize,
    key: &Key,
    config: &Config,
    patient: bool,
) -> Option<SpeedResult> {
    speed::detect_speed(key, config, samples, n_channels, patient)
}
