use realfft::num_complex::Complex32;

use crate::bands::{self, SyncMode};
use crate::codec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fft::FftProcessor;
use crate::key::Key;
use crate::limiter::Limiter;
use crate::payload::Payload;
use crate::shortcode::ShortCode;

/// Fixed cross-fade weight for mix mode: each touched bin moves halfway
/// from the original spectrum toward the fully scaled one, with the
/// phase taken from the original complex bin.
const MIX_BLEND: f32 = 0.5;

/// Role of one frame inside a block: exactly one FrameBit touches it.
#[derive(Debug, Clone)]
enum FrameRole {
    Sync { bit: usize, up: Vec<u16>, down: Vec<u16> },
    Data { bit: usize, up: Vec<u16>, down: Vec<u16> },
}

/// Outcome of an embed operation.
#[derive(Debug, Clone)]
pub struct EmbedResult {
    /// Number of complete blocks written (A, B, A, ...).
    pub blocks_written: usize,
    /// Signal-to-watermark ratio in dB.
    pub snr_db: f64,
}

/// Coded bit stream carried by the data frames of each block: payload
/// (+CRC-32 and convolutional code in 128-bit mode, short codeword in
/// short mode), interleaved with the key's bit-order stream.
pub fn block_coded_bits(key: &Key, config: &Config, payload: &Payload) -> Result<Vec<bool>> {
    if payload.len() != config.payload_size {
        return Err(Error::Format(format!(
            "payload has {} bits, config expects {}",
            payload.len(),
            config.payload_size
        )));
    }
    let coded = if config.payload_short {
        ShortCode::new(config.payload_size)?.encode(payload.to_value())?
    } else {
        codec::encode(&payload.with_crc())
    };
    debug_assert_eq!(coded.len(), config.coded_bits());
    Ok(codec::interleave(key, &coded))
}

/// One entry per block-relative frame position, derived from the keyed
/// sync/data layouts. Identical on the embed and extract sides.
fn block_frame_plan(key: &Key, config: &Config) -> Vec<FrameRole> {
    let mut plan: Vec<Option<FrameRole>> = vec![None; config.block_frames()];

    for (bit, frame_bits) in bands::get_sync_bits(key, config, SyncMode::Block)
        .into_iter()
        .enumerate()
    {
        for fb in frame_bits {
            debug_assert!(plan[fb.frame].is_none());
            plan[fb.frame] = Some(FrameRole::Sync {
                bit,
                up: fb.up,
                down: fb.down,
            });
        }
    }
    for (bit, frame_bits) in bands::get_data_bits(key, config).into_iter().enumerate() {
        for fb in frame_bits {
            debug_assert!(plan[fb.frame].is_none());
            plan[fb.frame] = Some(FrameRole::Data {
                bit,
                up: fb.up,
                down: fb.down,
            });
        }
    }
    plan.into_iter()
        .map(|role| role.expect("bit positions partition the block"))
        .collect()
}

/// Apply the magnitude scale to one bin. In mix mode the result is a
/// fixed cross-fade between the original and the fully scaled bin; both
/// are collinear, so the original phase is preserved.
fn shape_bin(bin: &mut Complex32, scale: f32, mix: bool) {
    let scaled = *bin * scale;
    *bin = if mix {
        *bin + (scaled - *bin) * MIX_BLEND
    } else {
        scaled
    };
}

/// Embed a watermark into interleaved samples (in place).
///
/// Writes `frames_pad_start` untouched frames, then as many alternating
/// A/B blocks as fit, then tail padding. Embedding is a pure function of
/// (samples, key, payload, config) and is byte-deterministic.
pub fn embed(
    samples: &mut [f32],
    n_channels: usize,
    key: &Key,
    config: &Config,
    payload: &Payload,
) -> Result<EmbedResult> {
    let frame_size = config.frame_size;
    let samples_per_channel = samples.len() / n_channels;
    if samples_per_channel < config.min_embed_samples() {
        return Err(Error::InputTooShort {
            needed: config.min_embed_samples(),
            got: samples_per_channel,
        });
    }

    let coded = block_coded_bits(key, config, payload)?;
    let plan = block_frame_plan(key, config);
    let block_frames = config.block_frames();

    let total_frames = config.frame_count(samples_per_channel);
    let usable = total_frames - config.frames_pad_start - config.frames_pad_end;
    let n_blocks = usable / block_frames;

    let original = samples.to_vec();
    let mut fft = FftProcessor::new(frame_size);
    let mut time_buf = vec![0.0f32; frame_size];
    let delta = config.water_delta as f32;

    for block_index in 0..n_blocks {
        let is_b_block = block_index % 2 == 1;
        let block_start = config.frames_pad_start + block_index * block_frames;

        for (pos, role) in plan.iter().enumerate() {
            let (up, down, value) = match role {
                FrameRole::Sync { bit, up, down } => (up, down, (bit & 1 == 1) != is_b_block),
                FrameRole::Data { bit, up, down } => (up, down, coded[*bit]),
            };
            let (up_scale, down_scale) = if value {
                (1.0 + delta, 1.0 - delta)
            } else {
                (1.0 - delta, 1.0 + delta)
            };

            let frame_offset = (block_start + pos) * frame_size;
            for ch in 0..n_channels {
                for i in 0..frame_size {
                    time_buf[i] = samples[ch + (frame_offset + i) * n_channels];
                }
                let bins = fft.forward(&mut time_buf)?;
                for &u in up {
                    shape_bin(&mut bins[config.min_band + u as usize], up_scale, config.mix);
                }
                for &d in down {
                    shape_bin(&mut bins[config.min_band + d as usize], down_scale, config.mix);
                }
                fft.inverse(&mut time_buf)?;
                fft.normalize(&mut time_buf);
                for i in 0..frame_size {
                    samples[ch + (frame_offset + i) * n_channels] = time_buf[i];
                }
            }
        }
    }

    if !config.test_no_limiter {
        Limiter::new(n_channels, frame_size).process(samples);
    }

    Ok(EmbedResult {
        blocks_written: n_blocks,
        snr_db: snr_db(&original, samples),
    })
}

/// Signal-to-watermark ratio in dB between the original and the
/// watermarked rendition of the same material.
pub fn snr_db(original: &[f32], watermarked: &[f32]) -> f64 {
    let mut signal_power = 0.0f64;
    let mut delta_power = 0.0f64;
    for (&o, &w) in original.iter().zip(watermarked.iter()) {
        signal_power += (o as f64) * (o as f64);
        let d = (o - w) as f64;
        delta_power += d * d;
    }
    if delta_power == 0.0 {
        f64::INFINITY
    } else {
        10.0 * (signal_power / delta_power).log10()
    }
}
