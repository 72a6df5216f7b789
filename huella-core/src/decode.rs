use tracing::debug;

use crate::bands::{self, FrameBit, SyncMode};
use crate::codec;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::payload::Payload;
use crate::shortcode::ShortCode;
use crate::sync::{self, BlockType, SyncFinder};

/// One recovered watermark candidate.
#[derive(Debug, Clone)]
pub struct Detection {
    pub payload: Payload,
    /// Coded-stream bit flips implied by the decode (Viterbi path flips,
    /// or Hamming distance in short mode).
    pub bit_errors: usize,
    /// Sync `abs_quality` of the match.
    pub quality: f64,
    /// Sample index of the block start. Clip-mode indices are relative to
    /// the start of the clip and may be negative (match begins in the
    /// zero padding).
    pub index: i64,
    pub block_type: BlockType,
}

/// Decode full A/B blocks at previously found sync offsets.
///
/// Candidates are ranked by bit errors, ties by sync quality; the best
/// candidate is first. No surviving candidate means `DecodeFail`.
pub fn decode_block_mode(
    key: &Key,
    config: &Config,
    samples: &[f32],
    n_channels: usize,
) -> Result<Vec<Detection>> {
    let mut finder = SyncFinder::new(key, config);
    let scores = finder.search(samples, n_channels, SyncMode::Block);
    debug!(matches = scores.len(), "block mode sync matches");

    let data_bits = bands::get_data_bits(key, config);
    let want_frames = data_want_frames(config, &data_bits, 1);

    let mut detections = Vec::new();
    for score in &scores {
        let Some((fft_db, have_frames)) = sync::collect_frame_db(
            config,
            samples,
            n_channels,
            score.index,
            config.block_frames(),
            Some(&want_frames),
            0,
            samples.len(),
        ) else {
            continue; // block extends past the end of the input
        };

        let soft = extract_soft_bits(config, &data_bits, &fft_db, &have_frames, 1);
        if let Some((payload, bit_errors)) = decode_candidate(key, config, &soft)? {
            detections.push(Detection {
                payload,
                bit_errors,
                quality: score.quality,
                index: score.index as i64,
                block_type: score.block_type,
            });
        }
    }

    finish(detections)
}

/// Decode a clip that may contain only a fragment of an AB (or BA) block
/// pair. The clip is zero-padded by a pair length on both sides so
/// partial pairs match against the padding; padded frames contribute
/// nothing and cost no FFTs.
pub fn decode_clip_mode(
    key: &Key,
    config: &Config,
    samples: &[f32],
    n_channels: usize,
) -> Result<Vec<Detection>> {
    let pad_samples = 2 * config.block_frames() * config.frame_size;
    let mut padded = vec![0.0f32; pad_samples * n_channels];
    padded.extend_from_slice(samples);
    padded.resize(padded.len() + pad_samples * n_channels, 0.0);

    let mut finder = SyncFinder::new(key, config);
    let scores = finder.search(&padded, n_channels, SyncMode::Clip);
    debug!(matches = scores.len(), "clip mode sync matches");

    // data layout of an AB pair: both blocks carry the same coded bits
    let block_frames = config.block_frames();
    let mut data_bits = bands::get_data_bits(key, config);
    for frame_bits in data_bits.iter_mut() {
        let second_block: Vec<FrameBit> = frame_bits
            .iter()
            .map(|fb| FrameBit {
                frame: fb.frame + block_frames,
                up: fb.up.clone(),
                down: fb.down.clone(),
            })
            .collect();
        frame_bits.extend(second_block);
    }
    let want_frames = data_want_frames(config, &data_bits, 2);

    // non-zero range of the padded signal bounds where FFTs happen
    let data_first = pad_samples * n_channels;
    let data_last = pad_samples * n_channels + samples.len();

    let mut detections = Vec::new();
    for score in &scores {
        let Some((fft_db, have_frames)) = sync::collect_frame_db(
            config,
            &padded,
            n_channels,
            score.index,
            2 * block_frames,
            Some(&want_frames),
            data_first,
            data_last,
        ) else {
            continue;
        };

        let soft = extract_soft_bits(config, &data_bits, &fft_db, &have_frames, 2);
        if let Some((payload, bit_errors)) = decode_candidate(key, config, &soft)? {
            detections.push(Detection {
                payload,
                bit_errors,
                quality: score.quality,
                index: score.index as i64 - pad_samples as i64,
                block_type: score.block_type,
            });
        }
    }

    finish(detections)
}

/// Mask of the frames (over `blocks` consecutive blocks) that carry data
/// bits, so the decoders skip FFTs for sync and unused frames.
fn data_want_frames(config: &Config, data_bits: &[Vec<FrameBit>], blocks: usize) -> Vec<bool> {
    let mut want = vec![false; blocks * config.block_frames()];
    for frame_bits in data_bits {
        for fb in frame_bits {
            want[fb.frame] = true;
        }
    }
    want
}

/// Soft values per coded-stream bit. Each bit's up/down magnitudes are
/// accumulated over the participations whose frames are present; the
/// confidence scales with how many of the `blocks * frames_per_bit`
/// participations were actually seen (partial clip overlap).
fn extract_soft_bits(
    config: &Config,
    data_bits: &[Vec<FrameBit>],
    fft_db: &[f32],
    have_frames: &[bool],
    blocks: usize,
) -> Vec<f32> {
    let n_bands = config.band_count();
    let total_participations = (blocks * config.frames_per_bit) as f64;

    data_bits
        .iter()
        .map(|frame_bits| {
            let mut umag = 0.0f32;
            let mut dmag = 0.0f32;
            let mut present = 0usize;
            for fb in frame_bits {
                if have_frames[fb.frame] {
                    let index = fb.frame * n_bands;
                    for i in 0..fb.up.len() {
                        umag += fft_db[index + fb.up[i] as usize];
                        dmag += fft_db[index + fb.down[i] as usize];
                    }
                    present += 1;
                }
            }
            let soft = sync::soft_bit_value(umag, dmag);
            (soft * present as f64 / total_participations) as f32
        })
        .collect()
}

/// Deinterleave and decode one soft-bit stream into a payload candidate.
fn decode_candidate(
    key: &Key,
    config: &Config,
    soft: &[f32],
) -> Result<Option<(Payload, usize)>> {
    let soft = codec::deinterleave_soft(key, soft);

    if config.payload_short {
        let hard: Vec<bool> = soft.iter().map(|&s| s > 0.0).collect();
        let (value, distance) = ShortCode::new(config.payload_size)?.decode(&hard);
        let payload = Payload::from_value(value, config.payload_size)?;
        Ok(Some((payload, distance)))
    } else {
        let (bits, bit_errors) = codec::decode_soft(&soft);
        let (payload, crc_ok) = Payload::check_crc(&bits);
        if crc_ok {
            Ok(Some((payload, bit_errors)))
        } else {
            Ok(None)
        }
    }
}

fn finish(mut detections: Vec<Detection>) -> Result<Vec<Detection>> {
    if detections.is_empty() {
        return Err(Error::DecodeFail);
    }
    detections.sort_by(|a, b| {
        a.bit_errors.cmp(&b.bit_errors).then(
            b.quality
                .partial_cmp(&a.quality)
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });
    Ok(detections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::embed;

    /// Reduced-size short-mode config with synthesized sync positions, so
    /// the decode path is exercised without the full search.
    fn short_config() -> Config {
        Config {
            payload_size: 12,
            payload_short: true,
            sync_frames_per_bit: 8,
            frames_pad_start: 4,
            frames_pad_end: 2,
            water_delta: 0.1,
            test_no_sync: true,
            ..Config::default()
        }
    }

    fn full_config() -> Config {
        Config {
            sync_frames_per_bit: 8,
            frames_pad_start: 4,
            frames_pad_end: 2,
            water_delta: 0.1,
            test_no_sync: true,
            ..Config::default()
        }
    }

    fn make_test_audio(num_samples: usize, sample_rate: u32) -> Vec<f32> {
        let mut samples = vec![0.0f32; num_samples];
        for (i, sample) in samples.iter_mut().enumerate() {
            let t = i as f32 / sample_rate as f32;
            for k in 1u32..80 {
                let freq = k as f32 * 60.0;
                let amp = 1.0 / (k as f32).sqrt();
                *sample += amp * (2.0 * std::f32::consts::PI * freq * t + k as f32).sin();
            }
        }
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
        if peak > 0.0 {
            for s in samples.iter_mut() {
                *s *= 0.5 / peak;
            }
        }
        samples
    }

    #[test]
    fn aligned_round_trip_short_mode() {
        let config = short_config();
        let key = Key::from_hex("0123456789abcdeffedcba9876543210").unwrap();
        let payload = Payload::from_value(0xabc, 12).unwrap();

        let mut audio = make_test_audio(config.min_embed_samples(), 44100);
        embed(&mut audio, 1, &key, &config, &payload).unwrap();

        let detections = decode_block_mode(&key, &config, &audio, 1).unwrap();
        let best = &detections[0];
        assert_eq!(best.payload.to_value(), 0xabc);
        assert!(
            best.bit_errors < config.coded_bits() / 3,
            "{} bit errors",
            best.bit_errors
        );
    }

    #[test]
    fn aligned_round_trip_128_bits() {
        let config = full_config();
        let key = Key::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let payload = Payload::from_hex("0123456789abcdeffedcba9876543210", 128).unwrap();

        let mut audio = make_test_audio(config.min_embed_samples(), 44100);
        embed(&mut audio, 1, &key, &config, &payload).unwrap();

        let detections = decode_block_mode(&key, &config, &audio, 1).unwrap();
        let best = &detections[0];
        assert_eq!(best.payload.to_hex(), "0123456789abcdeffedcba9876543210");
        assert_eq!(best.block_type, BlockType::A);
    }

    #[test]
    fn stereo_round_trip() {
        let config = short_config();
        let key = Key::default();
        let payload = Payload::from_value(0x123, 12).unwrap();

        let mono = make_test_audio(config.min_embed_samples(), 44100);
        let mut stereo = Vec::with_capacity(mono.len() * 2);
        for &s in &mono {
            stereo.push(s);
            stereo.push(s * 0.8);
        }
        embed(&mut stereo, 2, &key, &config, &payload).unwrap();

        let detections = decode_block_mode(&key, &config, &stereo, 2).unwrap();
        assert_eq!(detections[0].payload.to_value(), 0x123);
    }

    #[test]
    fn wrong_key_fails_crc() {
        let config = full_config();
        let k1 = Key::from_hex("00000000000000000000000000000001").unwrap();
        let k2 = Key::from_hex("00000000000000000000000000000002").unwrap();
        let payload = Payload::from_hex("deadbeefdeadbeefdeadbeefdeadbeef", 128).unwrap();

        let mut audio = make_test_audio(config.min_embed_samples(), 44100);
        embed(&mut audio, 1, &k1, &config, &payload).unwrap();

        assert!(matches!(
            decode_block_mode(&k2, &config, &audio, 1),
            Err(Error::DecodeFail)
        ));
    }

    #[test]
    fn wrong_key_short_mode_has_many_errors() {
        let config = short_config();
        let k1 = Key::from_hex("00000000000000000000000000000001").unwrap();
        let k2 = Key::from_hex("00000000000000000000000000000002").unwrap();
        let payload = Payload::from_value(0xabc, 12).unwrap();

        let mut audio = make_test_audio(config.min_embed_samples(), 44100);
        embed(&mut audio, 1, &k1, &config, &payload).unwrap();

        // short mode always returns the nearest codeword, but with the
        // wrong key the distance sits near half the codeword length
        let detections = decode_block_mode(&k2, &config, &audio, 1).unwrap();
        assert!(
            detections[0].bit_errors > config.coded_bits() / 5,
            "wrong key produced only {} bit errors",
            detections[0].bit_errors
        );
    }

    #[test]
    fn candidates_sorted_by_bit_errors() {
        let detections = vec![
            Detection {
                payload: Payload::from_value(1, 12).unwrap(),
                bit_errors: 9,
                quality: 1.0,
                index: 0,
                block_type: BlockType::A,
            },
            Detection {
                payload: Payload::from_value(2, 12).unwrap(),
                bit_errors: 2,
                quality: 0.8,
                index: 100,
                block_type: BlockType::B,
            },
        ];
        let sorted = finish(detections).unwrap();
        assert_eq!(sorted[0].bit_errors, 2);
    }
}

