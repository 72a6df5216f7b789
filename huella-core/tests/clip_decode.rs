//! Clip decoder round trips: a contiguous fragment cut from a longer
//! watermarked file is zero-padded and matched against AB/BA block pairs.

use huella_core::{decode, Config, Key, Payload};

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

fn clip_config() -> Config {
    Config {
        payload_size: 12,
        payload_short: true,
        sync_frames_per_bit: 40,
        sync_search_fine: 16,
        frames_pad_start: 8,
        frames_pad_end: 4,
        water_delta: 0.12,
        ..Config::default()
    }
}

#[test]
fn clip_covering_a_block_pair_decodes() {
    let config = clip_config();
    let key = Key::from_hex("0123456789abcdeffedcba9876543210").unwrap();
    let payload = Payload::from_value(0x9f3, 12).unwrap();

    // four blocks of material
    let total = (config.frames_pad_start + 4 * config.block_frames() + config.frames_pad_end)
        * config.frame_size;
    let mut audio = make_test_audio(total, 44100);
    let result = huella_core::embed(&mut audio, 1, &key, &config, &payload).unwrap();
    assert!(result.blocks_written >= 4);

    // cut a fragment spanning blocks 2..4 (one full AB pair plus change),
    // starting off the frame grid
    let block_samples = config.block_frames() * config.frame_size;
    let start = config.frames_pad_start * config.frame_size + block_samples + 12345;
    let clip = &audio[start..start + 2 * block_samples + block_samples / 2];

    let detections = decode::decode_clip_mode(&key, &config, clip, 1).unwrap();
    assert_eq!(detections[0].payload.to_value(), 0x9f3);
    assert!(
        detections[0].bit_errors < config.coded_bits() / 3,
        "{} bit errors",
        detections[0].bit_errors
    );
}

#[test]
fn partial_pair_overlap_still_decodes() {
    let config = clip_config();
    let key = Key::from_hex("00112233445566778899aabbccddeeff").unwrap();
    let payload = Payload::from_value(0x2c1, 12).unwrap();

    let total = (config.frames_pad_start + 4 * config.block_frames() + config.frames_pad_end)
        * config.frame_size;
    let mut audio = make_test_audio(total, 44100);
    huella_core::embed(&mut audio, 1, &key, &config, &payload).unwrap();

    // a fragment of ~1.4 blocks: every candidate pair overlaps the zero
    // padding, so soft bits come from partial participations
    let block_samples = config.block_frames() * config.frame_size;
    let start = config.frames_pad_start * config.frame_size + block_samples / 3;
    let clip = &audio[start..start + block_samples + 2 * block_samples / 5];

    let detections = decode::decode_clip_mode(&key, &config, clip, 1).unwrap();
    assert_eq!(detections[0].payload.to_value(), 0x2c1);
}

#[test]
fn clip_indices_relative_to_fragment() {
    let config = clip_config();
    let key = Key::default();
    let payload = Payload::from_value(0x555, 12).unwrap();

    let total = (config.frames_pad_start + 4 * config.block_frames() + config.frames_pad_end)
        * config.frame_size;
    let mut audio = make_test_audio(total, 44100);
    huella_core::embed(&mut audio, 1, &key, &config, &payload).unwrap();

    let block_samples = config.block_frames() * config.frame_size;
    let start = config.frames_pad_start * config.frame_size + block_samples;
    let clip = &audio[start..start + 2 * block_samples + block_samples / 2];

    let detections = decode::decode_clip_mode(&key, &config, clip, 1).unwrap();
    // a pair match may begin in the padding before the fragment, but
    // never more than a pair length before it
    let pair = 2 * block_samples as i64;
    for d in &detections {
        assert!(d.index >= -pair);
        assert!(d.index < clip.len() as i64);
    }
}
