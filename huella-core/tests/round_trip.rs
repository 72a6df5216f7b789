//! Full-pipeline round trips: embed, search for sync with the real
//! two-pass finder, decode. Uses reduced block sizes so the search stays
//! fast in debug builds; the layout and thresholds are the production
//! code paths throughout.

use huella_core::{decode, Config, Error, Key, Payload};

/// Broadband test audio with energy across many frequencies.
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

fn search_config() -> Config {
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
fn embed_search_decode_short_payload() {
    let config = search_config();
    let key = Key::from_hex("0123456789abcdeffedcba9876543210").unwrap();
    let payload = Payload::from_value(0xabc, 12).unwrap();

    let mut audio = make_test_audio(config.min_embed_samples() + 44100, 44100);
    huella_core::embed(&mut audio, 1, &key, &config, &payload).unwrap();

    let detections = decode::decode_block_mode(&key, &config, &audio, 1).unwrap();
    assert_eq!(detections[0].payload.to_value(), 0xabc);
    assert!(
        detections[0].bit_errors < config.coded_bits() / 3,
        "{} bit errors",
        detections[0].bit_errors
    );
}

#[test]
fn search_survives_unaligned_start() {
    let config = search_config();
    let key = Key::from_hex("00112233445566778899aabbccddeeff").unwrap();
    let payload = Payload::from_value(0x321, 12).unwrap();

    let mut audio = make_test_audio(config.min_embed_samples() + 44100, 44100);
    huella_core::embed(&mut audio, 1, &key, &config, &payload).unwrap();

    // drop 777 samples so block starts no longer sit on the frame grid
    let shifted = &audio[777..];
    let detections = decode::decode_block_mode(&key, &config, shifted, 1).unwrap();
    assert_eq!(detections[0].payload.to_value(), 0x321);
}

#[test]
fn embed_search_decode_128_bits() {
    let config = Config {
        payload_size: 128,
        payload_short: false,
        sync_frames_per_bit: 40,
        sync_search_fine: 16,
        frames_pad_start: 8,
        frames_pad_end: 4,
        water_delta: 0.12,
        ..Config::default()
    };
    let key = Key::from_hex("0123456789abcdeffedcba9876543210").unwrap();
    let hex = "0123456789abcdeffedcba9876543210";
    let payload = Payload::from_hex(hex, 128).unwrap();

    let mut audio = make_test_audio(config.min_embed_samples() + 44100, 44100);
    huella_core::embed(&mut audio, 1, &key, &config, &payload).unwrap();

    let detections = decode::decode_block_mode(&key, &config, &audio, 1).unwrap();
    assert_eq!(detections[0].payload.to_hex(), hex);
}

#[test]
fn wrong_key_is_not_detected() {
    let config = Config {
        payload_size: 128,
        payload_short: false,
        frames_per_bit: 1,
        sync_frames_per_bit: 40,
        sync_search_fine: 16,
        frames_pad_start: 8,
        frames_pad_end: 4,
        water_delta: 0.12,
        ..Config::default()
    };
    let k1 = Key::from_hex("00000000000000000000000000000001").unwrap();
    let k2 = Key::from_hex("00000000000000000000000000000002").unwrap();
    let payload = Payload::from_hex("deadbeefdeadbeefdeadbeefdeadbeef", 128).unwrap();

    let mut audio = make_test_audio(config.min_embed_samples() + 44100, 44100);
    huella_core::embed(&mut audio, 1, &k1, &config, &payload).unwrap();

    // the finder pads candidates up to n_best even below threshold, but
    // every decode attempt with the wrong key fails the CRC
    assert!(matches!(
        decode::decode_block_mode(&k2, &config, &audio, 1),
        Err(Error::DecodeFail)
    ));
}

#[test]
fn embed_output_is_deterministic_across_runs() {
    let config = search_config();
    let key = Key::from_hex("0123456789abcdeffedcba9876543210").unwrap();
    let payload = Payload::from_value(0x777, 12).unwrap();
    let audio = make_test_audio(config.min_embed_samples(), 44100);

    let mut a = audio.clone();
    huella_core::embed(&mut a, 1, &key, &config, &payload).unwrap();
    let mut b = audio.clone();
    huella_core::embed(&mut b, 1, &key, &config, &payload).unwrap();
    assert_eq!(a, b);
}
