use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;

use crate::key::Key;

/// Identifies one of the independent pseudo-random subsequences derived
/// from a key. Each stream gets its own byte in the CTR nonce, so streams
/// of the same key never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    DataUpDown = 1,
    SyncUpDown = 2,
    Mix = 3,
    BitOrder = 4,
    FramePosition = 5,
    SpeedClip = 6,
}

/// Keyed, stream-tagged deterministic 64-bit generator (AES-128 in CTR
/// mode). The nonce encodes `(seed, stream)`; the same key, seed and
/// stream always produce the same sequence.
pub struct Random {
    cipher: Aes128,
    seed: u64,
    stream: Stream,
    counter: u32,
    buffer: [u64; 2],
    buffer_pos: usize,
}

impl Random {
    pub fn new(key: &Key, seed: u64, stream: Stream) -> Self {
        let cipher = Aes128::new_from_slice(key.as_bytes()).expect("key is 16 bytes");
        Self {
            cipher,
            seed,
            stream,
            counter: 0,
            buffer: [0; 2],
            buffer_pos: 2,
        }
    }

    /// Reset to the start of the `(seed, stream)` subsequence.
    pub fn seed(&mut self, seed: u64, stream: Stream) {
        self.seed = seed;
        self.stream = stream;
        self.counter = 0;
        self.buffer_pos = 2;
    }

    fn refill(&mut self) {
        let mut input = [0u8; 16];
        input[0..8].copy_from_slice(&self.seed.to_be_bytes());
        input[8] = self.stream as u8;
        input[12..16].copy_from_slice(&self.counter.to_be_bytes());
        self.counter = self.counter.wrapping_add(1);

        let mut block = aes::Block::from(input);
        self.cipher.encrypt_block(&mut block);
        let out: [u8; 16] = block.into();
        self.buffer[0] = u64::from_be_bytes(out[0..8].try_into().expect("8 bytes"));
        self.buffer[1] = u64::from_be_bytes(out[8..16].try_into().expect("8 bytes"));
        self.buffer_pos = 0;
    }

    pub fn next_u64(&mut self) -> u64 {
        if self.buffer_pos == 2 {
            self.refill();
        }
        let value = self.buffer[self.buffer_pos];
        self.buffer_pos += 1;
        value
    }

    /// Uniform double in `[0, 1)` with 53 bits of precision.
    pub fn random_double(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Fisher-Yates shuffle driven by this stream.
    pub fn shuffle<T>(&mut self, values: &mut [T]) {
        for i in (1..values.len()).rev() {
            let j = (self.next_u64() % (i as u64 + 1)) as usize;
            values.swap(i, j);
        }
    }

    /// Generate a fresh 128-bit key as 32 hex characters from OS entropy.
    pub fn gen_key() -> String {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Deterministic 64-bit digest of a sample stream, used to seed
    /// sub-generators from signal content (Davies-Meyer over AES with the
    /// message as the block key, so the result is key-independent).
    pub fn seed_from_hash(samples: &[f32]) -> u64 {
        let mut state = [0u8; 16];
        let mut chunk = [0u8; 16];
        let mut fill = 0;

        let mut absorb = |state: &mut [u8; 16], chunk: &[u8; 16]| {
            let cipher = Aes128::new_from_slice(chunk).expect("chunk is 16 bytes");
            let mut block = aes::Block::from(*state);
            cipher.encrypt_block(&mut block);
            let out: [u8; 16] = block.into();
            for (s, o) in state.iter_mut().zip(out.iter()) {
                *s ^= o;
            }
        };

        for sample in samples {
            chunk[fill..fill + 4].copy_from_slice(&sample.to_le_bytes());
            fill += 4;
            if fill == 16 {
                absorb(&mut state, &chunk);
                fill = 0;
            }
        }
        if fill > 0 {
            chunk[fill..].fill(0);
            absorb(&mut state, &chunk);
        }
        u64::from_be_bytes(state[0..8].try_into().expect("8 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_per_seed_and_stream() {
        let key = Key::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let mut a = Random::new(&key, 7, Stream::DataUpDown);
        let mut b = Random::new(&key, 7, Stream::DataUpDown);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn streams_are_independent() {
        let key = Key::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let mut a = Random::new(&key, 0, Stream::DataUpDown);
        let mut b = Random::new(&key, 0, Stream::SyncUpDown);
        let matches = (0..256).filter(|_| a.next_u64() == b.next_u64()).count();
        assert_eq!(matches, 0);
    }

    #[test]
    fn reseed_restarts_sequence() {
        let key = Key::default();
        let mut rng = Random::new(&key, 3, Stream::Mix);
        let first: Vec<u64> = (0..16).map(|_| rng.next_u64()).collect();
        rng.seed(3, Stream::Mix);
        let second: Vec<u64> = (0..16).map(|_| rng.next_u64()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn random_double_in_range() {
        let key = Key::default();
        let mut rng = Random::new(&key, 0, Stream::SpeedClip);
        for _ in 0..1000 {
            let d = rng.random_double();
            assert!((0.0..1.0).contains(&d));
        }
    }

    #[test]
    fn gen_key_is_hex() {
        let k = Random::gen_key();
        assert_eq!(k.len(), 32);
        assert!(k.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn seed_from_hash_deterministic() {
        let samples: Vec<f32> = (0..1000).map(|i| (i as f32 * 0.01).sin()).collect();
        assert_eq!(
            Random::seed_from_hash(&samples),
            Random::seed_from_hash(&samples)
        );
        let mut other = samples.clone();
        other[500] += 0.5;
        assert_ne!(
            Random::seed_from_hash(&samples),
            Random::seed_from_hash(&other)
        );
    }

    #[test]
    fn shuffle_is_permutation() {
        let key = Key::default();
        let mut rng = Random::new(&key, 1, Stream::BitOrder);
        let mut values: Vec<usize> = (0..100).collect();
        rng.shuffle(&mut values);
        let mut sorted = values.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..100).collect::<Vec<_>>());
        assert_ne!(values, (0..100).collect::<Vec<_>>());
    }
}
