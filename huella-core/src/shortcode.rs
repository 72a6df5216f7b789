use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::{Error, Result};

/// Payload sizes with a short-code table.
pub const SUPPORTED_SIZES: [usize; 4] = [8, 12, 16, 20];

/// Expansion factor: a `payload_size`-bit value maps to a codeword of
/// `payload_size * 12` bits.
const EXPANSION: usize = 12;

/// Fixed public constant used to derive the codeword table. The table is
/// key-independent, like the interleaver-free short mode it replaces.
const TABLE_KEY: [u8; 16] = *b"huella-shortcode";

pub fn is_supported(payload_size: usize) -> bool {
    SUPPORTED_SIZES.contains(&payload_size)
}

/// Codeword length in bits for a supported payload size.
pub fn code_len(payload_size: usize) -> usize {
    payload_size * EXPANSION
}

/// Precomputed table mapping every `payload_size`-bit integer to a fixed
/// codeword with large mutual Hamming distance. Codewords are packed into
/// `u64` words for the distance search.
pub struct ShortCode {
    payload_size: usize,
    words_per_code: usize,
    table: Vec<u64>,
}

impl ShortCode {
    pub fn new(payload_size: usize) -> Result<Self> {
        if !is_supported(payload_size) {
            return Err(Error::ShortCodeUnsupported(payload_size));
        }
        let n_codes = 1usize << payload_size;
        let bits = code_len(payload_size);
        let words_per_code = bits.div_ceil(64);

        let cipher = Aes128::new_from_slice(&TABLE_KEY).expect("table key is 16 bytes");
        let blocks_per_code = bits.div_ceil(128);

        let mut table = vec![0u64; n_codes * words_per_code];
        for value in 0..n_codes {
            let mut raw = Vec::with_capacity(blocks_per_code * 16);
            for counter in 0..blocks_per_code {
                let mut input = [0u8; 16];
                input[0] = payload_size as u8;
                input[4..8].copy_from_slice(&(value as u32).to_be_bytes());
                input[12..16].copy_from_slice(&(counter as u32).to_be_bytes());
                let mut block = aes::Block::from(input);
                cipher.encrypt_block(&mut block);
                raw.extend_from_slice(&<[u8; 16]>::from(block));
            }
            let words = &mut table[value * words_per_code..(value + 1) * words_per_code];
            for bit in 0..bits {
                if (raw[bit / 8] >> (7 - bit % 8)) & 1 == 1 {
                    words[bit / 64] |= 1 << (bit % 64);
                }
            }
        }
        Ok(Self {
            payload_size,
            words_per_code,
            table,
        })
    }

    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Codeword bits for `value`; the mapping is injective.
    pub fn encode(&self, value: u64) -> Result<Vec<bool>> {
        if value >> self.payload_size != 0 {
            return Err(Error::Format(format!(
                "value {value:#x} does not fit in {} bits",
                self.payload_size
            )));
        }
        let words = self.code_words(value as usize);
        let bits = code_len(self.payload_size);
        Ok((0..bits).map(|b| (words[b / 64] >> (b % 64)) & 1 == 1).collect())
    }

    /// Find the table entry with minimum Hamming distance to the received
    /// hard bits. Ties resolve toward the lowest payload value.
    pub fn decode(&self, hard_bits: &[bool]) -> (u64, usize) {
        debug_assert_eq!(hard_bits.len(), code_len(self.payload_size));

        let mut received = vec![0u64; self.words_per_code];
        for (b, &bit) in hard_bits.iter().enumerate() {
            if bit {
                received[b / 64] |= 1 << (b % 64);
            }
        }

        let mut best_value = 0u64;
        let mut best_distance = usize::MAX;
        for value in 0..(1usize << self.payload_size) {
            let words = self.code_words(value);
            let distance: u32 = words
                .iter()
                .zip(received.iter())
                .map(|(&w, &r)| (w ^ r).count_ones())
                .sum();
            // strict < keeps the lowest value on ties
            if (distance as usize) < best_distance {
                best_distance = distance as usize;
                best_value = value as u64;
            }
        }
        (best_value, best_distance)
    }

    fn code_words(&self, value: usize) -> &[u64] {
        &self.table[value * self.words_per_code..(value + 1) * self.words_per_code]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_size_rejected() {
        assert!(matches!(
            ShortCode::new(13),
            Err(Error::ShortCodeUnsupported(13))
        ));
    }

    #[test]
    fn encode_deterministic_and_injective() {
        let code = ShortCode::new(8).unwrap();
        let mut seen = std::collections::HashSet::new();
        for value in 0..256u64 {
            let bits = code.encode(value).unwrap();
            assert_eq!(bits.len(), code_len(8));
            assert!(seen.insert(bits), "codeword collision for value {value}");
        }
    }

    #[test]
    fn exact_codeword_decodes_to_input() {
        let code = ShortCode::new(12).unwrap();
        for value in [0u64, 1, 0xabc, 0xfff] {
            let bits = code.encode(value).unwrap();
            let (decoded, distance) = code.decode(&bits);
            assert_eq!(decoded, value);
            assert_eq!(distance, 0);
        }
    }

    #[test]
    fn decode_survives_bit_flips() {
        let code = ShortCode::new(12).unwrap();
        let mut bits = code.encode(0x5a5).unwrap();
        // flip ~15% of the codeword
        for i in (0..bits.len()).step_by(7) {
            bits[i] = !bits[i];
        }
        let (decoded, distance) = code.decode(&bits);
        assert_eq!(decoded, 0x5a5);
        assert!(distance > 0);
    }

    #[test]
    fn value_out_of_range() {
        let code = ShortCode::new(8).unwrap();
        assert!(code.encode(0x100).is_err());
    }

    #[test]
    fn codewords_are_well_separated() {
        let code = ShortCode::new(8).unwrap();
        let bits = code_len(8);
        let mut min_distance = bits;
        for a in 0..256usize {
            let wa = code.code_words(a).to_vec();
            for b in (a + 1)..256usize {
                let d: u32 = wa
                    .iter()
                    .zip(code.code_words(b))
                    .map(|(&x, &y)| (x ^ y).count_ones())
                    .sum();
                min_distance = min_distance.min(d as usize);
            }
        }
        // random codes of 96 bits keep pairwise distances far from zero
        assert!(
            min_distance > bits / 5,
            "minimum pairwise distance {min_distance} too small"
        );
    }
}
