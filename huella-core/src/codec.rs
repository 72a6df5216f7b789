use crate::key::Key;
use crate::random::{Random, Stream};

/// Code rate: each input bit produces 6 output bits.
pub const CODE_RATE_INV: usize = 6;
/// Constraint length K=7, meaning 64 states.
pub const CONSTRAINT_LENGTH: usize = 7;
/// Number of states in the trellis (2^(K-1)).
pub const NUM_STATES: usize = 1 << (CONSTRAINT_LENGTH - 1);

/// Generator polynomials for the systematic rate-1/6, K=7 code. The first
/// generator passes the input bit through unchanged; the remaining five
/// are standard K=7 parity polynomials in octal notation.
const GENERATORS: [u8; CODE_RATE_INV] = [
    0o100, // systematic output
    0o171, 0o133, 0o165, 0o117, 0o155,
];

/// Coded length for `n` input bits including trellis termination.
pub fn coded_len(n: usize) -> usize {
    (n + CONSTRAINT_LENGTH - 1) * CODE_RATE_INV
}

fn branch_output(state: usize, input_bit: u8) -> [bool; CODE_RATE_INV] {
    let reg = ((input_bit as usize) << (CONSTRAINT_LENGTH - 1)) | state;
    let mut out = [false; CODE_RATE_INV];
    for (g, &poly) in GENERATORS.iter().enumerate() {
        out[g] = (reg & poly as usize).count_ones() % 2 == 1;
    }
    out
}

fn next_state(state: usize, input_bit: u8) -> usize {
    (((input_bit as usize) << (CONSTRAINT_LENGTH - 2)) | (state >> 1)) & (NUM_STATES - 1)
}

/// Convolutional encoder. Appends K-1 zero bits to terminate the trellis
/// in state 0, so `encode(bits).len() == coded_len(bits.len())`.
pub fn encode(input_bits: &[bool]) -> Vec<bool> {
    let mut output = Vec::with_capacity(coded_len(input_bits.len()));
    let mut state = 0usize;

    let flush = [false; CONSTRAINT_LENGTH - 1];
    for &bit in input_bits.iter().chain(flush.iter()) {
        let input_val = bit as u8;
        output.extend_from_slice(&branch_output(state, input_val));
        state = next_state(state, input_val);
    }
    output
}

/// Soft-decision Viterbi decoder.
///
/// `soft` holds signed soft values, positive = 1 was likely transmitted,
/// magnitude = confidence, zero = erased. The trellis starts and ends in
/// state 0 (the encoder terminates); ties are broken toward the lower
/// state index.
///
/// Returns the decoded bits (termination stripped) and the number of
/// coded hard-bit flips implied by the surviving path.
pub fn decode_soft(soft: &[f32]) -> (Vec<bool>, usize) {
    let num_steps = soft.len() / CODE_RATE_INV;
    if num_steps <= CONSTRAINT_LENGTH - 1 {
        return (Vec::new(), 0);
    }

    let mut path_metric = vec![f64::NEG_INFINITY; NUM_STATES];
    path_metric[0] = 0.0;

    let mut survivors = vec![[0u8; NUM_STATES]; num_steps];

    // Pre-compute expected output for each (state, input) pair.
    let mut expected = vec![[[false; CODE_RATE_INV]; 2]; NUM_STATES];
    for (state, outputs) in expected.iter_mut().enumerate() {
        for input_bit in 0..2u8 {
            outputs[input_bit as usize] = branch_output(state, input_bit);
        }
    }

    for t in 0..num_steps {
        let mut new_metric = vec![f64::NEG_INFINITY; NUM_STATES];
        let mut new_survivor = [0u8; NUM_STATES];
        let soft_slice = &soft[t * CODE_RATE_INV..(t + 1) * CODE_RATE_INV];

        for state in 0..NUM_STATES {
            if path_metric[state] == f64::NEG_INFINITY {
                continue;
            }
            for input_bit in 0..2u8 {
                let exp = &expected[state][input_bit as usize];
                let mut branch_metric = 0.0f64;
                for (g, &s) in soft_slice.iter().enumerate() {
                    if exp[g] {
                        branch_metric += s as f64;
                    } else {
                        branch_metric -= s as f64;
                    }
                }
                let next = next_state(state, input_bit);
                let candidate = path_metric[state] + branch_metric;
                // strict > keeps the earlier (lower) state on ties
                if candidate > new_metric[next] {
                    new_metric[next] = candidate;
                    new_survivor[next] = state as u8;
                }
            }
        }
        path_metric = new_metric;
        survivors[t] = new_survivor;
    }

    // The encoder terminates in state 0; trace back from there.
    let mut decoded = vec![false; num_steps];
    let mut state = 0usize;
    for t in (0..num_steps).rev() {
        let prev_state = survivors[t][state] as usize;
        decoded[t] = (state >> (CONSTRAINT_LENGTH - 2)) & 1 == 1;
        state = prev_state;
    }

    // Count hard-decision flips between the received stream and the
    // re-encoded surviving path. Erased positions (soft == 0) don't count.
    let recoded = encode(&decoded[..num_steps - (CONSTRAINT_LENGTH - 1)]);
    let bit_errors = recoded
        .iter()
        .zip(soft.iter())
        .filter(|&(&coded, &s)| s != 0.0 && coded != (s > 0.0))
        .count();

    decoded.truncate(num_steps - (CONSTRAINT_LENGTH - 1));
    (decoded, bit_errors)
}

/// Deterministic interleaving order for a coded stream of length `len`,
/// derived from `(key, bit_order stream, len)`. The embedder writes
/// `coded[order[i]]` at stream position `i`; the extractor inverts this,
/// which turns burst errors (contiguous lost frames) into spread errors.
pub fn interleave_order(key: &Key, len: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    let mut rng = Random::new(key, len as u64, Stream::BitOrder);
    rng.shuffle(&mut order);
    order
}

pub fn interleave(key: &Key, coded: &[bool]) -> Vec<bool> {
    let order = interleave_order(key, coded.len());
    order.iter().map(|&i| coded[i]).collect()
}

/// Invert the interleaving on soft values read back from the signal.
pub fn deinterleave_soft(key: &Key, soft: &[f32]) -> Vec<f32> {
    let order = interleave_order(key, soft.len());
    let mut out = vec![0.0f32; soft.len()];
    for (i, &pos) in order.iter().enumerate() {
        out[pos] = soft[i];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hard_soft(coded: &[bool]) -> Vec<f32> {
        coded.iter().map(|&b| if b { 1.0 } else { -1.0 }).collect()
    }

    #[test]
    fn encode_is_systematic() {
        let input: Vec<bool> = (0..40).map(|i| i % 3 == 0).collect();
        let coded = encode(&input);
        for (i, &bit) in input.iter().enumerate() {
            assert_eq!(coded[i * CODE_RATE_INV], bit);
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let input: Vec<bool> = (0..160).map(|i| (i * 7 + 3) % 3 == 0).collect();
        let coded = encode(&input);
        assert_eq!(coded.len(), coded_len(input.len()));

        let (decoded, errors) = decode_soft(&hard_soft(&coded));
        assert_eq!(decoded, input);
        assert_eq!(errors, 0);
    }

    #[test]
    fn decode_with_weak_bits() {
        let input: Vec<bool> = (0..160).map(|i| (i * 13 + 5) % 2 == 0).collect();
        let coded = encode(&input);
        let mut soft = hard_soft(&coded);
        for i in (0..soft.len()).step_by(13) {
            soft[i] *= 0.1;
        }
        let (decoded, _) = decode_soft(&soft);
        assert_eq!(decoded, input);
    }

    #[test]
    fn decode_with_bit_errors() {
        let input: Vec<bool> = (0..160).map(|i| (i * 11 + 2) % 3 == 0).collect();
        let coded = encode(&input);
        let mut soft = hard_soft(&coded);

        let mut flipped = 0;
        for i in (0..soft.len()).step_by(20) {
            soft[i] = -soft[i];
            flipped += 1;
        }
        let (decoded, errors) = decode_soft(&soft);
        assert_eq!(decoded, input, "rate 1/6 should absorb ~5% flips");
        assert_eq!(errors, flipped);
    }

    #[test]
    fn erased_bits_do_not_count_as_errors() {
        let input: Vec<bool> = (0..80).map(|i| i % 2 == 0).collect();
        let coded = encode(&input);
        let mut soft = hard_soft(&coded);
        // erase every systematic output; the five parity outputs per step
        // still pin down the input exactly
        for s in soft.iter_mut().step_by(CODE_RATE_INV) {
            *s = 0.0;
        }
        let (decoded, errors) = decode_soft(&soft);
        assert_eq!(decoded, input);
        assert_eq!(errors, 0);
    }

    #[test]
    fn all_zeros_and_ones() {
        for value in [false, true] {
            let input = vec![value; 160];
            let coded = encode(&input);
            let (decoded, errors) = decode_soft(&hard_soft(&coded));
            assert_eq!(decoded, input);
            assert_eq!(errors, 0);
        }
    }

    #[test]
    fn interleave_round_trip() {
        let key = Key::from_hex("00112233445566778899aabbccddeeff").unwrap();
        let coded: Vec<bool> = (0..996).map(|i| (i * 31 + 7) % 5 < 2).collect();
        let shuffled = interleave(&key, &coded);
        assert_ne!(shuffled, coded);

        let soft = hard_soft(&shuffled);
        let restored = deinterleave_soft(&key, &soft);
        let hard: Vec<bool> = restored.iter().map(|&s| s > 0.0).collect();
        assert_eq!(hard, coded);
    }

    #[test]
    fn interleave_differs_per_key() {
        let k1 = Key::from_hex("00000000000000000000000000000001").unwrap();
        let k2 = Key::from_hex("00000000000000000000000000000002").unwrap();
        assert_ne!(interleave_order(&k1, 996), interleave_order(&k2, 996));
    }
}
