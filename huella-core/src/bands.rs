use crate::config::Config;
use crate::key::Key;
use crate::random::{Random, Stream};

/// One pseudo-random partition of bins into `up` and `down` halves.
/// Indices are relative to `min_band` so they index directly into the
/// per-frame dB rows produced by the FFT stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpDown {
    pub up: Vec<u16>,
    pub down: Vec<u16>,
}

/// Keyed generator of `UpDown` selections, one per frame slot.
///
/// For a fixed key and slot the selection is reproducible regardless of
/// which slots were queried before (the stream is reseeded per slot).
pub struct UpDownGen {
    rng: Random,
    stream: Stream,
    n_bands: usize,
    band_count: usize,
}

impl UpDownGen {
    pub fn new(key: &Key, stream: Stream, config: &Config) -> Self {
        Self {
            rng: Random::new(key, 0, stream),
            stream,
            n_bands: config.n_bands,
            band_count: config.band_count(),
        }
    }

    /// Disjoint equal-size `up` and `down` bin lists for `slot`, drawn
    /// without replacement from the band range.
    pub fn get(&mut self, slot: usize) -> UpDown {
        self.rng.seed(slot as u64, self.stream);

        let mut bands: Vec<u16> = (0..self.band_count as u16).collect();
        // partial Fisher-Yates: only the first 2*n_bands entries are needed
        for i in 0..2 * self.n_bands {
            let j = i + (self.rng.next_u64() % (bands.len() - i) as u64) as usize;
            bands.swap(i, j);
        }

        let mut up: Vec<u16> = bands[..self.n_bands].to_vec();
        let mut down: Vec<u16> = bands[self.n_bands..2 * self.n_bands].to_vec();
        up.sort_unstable();
        down.sort_unstable();
        UpDown { up, down }
    }
}

/// Keyed permutation placing the sync frames and data frames of a block
/// at pseudo-random positions without collision.
pub struct BitPosGen {
    perm: Vec<usize>,
    sync_count: usize,
}

impl BitPosGen {
    pub fn new(key: &Key, config: &Config) -> Self {
        let mut perm: Vec<usize> = (0..config.block_frames()).collect();
        let mut rng = Random::new(key, 0, Stream::FramePosition);
        rng.shuffle(&mut perm);
        Self {
            perm,
            sync_count: config.mark_sync_frame_count(),
        }
    }

    /// Block-relative frame of the `f`-th sync slot.
    pub fn sync_frame(&self, f: usize) -> usize {
        self.perm[f]
    }

    /// Block-relative frame of the `d`-th data slot.
    pub fn data_frame(&self, d: usize) -> usize {
        self.perm[self.sync_count + d]
    }
}

/// One participation of one logical bit in one FFT frame.
#[derive(Debug, Clone)]
pub struct FrameBit {
    /// Block-relative frame index.
    pub frame: usize,
    pub up: Vec<u16>,
    pub down: Vec<u16>,
}

/// Sync search mode: full A/B blocks, or AB/BA double blocks for clips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Block,
    Clip,
}

/// FrameBit lists per sync bit.
///
/// In clip mode the pattern covers two consecutive blocks; the second
/// block swaps `up` and `down` because block polarity alternates, which
/// is what lets an AB (or BA) pair match a zero-padded clip.
pub fn get_sync_bits(key: &Key, config: &Config, mode: SyncMode) -> Vec<Vec<FrameBit>> {
    let first_block_end = config.block_frames();
    let block_count = if mode == SyncMode::Clip { 2 } else { 1 };

    let mut up_down_gen = UpDownGen::new(key, Stream::SyncUpDown, config);
    let bit_pos_gen = BitPosGen::new(key, config);

    let mut sync_bits = Vec::with_capacity(config.sync_bits);
    for bit in 0..config.sync_bits {
        let mut frame_bits = Vec::with_capacity(config.sync_frames_per_bit * block_count);
        for f in 0..config.sync_frames_per_bit {
            let slot = f + bit * config.sync_frames_per_bit;
            let ud = up_down_gen.get(slot);

            for block in 0..block_count {
                let frame = bit_pos_gen.sync_frame(slot) + block * first_block_end;
                let (up, down) = if block == 0 {
                    (ud.up.clone(), ud.down.clone())
                } else {
                    (ud.down.clone(), ud.up.clone())
                };
                frame_bits.push(FrameBit { frame, up, down });
            }
        }
        frame_bits.sort_by_key(|fb| fb.frame);
        sync_bits.push(frame_bits);
    }
    sync_bits
}

/// FrameBit lists per coded data bit (`frames_per_bit` participations
/// each). The assignment of participations to data frames is shuffled by
/// the `mix` stream so the frames carrying one bit are spread over the
/// whole block; `linear` keeps them in coded-stream order.
pub fn get_data_bits(key: &Key, config: &Config) -> Vec<Vec<FrameBit>> {
    let coded_bits = config.coded_bits();

    // slot d carries participation slots[d] of bit slots[d] / frames_per_bit
    let mut slots: Vec<usize> = (0..coded_bits)
        .flat_map(|bit| std::iter::repeat(bit).take(config.frames_per_bit))
        .collect();
    if !config.linear {
        let mut rng = Random::new(key, 0, Stream::Mix);
        rng.shuffle(&mut slots);
    }

    let mut up_down_gen = UpDownGen::new(key, Stream::DataUpDown, config);
    let bit_pos_gen = BitPosGen::new(key, config);

    let mut data_bits: Vec<Vec<FrameBit>> = vec![Vec::new(); coded_bits];
    for (d, &bit) in slots.iter().enumerate() {
        let ud = up_down_gen.get(d);
        data_bits[bit].push(FrameBit {
            frame: bit_pos_gen.data_frame(d),
            up: ud.up,
            down: ud.down,
        });
    }
    for frame_bits in data_bits.iter_mut() {
        frame_bits.sort_by_key(|fb| fb.frame);
    }
    data_bits
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config {
            sync_frames_per_bit: 8,
            frames_per_bit: 2,
            payload_size: 12,
            payload_short: true,
            ..Config::default()
        }
    }

    #[test]
    fn up_down_disjoint_and_in_range() {
        let key = Key::from_hex("0123456789abcdeffedcba9876543210").unwrap();
        let config = Config::default();
        let mut gen = UpDownGen::new(&key, Stream::DataUpDown, &config);

        for slot in 0..50 {
            let ud = gen.get(slot);
            assert_eq!(ud.up.len(), config.n_bands);
            assert_eq!(ud.down.len(), config.n_bands);
            for &b in ud.up.iter().chain(ud.down.iter()) {
                assert!((b as usize) < config.band_count());
            }
            let mut all: Vec<u16> = ud.up.iter().chain(ud.down.iter()).copied().collect();
            all.sort_unstable();
            all.dedup();
            assert_eq!(all.len(), 2 * config.n_bands, "up/down overlap at slot {slot}");
        }
    }

    #[test]
    fn up_down_reproducible_out_of_order() {
        let key = Key::default();
        let config = Config::default();
        let mut a = UpDownGen::new(&key, Stream::SyncUpDown, &config);
        let mut b = UpDownGen::new(&key, Stream::SyncUpDown, &config);

        let a5 = a.get(5);
        let _ = b.get(20);
        let b5 = b.get(5);
        assert_eq!(a5, b5);
    }

    #[test]
    fn bit_pos_partitions_block() {
        let key = Key::default();
        let config = small_config();
        let gen = BitPosGen::new(&key, &config);

        let mut seen = vec![false; config.block_frames()];
        for f in 0..config.mark_sync_frame_count() {
            let frame = gen.sync_frame(f);
            assert!(!seen[frame]);
            seen[frame] = true;
        }
        for d in 0..config.mark_data_frame_count() {
            let frame = gen.data_frame(d);
            assert!(!seen[frame]);
            seen[frame] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn sync_bits_shape() {
        let key = Key::default();
        let config = small_config();

        let block = get_sync_bits(&key, &config, SyncMode::Block);
        assert_eq!(block.len(), config.sync_bits);
        for frame_bits in &block {
            assert_eq!(frame_bits.len(), config.sync_frames_per_bit);
            for fb in frame_bits {
                assert!(fb.frame < config.block_frames());
            }
        }

        let clip = get_sync_bits(&key, &config, SyncMode::Clip);
        for frame_bits in &clip {
            assert_eq!(frame_bits.len(), 2 * config.sync_frames_per_bit);
        }
    }

    #[test]
    fn clip_mode_inverts_second_block() {
        let key = Key::default();
        let config = small_config();
        let clip = get_sync_bits(&key, &config, SyncMode::Clip);

        let block_frames = config.block_frames();
        for frame_bits in &clip {
            for fb in frame_bits.iter().filter(|fb| fb.frame >= block_frames) {
                let twin = frame_bits
                    .iter()
                    .find(|other| other.frame + block_frames == fb.frame)
                    .expect("second-block FrameBit has a first-block twin");
                assert_eq!(fb.up, twin.down);
                assert_eq!(fb.down, twin.up);
            }
        }
    }

    #[test]
    fn data_bits_cover_all_participations() {
        let key = Key::default();
        let config = small_config();
        let data = get_data_bits(&key, &config);
        assert_eq!(data.len(), config.coded_bits());
        for frame_bits in &data {
            assert_eq!(frame_bits.len(), config.frames_per_bit);
        }
    }

    #[test]
    fn linear_order_disables_shuffle() {
        let key = Key::from_hex("0123456789abcdeffedcba9876543210").unwrap();
        let shuffled = get_data_bits(&key, &small_config());
        let linear = get_data_bits(
            &key,
            &Config {
                linear: true,
                ..small_config()
            },
        );

        let frames = |bits: &[Vec<FrameBit>]| -> Vec<usize> {
            bits.iter()
                .flat_map(|fbs| fbs.iter().map(|fb| fb.frame))
                .collect()
        };
        assert_ne!(frames(&shuffled), frames(&linear));
    }
}
