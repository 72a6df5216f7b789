use crate::codec;
use crate::payload;
use crate::shortcode;

/// Configuration for watermark embedding and extraction.
///
/// The embedder and the extractor must agree on every field here; a single
/// `Config` value is passed by reference through all operations.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-bin magnitude scale factor. Higher = more robust, more audible.
    pub water_delta: f64,
    /// FFT frame length in samples. Must be a power of two.
    pub frame_size: usize,
    /// Number of frames each data bit participates in.
    pub frames_per_bit: usize,
    /// Number of frames each sync bit participates in.
    pub sync_frames_per_bit: usize,
    /// Length of the sync pattern (`0101..`) in bits.
    pub sync_bits: usize,
    /// Number of `up` bins (and `down` bins) selected per frame slot.
    pub n_bands: usize,
    /// Usable FFT bin range, inclusive on both ends.
    pub min_band: usize,
    pub max_band: usize,
    /// Internal sample rate; callers resample inputs to this.
    pub mark_sample_rate: u32,
    /// Untouched frames before the first block / after the last block.
    pub frames_pad_start: usize,
    pub frames_pad_end: usize,
    /// Coarse sync offset stride in samples.
    pub sync_search_step: usize,
    /// Refine pass stride in samples.
    pub sync_search_fine: usize,
    /// Final sync acceptance threshold (threshold1 is 0.75 of this).
    pub sync_threshold2: f64,
    /// Minimum number of sync peaks kept per pass.
    pub get_n_best: usize,
    /// Payload length in bits (128, or a short-code size in short mode).
    pub payload_size: usize,
    /// Short-code mode: payload is a small integer, no convolutional code.
    pub payload_short: bool,
    /// Cross-fade the watermarked spectrum with the original in the FFT
    /// domain, preserving phase. Halves the effective per-bin delta and
    /// reduces artifacts; `false` applies the full delta.
    pub mix: bool,
    /// Keep data-bit participations in linear frame order instead of
    /// shuffling them across the block.
    pub linear: bool,
    /// Treat marginal results as errors.
    pub strict: bool,
    /// Skip the peak limiter after embedding.
    pub test_no_limiter: bool,
    /// Synthesize perfect block-aligned sync positions instead of searching.
    pub test_no_sync: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            water_delta: 0.005,
            frame_size: 1024,
            frames_per_bit: 2,
            sync_frames_per_bit: 85,
            sync_bits: 6,
            n_bands: 30,
            min_band: 20,
            max_band: 100,
            mark_sample_rate: 44100,
            frames_pad_start: 250,
            frames_pad_end: 25,
            sync_search_step: 256,
            sync_search_fine: 8,
            sync_threshold2: 0.7,
            get_n_best: 5,
            payload_size: 128,
            payload_short: false,
            mix: true,
            linear: false,
            strict: false,
            test_no_limiter: false,
            test_no_sync: false,
        }
    }
}

impl Config {
    /// Number of coded bits carried by the data frames of one block.
    pub fn coded_bits(&self) -> usize {
        if self.payload_short {
            shortcode::code_len(self.payload_size)
        } else {
            codec::coded_len(self.payload_size + payload::CRC_BITS)
        }
    }

    /// Frames of one block reserved for sync bits.
    pub fn mark_sync_frame_count(&self) -> usize {
        self.sync_bits * self.sync_frames_per_bit
    }

    /// Frames of one block carrying data bits.
    pub fn mark_data_frame_count(&self) -> usize {
        self.coded_bits() * self.frames_per_bit
    }

    /// Total frames per block.
    pub fn block_frames(&self) -> usize {
        self.mark_sync_frame_count() + self.mark_data_frame_count()
    }

    /// Number of bands in the usable bin range.
    pub fn band_count(&self) -> usize {
        self.max_band - self.min_band + 1
    }

    /// Minimum samples per channel for embedding (pad + two blocks + pad).
    pub fn min_embed_samples(&self) -> usize {
        (self.frames_pad_start + 2 * self.block_frames() + self.frames_pad_end) * self.frame_size
    }

    /// Number of whole frames in `n` samples per channel.
    pub fn frame_count(&self, samples_per_channel: usize) -> usize {
        samples_per_channel / self.frame_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_block_layout() {
        let config = Config::default();
        assert_eq!(config.mark_sync_frame_count(), 510);
        // (128 payload + 32 crc + 6 flush) * 6 code outputs * 2 frames per bit
        assert_eq!(config.coded_bits(), 996);
        assert_eq!(config.mark_data_frame_count(), 1992);
        assert_eq!(config.block_frames(), 2502);
    }

    #[test]
    fn short_mode_block_is_smaller() {
        let config = Config {
            payload_size: 12,
            payload_short: true,
            ..Config::default()
        };
        assert_eq!(config.coded_bits(), 144);
        assert!(config.block_frames() < Config::default().block_frames());
    }

    #[test]
    fn band_count_default() {
        let config = Config::default();
        assert_eq!(config.band_count(), 81);
        // two disjoint selections of n_bands must fit into the range
        assert!(config.band_count() >= 2 * config.n_bands);
    }

    #[test]
    fn min_embed_samples_covers_two_blocks() {
        let config = Config::default();
        let frames = config.min_embed_samples() / config.frame_size;
        assert_eq!(
            frames,
            config.frames_pad_start + 2 * config.block_frames() + config.frames_pad_end
        );
    }
}
