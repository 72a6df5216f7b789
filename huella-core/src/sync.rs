use rayon::prelude::*;
use tracing::debug;

use crate::bands::{self, BitPosGen, FrameBit, SyncMode};
use crate::config::Config;
use crate::fft::{db_from_complex, FftAnalyzer, MIN_DB};
use crate::key::Key;

/// Block polarity: the sign of the embedded sync pattern. Consecutive
/// blocks alternate A, B, A, B so clip mode can match AB or BA pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    A,
    B,
}

/// A confirmed sync match: sample index where a block starts.
#[derive(Debug, Clone)]
pub struct Score {
    pub index: usize,
    pub quality: f64,
    pub block_type: BlockType,
}

/// Candidate during the search passes, before polarity is resolved.
#[derive(Debug, Clone, Copy)]
struct SearchScore {
    index: usize,
    raw_quality: f64,
    local_mean: f64,
}

impl SearchScore {
    fn abs_quality(&self) -> f64 {
        (self.raw_quality - self.local_mean).abs()
    }
}

/// Radius (in candidate steps) of the local-mean window.
const LOCAL_MEAN_DISTANCE: i64 = 20;
/// Frames per parallel FFT / scoring job.
const FRAMES_PER_JOB: usize = 256;

/// Signed soft bit from accumulated up/down magnitudes: positive means a
/// 1 bit was received (up bins louder). The ratio form avoids
/// level-dependent bias; zero magnitudes decode as erased.
pub fn soft_bit_value(umag: f32, dmag: f32) -> f64 {
    if umag == 0.0 || dmag == 0.0 {
        0.0
    } else if dmag < umag {
        1.0 - dmag as f64 / umag as f64
    } else {
        umag as f64 / dmag as f64 - 1.0
    }
}

/// Quality contribution of one sync bit given its accumulated up/down
/// magnitudes. The expected pattern is `0101..`.
pub fn bit_quality(umag: f32, dmag: f32, bit: usize) -> f64 {
    let raw_bit = soft_bit_value(umag, dmag);
    if bit & 1 == 1 {
        raw_bit
    } else {
        -raw_bit
    }
}

/// Scale raw sync quality so one threshold works across watermark
/// strengths: good sync blocks land near 1.0, noise near 0.0.
pub fn normalize_sync_quality(config: &Config, raw_quality: f64) -> f64 {
    raw_quality / config.water_delta.min(0.080) / 2.9
}

/// Searches for block-aligned sync patterns across time.
///
/// `search_approx` walks the signal in `sync_search_step` strides and
/// scores every candidate block start; `search_refine` then sweeps
/// `sync_search_fine` strides around the surviving peaks, recomputing
/// only sync-relevant frames. Block mode looks for single A or B blocks;
/// clip mode looks for AB/BA double blocks and skips FFTs over the
/// zero-padded head and tail.
pub struct SyncFinder<'a> {
    key: &'a Key,
    config: &'a Config,
    /// Non-zero sample range `[data_first, data_last)` in value units.
    data_first: usize,
    data_last: usize,
}

impl<'a> SyncFinder<'a> {
    pub fn new(key: &'a Key, config: &'a Config) -> Self {
        Self {
            key,
            config,
            data_first: 0,
            data_last: 0,
        }
    }

    pub fn search(
        &mut self,
        samples: &[f32],
        n_channels: usize,
        mode: SyncMode,
    ) -> Vec<Score> {
        if self.config.test_no_sync {
            return self.fake_sync(samples, n_channels, mode);
        }

        if mode == SyncMode::Clip {
            self.scan_silence(samples);
        } else {
            self.data_first = 0;
            self.data_last = samples.len();
        }

        let sync_bits = bands::get_sync_bits(self.key, self.config, mode);
        let mut scores = self.search_approx(&sync_bits, samples, n_channels, mode);

        Self::select_local_maxima(&mut scores);
        Self::mask_avg_false_positives(&mut scores, self.config.sync_search_step);

        let threshold1 = self.config.sync_threshold2 * 0.75;
        Self::select_threshold_and_n_best(&mut scores, threshold1, self.config.get_n_best);

        if mode == SyncMode::Clip {
            let n_max = self.config.get_n_best.max(5);
            Self::truncate_n(&mut scores, n_max);
        }

        debug!(candidates = scores.len(), "sync candidates after approx pass");
        self.search_refine(samples, n_channels, mode, &mut scores, &sync_bits);

        Self::select_threshold_and_n_best(
            &mut scores,
            self.config.sync_threshold2,
            self.config.get_n_best,
        );
        scores.sort_by_key(|s| s.index);

        scores
            .iter()
            .map(|s| {
                let q = s.raw_quality - s.local_mean;
                Score {
                    index: s.index,
                    quality: q.abs(),
                    block_type: if q > 0.0 { BlockType::A } else { BlockType::B },
                }
            })
            .collect()
    }

    /// Accumulated per-bit quality of one candidate block start.
    fn sync_decode(
        &self,
        sync_bits: &[Vec<FrameBit>],
        start_frame: usize,
        fft_out_db: &[f32],
        have_frames: &[bool],
    ) -> f64 {
        let n_bands = self.config.band_count();
        let mut sync_quality = 0.0f64;
        let mut bit_count = 0usize;

        for (bit, frame_bits) in sync_bits.iter().enumerate() {
            let mut umag = 0.0f32;
            let mut dmag = 0.0f32;
            let mut frame_bit_count = 0usize;

            for fb in frame_bits {
                if have_frames[start_frame + fb.frame] {
                    let index = (start_frame + fb.frame) * n_bands;
                    for i in 0..fb.up.len() {
                        umag += fft_out_db[index + fb.up[i] as usize];
                        dmag += fft_out_db[index + fb.down[i] as usize];
                    }
                    frame_bit_count += 1;
                }
            }
            sync_quality += bit_quality(umag, dmag, bit) * frame_bit_count as f64;
            bit_count += frame_bit_count;
        }
        if bit_count > 0 {
            sync_quality /= bit_count as f64;
        }
        normalize_sync_quality(self.config, sync_quality)
    }

    /// Bound the range where FFTs are worth computing: zero-padded clip
    /// head/tail carries no data and costs no work.
    fn scan_silence(&mut self, samples: &[f32]) {
        self.data_first = 0;
        while self.data_first < samples.len() && samples[self.data_first] == 0.0 {
            self.data_first += 1;
        }
        self.data_last = samples.len();
        while self.data_last > self.data_first && samples[self.data_last - 1] == 0.0 {
            self.data_last -= 1;
        }
    }

    fn search_approx(
        &self,
        sync_bits: &[Vec<FrameBit>],
        samples: &[f32],
        n_channels: usize,
        mode: SyncMode,
    ) -> Vec<SearchScore> {
        let config = self.config;
        let n_bands = config.band_count();
        let mut total_frame_count = config.block_frames();
        if mode == SyncMode::Clip {
            total_frame_count *= 2;
        }

        let mut scores: Vec<SearchScore> = Vec::new();
        let mut sync_shift = 0usize;
        while sync_shift < config.frame_size {
            let (fft_db, have_frames) =
                self.sync_fft_parallel(samples, n_channels, sync_shift);

            let start_frames: Vec<usize> = (0..config.frame_count(samples.len() / n_channels))
                .filter(|&sf| (sf + total_frame_count) * n_bands < fft_db.len())
                .collect();

            scores.par_extend(start_frames.par_chunks(FRAMES_PER_JOB).flat_map_iter(
                |chunk| {
                    chunk.iter().map(|&start_frame| {
                        let quality =
                            self.sync_decode(sync_bits, start_frame, &fft_db, &have_frames);
                        SearchScore {
                            index: start_frame * config.frame_size + sync_shift,
                            raw_quality: quality,
                            // filled in after all search scores are ready
                            local_mean: 0.0,
                        }
                    })
                },
            ));
            sync_shift += config.sync_search_step;
        }
        scores.sort_by_key(|s| s.index);

        /* Raw sync quality has a key and audio dependent local bias:
         * in some regions the values tend to be larger than zero, in
         * others smaller. Estimating and subtracting the local mean
         * makes the relevant peaks stand out. The nearest neighbours
         * are excluded so a real peak does not bias its own mean. */
        let n = scores.len() as i64;
        let means: Vec<f64> = (0..n)
            .map(|i| {
                let mut avg = 0.0;
                let mut count = 0;
                for j in -LOCAL_MEAN_DISTANCE..=LOCAL_MEAN_DISTANCE {
                    if j.abs() >= 4 {
                        let idx = i + j;
                        if idx >= 0 && idx < n {
                            avg += scores[idx as usize].raw_quality;
                            count += 1;
                        }
                    }
                }
                if count > 0 {
                    avg / count as f64
                } else {
                    0.0
                }
            })
            .collect();
        for (score, mean) in scores.iter_mut().zip(means) {
            score.local_mean = mean;
        }
        scores
    }

    fn select_local_maxima(scores: &mut Vec<SearchScore>) {
        let mut selected = Vec::new();
        let mut i = 0;
        while i < scores.len() {
            let q = scores[i].abs_quality();
            let q_last = if i > 0 { scores[i - 1].abs_quality() } else { 0.0 };
            let q_next = if i + 1 < scores.len() {
                scores[i + 1].abs_quality()
            } else {
                0.0
            };
            if q >= q_last && q >= q_next {
                selected.push(scores[i]);
                i += 1; // the score with quality q_next cannot be a local maximum
            }
            i += 1;
        }
        *scores = selected;
    }

    /* Subtracting the local mean leaves a dip of the opposite sign next
     * to each strong peak. A peak is suppressed when a much larger peak
     * of opposite sign sits within masking distance, which removes those
     * shadow peaks without touching genuine nearby matches. */
    fn mask_avg_false_positives(scores: &mut Vec<SearchScore>, sync_search_step: usize) {
        let mask_distance = LOCAL_MEAN_DISTANCE + 3;
        let mask_factor = 3.0;

        let quality_sign = |s: &SearchScore| -> i32 {
            if s.raw_quality - s.local_mean < 0.0 {
                -1
            } else {
                1
            }
        };

        let n = scores.len() as i64;
        let kept: Vec<SearchScore> = (0..n)
            .filter_map(|i| {
                let mut mask = false;
                for d in -mask_distance..=mask_distance {
                    let j = i + d;
                    if i != j && j >= 0 && j < n {
                        let si = &scores[i as usize];
                        let sj = &scores[j as usize];
                        // scores only holds peaks; measure the real gap
                        let distance = (si.index as i64 - sj.index as i64).unsigned_abs()
                            / sync_search_step as u64;
                        if distance <= mask_distance as u64
                            && sj.abs_quality() > si.abs_quality() * mask_factor
                            && quality_sign(sj) != quality_sign(si)
                        {
                            mask = true;
                        }
                    }
                }
                if mask {
                    None
                } else {
                    Some(scores[i as usize])
                }
            })
            .collect();
        *scores = kept;
    }

    /// Keep every match above `threshold`, but never fewer than `n_best`.
    fn select_threshold_and_n_best(scores: &mut Vec<SearchScore>, threshold: f64, n_best: usize) {
        scores.sort_by(|a, b| {
            b.abs_quality()
                .partial_cmp(&a.abs_quality())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut i = 0;
        while i < scores.len() && scores[i].abs_quality() > threshold {
            i += 1;
        }
        if i >= n_best {
            scores.truncate(i);
        } else if scores.len() > n_best {
            scores.truncate(n_best);
        }
    }

    fn truncate_n(scores: &mut Vec<SearchScore>, n: usize) {
        scores.sort_by(|a, b| {
            b.abs_quality()
                .partial_cmp(&a.abs_quality())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scores.truncate(n);
    }

    fn search_refine(
        &self,
        samples: &[f32],
        n_channels: usize,
        mode: SyncMode,
        scores: &mut Vec<SearchScore>,
        sync_bits: &[Vec<FrameBit>],
    ) {
        let config = self.config;
        let bit_pos_gen = BitPosGen::new(self.key, config);

        let first_block_end = config.block_frames();
        let mut total_frame_count = first_block_end;
        if mode == SyncMode::Clip {
            total_frame_count *= 2;
        }

        let mut want_frames = vec![false; total_frame_count];
        for f in 0..config.mark_sync_frame_count() {
            want_frames[bit_pos_gen.sync_frame(f)] = true;
            if mode == SyncMode::Clip {
                want_frames[first_block_end + bit_pos_gen.sync_frame(f)] = true;
            }
        }

        let mut refined: Vec<SearchScore> = scores
            .par_iter()
            .map(|score| {
                let mut best_quality = score.raw_quality;
                let mut best_index = score.index;

                let start = score.index.saturating_sub(config.sync_search_step);
                let end = score.index + config.sync_search_step;
                let mut fine_index = start;
                while fine_index <= end {
                    if let Some((fft_db, have_frames)) = self.sync_fft(
                        samples,
                        n_channels,
                        fine_index,
                        total_frame_count,
                        Some(&want_frames),
                    ) {
                        let q = self.sync_decode(sync_bits, 0, &fft_db, &have_frames);
                        if (q - score.local_mean).abs() > (best_quality - score.local_mean).abs() {
                            best_quality = q;
                            best_index = fine_index;
                        }
                    }
                    fine_index += config.sync_search_fine;
                }
                SearchScore {
                    index: best_index,
                    raw_quality: best_quality,
                    local_mean: score.local_mean,
                }
            })
            .collect();
        refined.sort_by_key(|s| s.index);
        *scores = refined;
    }

    fn sync_fft(
        &self,
        samples: &[f32],
        n_channels: usize,
        index: usize,
        frame_count: usize,
        want_frames: Option<&[bool]>,
    ) -> Option<(Vec<f32>, Vec<bool>)> {
        collect_frame_db(
            self.config,
            samples,
            n_channels,
            index,
            frame_count,
            want_frames,
            self.data_first,
            self.data_last,
        )
    }

    /// Parallel whole-signal FFT at one sync shift: batches of frames go
    /// to the thread pool, partial results are re-assembled in order.
    fn sync_fft_parallel(
        &self,
        samples: &[f32],
        n_channels: usize,
        index: usize,
    ) -> (Vec<f32>, Vec<bool>) {
        let config = self.config;
        let frame_count = config.frame_count(samples.len() / n_channels);

        let starts: Vec<usize> = (0..frame_count).step_by(FRAMES_PER_JOB).collect();
        let mut partials: Vec<(usize, Vec<f32>, Vec<bool>)> = starts
            .par_iter()
            .filter_map(|&start_frame| {
                let remaining = frame_count.saturating_sub(1 + start_frame);
                let frames = remaining.min(FRAMES_PER_JOB);
                if frames == 0 {
                    return None;
                }
                self.sync_fft(
                    samples,
                    n_channels,
                    index + start_frame * config.frame_size,
                    frames,
                    None,
                )
                .map(|(fft_db, have)| (start_frame, fft_db, have))
            })
            .collect();
        partials.sort_by_key(|p| p.0);

        let mut fft_out_db = Vec::new();
        let mut have_frames = Vec::new();
        for (_, fft_db, have) in partials {
            fft_out_db.extend(fft_db);
            have_frames.extend(have);
        }
        (fft_out_db, have_frames)
    }

    /// Synthesize perfect sync positions for testing: blocks start at
    /// `frames_pad_start * frame_size` and alternate A/B. Only valid
    /// because the embedder writes block boundaries exactly there.
    fn fake_sync(&self, samples: &[f32], n_channels: usize, mode: SyncMode) -> Vec<Score> {
        let config = self.config;
        let mut scores = Vec::new();

        if mode == SyncMode::Block {
            let expect0 = config.frames_pad_start * config.frame_size;
            let expect_step = config.block_frames() * config.frame_size;
            let expect_end = config.frame_count(samples.len() / n_channels) * config.frame_size;

            let mut ab = 0;
            let mut expect_index = expect0;
            while expect_index + expect_step < expect_end {
                scores.push(Score {
                    index: expect_index,
                    quality: 1.0,
                    block_type: if ab & 1 == 1 { BlockType::B } else { BlockType::A },
                });
                ab += 1;
                expect_index += expect_step;
            }
        }
        scores
    }
}

/// Windowed FFT of `frame_count` frames starting at sample `index`,
/// returning dB magnitudes (summed over channels) for the usable band
/// range plus a mask of the frames actually computed. Frames that are not
/// wanted or lie entirely in the silent range `[0, data_first)` /
/// `[data_last, ..)` are skipped without an FFT. Returns `None` when the
/// requested range reads past the end of the input.
#[allow(clippy::too_many_arguments)]
pub(crate) fn collect_frame_db(
    config: &Config,
    samples: &[f32],
    n_channels: usize,
    index: usize,
    frame_count: usize,
    want_frames: Option<&[bool]>,
    data_first: usize,
    data_last: usize,
) -> Option<(Vec<f32>, Vec<bool>)> {
    if samples.len() < (index + frame_count * config.frame_size) * n_channels {
        return None;
    }

    let n_bands = config.band_count();
    let mut analyzer = FftAnalyzer::new(n_channels, config.frame_size);
    let mut fft_out_db = vec![0.0f32; n_bands * frame_count];
    let mut have_frames = vec![false; frame_count];

    for f in 0..frame_count {
        let f_first = (index + f * config.frame_size) * n_channels;
        let f_last = (index + (f + 1) * config.frame_size) * n_channels;

        let unwanted = want_frames.is_some_and(|w| !w[f]);
        if unwanted || f_last < data_first || f_first > data_last {
            continue;
        }

        let frame_result = analyzer
            .run_fft(samples, index + f * config.frame_size)
            .expect("frame range was checked above");

        let out_pos = f * n_bands;
        for channel_bins in &frame_result {
            for i in config.min_band..=config.max_band {
                fft_out_db[out_pos + i - config.min_band] +=
                    db_from_complex(channel_bins[i], MIN_DB);
            }
        }
        have_frames[f] = true;
    }
    Some((fft_out_db, have_frames))
}
