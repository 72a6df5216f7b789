use rayon::prelude::*;
use tracing::debug;

use crate::bands::{self, SyncMode};
use crate::config::Config;
use crate::fft::{db_from_complex, gen_normalized_window, FftProcessor, MIN_DB};
use crate::key::Key;
use crate::random::{Random, Stream};
use crate::resample::resample_ratio_truncate;
use crate::sync;

/// Fixed-point base for expected sync-frame positions: survives rounding
/// across ~100 block positions where accumulated float steps would drift.
const OFFSET_SHIFT: u32 = 16;

/// A detected speed is only reported above this sync quality.
const SPEED_SYNC_THRESHOLD: f64 = 0.4;

/// Number of deterministic clip locations tried for speed detection.
const CLIP_CANDIDATES: usize = 5;

/// Result of a successful speed detection.
#[derive(Debug, Clone, Copy)]
pub struct SpeedResult {
    pub speed: f64,
    pub quality: f64,
}

/// One grid pass over log-speed space.
#[derive(Debug, Clone, Copy)]
struct SpeedScanParams {
    seconds: f64,
    step: f64,
    n_steps: i32,
    n_center_steps: i32,
}

#[derive(Debug, Clone, Copy)]
struct Score {
    speed: f64,
    quality: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Mags {
    umag: f32,
    dmag: f32,
}

/// Column-major magnitude matrix: rows are sync-step time positions,
/// columns are sync-bit participations. Resizing never preserves the
/// contents and releases unused memory.
#[derive(Default)]
struct MagMatrix {
    data: Vec<Mags>,
    rows: usize,
}

impl MagMatrix {
    fn at(&self, row: usize, col: usize) -> Mags {
        self.data[col * self.rows + row]
    }

    fn set(&mut self, row: usize, col: usize, mags: Mags) {
        self.data[col * self.rows + row] = mags;
    }

    fn resize(&mut self, rows: usize, cols: usize) {
        self.rows = rows;
        let mut new_data = vec![Mags::default(); rows * cols];
        std::mem::swap(&mut self.data, &mut new_data);
    }

    fn rows(&self) -> usize {
        self.rows
    }
}

/// One sync-bit participation, flattened from the block layout and
/// sorted by frame so the offset walk in `compare` is monotonic.
struct SyncBit {
    bit: usize,
    frame: usize,
    up: Vec<u16>,
    down: Vec<u16>,
}

#[derive(Clone)]
struct BitValue {
    umag: f32,
    dmag: f32,
    count: u32,
}

struct CmpState {
    offset: i64,
    bit_values: Vec<BitValue>,
}

/// Sync quality scan for one center-speed hypothesis.
///
/// `prepare_mags` must finish before `search` runs; `free_memory`
/// releases the magnitude matrix between groups to bound peak RSS.
struct SpeedSync<'a> {
    clip: &'a [f32],
    n_channels: usize,
    center: f64,
    frames_per_block: usize,
    sync_bits: Vec<SyncBit>,
    matrix: MagMatrix,
    scores: Vec<Score>,
}

impl<'a> SpeedSync<'a> {
    fn new(key: &Key, config: &Config, clip: &'a [f32], n_channels: usize, center: f64) -> Self {
        let mut sync_bits = Vec::new();
        for (bit, frame_bits) in bands::get_sync_bits(key, config, SyncMode::Block)
            .into_iter()
            .enumerate()
        {
            for fb in frame_bits {
                sync_bits.push(SyncBit {
                    bit,
                    frame: fb.frame,
                    up: fb.up,
                    down: fb.down,
                });
            }
        }
        sync_bits.sort_by_key(|sb| sb.frame);

        Self {
            clip,
            n_channels,
            center,
            frames_per_block: config.block_frames(),
            sync_bits,
            matrix: MagMatrix::default(),
            scores: Vec::new(),
        }
    }

    /// Magnitude matrix over all sync bits at all sync-step shifts, on a
    /// x1/2 downsampled rendition of the clip (resampled by `center` so
    /// the hypothesis plays at nominal speed).
    fn prepare_mags(&mut self, config: &Config, scan: &SpeedScanParams) {
        let sub_rate = config.mark_sample_rate / 2;
        let sub = resample_ratio_truncate(
            self.clip,
            self.n_channels,
            self.center * 2.0,
            sub_rate,
            scan.seconds / self.center,
        );
        let sub_frames = sub.len() / self.n_channels;

        let sub_frame_size = config.frame_size / 2;
        let sub_search_step = config.sync_search_step / 2;

        let window = gen_normalized_window(sub_frame_size);
        let mut fft = FftProcessor::new(sub_frame_size);
        let mut time_buf = vec![0.0f32; sub_frame_size];

        let n_bands = config.band_count();
        let mut n_rows = 0usize;
        let mut ppos = 0usize;
        while ppos + sub_frame_size < sub_frames {
            n_rows += 1;
            ppos += sub_search_step;
        }
        self.matrix.resize(n_rows, self.sync_bits.len());

        let mut fft_out_db = vec![0.0f32; n_bands];
        let mut pos = 0usize;
        for row in 0..n_rows {
            fft_out_db.fill(0.0);
            for ch in 0..self.n_channels {
                for i in 0..sub_frame_size {
                    time_buf[i] = sub[ch + (pos + i) * self.n_channels] * window[i];
                }
                let bins = fft
                    .forward(&mut time_buf)
                    .expect("buffer length matches the plan");
                for i in config.min_band..=config.max_band {
                    fft_out_db[i - config.min_band] += db_from_complex(bins[i], MIN_DB);
                }
            }
            for (col, sync_bit) in self.sync_bits.iter().enumerate() {
                let mut umag = 0.0f32;
                let mut dmag = 0.0f32;
                for i in 0..sync_bit.up.len() {
                    umag += fft_out_db[sync_bit.up[i] as usize];
                    dmag += fft_out_db[sync_bit.down[i] as usize];
                }
                self.matrix.set(row, col, Mags { umag, dmag });
            }
            pos += sub_search_step;
        }
    }

    /// Accumulate sync-bit magnitudes for one relative-speed hypothesis
    /// over `block` consecutive blocks, walking the expected sync-frame
    /// positions in fixed point. Block polarity alternates, so odd blocks
    /// swap up and down.
    fn compare_bits(
        &self,
        config: &Config,
        cmp_states: &mut [CmpState],
        block: usize,
        relative_speed: f64,
    ) {
        let steps_per_frame = config.frame_size / config.sync_search_step;
        let relative_speed_inv = 1.0 / relative_speed;

        let mut begin = cmp_states.len();
        let mut end = cmp_states.len();
        for (col, sync_bit) in self.sync_bits.iter().enumerate() {
            let frame_offset = (((block * self.frames_per_block + sync_bit.frame) as f64
                * steps_per_frame as f64
                * relative_speed_inv
                + 0.5)
                * (1u64 << OFFSET_SHIFT) as f64) as i64;

            // unshifted positivity check so the shifted value rounds to
            // the nearest frame later on
            while begin > 0 {
                if cmp_states[begin - 1].offset + frame_offset < 0 {
                    break;
                }
                begin -= 1;
            }
            while end > 0 {
                let index = (cmp_states[end - 1].offset + frame_offset) >> OFFSET_SHIFT;
                if index < self.matrix.rows() as i64 {
                    break;
                }
                end -= 1;
            }

            for cs in &mut cmp_states[begin..end] {
                let index = ((cs.offset + frame_offset) >> OFFSET_SHIFT) as usize;
                let mags = self.matrix.at(index, col);
                let bv = &mut cs.bit_values[sync_bit.bit];
                if block & 1 == 1 {
                    bv.umag += mags.dmag;
                    bv.dmag += mags.umag;
                } else {
                    bv.umag += mags.umag;
                    bv.dmag += mags.dmag;
                }
                bv.count += 1;
            }
        }
    }

    fn compare(&self, config: &Config, relative_speed: f64) -> Score {
        let steps_per_frame = config.frame_size / config.sync_search_step;
        debug_assert_eq!(steps_per_frame * config.sync_search_step, config.frame_size);
        let pad_start = self.frames_per_block * steps_per_frame + steps_per_frame;

        let mut cmp_states: Vec<CmpState> = (-(pad_start as i64)..0)
            .map(|offset| CmpState {
                offset: ((1u64 << OFFSET_SHIFT) as f64 / relative_speed) as i64 * offset,
                bit_values: vec![
                    BitValue {
                        umag: 0.0,
                        dmag: 0.0,
                        count: 0,
                    };
                    config.sync_bits
                ],
            })
            .collect();

        /* three blocks: one because all offsets (-pad_start..0) must be
         * tested, two more because the scan uses up to 50 seconds while a
         * short-payload block is just over half of that */
        for block in 0..3 {
            self.compare_bits(config, &mut cmp_states, block, relative_speed);
        }

        let mut best = Score {
            speed: 0.0,
            quality: 0.0,
        };
        for cs in &cmp_states {
            let mut sync_quality = 0.0f64;
            let mut bit_count = 0u32;
            for (bit, bv) in cs.bit_values.iter().enumerate() {
                sync_quality += sync::bit_quality(bv.umag, bv.dmag, bit) * bv.count as f64;
                bit_count += bv.count;
            }
            if bit_count > 0 {
                sync_quality /= bit_count as f64;
                sync_quality = sync::normalize_sync_quality(config, sync_quality).abs();
                if sync_quality > best.quality {
                    best.quality = sync_quality;
                    best.speed = relative_speed * self.center;
                }
            }
        }
        best
    }

    fn search(&mut self, config: &Config, scan: &SpeedScanParams) {
        self.scores.clear();
        for p in -scan.n_steps..=scan.n_steps {
            let relative_speed = scan.step.powi(p);
            let score = self.compare(config, relative_speed);
            self.scores.push(score);
        }
    }

    fn free_memory(&mut self) {
        self.matrix.resize(0, 0);
    }
}

/// Clip of `clip_seconds` starting at the fractional `location` of the
/// input (0.0 = begin, 1.0 = as late as possible).
fn get_speed_clip(
    location: f64,
    samples: &[f32],
    n_channels: usize,
    sample_rate: u32,
    clip_seconds: f64,
) -> Vec<f32> {
    let n_frames = samples.len() / n_channels;
    let end_sec = n_frames as f64 / sample_rate as f64;
    let start_sec = (location * (end_sec - clip_seconds)).max(0.0);

    let start_point = (start_sec * sample_rate as f64) as usize;
    let end_point = (start_point + (clip_seconds * sample_rate as f64) as usize).min(n_frames);
    samples[start_point * n_channels..end_point * n_channels].to_vec()
}

/// Deterministic candidate clip locations: the `speed_clip` stream is
/// reseeded from a hash of a subsampled copy of the signal, so locations
/// are reproducible but not biased by the key alone.
fn get_clip_locations(key: &Key, samples: &[f32], n: usize) -> Vec<f64> {
    let mut rng = Random::new(key, 0, Stream::SpeedClip);

    let mut xsamples = Vec::new();
    let mut p = 0usize;
    while p < samples.len() {
        xsamples.push(samples[p]);
        p += (rng.next_u64() % 1000) as usize;
    }
    rng.seed(Random::seed_from_hash(&xsamples), Stream::SpeedClip);

    (0..n).map(|_| rng.random_double()).collect()
}

/// Of the candidate locations, pick the one with highest signal energy.
fn get_best_clip_location(
    key: &Key,
    samples: &[f32],
    n_channels: usize,
    sample_rate: u32,
    seconds: f64,
) -> f64 {
    let mut clip_location = 0.0;
    let mut best_energy = 0.0f64;

    for location in get_clip_locations(key, samples, CLIP_CANDIDATES) {
        let clip = get_speed_clip(location, samples, n_channels, sample_rate, seconds);
        let energy: f64 = clip.iter().map(|&s| (s as f64) * (s as f64)).sum();
        if energy > best_energy {
            best_energy = energy;
            clip_location = location;
        }
    }
    clip_location
}

/// Raised-cosine weight for score smoothing, zero outside `|x| >= 1`.
fn window_cos(x: f64) -> f64 {
    let x = x.abs();
    if x < 1.0 {
        0.5 * ((x * std::f64::consts::PI).cos() + 1.0)
    } else {
        0.0
    }
}

/// The raw scores are noisy, so the argmax of the raw vector is not
/// necessarily the best speed. Smooth with a cosine kernel and take the
/// continuous argmax instead.
fn score_smooth_find_best(in_scores: &[Score], step: f64, distance: f64) -> f64 {
    let mut scores = in_scores.to_vec();
    scores.sort_by(|a, b| a.speed.total_cmp(&b.speed));
    if scores.is_empty() {
        return 1.0;
    }

    let mut best_speed = 0.0;
    let mut best_quality = 0.0;
    let mut speed = scores[0].speed;
    let last = scores[scores.len() - 1].speed;
    while speed < last {
        let mut quality_sum = 0.0;
        let mut quality_div = 0.0;
        for s in &scores {
            let w = window_cos((s.speed - speed) / (step * distance));
            quality_sum += s.quality * w;
            quality_div += w;
        }
        if quality_div > 0.0 {
            quality_sum /= quality_div;
            if quality_sum > best_quality {
                best_speed = speed;
                best_quality = quality_sum;
            }
        }
        speed += 0.000001;
    }
    best_speed
}

/// Keep the `n` best local maxima of the score vector (by quality),
/// counting plateaus of two equal values as a single peak.
fn select_n_best_scores(scores: &mut Vec<Score>, n: usize) {
    scores.sort_by(|a, b| a.speed.total_cmp(&b.speed));

    let get_quality = |scores: &[Score], pos: isize| -> f64 {
        if pos >= 0 && (pos as usize) < scores.len() {
            scores[pos as usize].quality
        } else {
            0.0
        }
    };

    let mut lmax_scores = Vec::new();
    let mut x: isize = 0;
    while (x as usize) < scores.len() {
        let q1 = get_quality(scores, x - 1);
        let q2 = get_quality(scores, x);
        let q3 = get_quality(scores, x + 1);
        if q1 <= q2 && q2 >= q3 {
            lmax_scores.push(scores[x as usize]);
            x += 1; // the score with quality q3 cannot be a local maximum
        }
        x += 1;
    }
    lmax_scores.sort_by(|a, b| b.quality.total_cmp(&a.quality));
    lmax_scores.truncate(n);
    *scores = lmax_scores;
}

/// Split `jobs` into batches that keep the thread pool busy: full batches
/// while plenty remain, then halve so the tail still runs wide.
fn split_jobs(mut jobs: usize, threads: usize) -> Vec<usize> {
    let mut split = Vec::new();
    let mut push = |split: &mut Vec<usize>, jobs: &mut usize, j: usize| {
        if j > 0 {
            split.push(j);
            *jobs -= j;
        }
    };
    while jobs > 2 * threads {
        push(&mut split, &mut jobs, threads);
    }
    if jobs > threads {
        let half = (jobs + 1) / 2;
        push(&mut split, &mut jobs, half);
    }
    let remaining = jobs;
    push(&mut split, &mut jobs, remaining);
    split
}

/// Run one scan pass: build hypothesis objects around the given center
/// speeds, then process them in batches with strictly ordered
/// prepare / search / free phases per batch.
fn run_search(
    key: &Key,
    config: &Config,
    samples: &[f32],
    n_channels: usize,
    clip_location: f64,
    scan: &SpeedScanParams,
    speeds: &[f64],
) -> Vec<Score> {
    /* speed is between 0.8 and 1.25, so a clip factor of 1.3 provides
     * enough samples for every hypothesis */
    let clip = get_speed_clip(
        clip_location,
        samples,
        n_channels,
        config.mark_sample_rate,
        scan.seconds * 1.3,
    );

    let mut speed_syncs: Vec<SpeedSync> = Vec::new();
    for &speed in speeds {
        for c in -scan.n_center_steps..=scan.n_center_steps {
            let c_speed = speed * scan.step.powi(c * (scan.n_steps * 2 + 1));
            speed_syncs.push(SpeedSync::new(key, config, &clip, n_channels, c_speed));
        }
    }

    let mut start = 0;
    for count in split_jobs(speed_syncs.len(), rayon::current_num_threads()) {
        let group = &mut speed_syncs[start..start + count];
        // prepare must finish before any search that reads its matrix
        group
            .par_iter_mut()
            .for_each(|s| s.prepare_mags(config, scan));
        group.par_iter_mut().for_each(|s| s.search(config, scan));
        for s in group.iter_mut() {
            s.free_memory();
        }
        start += count;
    }

    let mut scores: Vec<Score> = speed_syncs.iter().flat_map(|s| s.scores.clone()).collect();
    scores.sort_by(|a, b| a.speed.total_cmp(&b.speed));
    scores
}

/// Detect a playback-speed difference via a multi-resolution grid search
/// in log-speed space. Returns `None` when the quality threshold is not
/// met or the detected speed is indistinguishable from 1.0.
pub fn detect_speed(
    key: &Key,
    config: &Config,
    samples: &[f32],
    n_channels: usize,
    patient: bool,
) -> Option<SpeedResult> {
    let in_seconds =
        (samples.len() / n_channels) as f64 / config.mark_sample_rate as f64;
    if in_seconds < 0.25 {
        return None;
    }

    /* first pass: find an approximation, speed roughly 0.8..1.25 */
    let scan1 = if patient {
        SpeedScanParams {
            seconds: 50.0,
            step: 1.00035,
            n_steps: 11,
            n_center_steps: 28,
        }
    } else {
        SpeedScanParams {
            seconds: 25.0,
            step: 1.0007,
            n_steps: 5,
            n_center_steps: 28,
        }
    };
    /* second pass: improve approximation */
    let scan2 = if patient {
        SpeedScanParams {
            seconds: 50.0,
            step: 1.000175,
            n_steps: 1,
            n_center_steps: 0,
        }
    } else {
        SpeedScanParams {
            seconds: 50.0,
            step: 1.00035,
            n_steps: 1,
            n_center_steps: 0,
        }
    };
    /* third pass: fast refine (not always perfect) */
    let scan3 = SpeedScanParams {
        seconds: 50.0,
        step: 1.00005,
        n_steps: 40,
        n_center_steps: 0,
    };
    let scan3_smooth_distance = 20.0;
    let n_best = if patient { 15 } else { 5 };

    let clip_location = get_best_clip_location(
        key,
        samples,
        n_channels,
        config.mark_sample_rate,
        scan1.seconds,
    );

    let mut scores = run_search(
        key,
        config,
        samples,
        n_channels,
        clip_location,
        &scan1,
        &[1.0],
    );

    select_n_best_scores(&mut scores, n_best);
    let speeds: Vec<f64> = scores.iter().map(|s| s.speed).collect();
    let mut scores = run_search(
        key,
        config,
        samples,
        n_channels,
        clip_location,
        &scan2,
        &speeds,
    );

    select_n_best_scores(&mut scores, 1);
    let best = scores.first()?.speed;
    let scores = run_search(
        key,
        config,
        samples,
        n_channels,
        clip_location,
        &scan3,
        &[best],
    );

    let best_speed = score_smooth_find_best(&scores, 1.0 - scan3.step, scan3_smooth_distance);
    let best_quality = scores.iter().fold(0.0f64, |q, s| q.max(s.quality));
    debug!(best_speed, best_quality, "speed detection result");

    if best_quality > SPEED_SYNC_THRESHOLD {
        // speeds closer to 1.0 than this work without stretching
        if !(0.9999..=1.0001).contains(&best_speed) {
            return Some(SpeedResult {
                speed: best_speed,
                quality: best_quality,
            });
        }
    }
    None
}
