use std::sync::Arc;

use realfft::num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::error::{Error, Result};

/// Lowest representable magnitude in dB; quieter bins clip to this.
pub const MIN_DB: f32 = -96.0;

/// Magnitude of a complex bin in dB, clipped below at `min_db`.
pub fn db_from_complex(z: Complex32, min_db: f32) -> f32 {
    let norm = z.norm();
    if norm > 0.0 {
        (20.0 * norm.log10()).max(min_db)
    } else {
        min_db
    }
}

/// Hann window scaled to unit power, so windowed magnitudes are
/// comparable to the rectangular case.
pub fn gen_normalized_window(size: usize) -> Vec<f32> {
    let n = size as f32;
    let mut window: Vec<f32> = (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / n).cos()))
        .collect();
    let power: f32 = window.iter().map(|w| w * w).sum();
    let scale = (n / power).sqrt();
    for w in window.iter_mut() {
        *w *= scale;
    }
    window
}

/// Pre-allocated forward/inverse FFT pair for a fixed frame size.
pub struct FftProcessor {
    frame_size: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    freq_buf: Vec<Complex32>,
    scratch_fwd: Vec<Complex32>,
    scratch_inv: Vec<Complex32>,
}

impl FftProcessor {
    pub fn new(frame_size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(frame_size);
        let inverse = planner.plan_fft_inverse(frame_size);

        let freq_buf = forward.make_output_vec();
        let scratch_fwd = forward.make_scratch_vec();
        let scratch_inv = inverse.make_scratch_vec();

        Self {
            frame_size,
            forward,
            inverse,
            freq_buf,
            scratch_fwd,
            scratch_inv,
        }
    }

    /// Number of complex frequency bins (frame_size/2 + 1).
    pub fn num_bins(&self) -> usize {
        self.frame_size / 2 + 1
    }

    /// Forward FFT; `time_buf` must hold exactly `frame_size` samples and
    /// is modified in place. The result lands in the internal bin buffer.
    pub fn forward(&mut self, time_buf: &mut [f32]) -> Result<&mut [Complex32]> {
        if time_buf.len() != self.frame_size {
            return Err(Error::Internal(format!(
                "fft expected {} samples, got {}",
                self.frame_size,
                time_buf.len()
            )));
        }
        self.forward
            .process_with_scratch(time_buf, &mut self.freq_buf, &mut self.scratch_fwd)
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(&mut self.freq_buf)
    }

    /// Inverse FFT of the internal bin buffer into `time_buf`. Output is
    /// scaled by `frame_size` (realfft convention); use `normalize`.
    pub fn inverse(&mut self, time_buf: &mut [f32]) -> Result<()> {
        if time_buf.len() != self.frame_size {
            return Err(Error::Internal(format!(
                "fft expected {} samples, got {}",
                self.frame_size,
                time_buf.len()
            )));
        }
        self.inverse
            .process_with_scratch(&mut self.freq_buf, time_buf, &mut self.scratch_inv)
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    }

    pub fn freq_bins_mut(&mut self) -> &mut [Complex32] {
        &mut self.freq_buf
    }

    pub fn freq_bins(&self) -> &[Complex32] {
        &self.freq_buf
    }

    pub fn normalize(&self, time_buf: &mut [f32]) {
        let scale = 1.0 / self.frame_size as f32;
        for s in time_buf.iter_mut() {
            *s *= scale;
        }
    }
}

/// Windowed FFT over one frame of a multi-channel interleaved signal.
pub struct FftAnalyzer {
    n_channels: usize,
    frame_size: usize,
    window: Vec<f32>,
    processor: FftProcessor,
    time_buf: Vec<f32>,
}

impl FftAnalyzer {
    pub fn new(n_channels: usize, frame_size: usize) -> Self {
        Self {
            n_channels,
            frame_size,
            window: gen_normalized_window(frame_size),
            processor: FftProcessor::new(frame_size),
            time_buf: vec![0.0; frame_size],
        }
    }

    /// Windowed FFT of the frame starting at sample `offset` (per
    /// channel), returning the complex bins of every channel.
    pub fn run_fft(&mut self, samples: &[f32], offset: usize) -> Result<Vec<Vec<Complex32>>> {
        let needed = (offset + self.frame_size) * self.n_channels;
        if samples.len() < needed {
            return Err(Error::Internal(format!(
                "fft frame at offset {offset} reads past the input ({} < {needed})",
                samples.len()
            )));
        }

        let mut result = Vec::with_capacity(self.n_channels);
        for ch in 0..self.n_channels {
            for i in 0..self.frame_size {
                self.time_buf[i] =
                    samples[ch + (offset + i) * self.n_channels] * self.window[i];
            }
            let bins = self.processor.forward(&mut self.time_buf)?;
            result.push(bins.to_vec());
        }
        Ok(result)
    }
}
