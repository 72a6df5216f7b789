//! Fractional-rate resampling via Hermite interpolation.
//!
//! Quality is sufficient for watermark detection after speed changes; the
//! band of interest sits well below Nyquist at every rate involved.

/// 4-point Hermite interpolation at fractional position `t` in [0, 1).
fn hermite(t: f32, y0: f32, y1: f32, y2: f32, y3: f32) -> f32 {
    let c0 = y1;
    let c1 = 0.5 * (y2 - y0);
    let c2 = y0 - 2.5 * y1 + 2.0 * y2 - 0.5 * y3;
    let c3 = 0.5 * (y3 - y0) + 1.5 * (y1 - y2);
    ((c3 * t + c2) * t + c1) * t + c0
}

fn channel_sample(samples: &[f32], n_channels: usize, ch: usize, frame: isize) -> f32 {
    let frames = (samples.len() / n_channels) as isize;
    let clamped = frame.clamp(0, frames - 1) as usize;
    samples[ch + clamped * n_channels]
}

/// Resample an interleaved signal so one output sample advances the read
/// position by `step` input frames. `max_out_frames` truncates the output.
pub fn resample_step(
    samples: &[f32],
    n_channels: usize,
    step: f64,
    max_out_frames: usize,
) -> Vec<f32> {
    let in_frames = samples.len() / n_channels;
    if in_frames < 2 || step <= 0.0 {
        return Vec::new();
    }

    let out_frames = (((in_frames - 1) as f64 / step).floor() as usize).min(max_out_frames);
    let mut output = Vec::with_capacity(out_frames * n_channels);

    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = pos as isize;
        let frac = (pos - idx as f64) as f32;
        for ch in 0..n_channels {
            let y0 = channel_sample(samples, n_channels, ch, idx - 1);
            let y1 = channel_sample(samples, n_channels, ch, idx);
            let y2 = channel_sample(samples, n_channels, ch, idx + 1);
            let y3 = channel_sample(samples, n_channels, ch, idx + 2);
            output.push(hermite(frac, y0, y1, y2, y3));
        }
    }
    output
}

/// Resample from `in_rate` to `out_rate`.
pub fn resample(samples: &[f32], n_channels: usize, in_rate: u32, out_rate: u32) -> Vec<f32> {
    resample_step(
        samples,
        n_channels,
        in_rate as f64 / out_rate as f64,
        usize::MAX,
    )
}

/// Resample by an arbitrary speed ratio (output duration = input / ratio),
/// truncated to at most `max_seconds` of output at `out_rate`.
pub fn resample_ratio_truncate(
    samples: &[f32],
    n_channels: usize,
    step: f64,
    out_rate: u32,
    max_seconds: f64,
) -> Vec<f32> {
    let max_out = (max_seconds * out_rate as f64) as usize;
    resample_step(samples, n_channels, step, max_out)
}
