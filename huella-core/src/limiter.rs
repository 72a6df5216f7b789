//! Block-based look-ahead peak limiter.
//!
//! Embedding adds a small spectral delta on top of the input; on material
//! that already peaks near full scale the sum can clip. The limiter
//! computes a per-block gain from the block peak and interpolates the
//! gain linearly between block centers, so gain changes stay inaudible.

/// Peak limiter with one gain value per `block_size` frames.
pub struct Limiter {
    n_channels: usize,
    block_size: usize,
    ceiling: f32,
}

impl Limiter {
    pub fn new(n_channels: usize, block_size: usize) -> Self {
        Self {
            n_channels,
            block_size,
            ceiling: 0.99,
        }
    }

    pub fn set_ceiling(&mut self, ceiling: f32) {
        self.ceiling = ceiling;
    }

    /// Limit the interleaved signal in place so no sample exceeds the
    /// ceiling. A pure pass-through when the input already fits.
    pub fn process(&self, samples: &mut [f32]) {
        let frames = samples.len() / self.n_channels;
        if frames == 0 {
            return;
        }
        let n_blocks = frames.div_ceil(self.block_size);

        // per-block gain from the block peak
        let mut gains = Vec::with_capacity(n_blocks + 2);
        gains.push(1.0f32);
        for b in 0..n_blocks {
            let start = b * self.block_size * self.n_channels;
            let end = ((b + 1) * self.block_size * self.n_channels).min(samples.len());
            let peak = samples[start..end]
                .iter()
                .fold(0.0f32, |p, s| p.max(s.abs()));
            gains.push(if peak > self.ceiling {
                self.ceiling / peak
            } else {
                1.0
            });
        }
        gains.push(*gains.last().expect("gains is never empty"));

        // interpolate between block centers; use the minimum of the two
        // neighboring gains as the interpolation target so a loud block
        // is fully attenuated by the time it starts
        for frame in 0..frames {
            let block = frame / self.block_size;
            let t = (frame % self.block_size) as f32 / self.block_size as f32;
            let g0 = gains[block].min(gains[block + 1]);
            let g1 = gains[block + 1].min(gains[block + 2]);
            let gain = g0 + (g1 - g0) * t;
            for ch in 0..self.n_channels {
                samples[frame * self.n_channels + ch] *= gain;
            }
        }
    }
}
