use std::f64::consts::PI;

/// Per-channel filter bank producing bypass / low-pass / band-pass /
/// high-pass outputs from one biquad section.
///
/// Transposed direct form II, one lane per output. Low, band and high share
/// the same poles; the bypass lane has unit numerator and no feedback.
/// State-only: `feed_sample` is O(1) and never allocates.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultibandFilter {
    a0: [f32; 4],
    a1: [f32; 4],
    a2: [f32; 4],
    b1: [f32; 4],
    b2: [f32; 4],
    z1: [f32; 4],
    z2: [f32; 4],
}

// Keeps tan(pi * fc) finite.
const MAX_NORMALIZED_FC: f64 = 0.49;

impl MultibandFilter {
    pub fn new(fc: f32, q: f32) -> Self {
        let mut filter = Self::default();
        filter.set_parameter(fc, q);
        filter
    }

    /// Update cutoff (normalized to the sample rate, `0 < fc < 0.5`) and Q.
    ///
    /// Integrator state is kept so parameter updates between blocks don't click.
    pub fn set_parameter(&mut self, fc: f32, q: f32) {
        let fc = f64::from(fc).clamp(f64::EPSILON, MAX_NORMALIZED_FC);
        let q = f64::from(q).max(f64::EPSILON);

        let k = (PI * fc).tan();
        let norm = 1.0 / (1.0 + k / q + k * k);

        let lp = k * k * norm;
        let bp = k / q * norm;
        let hp = norm;
        let b1 = 2.0 * (k * k - 1.0) * norm;
        let b2 = (1.0 - k / q + k * k) * norm;

        self.a0 = [1.0, lp as f32, bp as f32, hp as f32];
        self.a1 = [0.0, (2.0 * lp) as f32, 0.0, (-2.0 * hp) as f32];
        self.a2 = [0.0, lp as f32, -bp as f32, hp as f32];
        self.b1 = [0.0, b1 as f32, b1 as f32, b1 as f32];
        self.b2 = [0.0, b2 as f32, b2 as f32, b2 as f32];
    }

    /// Consume one input sample and return the four lane outputs.
    #[inline]
    pub fn feed_sample(&mut self, x: f32) -> [f32; 4] {
        let mut out = [0.0f32; 4];
        for lane in 0..4 {
            let o = x * self.a0[lane] + self.z1[lane];
            self.z1[lane] = x * self.a1[lane] + self.z2[lane] - o * self.b1[lane];
            self.z2[lane] = x * self.a2[lane] - o * self.b2[lane];
            out[lane] = o;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    const SAMPLE_RATE: f32 = 48000.0;

    fn steady_state_gain(filter: &mut MultibandFilter, freq: f32, lane: usize) -> f32 {
        let n = SAMPLE_RATE as usize;
        let mut peak = 0.0f32;
        for i in 0..n {
            let x = (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE).sin();
            let y = filter.feed_sample(x)[lane];
            // Skip the transient.
            if i > n / 2 {
                peak = peak.max(y.abs());
            }
        }
        peak
    }

    #[test]
    fn bypass_lane_is_identity() {
        let mut filter = MultibandFilter::new(960.0 / SAMPLE_RATE, 0.15);
        for &x in &[0.0, 0.5, -1.0, 0.25, 1.0] {
            assert_eq!(filter.feed_sample(x)[0], x);
        }
    }

    #[test]
    fn dc_passes_low_and_blocks_band_and_high() {
        let mut filter = MultibandFilter::new(960.0 / SAMPLE_RATE, 0.15);
        let mut out = [0.0; 4];
        for _ in 0..48000 {
            out = filter.feed_sample(1.0);
        }
        assert_abs_diff_eq!(out[1], 1.0, epsilon = 1e-3);
        assert_abs_diff_eq!(out[2], 0.0, epsilon = 1e-3);
        assert_abs_diff_eq!(out[3], 0.0, epsilon = 1e-3);
    }

    #[test]
    fn high_frequency_passes_high_lane() {
        let mut filter = MultibandFilter::new(960.0 / SAMPLE_RATE, 0.15);
        let high = steady_state_gain(&mut filter, 15000.0, 3);
        let mut filter = MultibandFilter::new(960.0 / SAMPLE_RATE, 0.15);
        let low = steady_state_gain(&mut filter, 15000.0, 1);
        assert!(high > 0.9, "high lane gain {high}");
        assert!(low < 0.1, "low lane gain {low}");
    }

    #[test]
    fn stays_finite_on_full_scale_noise() {
        let mut filter = MultibandFilter::new(960.0 / 8000.0, 0.15);
        let mut seed: u32 = 12345;
        for _ in 0..100_000 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let x = ((seed >> 16) as i32 - 32768) as f32 / 32768.0;
            let out = filter.feed_sample(x);
            assert!(out.iter().all(|v| v.is_finite() && v.abs() < 10.0));
        }
    }

    #[test]
    fn extreme_cutoff_is_clamped() {
        let mut filter = MultibandFilter::new(0.75, 0.15);
        let out = filter.feed_sample(1.0);
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
