use crate::models::error::MeterError;
use crate::models::levels::BandLevels;
use crate::processing::multiband_filter::MultibandFilter;

/// Per-channel RMS meter over a multiband filter bank.
///
/// Levels are "last known good": a block that carries no samples for a
/// channel leaves that channel's levels untouched.
#[derive(Debug, Clone)]
pub struct LevelMeter {
    filters: Vec<MultibandFilter>,
    levels: Vec<BandLevels>,
    cutoff_hz: f32,
    q: f32,
}

impl LevelMeter {
    pub fn new(channel_count: usize, cutoff_hz: f32, q: f32) -> Self {
        Self {
            filters: vec![MultibandFilter::default(); channel_count],
            levels: vec![BandLevels::ZERO; channel_count],
            cutoff_hz,
            q,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.levels.len()
    }

    /// Filter one interleaved block and update every channel's RMS levels.
    pub fn process(&mut self, input: &[f32], sample_rate: u32) {
        let channels = self.levels.len();
        if input.is_empty() || channels == 0 || sample_rate == 0 {
            return;
        }

        let fc = self.cutoff_hz / sample_rate as f32;

        for (channel, (filter, level)) in self
            .filters
            .iter_mut()
            .zip(self.levels.iter_mut())
            .enumerate()
        {
            filter.set_parameter(fc, self.q);

            let mut sum = [0.0f64; 4];
            let mut count = 0usize;
            for &x in input.iter().skip(channel).step_by(channels) {
                let y = filter.feed_sample(x);
                for lane in 0..4 {
                    let v = f64::from(y[lane]);
                    sum[lane] += v * v;
                }
                count += 1;
            }

            if count == 0 {
                continue;
            }

            let n = count as f64;
            level.0 = sum.map(|s| (s / n).sqrt() as f32);
        }
    }

    /// Last computed levels for `channel`.
    pub fn level(&self, channel: usize) -> Result<BandLevels, MeterError> {
        self.levels
            .get(channel)
            .copied()
            .ok_or(MeterError::OutOfRange {
                channel,
                channel_count: self.levels.len(),
            })
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::models::levels::FilterType;

    fn meter(channels: usize) -> LevelMeter {
        LevelMeter::new(channels, 960.0, 0.15)
    }

    fn sine(amplitude: f32, freq: f32, sample_rate: u32, frames: usize, channels: usize) -> Vec<f32> {
        let mut out = Vec::with_capacity(frames * channels);
        for i in 0..frames {
            let t = i as f32 / sample_rate as f32;
            let x = amplitude * (2.0 * std::f32::consts::PI * freq * t).sin();
            for _ in 0..channels {
                out.push(x);
            }
        }
        out
    }

    #[test]
    fn silence_yields_zero_levels() {
        for channels in 1..=4 {
            let mut m = meter(channels);
            m.process(&vec![0.0; 480 * channels], 48000);
            for c in 0..channels {
                assert_eq!(m.level(c).unwrap(), BandLevels::ZERO);
            }
        }
    }

    #[test]
    fn empty_block_keeps_previous_levels() {
        let mut m = meter(2);
        m.process(&sine(0.5, 100.0, 48000, 4800, 2), 48000);
        let before = m.level(1).unwrap();

        m.process(&[], 48000);
        assert_eq!(m.level(1).unwrap(), before);
        assert!(before.bypass() > 0.0);
    }

    #[test]
    fn low_frequency_sine_converges_to_rms() {
        let amplitude = 0.5;
        let expected = amplitude / 2.0f32.sqrt();
        let mut m = meter(1);

        // 20 Hz at 48 kHz: one second is a whole number of periods.
        m.process(&sine(amplitude, 20.0, 48000, 48000, 1), 48000);
        let levels = m.level(0).unwrap();

        assert_relative_eq!(levels.get(FilterType::Bypass), expected, max_relative = 1e-3);
        assert_relative_eq!(levels.get(FilterType::LowPass), expected, max_relative = 0.02);
        assert!(levels.get(FilterType::HighPass) < expected * 0.05);
    }

    #[test]
    fn channels_are_metered_independently() {
        let mut m = meter(2);
        let frames = 4800;
        let mut block = Vec::with_capacity(frames * 2);
        for i in 0..frames {
            block.push(if i % 2 == 0 { 1.0 } else { -1.0 });
            block.push(0.0);
        }
        m.process(&block, 48000);

        assert_relative_eq!(m.level(0).unwrap().bypass(), 1.0, max_relative = 1e-6);
        assert_eq!(m.level(1).unwrap().bypass(), 0.0);
    }

    #[test]
    fn short_block_only_updates_channels_with_samples() {
        let mut m = meter(3);
        m.process(&[1.0], 48000);

        assert_eq!(m.level(0).unwrap().bypass(), 1.0);
        assert_eq!(m.level(1).unwrap(), BandLevels::ZERO);
        assert!(m.level(2).unwrap().bypass().is_finite());
    }

    #[test]
    fn invalid_channel_is_out_of_range() {
        let m = meter(2);
        assert_eq!(
            m.level(2).unwrap_err(),
            MeterError::OutOfRange {
                channel: 2,
                channel_count: 2
            }
        );
    }
}
