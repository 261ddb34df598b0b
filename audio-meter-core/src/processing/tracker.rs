use crate::device::input_stream::InputStream;
use crate::device::registry::DeviceRegistry;
use crate::models::config::TrackerConfig;
use crate::models::error::MeterError;
use crate::models::levels::{amplitude_to_db, SILENCE_DB};

// Peak follower decay, dB per second.
const PEAK_FALL_SPEED: f32 = 0.6;

/// Turns one channel's RMS level into a normalized 0..1 value for driving
/// visuals: dB conversion, automatic or manual gain, and an optional
/// hold-and-fall-down envelope.
///
/// Keeps its [`InputStream`] cached and re-acquires it from the registry when
/// the device goes away.
#[derive(Debug, Clone)]
pub struct LevelTracker {
    config: TrackerConfig,
    stream: Option<InputStream>,
    amplitude: f32,
    peak: f32,
    fall: f32,
}

impl LevelTracker {
    pub fn new(config: TrackerConfig) -> Result<Self, MeterError> {
        config.validate().map_err(MeterError::ConfigurationFailed)?;
        Ok(Self {
            config,
            stream: None,
            amplitude: 0.0,
            peak: SILENCE_DB,
            fall: 0.0,
        })
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Current gain in dB: the inverted peak when tracking, else the manual gain.
    pub fn calculated_gain(&self) -> f32 {
        if self.config.peak_tracking {
            -self.peak
        } else {
            self.config.gain_db
        }
    }

    /// Output of the last update, 0..1.
    pub fn normalized_level(&self) -> f32 {
        self.amplitude
    }

    pub fn reset_peak(&mut self) {
        self.peak = SILENCE_DB;
    }

    /// Input level of the tracked channel in dBFS. Silence when the device is
    /// missing or the stream is still opening.
    pub fn input_amplitude(&mut self, registry: &mut DeviceRegistry) -> f32 {
        let (channel, filter) = (self.config.channel, self.config.filter_type);
        let Some(stream) = self.stream(registry) else {
            return SILENCE_DB;
        };
        match stream.filtered_level(channel, filter) {
            Ok(level) => amplitude_to_db(level),
            Err(err) => {
                log::debug!("Level tracker read failed: {}", err);
                SILENCE_DB
            }
        }
    }

    /// Read the tracked channel and advance the envelope by `delta_secs`.
    pub fn update(&mut self, registry: &mut DeviceRegistry, delta_secs: f32) -> f32 {
        let input = self.input_amplitude(registry);
        self.process(input, delta_secs)
    }

    /// Advance the envelope with an input level in dBFS.
    pub fn process(&mut self, input_db: f32, delta_secs: f32) -> f32 {
        if self.config.peak_tracking {
            self.peak = (self.peak - PEAK_FALL_SPEED * delta_secs).max(SILENCE_DB);

            // Allow a little clipping before pulling the peak up.
            let clip = self.config.dynamic_range_db * 0.05;
            self.peak = (input_db - clip).max(self.peak).min(0.0);
        }

        let normalized =
            ((input_db + self.calculated_gain()) / self.config.dynamic_range_db + 1.0).clamp(0.0, 1.0);

        if self.config.hold_and_fall_down {
            self.fall += 10f32.powf(1.0 + self.config.fall_down_speed * 2.0) * delta_secs;
            self.amplitude -= self.fall * delta_secs;

            if self.amplitude < normalized {
                self.amplitude = normalized;
                self.fall = 0.0;
            }
        } else {
            self.amplitude = normalized;
        }

        self.amplitude
    }

    fn stream(&mut self, registry: &mut DeviceRegistry) -> Option<&InputStream> {
        let stale = self.stream.as_ref().map_or(true, |s| !s.is_valid());
        if stale {
            self.stream = match &self.config.device_id {
                Some(id) => registry.stream(id),
                None => registry.default_stream(),
            };
        }
        self.stream.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    fn tracker(peak_tracking: bool, hold: bool) -> LevelTracker {
        LevelTracker::new(TrackerConfig {
            peak_tracking,
            hold_and_fall_down: hold,
            ..TrackerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn manual_gain_normalizes_into_range() {
        let mut t = tracker(false, false);
        // (-18 + 6) / 12 + 1 = 0
        assert_abs_diff_eq!(t.process(-18.0, 0.016), 0.0);
        // (-12 + 6) / 12 + 1 = 0.5
        assert_abs_diff_eq!(t.process(-12.0, 0.016), 0.5);
        assert_abs_diff_eq!(t.process(0.0, 0.016), 1.0);
    }

    #[test]
    fn peak_tracking_follows_loud_input() {
        let mut t = tracker(true, false);
        let level = t.process(-6.0, 0.016);

        // Peak pulled up to input minus 5% of the range.
        assert_abs_diff_eq!(t.calculated_gain(), 6.6, epsilon = 1e-4);
        assert!(level > 0.99);

        t.reset_peak();
        assert_abs_diff_eq!(t.calculated_gain(), 60.0);
    }

    #[test]
    fn peak_decays_over_time() {
        let mut t = tracker(true, false);
        t.process(-6.0, 0.0);
        t.process(SILENCE_DB, 10.0);
        assert_abs_diff_eq!(t.calculated_gain(), 6.6 + 6.0, epsilon = 1e-4);
    }

    #[test]
    fn hold_and_fall_down_decays_gradually() {
        let mut t = tracker(false, true);
        assert_abs_diff_eq!(t.process(0.0, 0.016), 1.0);

        let after_one = t.process(SILENCE_DB, 0.016);
        assert!(after_one < 1.0 && after_one > 0.9);

        let mut level = after_one;
        for _ in 0..200 {
            level = t.process(SILENCE_DB, 0.016);
        }
        assert_eq!(level, 0.0);
    }

    #[test]
    fn invalid_config_rejected() {
        let result = LevelTracker::new(TrackerConfig {
            dynamic_range_db: 0.0,
            ..TrackerConfig::default()
        });
        assert!(result.is_err());
    }
}
