use serde::{Deserialize, Serialize};

use super::levels::FilterType;

/// Tuning for device handles and level metering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterConfig {
    /// Host update rate in Hz. A stream targets one frame of software latency.
    pub expected_frame_rate: f64,

    /// Consecutive ticks without a read before an open stream is closed.
    pub idle_tick_limit: u32,

    /// Ring and window buffers hold this many multiples of the stream latency,
    /// so the consumer may stall for that many ticks (or the producer fire
    /// that many callbacks per tick) without overflowing.
    pub buffer_latency_multiplier: f64,

    /// Crossover frequency of the multiband filter, in Hz.
    pub filter_cutoff_hz: f32,

    /// Resonance of the multiband filter.
    pub filter_q: f32,
}

impl MeterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.expected_frame_rate > 0.0) {
            return Err("expected frame rate must be positive".into());
        }
        if self.idle_tick_limit == 0 {
            return Err("idle tick limit must be at least 1".into());
        }
        if !(self.buffer_latency_multiplier >= 1.0) {
            return Err(format!(
                "buffer latency multiplier must be >= 1 (got {})",
                self.buffer_latency_multiplier
            ));
        }
        if !(self.filter_cutoff_hz > 0.0) {
            return Err("filter cutoff must be positive".into());
        }
        if !(self.filter_q > 0.0) {
            return Err("filter Q must be positive".into());
        }
        Ok(())
    }

    /// Target software latency in seconds before device limits are applied.
    pub fn frame_latency(&self) -> f64 {
        1.0 / self.expected_frame_rate
    }
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            expected_frame_rate: 60.0,
            idle_tick_limit: 10,
            buffer_latency_multiplier: 4.0,
            filter_cutoff_hz: 960.0,
            filter_q: 0.15,
        }
    }
}

/// Settings for [`LevelTracker`](crate::processing::tracker::LevelTracker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Device to follow; `None` follows the default device.
    pub device_id: Option<String>,
    pub channel: usize,
    pub filter_type: FilterType,
    /// Automatic gain from a falling peak follower.
    pub peak_tracking: bool,
    /// Manual gain in dB, used when peak tracking is off.
    pub gain_db: f32,
    /// Range in dB mapped onto the normalized 0..1 output.
    pub dynamic_range_db: f32,
    pub hold_and_fall_down: bool,
    /// Fall-down animation speed, 0..1.
    pub fall_down_speed: f32,
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(1.0..=40.0).contains(&self.dynamic_range_db) {
            return Err(format!(
                "dynamic range must be within 1..40 dB (got {})",
                self.dynamic_range_db
            ));
        }
        if !(-10.0..=40.0).contains(&self.gain_db) {
            return Err(format!("gain must be within -10..40 dB (got {})", self.gain_db));
        }
        if !(0.0..=1.0).contains(&self.fall_down_speed) {
            return Err("fall down speed must be within 0..1".into());
        }
        Ok(())
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            channel: 0,
            filter_type: FilterType::Bypass,
            peak_tracking: true,
            gain_db: 6.0,
            dynamic_range_db: 12.0,
            hold_and_fall_down: true,
            fall_down_speed: 0.3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(MeterConfig::default().validate().is_ok());
        assert!(TrackerConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_frame_rate() {
        let config = MeterConfig {
            expected_frame_rate: 0.0,
            ..MeterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_small_multiplier() {
        let config = MeterConfig {
            buffer_latency_multiplier: 0.5,
            ..MeterConfig::default()
        };
        assert!(config.validate().unwrap_err().contains("multiplier"));
    }

    #[test]
    fn frame_latency_from_rate() {
        let config = MeterConfig::default();
        assert!((config.frame_latency() - 1.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: MeterConfig = serde_json::from_str(r#"{"idle_tick_limit": 3}"#).unwrap();
        assert_eq!(config.idle_tick_limit, 3);
        assert_eq!(config.filter_cutoff_hz, 960.0);

        let tracker: TrackerConfig =
            serde_json::from_str(r#"{"device_id": "mic0", "filter_type": "lowpass"}"#).unwrap();
        assert_eq!(tracker.device_id.as_deref(), Some("mic0"));
        assert_eq!(tracker.filter_type, FilterType::LowPass);
    }
}
