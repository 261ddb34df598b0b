use serde::{Deserialize, Serialize};

/// Output of the multiband filter bank used for metering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterType {
    /// Unfiltered signal.
    #[default]
    Bypass,
    LowPass,
    BandPass,
    HighPass,
}

impl FilterType {
    pub const ALL: [FilterType; 4] = [
        FilterType::Bypass,
        FilterType::LowPass,
        FilterType::BandPass,
        FilterType::HighPass,
    ];

    /// Lane of this output inside a [`BandLevels`] vector.
    pub fn index(self) -> usize {
        match self {
            Self::Bypass => 0,
            Self::LowPass => 1,
            Self::BandPass => 2,
            Self::HighPass => 3,
        }
    }
}

/// One value per filter output, ordered bypass / low / band / high.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BandLevels(pub [f32; 4]);

impl BandLevels {
    pub const ZERO: BandLevels = BandLevels([0.0; 4]);

    pub fn get(&self, filter: FilterType) -> f32 {
        self.0[filter.index()]
    }

    pub fn bypass(&self) -> f32 {
        self.0[0]
    }

    pub fn low(&self) -> f32 {
        self.0[1]
    }

    pub fn band(&self) -> f32 {
        self.0[2]
    }

    pub fn high(&self) -> f32 {
        self.0[3]
    }
}

/// Linear level reported when no stream data is available.
pub const SILENCE_LEVEL: f32 = 0.0;

/// Level floor in dBFS used by level tracking.
pub const SILENCE_DB: f32 = -60.0;

/// Converts a linear RMS amplitude to dBFS, floored at [`SILENCE_DB`].
pub fn amplitude_to_db(level: f32) -> f32 {
    if level <= 0.0 || !level.is_finite() {
        return SILENCE_DB;
    }
    (20.0 * level.log10()).max(SILENCE_DB)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_indices_match_lane_order() {
        let levels = BandLevels([0.1, 0.2, 0.3, 0.4]);
        for (lane, filter) in FilterType::ALL.iter().enumerate() {
            assert_eq!(filter.index(), lane);
        }
        assert_eq!(levels.get(FilterType::BandPass), 0.3);
        assert_eq!(levels.high(), 0.4);
    }

    #[test]
    fn db_conversion() {
        assert_eq!(amplitude_to_db(1.0), 0.0);
        assert!((amplitude_to_db(0.1) + 20.0).abs() < 1e-4);
        assert_eq!(amplitude_to_db(0.0), SILENCE_DB);
        assert_eq!(amplitude_to_db(1e-9), SILENCE_DB);
    }
}
