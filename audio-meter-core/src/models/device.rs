use serde::{Deserialize, Serialize};

/// Sample format requested from the backend.
///
/// Metering only ever asks for little-endian 32-bit float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SampleFormat {
    #[default]
    Float32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Float32Le => 4,
        }
    }
}

/// A channel layout supported by an input device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelLayout {
    pub name: String,
    pub channel_count: u16,
}

impl ChannelLayout {
    pub fn new(name: impl Into<String>, channel_count: u16) -> Self {
        Self {
            name: name.into(),
            channel_count,
        }
    }

    /// Builds a layout with a conventional name for the channel count.
    pub fn from_channel_count(channel_count: u16) -> Self {
        let name = match channel_count {
            1 => "Mono".to_string(),
            2 => "Stereo".to_string(),
            n => format!("{n} Channels"),
        };
        Self::new(name, channel_count)
    }

    pub fn mono() -> Self {
        Self::from_channel_count(1)
    }

    pub fn stereo() -> Self {
        Self::from_channel_count(2)
    }
}

/// Immutable description of an input device as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    /// Raw (exclusive, unmixed) devices are never metered.
    pub is_raw: bool,
    /// Supported layouts in backend preference order.
    pub layouts: Vec<ChannelLayout>,
    /// Smallest software latency the device accepts, in seconds.
    pub software_latency_min: f64,
}

impl DeviceDescriptor {
    /// Whether the registry may expose this device.
    pub fn is_usable(&self) -> bool {
        !self.is_raw && !self.layouts.is_empty()
    }

    pub fn preferred_layout(&self) -> Option<&ChannelLayout> {
        self.layouts.first()
    }
}

/// Result of one backend enumeration pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceEnumeration {
    pub devices: Vec<DeviceDescriptor>,
    pub default_index: Option<usize>,
}
