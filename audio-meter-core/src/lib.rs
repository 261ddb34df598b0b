//! # audio-meter-core
//!
//! Platform-agnostic audio input metering core.
//!
//! Tracks input devices across hot-plug events, opens their streams on
//! demand, bridges the backend's realtime callback to a per-frame consumer
//! tick through a locked ring buffer, and computes per-channel RMS levels
//! over a bypass / low / band / high filter bank. Platform backends (Windows
//! WASAPI, or the in-memory `MockBackend`) implement the `AudioBackend` trait
//! and plug into the generic `DeviceRegistry`.
//!
//! ## Architecture
//!
//! ```text
//! audio-meter-core (this crate)
//! ├── traits/       ← AudioBackend, BackendStream, InputCallback
//! ├── models/       ← MeterError, MeterConfig, DeviceDescriptor, BandLevels, etc.
//! ├── processing/   ← RingBuffer, MultibandFilter, LevelMeter, LevelTracker
//! ├── device/       ← DeviceHandle, DeviceRegistry, InputStream
//! └── mock/         ← MockBackend
//! ```
//!
//! ## Usage
//! ```
//! use audio_meter_core::{DeviceRegistry, MockBackend};
//!
//! let backend = MockBackend::new().with_input("mic0", 2, 48000);
//! let mut registry = DeviceRegistry::new(backend.clone());
//!
//! let stream = registry.default_stream().unwrap();
//! assert_eq!(stream.channel_level(0), Ok(0.0)); // opens the stream
//!
//! backend.push_samples("mic0", &[0.5; 960]);
//! registry.update(0.01);
//! assert!(stream.channel_level(0).unwrap() > 0.49);
//! ```

pub mod device;
pub mod mock;
pub mod models;
pub mod processing;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use device::handle::{DeviceHandle, StreamState};
pub use device::input_stream::InputStream;
pub use device::registry::{DeviceRegistry, SharedHandle};
pub use mock::MockBackend;
pub use models::config::{MeterConfig, TrackerConfig};
pub use models::device::{ChannelLayout, DeviceDescriptor, DeviceEnumeration, SampleFormat};
pub use models::error::MeterError;
pub use models::levels::{amplitude_to_db, BandLevels, FilterType, SILENCE_DB, SILENCE_LEVEL};
pub use processing::level_meter::LevelMeter;
pub use processing::multiband_filter::MultibandFilter;
pub use processing::ring_buffer::RingBuffer;
pub use processing::tracker::LevelTracker;
pub use traits::audio_backend::{
    AudioBackend, BackendStream, DevicesChangedCallback, InputCallback, InputChunk, SharedBackend,
    StreamRequest,
};
