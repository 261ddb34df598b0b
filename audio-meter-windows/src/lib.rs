//! # audio-meter-windows
//!
//! Windows WASAPI backend for audio-meter.
//!
//! Provides:
//! - `WasapiBackend`: `AudioBackend` over the MMDevice API and shared-mode capture
//! - `WasapiInputStream`: capture on a dedicated MMCSS-registered thread
//! - `DeviceEnumerator`: capture endpoint enumeration
//! - `permissions`: Windows microphone privacy check
//!
//! ## Platform Requirements
//! - Windows 10+
//! - Visual Studio Build Tools 2022 + Windows SDK for linking
//!
//! ## Usage
//! ```ignore
//! use audio_meter_core::DeviceRegistry;
//! use audio_meter_windows::WasapiBackend;
//!
//! let mut registry = DeviceRegistry::new(WasapiBackend::new());
//! let stream = registry.default_stream().unwrap();
//! loop {
//!     registry.update(1.0 / 60.0);
//!     println!("{:.3}", stream.level().unwrap_or(0.0));
//! }
//! ```

#[cfg(target_os = "windows")]
mod com;
#[cfg(target_os = "windows")]
pub mod device_enumerator;
#[cfg(target_os = "windows")]
pub mod error;
#[cfg(target_os = "windows")]
pub mod permissions;
#[cfg(target_os = "windows")]
pub mod wasapi_backend;
#[cfg(target_os = "windows")]
pub mod wasapi_input;

#[cfg(target_os = "windows")]
pub use device_enumerator::DeviceEnumerator;
#[cfg(target_os = "windows")]
pub use error::WasapiError;
#[cfg(target_os = "windows")]
pub use wasapi_backend::WasapiBackend;
#[cfg(target_os = "windows")]
pub use wasapi_input::WasapiInputStream;
