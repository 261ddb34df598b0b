use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::device::handle::DeviceHandle;
use crate::models::error::MeterError;
use crate::models::levels::{BandLevels, FilterType, SILENCE_LEVEL};

/// Client view of one device's input.
///
/// Holds no ownership: once the registry drops the device every read answers
/// with silence (or an empty window) instead of failing.
#[derive(Debug, Clone)]
pub struct InputStream {
    device_id: String,
    channel: usize,
    handle: Weak<Mutex<DeviceHandle>>,
}

impl InputStream {
    pub(crate) fn new(handle: &Arc<Mutex<DeviceHandle>>) -> Self {
        Self {
            device_id: handle.lock().id().to_string(),
            channel: 0,
            handle: Arc::downgrade(handle),
        }
    }

    /// Select the channel read by [`level`](Self::level).
    pub fn with_channel(mut self, channel: usize) -> Self {
        self.channel = channel;
        self
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Friendly name of the device; empty once it is gone.
    pub fn device_name(&self) -> String {
        self.with_handle(|h| h.name().to_string())
            .unwrap_or_default()
    }

    /// Whether the device is still known to the registry.
    pub fn is_valid(&self) -> bool {
        self.with_handle(|_| ()).is_some()
    }

    pub fn is_stream_active(&self) -> bool {
        self.with_handle(|h| h.is_stream_active()).unwrap_or(false)
    }

    pub fn channel_count(&self) -> usize {
        self.with_handle(|h| h.channel_count()).unwrap_or(0)
    }

    pub fn sample_rate(&self) -> u32 {
        self.with_handle(|h| h.sample_rate()).unwrap_or(0)
    }

    pub fn latency(&self) -> f64 {
        self.with_handle(|h| h.latency()).unwrap_or(0.0)
    }

    /// Unfiltered level of the selected channel.
    pub fn level(&self) -> Result<f32, MeterError> {
        self.channel_level(self.channel)
    }

    pub fn channel_level(&self, channel: usize) -> Result<f32, MeterError> {
        self.with_handle(|h| h.channel_level(channel))
            .unwrap_or(Ok(SILENCE_LEVEL))
    }

    pub fn filtered_level(&self, channel: usize, filter: FilterType) -> Result<f32, MeterError> {
        self.with_handle(|h| h.filtered_level(channel, filter))
            .unwrap_or(Ok(SILENCE_LEVEL))
    }

    pub fn channel_levels(&self, channel: usize) -> Result<BandLevels, MeterError> {
        self.with_handle(|h| h.channel_levels(channel))
            .unwrap_or(Ok(BandLevels::ZERO))
    }

    /// Copy of the interleaved samples drained on the last tick.
    pub fn raw_window(&self) -> Vec<f32> {
        self.with_handle(|h| h.window().to_vec()).unwrap_or_default()
    }

    pub fn raw_window_bytes(&self) -> Vec<u8> {
        self.with_handle(|h| h.window_bytes().to_vec())
            .unwrap_or_default()
    }

    fn with_handle<R>(&self, f: impl FnOnce(&mut DeviceHandle) -> R) -> Option<R> {
        let handle = self.handle.upgrade()?;
        let mut handle = handle.lock();
        if handle.is_retired() {
            return None;
        }
        Some(f(&mut handle))
    }
}
