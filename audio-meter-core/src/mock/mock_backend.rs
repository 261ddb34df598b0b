use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::device::{ChannelLayout, DeviceDescriptor, DeviceEnumeration};
use crate::models::error::MeterError;
use crate::traits::audio_backend::{
    AudioBackend, BackendStream, DevicesChangedCallback, InputCallback, InputChunk, StreamRequest,
};

/// Scriptable [`AudioBackend`].
///
/// Clones share state, so a test can keep one clone as a controller after
/// handing another to a registry. Producer calls (`push_samples`, `push_gap`,
/// `report_overflow`, `report_error`) run the stream callback on the calling
/// thread, standing in for the backend's realtime thread.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

struct MockDevice {
    descriptor: DeviceDescriptor,
    sample_rate: u32,
}

#[derive(Default)]
struct MockState {
    devices: Vec<MockDevice>,
    default_index: Option<usize>,
    devices_changed: Option<DevicesChangedCallback>,
    change_pending: bool,
    fail_enumeration: bool,
    open_failure: Option<MeterError>,
    start_failure: Option<MeterError>,
    granted_latency: Option<f64>,
    streams: HashMap<String, Arc<StreamShared>>,
    requests: HashMap<String, StreamRequest>,
    open_counts: HashMap<String, usize>,
    close_counts: HashMap<String, usize>,
}

struct StreamShared {
    channel_count: usize,
    callback: Mutex<Option<Arc<dyn InputCallback>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_input`](Self::add_input).
    pub fn with_input(self, id: &str, channels: u16, sample_rate: u32) -> Self {
        self.add_input(id, channels, sample_rate);
        self
    }

    /// Add a usable device with a single layout of `channels` channels.
    pub fn add_input(&self, id: &str, channels: u16, sample_rate: u32) {
        self.add_device(
            DeviceDescriptor {
                id: id.to_string(),
                name: format!("Mock Input {id}"),
                is_raw: false,
                layouts: vec![ChannelLayout::from_channel_count(channels)],
                software_latency_min: 0.005,
            },
            sample_rate,
        );
    }

    /// Add any device, including unusable (raw or layout-less) ones.
    pub fn add_device(&self, descriptor: DeviceDescriptor, sample_rate: u32) {
        let mut state = self.state.lock();
        state.devices.push(MockDevice {
            descriptor,
            sample_rate,
        });
        state.change_pending = true;
    }

    /// Remove a device. Its stream, if any, keeps running until closed.
    pub fn remove_device(&self, id: &str) {
        let mut state = self.state.lock();
        state.devices.retain(|d| d.descriptor.id != id);
        state.change_pending = true;
    }

    pub fn set_default_index(&self, index: Option<usize>) {
        let mut state = self.state.lock();
        state.default_index = index;
        state.change_pending = true;
    }

    /// Fire the hot-plug notification on the next `flush_events`.
    pub fn notify_devices_changed(&self) {
        self.state.lock().change_pending = true;
    }

    pub fn set_enumeration_failure(&self, fail: bool) {
        self.state.lock().fail_enumeration = fail;
    }

    pub fn set_open_failure(&self, error: Option<MeterError>) {
        self.state.lock().open_failure = error;
    }

    pub fn set_start_failure(&self, error: Option<MeterError>) {
        self.state.lock().start_failure = error;
    }

    /// Latency the mock reports back instead of the requested one.
    pub fn set_granted_latency(&self, latency: Option<f64>) {
        self.state.lock().granted_latency = latency;
    }

    /// Deliver interleaved samples. Returns false if no stream is running.
    pub fn push_samples(&self, id: &str, samples: &[f32]) -> bool {
        let Some(callback) = self.callback(id) else {
            return false;
        };
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        callback.on_read(InputChunk::Samples(&bytes));
        true
    }

    /// Deliver `frames` frames of silence as a backend-reported gap.
    pub fn push_gap(&self, id: &str, frames: usize) -> bool {
        let Some(shared) = self.stream(id) else {
            return false;
        };
        let Some(callback) = shared.callback.lock().clone() else {
            return false;
        };
        callback.on_read(InputChunk::Gap(frames * shared.channel_count * 4));
        true
    }

    pub fn report_overflow(&self, id: &str) -> bool {
        let Some(callback) = self.callback(id) else {
            return false;
        };
        callback.on_overflow();
        true
    }

    pub fn report_error(&self, id: &str, error: MeterError, stream_invalid: bool) -> bool {
        let Some(callback) = self.callback(id) else {
            return false;
        };
        callback.on_error(&error, stream_invalid);
        true
    }

    /// Whether a started, unclosed stream exists for `id`.
    pub fn is_streaming(&self, id: &str) -> bool {
        self.callback(id).is_some()
    }

    pub fn open_count(&self, id: &str) -> usize {
        self.state.lock().open_counts.get(id).copied().unwrap_or(0)
    }

    pub fn close_count(&self, id: &str) -> usize {
        self.state.lock().close_counts.get(id).copied().unwrap_or(0)
    }

    /// Request used for the most recent open on `id`.
    pub fn last_request(&self, id: &str) -> Option<StreamRequest> {
        self.state.lock().requests.get(id).cloned()
    }

    fn stream(&self, id: &str) -> Option<Arc<StreamShared>> {
        self.state.lock().streams.get(id).cloned()
    }

    fn callback(&self, id: &str) -> Option<Arc<dyn InputCallback>> {
        self.stream(id)?.callback.lock().clone()
    }
}

impl AudioBackend for MockBackend {
    fn set_devices_changed_callback(&mut self, callback: DevicesChangedCallback) {
        self.state.lock().devices_changed = Some(callback);
    }

    fn flush_events(&mut self) {
        let callback = {
            let mut state = self.state.lock();
            if !state.change_pending {
                return;
            }
            state.change_pending = false;
            state.devices_changed.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    fn enumerate_input_devices(&mut self) -> Result<DeviceEnumeration, MeterError> {
        let state = self.state.lock();
        if state.fail_enumeration {
            return Err(MeterError::Enumeration("mock enumeration failure".into()));
        }
        Ok(DeviceEnumeration {
            devices: state.devices.iter().map(|d| d.descriptor.clone()).collect(),
            default_index: state.default_index,
        })
    }

    fn open_input_stream(
        &mut self,
        device: &DeviceDescriptor,
        request: &StreamRequest,
    ) -> Result<Box<dyn BackendStream>, MeterError> {
        let mut state = self.state.lock();
        if let Some(err) = state.open_failure.clone() {
            return Err(err);
        }

        let sample_rate = state
            .devices
            .iter()
            .find(|d| d.descriptor.id == device.id)
            .map(|d| d.sample_rate)
            .ok_or_else(|| MeterError::stream_open(-5, format!("no such device: {}", device.id)))?;

        *state.open_counts.entry(device.id.clone()).or_default() += 1;
        state.requests.insert(device.id.clone(), request.clone());

        Ok(Box::new(MockStream {
            device_id: device.id.clone(),
            sample_rate,
            layout: request.layout.clone(),
            latency: state.granted_latency.unwrap_or(request.software_latency),
            shared: Arc::new(StreamShared {
                channel_count: usize::from(request.layout.channel_count),
                callback: Mutex::new(None),
            }),
            backend: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MockStream {
    device_id: String,
    sample_rate: u32,
    layout: ChannelLayout,
    latency: f64,
    shared: Arc<StreamShared>,
    backend: Arc<Mutex<MockState>>,
    closed: AtomicBool,
}

impl BackendStream for MockStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    fn software_latency(&self) -> f64 {
        self.latency
    }

    fn start(&mut self, callback: Arc<dyn InputCallback>) -> Result<(), MeterError> {
        let mut state = self.backend.lock();
        if let Some(err) = state.start_failure.clone() {
            return Err(err);
        }
        *self.shared.callback.lock() = Some(callback);
        state
            .streams
            .insert(self.device_id.clone(), Arc::clone(&self.shared));
        Ok(())
    }

    fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.callback.lock().take();

        let mut state = self.backend.lock();
        *state.close_counts.entry(self.device_id.clone()).or_default() += 1;
        let is_current = state
            .streams
            .get(&self.device_id)
            .is_some_and(|s| Arc::ptr_eq(s, &self.shared));
        if is_current {
            state.streams.remove(&self.device_id);
        }
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::device::SampleFormat;

    fn request(channels: u16) -> StreamRequest {
        StreamRequest {
            format: SampleFormat::Float32Le,
            layout: ChannelLayout::from_channel_count(channels),
            software_latency: 0.02,
        }
    }

    #[test]
    fn hot_plug_fires_on_flush() {
        let mut backend = MockBackend::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        backend.set_devices_changed_callback(Arc::new(move || flag.store(true, Ordering::SeqCst)));

        backend.add_input("mic0", 1, 48000);
        assert!(!fired.load(Ordering::SeqCst));

        backend.flush_events();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn close_is_counted_once() {
        let mut backend = MockBackend::new().with_input("mic0", 2, 48000);
        let device = backend.enumerate_input_devices().unwrap().devices[0].clone();

        let mut stream = backend.open_input_stream(&device, &request(2)).unwrap();
        assert_eq!(backend.open_count("mic0"), 1);

        stream.close();
        stream.close();
        drop(stream);
        assert_eq!(backend.close_count("mic0"), 1);
    }

    #[test]
    fn push_requires_started_stream() {
        let mut backend = MockBackend::new().with_input("mic0", 1, 48000);
        assert!(!backend.push_samples("mic0", &[0.0]));

        let device = backend.enumerate_input_devices().unwrap().devices[0].clone();
        let _stream = backend.open_input_stream(&device, &request(1)).unwrap();
        assert!(!backend.is_streaming("mic0"));
    }

    #[test]
    fn enumeration_failure() {
        let mut backend = MockBackend::new().with_input("mic0", 1, 48000);
        backend.set_enumeration_failure(true);
        assert!(matches!(
            backend.enumerate_input_devices(),
            Err(MeterError::Enumeration(_))
        ));
    }
}
