use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::config::MeterConfig;
use crate::models::device::{DeviceDescriptor, SampleFormat};
use crate::models::error::MeterError;
use crate::models::levels::{BandLevels, FilterType};
use crate::processing::level_meter::LevelMeter;
use crate::processing::ring_buffer::RingBuffer;
use crate::traits::audio_backend::{
    BackendStream, InputCallback, InputChunk, SharedBackend, StreamRequest,
};

/// Backend error code used when the device exposes no usable layout.
pub const NO_LAYOUT_ERROR_CODE: i32 = -1;

/// Backend error code used when a stream negotiates zero channels or rate.
pub const EMPTY_FORMAT_ERROR_CODE: i32 = -2;

/// Stream lifecycle of a [`DeviceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Open,
}

/// State shared with the backend's realtime thread.
///
/// The ring buffer lock is the only lock the producer ever takes.
struct StreamContext {
    device_id: String,
    ring: Mutex<RingBuffer>,
    overflow_events: AtomicU64,
    invalid: AtomicBool,
}

impl StreamContext {
    fn new(device_id: String, capacity: usize) -> Self {
        Self {
            device_id,
            ring: Mutex::new(RingBuffer::new(capacity)),
            overflow_events: AtomicU64::new(0),
            invalid: AtomicBool::new(false),
        }
    }

    fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }
}

impl InputCallback for StreamContext {
    fn on_read(&self, chunk: InputChunk<'_>) {
        match chunk {
            InputChunk::Samples(bytes) => self.ring.lock().write(bytes),
            InputChunk::Gap(len) => self.ring.lock().write_empty(len),
        }
    }

    fn on_overflow(&self) {
        self.overflow_events.fetch_add(1, Ordering::Relaxed);
        log::warn!("Input stream overflow on {}", self.device_id);
    }

    fn on_error(&self, error: &MeterError, stream_invalid: bool) {
        log::error!("Input stream error on {}: {}", self.device_id, error);
        if stream_invalid {
            self.invalid.store(true, Ordering::Release);
        }
    }
}

/// Everything that exists only while the stream is open.
struct ActiveStream {
    stream: Box<dyn BackendStream>,
    context: Arc<StreamContext>,
    sample_rate: u32,
    channel_count: usize,
    latency: f64,
    // Last tick's window. Consumer thread only.
    window: Vec<u8>,
    window_len: usize,
    samples: Vec<f32>,
    meter: LevelMeter,
}

impl ActiveStream {
    fn bytes_for(&self, seconds: f64) -> usize {
        bytes_for(self.sample_rate, self.channel_count, seconds)
    }

    /// Pull one tick's worth of audio out of the ring and re-meter it.
    fn drain(&mut self, delta_secs: f64) {
        let target = self.bytes_for(delta_secs).min(self.window.len());

        let overflowed = {
            let mut ring = self.context.ring.lock();
            self.window_len = if ring.fill_count() >= target
                && ring.read_into(&mut self.window[..target]).is_ok()
            {
                target
            } else {
                0
            };

            let overflowed = ring.overflow_count() > 0;
            if overflowed {
                ring.clear();
            }
            overflowed
        };

        if overflowed {
            log::debug!(
                "Ring buffer overflow on {}, buffer cleared",
                self.context.device_id
            );
        }

        self.samples.clear();
        self.samples.extend(
            self.window[..self.window_len]
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        self.meter.process(&self.samples, self.sample_rate);
    }
}

/// Saturates instead of overflowing; callers clamp to their buffer size.
fn bytes_for(sample_rate: u32, channel_count: usize, seconds: f64) -> usize {
    let frames = (f64::from(sample_rate) * seconds.max(0.0)).round() as usize;
    frames
        .saturating_mul(channel_count)
        .saturating_mul(SampleFormat::Float32Le.bytes_per_sample())
}

/// One input device and its on-demand stream.
///
/// The stream opens lazily on the first read through [`prepare`](Self::prepare)
/// and closes itself after `idle_tick_limit` ticks without a read. Every read
/// answers: a closed or failed stream reads as silence.
pub struct DeviceHandle {
    descriptor: DeviceDescriptor,
    backend: SharedBackend,
    config: MeterConfig,
    stream: Option<ActiveStream>,
    idle_ticks: u32,
    retired: bool,
}

impl DeviceHandle {
    pub fn new(descriptor: DeviceDescriptor, backend: SharedBackend, config: MeterConfig) -> Self {
        Self {
            descriptor,
            backend,
            config,
            stream: None,
            idle_ticks: 0,
            retired: false,
        }
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn stream_state(&self) -> StreamState {
        if self.stream.is_some() {
            StreamState::Open
        } else {
            StreamState::Closed
        }
    }

    pub fn is_stream_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether the registry has dropped this device.
    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn channel_count(&self) -> usize {
        self.stream.as_ref().map_or(0, |s| s.channel_count)
    }

    pub fn sample_rate(&self) -> u32 {
        self.stream.as_ref().map_or(0, |s| s.sample_rate)
    }

    /// Software latency of the open stream in seconds.
    pub fn latency(&self) -> f64 {
        self.stream.as_ref().map_or(0.0, |s| s.latency)
    }

    /// Ticks since the last read.
    pub fn idle_ticks(&self) -> u32 {
        self.idle_ticks
    }

    /// Producer overflows the backend reported on the current stream.
    pub fn overflow_events(&self) -> u64 {
        self.stream
            .as_ref()
            .map_or(0, |s| s.context.overflow_events.load(Ordering::Relaxed))
    }

    /// Open and start a stream on the device's preferred layout.
    ///
    /// On failure the handle stays closed and any half-built stream is torn down.
    pub fn open_stream(&mut self) -> Result<(), MeterError> {
        if self.stream.is_some() {
            return Err(MeterError::InvalidState("stream already open".into()));
        }
        if self.retired {
            return Err(MeterError::DeviceNotFound(self.descriptor.id.clone()));
        }

        let layout = self
            .descriptor
            .preferred_layout()
            .cloned()
            .ok_or_else(|| MeterError::stream_open(NO_LAYOUT_ERROR_CODE, "no channel layout"))?;

        let best_latency = self
            .config
            .frame_latency()
            .max(self.descriptor.software_latency_min);

        let request = StreamRequest {
            format: SampleFormat::Float32Le,
            layout,
            software_latency: best_latency,
        };

        let mut stream = self
            .backend
            .lock()
            .open_input_stream(&self.descriptor, &request)?;

        let sample_rate = stream.sample_rate();
        let channel_count = usize::from(stream.layout().channel_count);
        if sample_rate == 0 || channel_count == 0 {
            stream.close();
            return Err(MeterError::stream_open(
                EMPTY_FORMAT_ERROR_CODE,
                format!("negotiated {channel_count} channels at {sample_rate} Hz"),
            ));
        }

        // Survive the consumer stalling, or the producer firing, for
        // `buffer_latency_multiplier` periods.
        let granted = stream.software_latency();
        let latency = if granted.is_finite() {
            granted.max(best_latency)
        } else {
            best_latency
        };
        let capacity = bytes_for(
            sample_rate,
            channel_count,
            latency * self.config.buffer_latency_multiplier,
        );

        let context = Arc::new(StreamContext::new(self.descriptor.id.clone(), capacity));
        let callback: Arc<dyn InputCallback> = context.clone();
        if let Err(err) = stream.start(callback) {
            stream.close();
            return Err(err);
        }

        log::debug!(
            "Opened input stream on {}: {} ch @ {} Hz, latency {:.1} ms, buffer {} bytes",
            self.descriptor.id,
            channel_count,
            sample_rate,
            latency * 1000.0,
            capacity
        );

        self.stream = Some(ActiveStream {
            stream,
            context,
            sample_rate,
            channel_count,
            latency,
            window: vec![0; capacity],
            window_len: 0,
            samples: Vec::with_capacity(capacity / 4),
            meter: LevelMeter::new(
                channel_count,
                self.config.filter_cutoff_hz,
                self.config.filter_q,
            ),
        });
        Ok(())
    }

    /// Stop and release the stream. Closing a closed stream is a caller bug.
    pub fn close_stream(&mut self) -> Result<(), MeterError> {
        let Some(mut active) = self.stream.take() else {
            log::warn!("close_stream called on closed stream ({})", self.descriptor.id);
            return Err(MeterError::InvalidState("stream not open".into()));
        };
        active.stream.close();
        log::debug!("Closed input stream on {}", self.descriptor.id);
        Ok(())
    }

    /// Mark a read. Opens the stream if needed; returns whether data is ready.
    ///
    /// The call that triggers an open returns `false`, and so does every call
    /// while the backend keeps refusing the stream.
    pub fn prepare(&mut self) -> bool {
        self.idle_ticks = 0;

        if self.stream.is_some() {
            return true;
        }
        if self.retired {
            return false;
        }

        if let Err(err) = self.open_stream() {
            log::warn!("Failed to open input stream on {}: {}", self.descriptor.id, err);
        }
        false
    }

    /// Consumer tick: drain the ring into the window and refresh levels.
    pub fn update(&mut self, delta_secs: f64) {
        let Some(active) = self.stream.as_ref() else {
            return;
        };

        if active.context.is_invalid() {
            log::warn!(
                "Backend invalidated input stream on {}, closing",
                self.descriptor.id
            );
            let _ = self.close_stream();
            return;
        }

        self.idle_ticks += 1;
        if self.idle_ticks > self.config.idle_tick_limit {
            log::debug!(
                "Input stream on {} idle for {} ticks",
                self.descriptor.id,
                self.idle_ticks
            );
            let _ = self.close_stream();
            return;
        }

        if let Some(active) = self.stream.as_mut() {
            active.drain(delta_secs);
        }
    }

    /// Unfiltered RMS level of `channel`.
    pub fn channel_level(&mut self, channel: usize) -> Result<f32, MeterError> {
        self.filtered_level(channel, FilterType::Bypass)
    }

    pub fn filtered_level(&mut self, channel: usize, filter: FilterType) -> Result<f32, MeterError> {
        Ok(self.channel_levels(channel)?.get(filter))
    }

    /// All band levels of `channel`; silence while the stream is not ready.
    pub fn channel_levels(&mut self, channel: usize) -> Result<BandLevels, MeterError> {
        if !self.prepare() {
            return Ok(BandLevels::ZERO);
        }
        match &self.stream {
            Some(active) => active.meter.level(channel),
            None => Ok(BandLevels::ZERO),
        }
    }

    /// Interleaved samples drained on the last tick.
    pub fn window(&mut self) -> &[f32] {
        self.prepare();
        match &self.stream {
            Some(active) => &active.samples,
            None => &[],
        }
    }

    /// Raw little-endian bytes drained on the last tick.
    pub fn window_bytes(&mut self) -> &[u8] {
        self.prepare();
        match &self.stream {
            Some(active) => &active.window[..active.window_len],
            None => &[],
        }
    }

    /// Close the stream for good; used when the device disappears.
    pub(crate) fn retire(&mut self) {
        self.retired = true;
        if self.stream.is_some() {
            let _ = self.close_stream();
        }
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if let Some(mut active) = self.stream.take() {
            active.stream.close();
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.descriptor.id)
            .field("state", &self.stream_state())
            .field("idle_ticks", &self.idle_ticks)
            .field("retired", &self.retired)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::mock::MockBackend;
    use crate::traits::audio_backend::AudioBackend;

    const TICK: f64 = 0.01;

    fn handle_for(backend: &MockBackend, id: &str) -> DeviceHandle {
        let descriptor = backend
            .clone()
            .enumerate_input_devices()
            .unwrap()
            .devices
            .into_iter()
            .find(|d| d.id == id)
            .unwrap();
        let shared: SharedBackend = Arc::new(Mutex::new(backend.clone()));
        DeviceHandle::new(descriptor, shared, MeterConfig::default())
    }

    fn stereo_mic() -> (MockBackend, DeviceHandle) {
        let backend = MockBackend::new().with_input("mic0", 2, 48000);
        let handle = handle_for(&backend, "mic0");
        (backend, handle)
    }

    fn frames(value: f32, count: usize, channels: usize) -> Vec<f32> {
        vec![value; count * channels]
    }

    #[test]
    fn prepare_opens_lazily() {
        let (backend, mut handle) = stereo_mic();
        assert_eq!(handle.stream_state(), StreamState::Closed);
        assert_eq!(handle.channel_count(), 0);

        assert!(!handle.prepare());
        assert_eq!(handle.stream_state(), StreamState::Open);
        assert!(backend.is_streaming("mic0"));
        assert_eq!(handle.channel_count(), 2);
        assert_eq!(handle.sample_rate(), 48000);

        assert!(handle.prepare());
        assert_eq!(backend.open_count("mic0"), 1);
    }

    #[test]
    fn requests_frame_latency_or_device_minimum() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();
        let request = backend.last_request("mic0").unwrap();
        assert_relative_eq!(request.software_latency, 1.0 / 60.0);
        assert_eq!(request.format, SampleFormat::Float32Le);
        assert_eq!(request.layout.channel_count, 2);

        let backend = MockBackend::new();
        backend.add_device(
            DeviceDescriptor {
                id: "slow".into(),
                name: "Slow".into(),
                is_raw: false,
                layouts: vec![crate::models::device::ChannelLayout::mono()],
                software_latency_min: 0.05,
            },
            44100,
        );
        let mut handle = handle_for(&backend, "slow");
        handle.prepare();
        assert_relative_eq!(backend.last_request("slow").unwrap().software_latency, 0.05);
    }

    #[test]
    fn open_and_close_guard_state() {
        let (backend, mut handle) = stereo_mic();
        assert!(matches!(handle.close_stream(), Err(MeterError::InvalidState(_))));

        handle.open_stream().unwrap();
        assert!(matches!(handle.open_stream(), Err(MeterError::InvalidState(_))));

        handle.close_stream().unwrap();
        assert_eq!(handle.stream_state(), StreamState::Closed);
        assert_eq!(backend.close_count("mic0"), 1);
    }

    #[test]
    fn open_failure_leaves_handle_closed_and_retries() {
        let (backend, mut handle) = stereo_mic();
        backend.set_open_failure(Some(MeterError::stream_open(-7, "device busy")));

        assert!(!handle.prepare());
        assert_eq!(handle.stream_state(), StreamState::Closed);
        assert_eq!(handle.channel_level(0), Ok(0.0));
        assert_eq!(
            handle.open_stream(),
            Err(MeterError::stream_open(-7, "device busy"))
        );

        backend.set_open_failure(None);
        assert!(!handle.prepare());
        assert_eq!(handle.stream_state(), StreamState::Open);
    }

    #[test]
    fn start_failure_tears_down_stream() {
        let (backend, mut handle) = stereo_mic();
        backend.set_start_failure(Some(MeterError::stream_open(-9, "start refused")));

        assert!(handle.open_stream().is_err());
        assert_eq!(handle.stream_state(), StreamState::Closed);
        assert_eq!(backend.open_count("mic0"), 1);
        assert_eq!(backend.close_count("mic0"), 1);
    }

    #[test]
    fn non_finite_tick_is_clamped_to_window() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();

        backend.push_samples("mic0", &frames(0.5, 480, 2));
        handle.update(f64::INFINITY);
        assert!(handle.window().is_empty());
        handle.update(f64::NAN);
        assert!(handle.window().is_empty());
        assert!(handle.is_stream_active());

        handle.update(TICK);
        assert_eq!(handle.window().len(), 960);

        // 4 frame periods at 48 kHz fill the ring exactly.
        backend.push_samples("mic0", &frames(0.25, 3200, 2));
        handle.update(f64::INFINITY);
        assert_eq!(handle.window().len(), 6400);
        assert_relative_eq!(handle.channel_level(0).unwrap(), 0.25, max_relative = 1e-6);
    }

    #[test]
    fn granted_latency_sizes_ring() {
        let (backend, mut handle) = stereo_mic();
        backend.set_granted_latency(Some(0.05));
        handle.prepare();
        assert_relative_eq!(handle.latency(), 0.05);

        // Overflows a ring sized for the requested 1/60 s, fits one sized for 0.05 s.
        backend.push_samples("mic0", &frames(0.5, 4000, 2));
        handle.update(TICK);
        assert_eq!(handle.window().len(), 960);
        handle.update(TICK);
        assert_eq!(handle.window().len(), 960);
        assert!(handle.window().iter().all(|&s| s == 0.5));
    }

    #[test]
    fn non_finite_granted_latency_falls_back_to_request() {
        let (backend, mut handle) = stereo_mic();
        backend.set_granted_latency(Some(f64::INFINITY));
        handle.prepare();
        assert!(handle.is_stream_active());
        assert_relative_eq!(handle.latency(), 1.0 / 60.0);
    }

    #[test]
    fn update_drains_one_tick_and_meters_it() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();

        assert!(backend.push_samples("mic0", &frames(0.5, 480, 2)));
        handle.update(TICK);

        assert_eq!(handle.window().len(), 960);
        assert_eq!(handle.window_bytes().len(), 960 * 4);
        assert_relative_eq!(handle.channel_level(0).unwrap(), 0.5, max_relative = 1e-6);
        assert_relative_eq!(handle.channel_level(1).unwrap(), 0.5, max_relative = 1e-6);
    }

    #[test]
    fn underflow_exposes_empty_window_without_consuming() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();

        backend.push_samples("mic0", &frames(0.25, 100, 2));
        handle.update(TICK);
        assert!(handle.window().is_empty());
        assert_eq!(handle.channel_level(0).unwrap(), 0.0);

        backend.push_samples("mic0", &frames(0.25, 380, 2));
        handle.update(TICK);
        assert_eq!(handle.window().len(), 960);
        assert!(handle.window().iter().all(|&s| s == 0.25));
    }

    #[test]
    fn overflow_clears_ring_after_read() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();

        // Capacity is four frame periods (3200 frames at 48 kHz / 60 Hz).
        backend.push_samples("mic0", &frames(0.1, 4000, 2));
        handle.update(TICK);
        assert_eq!(handle.window().len(), 960);

        handle.update(TICK);
        assert!(handle.window().is_empty());
    }

    #[test]
    fn gap_reads_back_as_silence() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();

        backend.push_samples("mic0", &frames(0.9, 480, 2));
        handle.update(TICK);
        assert!(handle.channel_level(0).unwrap() > 0.8);

        assert!(backend.push_gap("mic0", 480));
        handle.update(TICK);
        assert_eq!(handle.window().len(), 960);
        assert!(handle.window().iter().all(|&s| s == 0.0));
        assert_eq!(handle.channel_level(0).unwrap(), 0.0);
    }

    #[test]
    fn backend_overflow_is_not_fatal() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();

        assert!(backend.report_overflow("mic0"));
        handle.update(TICK);
        assert_eq!(handle.overflow_events(), 1);
        assert_eq!(handle.stream_state(), StreamState::Open);
    }

    #[test]
    fn invalidating_error_closes_on_next_update() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();

        backend.report_error("mic0", MeterError::backend_runtime(3, "glitch"), false);
        handle.update(TICK);
        assert_eq!(handle.stream_state(), StreamState::Open);

        backend.report_error("mic0", MeterError::backend_runtime(4, "unplugged"), true);
        assert_eq!(handle.stream_state(), StreamState::Open);
        handle.update(TICK);
        assert_eq!(handle.stream_state(), StreamState::Closed);
        assert_eq!(backend.close_count("mic0"), 1);
    }

    #[test]
    fn idle_stream_closes_after_limit() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();

        for _ in 0..10 {
            handle.update(TICK);
        }
        assert_eq!(handle.stream_state(), StreamState::Open);
        assert_eq!(handle.idle_ticks(), 10);

        handle.update(TICK);
        assert_eq!(handle.stream_state(), StreamState::Closed);
        assert_eq!(backend.close_count("mic0"), 1);

        handle.update(TICK);
        assert_eq!(backend.close_count("mic0"), 1);
    }

    #[test]
    fn reads_keep_stream_alive() {
        let (_backend, mut handle) = stereo_mic();
        handle.prepare();

        for _ in 0..30 {
            handle.update(TICK);
            let _ = handle.channel_level(0);
        }
        assert_eq!(handle.stream_state(), StreamState::Open);
    }

    #[test]
    fn channel_range_checked_only_when_open() {
        let (_backend, mut handle) = stereo_mic();
        assert_eq!(handle.channel_level(5), Ok(0.0));

        assert_eq!(
            handle.channel_level(5),
            Err(MeterError::OutOfRange {
                channel: 5,
                channel_count: 2
            })
        );
    }

    #[test]
    fn retired_handle_never_reopens() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();
        handle.retire();

        assert_eq!(handle.stream_state(), StreamState::Closed);
        assert!(!handle.prepare());
        assert!(handle.window().is_empty());
        assert_eq!(backend.open_count("mic0"), 1);
        assert_eq!(backend.close_count("mic0"), 1);
    }

    #[test]
    fn drop_closes_stream() {
        let (backend, mut handle) = stereo_mic();
        handle.prepare();
        drop(handle);
        assert!(!backend.is_streaming("mic0"));
        assert_eq!(backend.close_count("mic0"), 1);
    }
}
