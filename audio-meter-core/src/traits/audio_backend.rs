use std::sync::Arc;

use parking_lot::Mutex;

use crate::models::device::{ChannelLayout, DeviceDescriptor, DeviceEnumeration, SampleFormat};
use crate::models::error::MeterError;

/// Callback invoked when the backend notices devices being added or removed.
///
/// May fire from any thread; implementations only set a flag.
pub type DevicesChangedCallback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Backend shared between the registry and every device handle.
///
/// Locked only from the consumer thread.
pub type SharedBackend = Arc<Mutex<dyn AudioBackend>>;

/// One batch delivered by the backend's read loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputChunk<'a> {
    /// Tightly packed interleaved frames in the negotiated format.
    Samples(&'a [u8]),
    /// The backend had no data for this many bytes (underrun or silent
    /// buffer). Consumers substitute zeros to keep timing aligned.
    Gap(usize),
}

impl InputChunk<'_> {
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Samples(bytes) => bytes.len(),
            Self::Gap(len) => *len,
        }
    }
}

/// Producer-side receiver for a running input stream.
///
/// All methods are called on the backend's realtime thread. Implementations
/// must not block except on a short buffer lock and must not allocate.
pub trait InputCallback: Send + Sync {
    /// A batch of captured frames is available.
    fn on_read(&self, chunk: InputChunk<'_>);

    /// The backend dropped input because it was not read fast enough.
    fn on_overflow(&self);

    /// The backend hit an error while streaming. `stream_invalid` means the
    /// stream can no longer deliver data.
    fn on_error(&self, error: &MeterError, stream_invalid: bool);
}

/// Parameters for opening an input stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub format: SampleFormat,
    pub layout: ChannelLayout,
    /// Requested software latency in seconds.
    pub software_latency: f64,
}

/// An opened, possibly not yet started, input stream.
///
/// Dropping a stream must release it even if `close` was never called.
pub trait BackendStream: Send {
    fn sample_rate(&self) -> u32;

    /// Layout actually negotiated with the device.
    fn layout(&self) -> &ChannelLayout;

    /// Software latency granted by the backend, in seconds.
    fn software_latency(&self) -> f64;

    /// Start delivering input to `callback` on the backend's own thread.
    fn start(&mut self, callback: Arc<dyn InputCallback>) -> Result<(), MeterError>;

    /// Stop the stream and release its resources. Idempotent.
    fn close(&mut self);
}

/// Native audio I/O capability: device discovery and input streaming.
pub trait AudioBackend: Send {
    /// Register the hot-plug notification.
    fn set_devices_changed_callback(&mut self, callback: DevicesChangedCallback);

    /// Process pending backend events, firing the hot-plug callback if the
    /// device set changed.
    fn flush_events(&mut self);

    /// Current input devices and the index of the default one.
    fn enumerate_input_devices(&mut self) -> Result<DeviceEnumeration, MeterError>;

    /// Open (but do not start) an input stream on `device`.
    fn open_input_stream(
        &mut self,
        device: &DeviceDescriptor,
        request: &StreamRequest,
    ) -> Result<Box<dyn BackendStream>, MeterError>;
}
