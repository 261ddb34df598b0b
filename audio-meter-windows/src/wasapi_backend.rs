//! [`AudioBackend`] over WASAPI.

use std::time::{Duration, Instant};

use audio_meter_core::{
    AudioBackend, BackendStream, DeviceDescriptor, DeviceEnumeration, DevicesChangedCallback,
    MeterError, StreamRequest,
};

use crate::com::ComApartment;
use crate::device_enumerator::{DeviceEnumerator, EndpointSnapshot};
use crate::error::WasapiError;
use crate::wasapi_input::WasapiInputStream;

/// Minimum time between two hot-plug polls.
pub const HOT_PLUG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// WASAPI capture backend.
///
/// Holds no COM objects between calls, so it can move between threads. Each
/// call joins the calling thread to the MTA for its duration. Hot-plug
/// changes are detected by polling the active endpoint set from
/// `flush_events`.
#[derive(Default)]
pub struct WasapiBackend {
    devices_changed: Option<DevicesChangedCallback>,
    known: Option<EndpointSnapshot>,
    last_poll: Option<Instant>,
}

impl WasapiBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_enumerator<T>(
        f: impl FnOnce(&DeviceEnumerator) -> Result<T, WasapiError>,
    ) -> Result<T, WasapiError> {
        let _apartment = ComApartment::enter()?;
        let enumerator = DeviceEnumerator::new()?;
        f(&enumerator)
    }

    /// Poll the endpoint set; true when it differs from the last poll.
    fn endpoints_changed(&mut self) -> bool {
        let snapshot = match Self::with_enumerator(|e| e.snapshot()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::debug!("Endpoint poll failed: {}", e);
                return false;
            }
        };

        match self.known.replace(snapshot) {
            Some(previous) => self.known.as_ref() != Some(&previous),
            None => false,
        }
    }
}

impl AudioBackend for WasapiBackend {
    fn set_devices_changed_callback(&mut self, callback: DevicesChangedCallback) {
        self.devices_changed = Some(callback);
    }

    fn flush_events(&mut self) {
        let now = Instant::now();
        if self
            .last_poll
            .is_some_and(|last| now.duration_since(last) < HOT_PLUG_POLL_INTERVAL)
        {
            return;
        }
        self.last_poll = Some(now);

        if self.endpoints_changed() {
            log::debug!("Capture endpoints changed");
            if let Some(callback) = &self.devices_changed {
                callback();
            }
        }
    }

    fn enumerate_input_devices(&mut self) -> Result<DeviceEnumeration, MeterError> {
        Self::with_enumerator(|e| e.list_input_devices())
            .map_err(|e| MeterError::Enumeration(e.to_string()))
    }

    fn open_input_stream(
        &mut self,
        device: &DeviceDescriptor,
        request: &StreamRequest,
    ) -> Result<Box<dyn BackendStream>, MeterError> {
        let stream = Self::with_enumerator(|e| WasapiInputStream::open(e, device, request))?;
        Ok(Box::new(stream))
    }
}
