//! Capture endpoint enumeration via the MMDevice API.
//!
//! Wraps `IMMDeviceEnumerator` to list active capture endpoints as
//! [`DeviceDescriptor`]s. Each endpoint's shared-mode mix format decides its
//! channel layout and its minimum device period the lowest software latency.

use windows::core::PCWSTR;
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;

use audio_meter_core::{ChannelLayout, DeviceDescriptor, DeviceEnumeration};

use crate::error::{ComContext, WasapiError};

// REFERENCE_TIME ticks per second.
pub(crate) const REFTIMES_PER_SEC: f64 = 10_000_000.0;

/// Shared-mode format of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MixFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Active endpoint ids plus the default, used to detect hot-plug changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSnapshot {
    pub ids: Vec<String>,
    pub default_id: Option<String>,
}

/// Capture endpoint enumerator. COM must be initialized on the calling thread.
pub struct DeviceEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl DeviceEnumerator {
    pub fn new() -> Result<Self, WasapiError> {
        let enumerator = unsafe {
            CoCreateInstance::<_, IMMDeviceEnumerator>(&MMDeviceEnumerator, None, CLSCTX_ALL)
        }
        .call("CoCreateInstance(MMDeviceEnumerator)")?;
        Ok(Self { enumerator })
    }

    /// Describe every active capture endpoint.
    ///
    /// An endpoint whose audio client cannot be queried is still listed, with
    /// no layouts, so callers see it but never try to open it.
    pub fn list_input_devices(&self) -> Result<DeviceEnumeration, WasapiError> {
        let snapshot = self.snapshot()?;
        let mut devices = Vec::with_capacity(snapshot.ids.len());

        for (index, id) in snapshot.ids.iter().enumerate() {
            let device = match self.device(id) {
                Ok(d) => d,
                Err(e) => {
                    log::debug!("Endpoint {} vanished during enumeration: {}", id, e);
                    continue;
                }
            };
            let name = friendly_name(&device).unwrap_or_else(|| format!("Input {}", index));
            devices.push(describe(&device, id.clone(), name));
        }

        let default_index = snapshot
            .default_id
            .as_deref()
            .and_then(|default| devices.iter().position(|d| d.id == default));

        Ok(DeviceEnumeration {
            devices,
            default_index,
        })
    }

    /// Ids of the active capture endpoints, in enumeration order.
    pub fn snapshot(&self) -> Result<EndpointSnapshot, WasapiError> {
        unsafe {
            let collection = self
                .enumerator
                .EnumAudioEndpoints(eCapture, DEVICE_STATE_ACTIVE)
                .call("EnumAudioEndpoints")?;
            let count = collection.GetCount().call("IMMDeviceCollection::GetCount")?;

            let mut ids = Vec::with_capacity(count as usize);
            for i in 0..count {
                let Ok(device) = collection.Item(i) else {
                    continue;
                };
                if let Ok(id) = device_id(&device) {
                    ids.push(id);
                }
            }

            Ok(EndpointSnapshot {
                ids,
                default_id: self.default_input_id(),
            })
        }
    }

    pub fn default_input_id(&self) -> Option<String> {
        let device = unsafe { self.enumerator.GetDefaultAudioEndpoint(eCapture, eConsole) }.ok()?;
        device_id(&device).ok()
    }

    pub(crate) fn device(&self, id: &str) -> Result<IMMDevice, WasapiError> {
        let wide: Vec<u16> = id.encode_utf16().chain(std::iter::once(0)).collect();
        unsafe { self.enumerator.GetDevice(PCWSTR(wide.as_ptr())) }
            .map_err(|_| WasapiError::DeviceNotAvailable(id.to_string()))
    }
}

pub(crate) fn device_id(device: &IMMDevice) -> Result<String, WasapiError> {
    unsafe {
        let raw = device.GetId().call("IMMDevice::GetId")?;
        let id = raw.to_string();
        CoTaskMemFree(Some(raw.0 as *const _));
        id.map_err(|e| WasapiError::DeviceNotAvailable(format!("malformed endpoint id: {e}")))
    }
}

/// Read `PKEY_Device_FriendlyName`.
fn friendly_name(device: &IMMDevice) -> Option<String> {
    unsafe {
        let store = device.OpenPropertyStore(STGM_READ).ok()?;
        let value = store.GetValue(&PKEY_Device_FriendlyName).ok()?;
        let name = value.to_string();
        (!name.is_empty()).then_some(name)
    }
}

fn describe(device: &IMMDevice, id: String, name: String) -> DeviceDescriptor {
    let mut descriptor = DeviceDescriptor {
        id,
        name,
        is_raw: false,
        layouts: Vec::new(),
        software_latency_min: 0.0,
    };

    let probe = unsafe { device.Activate::<IAudioClient>(CLSCTX_ALL, None) }
        .call("IMMDevice::Activate")
        .and_then(|client| Ok((mix_format(&client)?, minimum_period(&client)?)));

    match probe {
        Ok((format, period)) => {
            descriptor.layouts = vec![ChannelLayout::from_channel_count(format.channels)];
            descriptor.software_latency_min = period;
        }
        Err(e) => log::debug!("Cannot query endpoint {}: {}", descriptor.id, e),
    }
    descriptor
}

pub(crate) fn mix_format(client: &IAudioClient) -> Result<MixFormat, WasapiError> {
    unsafe {
        let ptr = client.GetMixFormat().call("IAudioClient::GetMixFormat")?;
        let format = MixFormat {
            sample_rate: (*ptr).nSamplesPerSec,
            channels: (*ptr).nChannels,
        };
        CoTaskMemFree(Some(ptr as *const _));

        if format.sample_rate == 0 || format.channels == 0 {
            return Err(WasapiError::UnsupportedFormat(format!(
                "{} channels at {} Hz",
                format.channels, format.sample_rate
            )));
        }
        Ok(format)
    }
}

/// Minimum device period in seconds.
pub(crate) fn minimum_period(client: &IAudioClient) -> Result<f64, WasapiError> {
    let mut default_period = 0i64;
    let mut minimum_period = 0i64;
    unsafe {
        client
            .GetDevicePeriod(
                Some(&mut default_period as *mut i64),
                Some(&mut minimum_period as *mut i64),
            )
            .call("IAudioClient::GetDevicePeriod")?;
    }
    Ok(minimum_period as f64 / REFTIMES_PER_SEC)
}
