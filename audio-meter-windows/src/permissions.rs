//! Windows microphone privacy check.
//!
//! Microphone access is controlled by Settings > Privacy > Microphone. When the
//! toggle is off, activating a capture client fails with `E_ACCESSDENIED` and
//! every stream open on this machine will keep failing until the user flips it.

use windows::core::HRESULT;
use windows::Win32::Foundation::E_ACCESSDENIED;
use windows::Win32::Media::Audio::*;
use windows::Win32::System::Com::*;

use crate::com::ComApartment;
use crate::error::{ComContext, WasapiError};

pub(crate) fn is_access_denied(code: HRESULT) -> bool {
    code == E_ACCESSDENIED
}

/// Whether the default capture endpoint can be activated.
///
/// Returns `Ok(false)` when there is no capture device or access is denied.
pub fn check_microphone_access() -> Result<bool, WasapiError> {
    let _apartment = ComApartment::enter()?;

    unsafe {
        let enumerator: IMMDeviceEnumerator =
            CoCreateInstance::<_, IMMDeviceEnumerator>(&MMDeviceEnumerator, None, CLSCTX_ALL)
                .call("CoCreateInstance")?;

        let device = match enumerator.GetDefaultAudioEndpoint(eCapture, eConsole) {
            Ok(d) => d,
            Err(_) => return Ok(false),
        };

        match device.Activate::<IAudioClient>(CLSCTX_ALL, None) {
            Ok(_) => Ok(true),
            Err(e) if is_access_denied(e.code()) => Ok(false),
            Err(e) => {
                log::warn!("Unexpected error checking microphone access: {}", e);
                Ok(true)
            }
        }
    }
}
