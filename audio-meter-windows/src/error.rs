//! WASAPI failures and their mapping onto [`MeterError`].

use audio_meter_core::MeterError;
use thiserror::Error;

/// Errors raised while talking to the MMDevice / WASAPI APIs.
#[derive(Debug, Error)]
pub enum WasapiError {
    #[error("{call} failed: {source}")]
    Com {
        call: &'static str,
        #[source]
        source: windows::core::Error,
    },

    #[error("device not available: {0}")]
    DeviceNotAvailable(String),

    #[error("unsupported mix format: {0}")]
    UnsupportedFormat(String),

    #[error("capture thread failed: {0}")]
    Thread(String),
}

impl WasapiError {
    /// HRESULT of the failing call, or a negative sentinel for local failures.
    pub fn code(&self) -> i32 {
        match self {
            Self::Com { source, .. } => source.code().0,
            Self::DeviceNotAvailable(_) => -3,
            Self::UnsupportedFormat(_) => -4,
            Self::Thread(_) => -5,
        }
    }

    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Com { source, .. } if crate::permissions::is_access_denied(source.code()))
    }

    /// Fatal error while a stream is running.
    pub fn into_runtime(self) -> MeterError {
        MeterError::backend_runtime(self.code(), self.to_string())
    }
}

impl From<WasapiError> for MeterError {
    fn from(err: WasapiError) -> Self {
        let reason = if err.is_access_denied() {
            format!("{err} (microphone access is disabled in privacy settings)")
        } else {
            err.to_string()
        };
        MeterError::stream_open(err.code(), reason)
    }
}

/// Attach the name of the failing COM call.
pub(crate) trait ComContext<T> {
    fn call(self, call: &'static str) -> Result<T, WasapiError>;
}

impl<T> ComContext<T> for windows::core::Result<T> {
    fn call(self, call: &'static str) -> Result<T, WasapiError> {
        self.map_err(|source| WasapiError::Com { call, source })
    }
}
