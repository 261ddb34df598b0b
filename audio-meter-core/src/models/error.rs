use thiserror::Error;

/// Errors that can occur during device, stream, or metering operations.
///
/// Producer-thread failures never surface through this type directly: the
/// stream callback records them and the consumer-side `update` observes the
/// result on its next tick.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeterError {
    /// The backend refused to allocate, configure, or start a stream.
    #[error("stream open failed ({code}): {reason}")]
    StreamOpen { code: i32, reason: String },

    /// An operation was invoked in the wrong stream state (caller bug).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("channel {channel} out of range (channel count {channel_count})")]
    OutOfRange { channel: usize, channel_count: usize },

    /// Overflow or failure reported by the backend while streaming.
    #[error("backend runtime error ({code}): {reason}")]
    BackendRuntime { code: i32, reason: String },

    #[error("ring buffer underflow: requested {requested} bytes, {available} available")]
    Underflow { requested: usize, available: usize },

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    #[error("configuration failed: {0}")]
    ConfigurationFailed(String),
}

impl MeterError {
    /// Shorthand for a `StreamOpen` error with a backend error code.
    pub fn stream_open(code: i32, reason: impl Into<String>) -> Self {
        Self::StreamOpen {
            code,
            reason: reason.into(),
        }
    }

    pub fn backend_runtime(code: i32, reason: impl Into<String>) -> Self {
        Self::BackendRuntime {
            code,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_open_display_carries_code() {
        let err = MeterError::stream_open(-3, "no channel layout");
        assert_eq!(err.to_string(), "stream open failed (-3): no channel layout");
    }

    #[test]
    fn out_of_range_display() {
        let err = MeterError::OutOfRange {
            channel: 4,
            channel_count: 2,
        };
        assert_eq!(err.to_string(), "channel 4 out of range (channel count 2)");
    }
}
