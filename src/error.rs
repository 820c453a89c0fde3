//! Custom error types for the control core.
//!
//! This module defines the primary error type, `SpimError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the error classes the instrument can produce:
//!
//! - **`Connectivity`**: a serial port could not be opened. Fatal for the
//!   bus-owning device at startup; auxiliary laser devices log and continue.
//! - **`ReadTimeout`** / **`NotOpen`** / **`Io`**: transport-level faults on
//!   an open channel.
//! - **`Decode`**: a malformed or incomplete telemetry line. Recovered
//!   locally with a bounded retry; never treated as a valid reading.
//! - **`OutOfRange`**: a motion command outside the configured stage bounds.
//!   Rejected before anything is transmitted.
//! - **`SerialFeatureDisabled`**: hardware support was not compiled in.
//!
//! Task-lifecycle misuse (starting a running task, halting a stopped one) is
//! deliberately *not* an error value: the supervisor logs a warning and
//! leaves state untouched, so those paths never construct a `SpimError`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SpimResult<T> = std::result::Result<T, SpimError>;

#[derive(Error, Debug)]
pub enum SpimError {
    #[error("could not connect to {device} on '{port}': {reason}")]
    Connectivity {
        device: String,
        port: String,
        reason: String,
    },

    #[error("bus channel is not open")]
    NotOpen,

    #[error("serial read timeout after {0:?}")]
    ReadTimeout(Duration),

    #[error("telemetry decode failure: {0}")]
    Decode(String),

    #[error("command rejected: {0}")]
    OutOfRange(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("configuration validation error: {0}")]
    Configuration(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SpimError::Decode("no END marker".to_string());
        assert_eq!(err.to_string(), "telemetry decode failure: no END marker");
    }

    #[test]
    fn test_connectivity_error_names_device() {
        let err = SpimError::Connectivity {
            device: "488nm laser".into(),
            port: "COM42".into(),
            reason: "permission denied".into(),
        };
        assert!(err.to_string().contains("488nm laser"));
        assert!(err.to_string().contains("COM42"));
    }
}
