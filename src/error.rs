//! # Error Types
//!
//! Custom error types for Cartelem using `thiserror`.
//!
//! Most of these never leave the component that produced them: readers,
//! the writer and the uplink publisher turn them into counters and log
//! events at their own boundary.

use thiserror::Error;

/// Main error type for Cartelem
#[derive(Debug, Error)]
pub enum CartelemError {
    /// Serial device unreachable or dropped mid-read
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed NMEA sentence or OBD response
    #[error("Parse error: {0}")]
    Parse(String),

    /// Diagnostics PID the vehicle does not answer
    #[error("Unsupported channel: {0}")]
    UnsupportedChannel(String),

    /// Uplink value does not fit the scaled i32 range
    #[error("Value {value} for field {field} is out of range")]
    Range {
        /// Field name
        field: String,
        /// Unscaled value that was rejected
        value: f64,
    },

    /// Writer queue at capacity
    #[error("Writer queue full, {dropped} entries dropped so far")]
    QueueOverflow {
        /// Total drops including this one
        dropped: u64,
    },

    /// Storage backend rejected an insert
    #[error("Storage insert failed: {0}")]
    StorageInsert(String),

    /// Malformed uplink frame
    #[error("Uplink codec error: {0}")]
    Codec(String),

    /// Radio transport failure
    #[error("Radio transport error: {0}")]
    Transport(String),

    /// Serial port setup errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No serial device found at any candidate path
    #[error("No serial device found (tried: {0})")]
    SerialPortNotFound(String),

    /// Session lifecycle misuse (double start, stop of unknown session)
    #[error("Session error: {0}")]
    Session(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Cartelem
pub type Result<T> = std::result::Result<T, CartelemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_error_message() {
        let err = CartelemError::Range { field: "latitude".to_string(), value: 500.0 };
        assert_eq!(err.to_string(), "Value 500 for field latitude is out of range");
    }
}
