//! # Error Types
//!
//! Custom error types for VESC Bridge using `thiserror`.

use thiserror::Error;

/// Main error type for VESC Bridge
#[derive(Debug, Error)]
pub enum VescBridgeError {
    /// Framing errors (bad length, oversized payload)
    #[error("VESC protocol error: {0}")]
    Protocol(String),

    /// GET_VALUES payload could not be decoded
    #[error("Telemetry decode error: {0}")]
    Telemetry(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors (open, write, read, clear)
    #[error("Serial error: {0}")]
    Serial(String),

    /// None of the candidate device paths could be opened
    #[error("No VESC serial device found (tried: {0})")]
    SerialPortNotFound(String),

    /// Control sequence interrupted by an emergency stop
    #[error("Control sequence aborted by emergency stop")]
    Aborted,

    /// A required input device is missing or failed to calibrate
    #[error("Input unavailable: {0}")]
    InputUnavailable(String),

    /// JSON serialization errors (JSONL telemetry sink)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for VESC Bridge
pub type Result<T> = std::result::Result<T, VescBridgeError>;
