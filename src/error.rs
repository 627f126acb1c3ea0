//! Error types for the audio output sink

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by the sink session to its caller
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    /// Requested format/device combination was rejected at initialize time.
    /// The caller may retry with another format.
    #[error("Configuration unsupported: {0}")]
    ConfigurationUnsupported(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Transient write failure; nothing from this call was consumed
    #[error("Device write failed: {0}")]
    DeviceWriteFailed(String),

    /// Device closed or lost; the sink must be initialized again
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Drain timed out after {waited_ms} ms with {pending_frames} frames pending")]
    Timeout { waited_ms: u64, pending_frames: u64 },

    #[error("Sink is not initialized")]
    NotInitialized,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
}

/// Failures raised by a device backend
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("Failed to open device: {0}")]
    Open(String),

    #[error("Write failed: {0}")]
    Write(String),

    #[error("Device lost: {0}")]
    Lost(String),

    #[error("Capability probe failed: {0}")]
    Probe(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
