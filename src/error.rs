//! # Error Types
//!
//! Custom error types for the TriSonica logger using `thiserror`.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the logger core
#[derive(Debug, Error)]
pub enum LoggerError {
    /// Auto-detection produced no usable serial device
    #[error("No serial device found (tried: {0})")]
    NoDeviceFound(String),

    /// An explicit device path could not be opened
    #[error("Failed to open {path}: {reason}")]
    DeviceOpen { path: String, reason: String },

    /// The device disappeared while streaming (unplugged, EOF, I/O failure)
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// No bytes arrived within the liveness interval
    #[error("No data received for {0:?}")]
    ReadTimeout(Duration),

    /// A frame grew past the buffer cap without a terminator
    #[error("Frame overflow: discarded {discarded} bytes")]
    FrameOverflow { discarded: usize },

    /// A frame did not match the tagged-field grammar
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Writing a log file failed
    #[error("Log write error: {0}")]
    LogWrite(String),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration values are out of range or inconsistent
    #[error("Configuration error: {0}")]
    InvalidConfig(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoggerError {
    /// Whether the session may recover from this error by skipping,
    /// retrying or reconnecting.
    ///
    /// Configuration errors abort startup and persistent log-write failures
    /// end the session; everything originating from the device or its data
    /// is recoverable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            LoggerError::ConfigParse(_) | LoggerError::InvalidConfig(_) | LoggerError::LogWrite(_)
        )
    }
}

/// Result type alias for the logger core
pub type Result<T> = std::result::Result<T, LoggerError>;
