//! Error module for the Rusty Kernel library.
use std::error::Error;
use std::fmt;

/// Error types for the library.
#[derive(Debug, PartialEq, Clone)]
pub enum KernelError {
    /// Error for invalid parameters, e.g., a non-positive resolution.
    InvalidParameter(String),
    /// Error for a delay which is not a positive multiple of the resolution.
    InvalidDelay(String),
    /// Error for a delay outside the sealed [min_delay, max_delay] envelope.
    DelayOutOfEnvelope {
        delay: f64,
        min_delay: f64,
        max_delay: f64,
    },
    /// Error for an unknown node id.
    UnknownNode(usize),
    /// Error for an operation which is not allowed in the current kernel state.
    InvalidState(String),
    /// Error for two file-backed sinks resolving to the same path, or for an existing file
    /// when overwriting is disabled.
    SinkCollision(String),
    /// Error for failures of the spike exchange collective.
    ExchangeError(String),
    /// Error for invalid or unreadable configuration.
    ConfigError(String),
    /// Error for I/O operations.
    IOError(String),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernelError::InvalidParameter(e) => write!(f, "Invalid parameter: {}", e),
            KernelError::InvalidDelay(e) => write!(f, "Invalid delay: {}", e),
            KernelError::DelayOutOfEnvelope {
                delay,
                min_delay,
                max_delay,
            } => write!(
                f,
                "Delay {} ms is outside the sealed envelope [{}, {}] ms",
                delay, min_delay, max_delay
            ),
            KernelError::UnknownNode(id) => write!(f, "Unknown node: {}", id),
            KernelError::InvalidState(e) => write!(f, "Invalid state: {}", e),
            KernelError::SinkCollision(e) => write!(f, "Recording sink collision: {}", e),
            KernelError::ExchangeError(e) => write!(f, "Spike exchange error: {}", e),
            KernelError::ConfigError(e) => write!(f, "Configuration error: {}", e),
            KernelError::IOError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for KernelError {}

impl From<std::io::Error> for KernelError {
    fn from(e: std::io::Error) -> Self {
        KernelError::IOError(e.to_string())
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(e: serde_json::Error) -> Self {
        KernelError::ConfigError(e.to_string())
    }
}
