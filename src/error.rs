//! # Centralized Error Handling
//!
//! Unified error types for the entire crate using `thiserror`.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for EPA operations
#[derive(Error, Debug)]
pub enum EpaError {
    /// I/O errors (file missing, permission denied, read/write failures)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Format errors (sequence length mismatch, malformed alignment rows)
    #[error("Format error: {message}")]
    Format { message: String },

    /// Attempt to position a stream past the known sequence count
    #[error("Trying to skip out of bounds: sequence {index} of {len}")]
    OutOfBounds { index: usize, len: usize },

    /// Attempt to position a stream behind data that was already read
    #[error("Trying to skip behind: sequence {index} is before read position {position}")]
    BackwardSeek { index: usize, position: usize },

    /// Non-success status reported by the message transport
    #[error("Failed transport call: {message} (status {status})")]
    Transport { status: i32, message: String },

    /// Likelihood engine failures (non-finite values, invalid model)
    #[error("Numerical error: {message}")]
    Numerical { message: String },

    /// Invalid arguments passed to a library call
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Configuration errors (invalid CLI arguments)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Payload encoding / decoding failures
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File not found errors
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// Parse errors
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// Type alias for Results using EpaError
pub type Result<T> = std::result::Result<T, EpaError>;

impl EpaError {
    /// Create a format error with a message
    pub fn format(message: impl Into<String>) -> Self {
        Self::Format {
            message: message.into(),
        }
    }

    /// Create a numerical error
    pub fn numerical(message: impl Into<String>) -> Self {
        Self::Numerical {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether the error leaves a stream usable for further valid operations
    pub fn is_bounds(&self) -> bool {
        matches!(self, Self::OutOfBounds { .. } | Self::BackwardSeek { .. })
    }
}

impl From<bincode::error::EncodeError> for EpaError {
    fn from(err: bincode::error::EncodeError) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<bincode::error::DecodeError> for EpaError {
    fn from(err: bincode::error::DecodeError) -> Self {
        Self::serialization(err.to_string())
    }
}

impl From<serde_json::Error> for EpaError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string())
    }
}
