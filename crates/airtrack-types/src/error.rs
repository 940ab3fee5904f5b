//! Error types for payload decoding in airtrack-types.

use thiserror::Error;

/// Errors that can occur when decoding raw sensor payloads.
///
/// Decode errors are always local to a single payload: the owning
/// connection drops the record and keeps running.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DecodeError {
    /// The payload could not be interpreted at all.
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// The payload is shorter than the frame format requires.
    #[error("Insufficient bytes: expected at least {expected}, got {actual}")]
    InsufficientBytes {
        /// Minimum number of bytes for the frame.
        expected: usize,
        /// Number of bytes received.
        actual: usize,
    },

    /// A line carried a sensor tag that maps to no known measurement kind.
    #[error("Unsupported measurement kind: {0}")]
    UnsupportedMeasurementKind(String),

    /// A binary frame announced a data format this decoder does not handle.
    #[error("Unsupported frame format: 0x{0:02X}")]
    UnsupportedFormat(u8),
}

impl DecodeError {
    /// Create an invalid data error.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }
}

/// Result type alias using airtrack-types' DecodeError type.
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;
