//! Error types for airtrack-core.
//!
//! This module defines the errors raised while establishing and running
//! device connections.
//!
//! # Error Recovery Strategies
//!
//! | Error Type | Strategy | Rationale |
//! |------------|----------|-----------|
//! | [`Error::Timeout`] | Reconnect with backoff | Device busy or briefly out of range |
//! | [`Error::Bluetooth`] | Reconnect with backoff | Often transient adapter state |
//! | [`Error::Transport`] | Depends on [`TransportFailure`] | See [`Error::is_retryable`] |
//! | [`Error::Io`] | Reconnect with backoff | Socket or tty went away |
//! | [`Error::Decode`] | Drop the record | The connection is unaffected |
//! | [`Error::DeviceNotFound`] | Reconnect with backoff | Device may come back into range |
//! | [`Error::CharacteristicNotFound`] | Do not retry | Firmware incompatibility |
//! | [`Error::InvalidConfig`] | Do not retry | Fix configuration and restart |
//! | [`Error::Cancelled`] | Do not retry | A disconnect won the race |
//!
//! The supervisor only schedules another attempt for errors where
//! [`Error::is_retryable`] returns `true`.

use std::time::Duration;

use thiserror::Error;

use airtrack_types::DecodeError;

/// Errors that can occur while talking to sensors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The transport failed to open or broke while running.
    #[error("Transport error for {address}: {reason}")]
    Transport {
        /// Address of the affected device.
        address: String,
        /// The structured reason for the failure.
        reason: TransportFailure,
    },

    /// Device not found during scan or connection.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Operation attempted while not connected to device.
    #[error("Not connected to device")]
    NotConnected,

    /// Required BLE characteristic not found on device.
    #[error("Characteristic not found: {uuid} (searched in {service_count} services)")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
        /// Number of services that were searched.
        service_count: usize,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Persisting device state failed.
    #[error("Store error: {0}")]
    Store(#[from] airtrack_store::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for transport failures.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportFailure {
    /// Bluetooth adapter not available or powered off.
    AdapterUnavailable,
    /// No endpoint is configured for a socket device.
    NoEndpoint,
    /// The link closed while it was expected to be up.
    LinkLost,
    /// The transport does not support the device family.
    UnsupportedFamily(String),
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdapterUnavailable => write!(f, "Bluetooth adapter unavailable"),
            Self::NoEndpoint => write!(f, "no socket endpoint configured"),
            Self::LinkLost => write!(f, "link lost"),
            Self::UnsupportedFamily(family) => write!(f, "unsupported device family {}", family),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(identifier.into())
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl Into<String>, service_count: usize) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.into(),
            service_count,
        }
    }

    /// Create a transport failure for a device.
    pub fn transport(address: impl Into<String>, reason: TransportFailure) -> Self {
        Self::Transport {
            address: address.into(),
            reason,
        }
    }

    /// Create a transport failure with a string reason.
    pub fn transport_str(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::transport(address, TransportFailure::Other(reason.into()))
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Whether another connection attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Bluetooth(_)
            | Error::Timeout { .. }
            | Error::Io(_)
            | Error::NotConnected
            | Error::DeviceNotFound(_) => true,
            Error::Transport { reason, .. } => !matches!(
                reason,
                TransportFailure::NoEndpoint | TransportFailure::UnsupportedFamily(_)
            ),
            Error::Decode(_)
            | Error::CharacteristicNotFound { .. }
            | Error::Cancelled
            | Error::Store(_)
            | Error::InvalidConfig(_) => false,
        }
    }
}

/// Result type alias using airtrack-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
