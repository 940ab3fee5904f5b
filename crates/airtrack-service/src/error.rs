//! Error types for airtrack-service.
//!
//! [`PublishError`] never reaches the user for a queued message: the message
//! stays in the store and delivery is retried. [`AuthorizationError`] is the
//! opposite and always surfaces to the caller.

use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the tracking service.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Telemetry could not be queued or delivered.
    #[error(transparent)]
    Publish(#[from] PublishError),

    /// The current identity may not perform the operation.
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    /// Device connection failure.
    #[error(transparent)]
    Core(#[from] airtrack_core::Error),

    /// Persistence failure.
    #[error("Store error: {0}")]
    Store(#[from] airtrack_store::Error),

    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Errors on the broker leg.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PublishError {
    /// The broker URL could not be parsed.
    #[error("Invalid broker URL '{url}': {reason}")]
    InvalidBrokerUrl {
        /// The configured URL.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Connecting to the broker failed.
    #[error("Failed to connect to broker: {0}")]
    Connect(String),

    /// Publish attempted without a broker connection.
    #[error("Not connected to broker")]
    NotConnected,

    /// The broker connection dropped while a publish was outstanding.
    #[error("Broker connection lost: {0}")]
    ConnectionLost(String),

    /// The broker did not confirm in time.
    #[error("No confirmation for packet {pkid} within {timeout:?}")]
    AckTimeout {
        /// Packet id of the unconfirmed publish.
        pkid: u16,
        /// How long we waited.
        timeout: Duration,
    },

    /// The MQTT client rejected the request.
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Queue persistence failed.
    #[error("Queue error: {0}")]
    Store(#[from] airtrack_store::Error),

    /// Publishing was cancelled by a disconnect.
    #[error("Publishing cancelled")]
    Cancelled,
}

impl PublishError {
    /// Whether the broker connection has to be re-established before retrying.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::NotConnected | Self::ConnectionLost(_)
        )
    }
}

/// Errors raised when an identity lacks a required capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum AuthorizationError {
    /// Nobody is signed in.
    #[error("No identity is signed in")]
    NoIdentity,

    /// The identity lacks a resource role.
    #[error("User '{username}' lacks role '{role}' on resource '{resource}'")]
    MissingRole {
        /// The identity that was checked.
        username: String,
        /// The resource the role applies to.
        resource: String,
        /// The missing role.
        role: String,
    },
}
