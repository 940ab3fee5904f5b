//! Data models for stored data.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use airtrack_types::{ConnectionState, DeliveryState, DeviceFamily, TelemetryKind};

use crate::error::Result;

/// A known device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Hardware address (primary key).
    pub address: String,
    /// Device family.
    pub family: DeviceFamily,
    /// Human label.
    pub label: String,
    /// Connection state requested by the user.
    pub desired_state: ConnectionState,
    /// Last connection state reported by the transport.
    pub actual_state: ConnectionState,
    /// Optional record version marker.
    pub version: Option<String>,
    /// When the device was added.
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
    /// When the record last changed.
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl DeviceRecord {
    /// Create a record for a newly added device with the family's default label.
    pub fn new(address: impl Into<String>, family: DeviceFamily) -> Self {
        let address = address.into();
        let now = OffsetDateTime::now_utc();
        Self {
            label: family.default_label(&address),
            address,
            family,
            desired_state: ConnectionState::Disconnected,
            actual_state: ConnectionState::Disconnected,
            version: Some(uuid::Uuid::new_v4().to_string()),
            added_at: now,
            updated_at: now,
        }
    }

    /// Override the label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Whether the device should be connected but is not.
    pub fn is_auto_connecting(&self) -> bool {
        self.desired_state == ConnectionState::Connected
            && self.actual_state != ConnectionState::Connected
    }
}

/// A telemetry message ready to be queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMessage {
    /// What the payload carries.
    pub kind: TelemetryKind,
    /// JSON payload.
    pub payload: String,
    /// Topic template; `{username}` is replaced at delivery time.
    pub topic_pattern: String,
    /// Producing identity, `None` until someone is signed in.
    pub username: Option<String>,
    /// Version of the producing application.
    pub app_version: String,
    /// Tracking session that produced the message.
    pub session_id: Option<String>,
    /// When the message was enqueued.
    #[serde(with = "time::serde::rfc3339")]
    pub enqueued_at: OffsetDateTime,
}

impl TelemetryMessage {
    /// Create an unowned, sessionless message.
    pub fn new(
        kind: TelemetryKind,
        payload: impl Into<String>,
        topic_pattern: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            payload: payload.into(),
            topic_pattern: topic_pattern.into(),
            username: None,
            app_version: app_version.into(),
            session_id: None,
            enqueued_at: OffsetDateTime::now_utc(),
        }
    }

    /// Create a message whose payload is the JSON encoding of `value`.
    pub fn from_json<T: Serialize>(
        kind: TelemetryKind,
        value: &T,
        topic_pattern: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Result<Self> {
        let payload = serde_json::to_string(value)?;
        Ok(Self::new(kind, payload, topic_pattern, app_version))
    }

    /// Set the producing identity.
    #[must_use]
    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    /// Set the producing session.
    #[must_use]
    pub fn with_session(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }
}

/// A message as stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Queue position (monotonic row id).
    pub id: i64,
    /// The message.
    pub message: TelemetryMessage,
    /// Delivery state.
    pub state: DeliveryState,
    /// Number of publish attempts so far.
    pub attempts: u32,
}

/// Queue occupancy summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Messages waiting to be published.
    pub pending: usize,
    /// Messages handed to the broker and awaiting confirmation.
    pub in_flight: usize,
    /// Messages without a producing identity.
    pub unowned: usize,
}

impl QueueStats {
    /// Total number of undelivered messages.
    pub fn total(&self) -> usize {
        self.pending + self.in_flight
    }
}
