//! Device event system for connection and reading notifications.
//!
//! This module provides an event-based system for receiving notifications
//! about device connections, disconnections, reconnect attempts and readings.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use airtrack_types::{ConnectionState, DeviceFamily, Reading};

/// Device identifier for events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    /// Hardware address.
    pub address: String,
    /// Device family.
    pub family: DeviceFamily,
}

impl DeviceId {
    /// Create a new device ID.
    pub fn new(address: impl Into<String>, family: DeviceFamily) -> Self {
        Self {
            address: address.into(),
            family,
        }
    }
}

/// Events that can be emitted by devices.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum DeviceEvent {
    /// Transport handshake completed.
    Connected { device: DeviceId },
    /// Connection torn down.
    Disconnected {
        device: DeviceId,
        reason: DisconnectReason,
    },
    /// Actual connection state changed.
    StateChanged {
        device: DeviceId,
        state: ConnectionState,
    },
    /// New reading decoded from the device.
    Reading { device: DeviceId, reading: Reading },
    /// Reconnection attempt started.
    ReconnectStarted { device: DeviceId, attempt: u32 },
    /// Reconnection succeeded.
    ReconnectSucceeded { device: DeviceId, attempts: u32 },
    /// Device was unlinked and forgotten.
    Removed { device: DeviceId },
    /// Error occurred during device operation.
    Error { device: DeviceId, error: String },
}

/// Reason for disconnection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Normal disconnection requested by user.
    UserRequested,
    /// The transport closed or failed.
    TransportLost(String),
    /// No advertisement arrived within the idle timeout.
    IdleTimeout,
    /// A forced reconnect closed the link.
    Forced,
    /// The supervisor is shutting down.
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UserRequested => write!(f, "user requested"),
            Self::TransportLost(msg) => write!(f, "transport lost: {}", msg),
            Self::IdleTimeout => write!(f, "idle timeout"),
            Self::Forced => write!(f, "forced reconnect"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Sender for device events.
pub type EventSender = broadcast::Sender<DeviceEvent>;

/// Receiver for device events.
pub type EventReceiver = broadcast::Receiver<DeviceEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: DeviceEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = DeviceEvent::Disconnected {
            device: DeviceId::new("AA:BB", DeviceFamily::AirBeam2),
            reason: DisconnectReason::IdleTimeout,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"disconnected\""));
        assert!(json.contains("\"family\":\"AirBeam2\""));
        assert!(json.contains("IdleTimeout"));
    }

    #[tokio::test]
    async fn test_dispatcher_fan_out() {
        let dispatcher = EventDispatcher::default();
        let mut rx1 = dispatcher.subscribe();
        let mut rx2 = dispatcher.subscribe();
        assert_eq!(dispatcher.receiver_count(), 2);

        dispatcher.send(DeviceEvent::Removed {
            device: DeviceId::new("AA:BB", DeviceFamily::RuuviTag),
        });

        assert!(matches!(rx1.recv().await.unwrap(), DeviceEvent::Removed { .. }));
        assert!(matches!(rx2.recv().await.unwrap(), DeviceEvent::Removed { .. }));
    }

    #[test]
    fn test_send_without_receivers_is_silent() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.send(DeviceEvent::Connected {
            device: DeviceId::new("AA:BB", DeviceFamily::AirBeam3),
        });
        assert_eq!(dispatcher.receiver_count(), 0);
    }

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(
            DisconnectReason::TransportLost("eof".into()).to_string(),
            "transport lost: eof"
        );
        assert_eq!(DisconnectReason::Forced.to_string(), "forced reconnect");
    }
}
