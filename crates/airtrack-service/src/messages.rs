//! Telemetry message payloads.
//!
//! Every payload is an [`Envelope`]: the value itself plus the session
//! metadata the backend uses to group and order messages.

use serde::{Deserialize, Serialize};

use airtrack_store::TelemetryMessage;
use airtrack_types::{Heartbeat, LocationFix, Reading, TelemetryKind};

use crate::topics::TopicSet;

/// JSON payload of a telemetry message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Persistent installation id.
    pub app_id: String,
    /// Version of the producing application.
    pub app_version: String,
    /// Producing identity at session start.
    pub username: Option<String>,
    /// Tracking session id.
    pub session_id: String,
    /// Per-session message counter.
    pub sequence: u64,
    /// The reading, fix or heartbeat.
    pub value: T,
}

/// Metadata shared by every message of one tracking session.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Persistent installation id.
    pub app_id: String,
    /// Version of the producing application.
    pub app_version: String,
    /// Identity snapshot taken at session start.
    pub username: Option<String>,
    /// Session id.
    pub session_id: String,
    /// Topic flavor.
    pub topics: TopicSet,
}

impl MessageContext {
    /// Message for a sensor reading.
    pub fn reading(
        &self,
        reading: Reading,
        sequence: u64,
    ) -> airtrack_store::Result<TelemetryMessage> {
        self.build(TelemetryKind::Reading, reading, sequence)
    }

    /// Message for a location fix.
    pub fn location(
        &self,
        fix: LocationFix,
        sequence: u64,
    ) -> airtrack_store::Result<TelemetryMessage> {
        self.build(TelemetryKind::Location, fix, sequence)
    }

    /// Message for a heartbeat.
    pub fn heartbeat(
        &self,
        heartbeat: Heartbeat,
        sequence: u64,
    ) -> airtrack_store::Result<TelemetryMessage> {
        self.build(TelemetryKind::Heartbeat, heartbeat, sequence)
    }

    fn build<T: Serialize>(
        &self,
        kind: TelemetryKind,
        value: T,
        sequence: u64,
    ) -> airtrack_store::Result<TelemetryMessage> {
        let envelope = Envelope {
            app_id: self.app_id.clone(),
            app_version: self.app_version.clone(),
            username: self.username.clone(),
            session_id: self.session_id.clone(),
            sequence,
            value,
        };
        let message = TelemetryMessage::from_json(
            kind,
            &envelope,
            self.topics.pattern(kind),
            self.app_version.clone(),
        )?;
        Ok(message
            .with_username(self.username.clone())
            .with_session(Some(self.session_id.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use airtrack_types::{DeviceFamily, MeasurementKind};
    use time::OffsetDateTime;

    fn context(username: Option<&str>) -> MessageContext {
        MessageContext {
            app_id: "4f6c".into(),
            app_version: "0.1.0".into(),
            username: username.map(str::to_string),
            session_id: "session-1".into(),
            topics: TopicSet::production(),
        }
    }

    #[test]
    fn test_reading_message() {
        let reading = Reading {
            sensor_id: "00:18:96:10:57:A2".into(),
            family: DeviceFamily::AirBeam3,
            kind: MeasurementKind::Pm2_5,
            value: Some(12.3),
            timestamp: OffsetDateTime::now_utc(),
            raw: "12.3;AirBeam3:0018961057a2;AirBeam3-PM2.5".into(),
            location: None,
            sequence: Some(7),
        };

        let message = context(Some("alice")).reading(reading, 7).unwrap();
        assert_eq!(message.kind, TelemetryKind::Reading);
        assert_eq!(message.topic_pattern, "sensors/{username}/airtrack-v1");
        assert_eq!(message.username.as_deref(), Some("alice"));
        assert_eq!(message.session_id.as_deref(), Some("session-1"));

        let envelope: serde_json::Value = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(envelope["sequence"], 7);
        assert_eq!(envelope["app_id"], "4f6c");
        assert_eq!(envelope["value"]["value"], 12.3);
        assert_eq!(envelope["value"]["sensor_id"], "00:18:96:10:57:A2");
    }

    #[test]
    fn test_heartbeat_message_without_identity() {
        let heartbeat = Heartbeat {
            timestamp: OffsetDateTime::now_utc(),
            app_id: "4f6c".into(),
            battery_percentage: Some(80),
            power_save: None,
        };

        let message = context(None).heartbeat(heartbeat, 1).unwrap();
        assert!(message.username.is_none());
        assert_eq!(message.topic_pattern, "heartbeats/{username}/airtrack");

        let envelope: Envelope<Heartbeat> = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(envelope.value.battery_percentage, Some(80));
        assert_eq!(envelope.username, None);
    }
}
