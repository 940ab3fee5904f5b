//! Telemetry topic templates.
//!
//! Every topic is a template with a `{username}` placeholder. Messages store
//! the template and the producing identity; the topic string is rendered
//! only at delivery time, so a message enqueued before sign-in can still be
//! addressed once an identity is known.
//!
//! | Kind      | Production                           | Debug                                     |
//! |-----------|--------------------------------------|-------------------------------------------|
//! | Reading   | `sensors/{username}/airtrack-v1`     | `sensors/{username}/airtrack-v1-debug`    |
//! | Location  | `locations/{username}/airtrack`      | `locations/{username}/airtrack-debug`     |
//! | Heartbeat | `heartbeats/{username}/airtrack`     | `heartbeats/{username}/airtrack-debug`    |

use airtrack_types::TelemetryKind;

/// Placeholder replaced by the producing username.
pub const USERNAME_PLACEHOLDER: &str = "{username}";

const DEBUG_SUFFIX: &str = "-debug";

/// Topic templates for one deployment flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TopicSet {
    debug: bool,
}

impl TopicSet {
    /// Production topics.
    pub fn production() -> Self {
        Self { debug: false }
    }

    /// Debug topics.
    pub fn debug() -> Self {
        Self { debug: true }
    }

    /// Topics for the given flavor.
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    /// Template for a message kind.
    pub fn pattern(&self, kind: TelemetryKind) -> String {
        let base = match kind {
            TelemetryKind::Reading => "sensors/{username}/airtrack-v1",
            TelemetryKind::Location => "locations/{username}/airtrack",
            TelemetryKind::Heartbeat => "heartbeats/{username}/airtrack",
        };
        if self.debug {
            format!("{base}{DEBUG_SUFFIX}")
        } else {
            base.to_string()
        }
    }
}

/// Render a template for `username`.
pub fn render(pattern: &str, username: &str) -> String {
    pattern.replace(USERNAME_PLACEHOLDER, &sanitize_topic_segment(username))
}

/// Sanitize a string for use as a single topic level.
///
/// Replaces MQTT wildcards (`#`, `+`), the level separator and spaces.
pub fn sanitize_topic_segment(s: &str) -> String {
    s.replace(['#', '+', ' ', '/'], "_")
}
