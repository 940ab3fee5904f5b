//! Tracking daemon relaying airtrack sensor readings to an MQTT broker.
//!
//! This crate ties the device layer to the backend:
//! - Restores known devices and keeps the wanted ones connected
//! - Runs a tracking session that turns readings, location fixes and
//!   heartbeats into telemetry messages
//! - Queues every message durably and publishes it with at-least-once
//!   delivery, in enqueue order
//!
//! # Configuration
//!
//! The daemon reads `~/.config/airtrack/airtrack.toml`:
//!
//! ```toml
//! [mqtt]
//! broker = "mqtts://broker.example.com"
//!
//! [identity]
//! username = "alice"
//! token = "..."
//! roles = { "airtrack-app" = ["mqtt"] }
//!
//! [location]
//! enabled = true
//! gpsd = "127.0.0.1:2947"
//!
//! [[devices]]
//! address = "00:18:96:10:57:A2"
//! family = "AirBeam3"
//! label = "Backpack"
//!
//! [[devices]]
//! address = "00:18:96:10:33:07"
//! family = "AirBeam2"
//! endpoint = "/dev/rfcomm0"
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod gpsd;
pub mod identity;
pub mod location;
pub mod messages;
pub mod mock;
pub mod mqtt;
pub mod power;
pub mod publisher;
pub mod topics;
pub mod tracking;

pub use app::{App, Components};
pub use config::{Config, ConfigError, DeviceConfig, ValidationError};
pub use error::{AuthorizationError, Error, PublishError, Result};
pub use identity::{Identity, IdentityProvider, StaticIdentityProvider};
pub use location::{LocationFeed, LocationProvider};
pub use mock::MockBroker;
pub use mqtt::{Credentials, MqttTransport, PublishTransport};
pub use power::{PowerStatus, StaticPowerStatus, SysfsPowerStatus};
pub use publisher::{PublisherConfig, TelemetryPublisher};
pub use topics::TopicSet;
pub use tracking::{TrackingSession, TrackingSettings, TrackingState};
