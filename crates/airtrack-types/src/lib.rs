//! Platform-agnostic types for airtrack sensors.
//!
//! This crate provides the shared data model used by the connection layer
//! (airtrack-core), the persistence layer (airtrack-store) and the tracking
//! service (airtrack-service).
//!
//! # Features
//!
//! - Device families, connection states and measurement kinds
//! - Readings, location fixes and heartbeats
//! - Stateless payload decoders for line and advertisement formats
//! - UUID constants for BLE and RFCOMM
//!
//! # Example
//!
//! ```
//! use airtrack_types::{DeviceFamily, MeasurementKind, decode};
//! use time::OffsetDateTime;
//!
//! let readings = decode::decode(
//!     "00:18:96:10:57:A2",
//!     DeviceFamily::AirBeam3,
//!     b"12.3;AirBeam3:0018961057a2;AirBeam3-PM2.5",
//!     OffsetDateTime::now_utc(),
//! )
//! .unwrap();
//! assert_eq!(readings[0].kind, MeasurementKind::Pm2_5);
//! ```

pub mod decode;
pub mod error;
pub mod types;
pub mod uuid;

pub use error::{DecodeError, DecodeResult};
pub use types::{
    ConnectionState, DeliveryState, DeviceFamily, Heartbeat, LocationFix, MeasurementKind,
    Reading, TelemetryKind, TransportKind,
};
pub use uuid as uuids;
