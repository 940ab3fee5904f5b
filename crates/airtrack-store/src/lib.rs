//! Durable local storage for airtrack.
//!
//! This crate provides SQLite-based persistence for the two pieces of state
//! that must survive a restart: the list of known devices (with their desired
//! and last-known connection states) and the outbound telemetry queue.
//!
//! # Features
//!
//! - Device records keyed by hardware address
//! - FIFO telemetry queue with pending / in-flight delivery states
//! - Crash recovery: in-flight messages return to pending on open
//! - Deferred ownership for messages enqueued before sign-in
//! - A persistent application id
//!
//! # Example
//!
//! ```no_run
//! use airtrack_store::{Store, TelemetryMessage};
//! use airtrack_types::TelemetryKind;
//!
//! let store = Store::open_default()?;
//!
//! let message = TelemetryMessage::new(
//!     TelemetryKind::Heartbeat,
//!     r#"{"battery_percentage":80}"#,
//!     "heartbeats/{username}/airtrack",
//!     "0.1.0",
//! );
//! let id = store.enqueue(&message)?;
//! store.acknowledge(id)?;
//! # Ok::<(), airtrack_store::Error>(())
//! ```

mod error;
mod models;
mod schema;
mod store;

pub use error::{Error, Result};
pub use models::{DeviceRecord, QueueStats, QueuedMessage, TelemetryMessage};
pub use store::Store;

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/airtrack/airtrack.db`
/// - macOS: `~/Library/Application Support/airtrack/airtrack.db`
/// - Windows: `C:\Users\<user>\AppData\Local\airtrack\airtrack.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("airtrack")
        .join("airtrack.db")
}
