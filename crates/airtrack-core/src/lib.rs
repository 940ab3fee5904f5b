//! Device connections for airtrack sensors.
//!
//! This crate owns everything between a sensor and a decoded [`Reading`]:
//! transports for each device family, the per-device connection state
//! machine, and the supervisor that keeps the user's devices connected.
//!
//! # Features
//!
//! - **Transports**: GATT notifications (AirBeam3, AirBeamMini), serial lines
//!   (AirBeam2) and beacon advertisements (RuuviTag) behind one trait
//! - **Device discovery**: Scan for nearby supported sensors via BLE
//! - **Connection state machine**: Idempotent connect, a single teardown path,
//!   idle timeouts for beacons
//! - **Supervision**: Persisted desired/actual state, automatic reconnection
//!   with configurable backoff
//! - **Testing**: A mock transport that injects payloads, failures and drops
//!
//! # Supported Devices
//!
//! | Device | Transport | Sensors |
//! |--------|-----------|---------|
//! | AirBeam3 | GATT | PM1, PM2.5, PM10, Temperature, Humidity |
//! | AirBeamMini | GATT | PM1, PM2.5 |
//! | AirBeam2 | Serial socket | PM1, PM2.5, PM10, Temperature, Humidity |
//! | RuuviTag | Advertisement | Temperature, Humidity, Pressure |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use airtrack_core::{BluetoothTransportFactory, ConnectionSupervisor, SupervisorConfig};
//! use airtrack_store::Store;
//! use airtrack_types::DeviceFamily;
//! use tokio::sync::Mutex;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(Mutex::new(Store::open_default()?));
//!     let factory = Arc::new(BluetoothTransportFactory::default());
//!     let supervisor = ConnectionSupervisor::new(store, factory, SupervisorConfig::default());
//!
//!     let mut readings = supervisor.subscribe_readings();
//!     supervisor
//!         .connect("00:18:96:10:57:A2", DeviceFamily::AirBeam3, true)
//!         .await?;
//!
//!     while let Ok(reading) = readings.recv().await {
//!         println!("{}: {:?}", reading.kind, reading.value);
//!     }
//!     Ok(())
//! }
//! ```

pub mod advertisement;
pub mod connection;
pub mod error;
pub mod events;
pub mod gatt;
pub mod mock;
pub mod reconnect;
pub mod scan;
pub mod socket;
pub mod supervisor;
pub mod transport;
pub mod util;

pub use airtrack_types::uuid;
pub use airtrack_types::{ConnectionState, DeviceFamily, MeasurementKind, Reading, TransportKind};

pub use advertisement::{Advertisement, AdvertisementScanner, AdvertisementTransport};
pub use connection::DeviceConnection;
pub use error::{Error, Result, TransportFailure};
pub use events::{
    DeviceEvent, DeviceId, DisconnectReason, EventDispatcher, EventReceiver, EventSender,
};
pub use gatt::GattTransport;
pub use mock::{MockTransport, MockTransportFactory};
pub use reconnect::ReconnectOptions;
pub use scan::{DiscoveredDevice, ScanOptions, scan_with_options};
pub use socket::{SocketEndpoint, SocketTransport};
pub use supervisor::{ConnectionSupervisor, DeviceSnapshot, SharedStore, SupervisorConfig};
pub use transport::{
    BluetoothTransportFactory, PayloadStream, Transport, TransportFactory, TransportSettings,
};
pub use util::{create_identifier, format_peripheral_id};
