//! Transport abstraction shared by every device family.
//!
//! A [`Transport`] hides how payloads arrive (GATT notifications, a
//! line-oriented socket, or BLE advertisements). Opening a transport yields a
//! [`PayloadStream`]; the stream ending, or yielding an error, means the link
//! is gone and the owning connection tears down through its single
//! disconnect path.
//!
//! Transports are created by a [`TransportFactory`] keyed on the device
//! family, which lets tests inject [`crate::mock::MockTransportFactory`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use airtrack_types::{DeviceFamily, TransportKind};

use crate::advertisement::{AdvertisementScanner, AdvertisementTransport};
use crate::error::{Error, Result, TransportFailure};
use crate::gatt::GattTransport;
use crate::socket::{SocketEndpoint, SocketTransport};

/// Stream of raw payloads from an open transport.
pub type PayloadStream = BoxStream<'static, Result<Vec<u8>>>;

/// Default time allowed for a transport handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Default idle timeout for advertisement-only devices.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// A physical link to one device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The kind of link this transport drives.
    fn kind(&self) -> TransportKind;

    /// Perform the handshake and start delivering payloads.
    async fn open(&self) -> Result<PayloadStream>;

    /// Close the link. Closing an already closed transport is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Creates transports for device families.
pub trait TransportFactory: Send + Sync {
    /// Create a transport for the device at `address`.
    fn create(&self, address: &str, family: DeviceFamily) -> Result<Arc<dyn Transport>>;

    /// Release adapter-wide resources such as a running scan.
    fn shutdown(&self) {}
}

/// Timing applied to every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Upper bound for a handshake.
    pub connect_timeout: Duration,
    /// Silence after which an advertisement-only device counts as gone.
    pub idle_timeout: Duration,
    /// How long a GATT transport scans for a peripheral not yet known to the adapter.
    pub scan_duration: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            scan_duration: Duration::from_secs(5),
        }
    }
}

impl TransportSettings {
    /// Idle timeout to apply for a transport kind, if any.
    pub fn idle_timeout_for(&self, kind: TransportKind) -> Option<Duration> {
        match kind {
            TransportKind::Advertisement => Some(self.idle_timeout),
            TransportKind::Gatt | TransportKind::ClassicSocket => None,
        }
    }
}

/// Production factory backed by btleplug and the local socket layer.
pub struct BluetoothTransportFactory {
    settings: TransportSettings,
    endpoints: HashMap<String, SocketEndpoint>,
    scanner: Arc<AdvertisementScanner>,
}

impl BluetoothTransportFactory {
    /// Create a factory with the given timing.
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            endpoints: HashMap::new(),
            scanner: Arc::new(AdvertisementScanner::new()),
        }
    }

    /// Register the socket endpoint of a classic-socket device.
    #[must_use]
    pub fn with_endpoint(mut self, address: impl Into<String>, endpoint: SocketEndpoint) -> Self {
        self.endpoints
            .insert(address.into().to_uppercase(), endpoint);
        self
    }

    /// The shared advertisement scanner.
    pub fn scanner(&self) -> &Arc<AdvertisementScanner> {
        &self.scanner
    }
}

impl Default for BluetoothTransportFactory {
    fn default() -> Self {
        Self::new(TransportSettings::default())
    }
}

impl TransportFactory for BluetoothTransportFactory {
    fn create(&self, address: &str, family: DeviceFamily) -> Result<Arc<dyn Transport>> {
        match family.transport() {
            TransportKind::Gatt => Ok(Arc::new(GattTransport::new(
                address,
                family,
                self.settings.scan_duration,
            ))),
            TransportKind::ClassicSocket => {
                let endpoint = self
                    .endpoints
                    .get(&address.to_uppercase())
                    .cloned()
                    .ok_or_else(|| Error::transport(address, TransportFailure::NoEndpoint))?;
                Ok(Arc::new(SocketTransport::new(address, endpoint)))
            }
            TransportKind::Advertisement => Ok(Arc::new(AdvertisementTransport::new(
                address,
                Arc::clone(&self.scanner),
            ))),
        }
    }

    fn shutdown(&self) {
        self.scanner.stop();
    }
}
