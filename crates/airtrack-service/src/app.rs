//! Daemon wiring.
//!
//! [`App`] builds every component from the configuration with explicit
//! dependencies and tears them down in reverse order.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use airtrack_core::{
    BluetoothTransportFactory, ConnectionState, ConnectionSupervisor, SharedStore,
    SupervisorConfig, TransportFactory,
};
use airtrack_store::Store;

use crate::config::{Config, DeviceConfig};
use crate::error::Result;
use crate::gpsd::GpsdClient;
use crate::identity::StaticIdentityProvider;
use crate::location::LocationFeed;
use crate::mqtt::{MqttTransport, PublishTransport};
use crate::power::{PowerStatus, SysfsPowerStatus};
use crate::publisher::{PublisherConfig, TelemetryPublisher};
use crate::tracking::{TrackingSession, TrackingSettings};

/// Replaceable edges of the daemon.
pub struct Components {
    /// Creates device transports.
    pub factory: Arc<dyn TransportFactory>,
    /// Broker connection.
    pub broker: Arc<dyn PublishTransport>,
    /// Host power status.
    pub power: Arc<dyn PowerStatus>,
}

impl Components {
    /// Production components for `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut factory = BluetoothTransportFactory::new(config.bluetooth.transport_settings());
        for device in &config.devices {
            if let Some(endpoint) = device.socket_endpoint() {
                factory = factory.with_endpoint(device.address.as_str(), endpoint);
            }
        }

        Ok(Self {
            factory: Arc::new(factory),
            broker: Arc::new(MqttTransport::new(&config.mqtt)?),
            power: Arc::new(SysfsPowerStatus::new()),
        })
    }
}

/// The running daemon.
pub struct App {
    /// Shared store.
    pub store: SharedStore,
    /// Device connections.
    pub supervisor: Arc<ConnectionSupervisor>,
    /// Telemetry queue and broker leg.
    pub publisher: Arc<TelemetryPublisher>,
    /// Tracking session.
    pub tracking: Arc<TrackingSession>,
    /// Signed-in identity.
    pub identity: Arc<StaticIdentityProvider>,
    /// Latest location fix.
    pub location: Arc<LocationFeed>,
    gpsd: Option<(CancellationToken, JoinHandle<()>)>,
}

impl App {
    /// Open the configured store and start with production components.
    pub async fn start(config: &Config) -> Result<Self> {
        info!("Opening database at {:?}", config.storage.path);
        let store = Store::open(&config.storage.path)?;
        let components = Components::from_config(config)?;
        Self::start_with(config, store, components).await
    }

    /// Start with the given store and components.
    pub async fn start_with(config: &Config, store: Store, components: Components) -> Result<Self> {
        let store: SharedStore = Arc::new(Mutex::new(store));
        let reconnect = config.bluetooth.reconnect_options();

        let supervisor = ConnectionSupervisor::new(
            Arc::clone(&store),
            components.factory,
            SupervisorConfig {
                reconnect: reconnect.clone(),
                transport: config.bluetooth.transport_settings(),
                ..Default::default()
            },
        );
        sync_devices(&supervisor, &config.devices).await?;
        let restored = supervisor.load().await?;
        info!("Restored {} devices", restored);

        let identity = Arc::new(StaticIdentityProvider::from_config(&config.identity)?);
        let location = Arc::new(LocationFeed::new());
        let gpsd = config.location.enabled.then(|| {
            let cancel = CancellationToken::new();
            let client = GpsdClient::new(
                config.location.gpsd.clone(),
                Arc::clone(&location),
                reconnect.clone(),
            );
            (cancel.clone(), client.spawn(cancel))
        });

        let publisher = TelemetryPublisher::new(
            Arc::clone(&store),
            components.broker,
            identity.clone(),
            PublisherConfig {
                reconnect,
                ..Default::default()
            },
        );
        let tracking = Arc::new(TrackingSession::new(
            Arc::clone(&supervisor),
            Arc::clone(&publisher),
            identity.clone(),
            location.clone(),
            components.power,
            TrackingSettings::from_config(&config.tracking, config.identity.track_only.clone()),
        ));

        if config.tracking.start_on_launch {
            tracking.start().await?;
        }

        Ok(Self {
            store,
            supervisor,
            publisher,
            tracking,
            identity,
            location,
            gpsd,
        })
    }

    /// Stop tracking, close every connection and stop the location source.
    ///
    /// Desired device states are kept for the next start.
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.tracking.stop().await;
        self.supervisor.reset().await;
        if let Some((cancel, task)) = self.gpsd {
            cancel.cancel();
            if let Err(e) = task.await {
                warn!("gpsd task ended abnormally: {}", e);
            }
        }
    }
}

/// Register configured devices and apply their `connect` flag.
async fn sync_devices(supervisor: &ConnectionSupervisor, devices: &[DeviceConfig]) -> Result<()> {
    for device in devices {
        let record = supervisor
            .add_device(&device.address, device.family, device.label.clone())
            .await?;
        let desired = if device.connect {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        supervisor
            .store()
            .lock()
            .await
            .set_desired_state(&record.address, desired)?;
    }
    Ok(())
}
