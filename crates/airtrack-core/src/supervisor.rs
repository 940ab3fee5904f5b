//! Multi-device connection supervision.
//!
//! The [`ConnectionSupervisor`] owns the set of known devices, persists their
//! desired and actual connection state, and closes the gap between the two
//! with backoff. It also aggregates readings and lifecycle events across all
//! devices and exposes whether any device is connected.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airtrack_store::{DeviceRecord, Store};
use airtrack_types::{ConnectionState, DeviceFamily, Reading};

use crate::connection::DeviceConnection;
use crate::error::{Error, Result, TransportFailure};
use crate::events::{DeviceEvent, DeviceId, DisconnectReason, EventDispatcher};
use crate::reconnect::{ReconnectOptions, sleep_or_cancel};
use crate::transport::{TransportFactory, TransportSettings};

/// Store handle shared between the supervisor and the telemetry publisher.
pub type SharedStore = Arc<Mutex<Store>>;

/// Configuration for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Backoff between connection attempts.
    pub reconnect: ReconnectOptions,
    /// Timing handed to every connection.
    pub transport: TransportSettings,
    /// Event channel capacity.
    pub event_capacity: usize,
    /// Aggregated reading channel capacity.
    pub reading_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectOptions::default(),
            transport: TransportSettings::default(),
            event_capacity: 100,
            reading_capacity: 256,
        }
    }
}

/// Point-in-time view of a known device.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    /// Persisted record.
    pub record: DeviceRecord,
    /// Live connection state.
    pub state: ConnectionState,
    /// Last reading per measurement kind.
    pub readings: Vec<Reading>,
}

struct ManagedDevice {
    connection: Arc<DeviceConnection>,
    /// Stops the state/reading monitor when the device is forgotten.
    monitor: CancellationToken,
}

#[derive(Default)]
struct DeviceTasks {
    /// Cancels the retry loop and the reconnect keeper.
    cancel: CancellationToken,
    keeper: Option<JoinHandle<()>>,
    /// Outcome of the connect in progress; `None` until it finishes.
    pending: Option<watch::Receiver<Option<ConnectOutcome>>>,
}

/// How a supervised connect ended, as seen by callers that joined it.
#[derive(Debug, Clone)]
enum ConnectOutcome {
    Connected,
    Cancelled,
    Failed(String),
}

impl ConnectOutcome {
    fn of(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self::Connected,
            Err(Error::Cancelled) => Self::Cancelled,
            Err(e) => Self::Failed(e.to_string()),
        }
    }
}

enum ConnectTurn {
    Lead {
        cancel: CancellationToken,
        outcome: watch::Sender<Option<ConnectOutcome>>,
    },
    Join(watch::Receiver<Option<ConnectOutcome>>),
}

/// Owner of every device connection.
pub struct ConnectionSupervisor {
    devices: RwLock<HashMap<String, ManagedDevice>>,
    tasks: Mutex<HashMap<String, DeviceTasks>>,
    store: SharedStore,
    factory: Arc<dyn TransportFactory>,
    config: SupervisorConfig,
    any_connected: watch::Sender<bool>,
    readings: broadcast::Sender<Reading>,
    events: EventDispatcher,
    this: Weak<ConnectionSupervisor>,
}

/// Canonical form of a hardware address.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_uppercase()
}

impl ConnectionSupervisor {
    /// Create a supervisor over a store and a transport factory.
    pub fn new(
        store: SharedStore,
        factory: Arc<dyn TransportFactory>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        let (any_connected, _) = watch::channel(false);
        let (readings, _) = broadcast::channel(config.reading_capacity);
        let events = EventDispatcher::new(config.event_capacity);
        Arc::new_cyclic(|this| Self {
            devices: RwLock::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            store,
            factory,
            config,
            any_connected,
            readings,
            events,
            this: this.clone(),
        })
    }

    /// Lifecycle events of every device.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Readings of every device.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<Reading> {
        self.readings.subscribe()
    }

    /// Whether at least one device is connected.
    pub fn has_any_connected(&self) -> watch::Receiver<bool> {
        self.any_connected.subscribe()
    }

    /// The shared store handle.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Restore persisted devices and resume those that should be connected.
    ///
    /// Returns the number of devices restored.
    pub async fn load(&self) -> Result<usize> {
        let records = self.store.lock().await.list_devices()?;
        let count = records.len();

        for record in records {
            if let Err(e) = self.ensure_connection(&record.address, record.family).await {
                warn!("Cannot manage {}: {}", record.address, e);
                continue;
            }
            if record.desired_state == ConnectionState::Connected {
                info!("Resuming connection to {}", record.address);
                self.spawn_connect(record.address, record.family);
            }
        }

        info!("Restored {} device(s)", count);
        Ok(count)
    }

    /// Persist a device without connecting to it.
    pub async fn add_device(
        &self,
        address: &str,
        family: DeviceFamily,
        label: Option<String>,
    ) -> Result<DeviceRecord> {
        let address = normalize_address(address);
        let record = {
            let store = self.store.lock().await;
            let mut record = match store.get_device(&address)? {
                Some(existing) if existing.family != family => {
                    return Err(Error::invalid_config(format!(
                        "{} is already known as {}",
                        address, existing.family
                    )));
                }
                Some(existing) => existing,
                None => DeviceRecord::new(address.clone(), family),
            };
            if let Some(label) = label {
                record.label = label;
            }
            store.upsert_device(&record)?;
            record
        };

        if let Err(e) = self.ensure_connection(&address, family).await {
            warn!("Added {} but it cannot be connected yet: {}", address, e);
        } else {
            info!("Added device {} ({})", address, family);
        }
        Ok(record)
    }

    /// Connect to a device, adding it first if it is unknown.
    ///
    /// With `with_retry`, failed attempts are retried with backoff until one
    /// succeeds, the options run out of attempts, or the device is
    /// disconnected. Without it, a single attempt is made and a failure sets
    /// the desired state back to disconnected. After a successful connect a
    /// reconnect task keeps the device connected across drops.
    ///
    /// Only one connect runs per address. A call made while another is in
    /// progress, including its backoff, waits for that call and returns its
    /// outcome.
    pub async fn connect(
        &self,
        address: &str,
        family: DeviceFamily,
        with_retry: bool,
    ) -> Result<()> {
        let address = normalize_address(address);
        if self.store.lock().await.get_device(&address)?.is_none() {
            self.add_device(&address, family, None).await?;
        }
        let connection = self.ensure_connection(&address, family).await?;

        let (cancel, outcome) = match self.join_or_lead(&address).await {
            ConnectTurn::Join(mut outcome) => {
                debug!("Connect to {} already in progress, waiting for it", address);
                return wait_for_outcome(&address, &mut outcome).await;
            }
            ConnectTurn::Lead { cancel, outcome } => (cancel, outcome),
        };

        let result = self
            .run_connect(&address, family, &connection, with_retry, &cancel)
            .await;
        outcome.send_replace(Some(ConnectOutcome::of(&result)));
        result
    }

    /// Disconnect a device and stop reconnecting it.
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        let address = normalize_address(address);
        self.cancel_tasks(&address).await;

        let updated = self
            .store
            .lock()
            .await
            .set_desired_state(&address, ConnectionState::Disconnected);
        match updated {
            Ok(()) => {}
            Err(airtrack_store::Error::DeviceNotFound(_)) => {
                return Err(Error::device_not_found(address));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(connection) = self.connection(&address).await {
            connection.disconnect().await?;
            connection.clear_reconnecting().await;
        }
        Ok(())
    }

    /// Disconnect every device (in parallel).
    ///
    /// Returns a map of addresses to disconnection results.
    pub async fn disconnect_all(&self) -> HashMap<String, Result<()>> {
        let addresses = self.addresses().await;
        let futures = addresses.into_iter().map(|address| async move {
            let result = self.disconnect(&address).await;
            (address, result)
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Force the live link of a device to drop; the reconnect task recovers it.
    pub async fn force_reconnect(&self, address: &str) -> Result<()> {
        let address = normalize_address(address);
        let connection = self
            .connection(&address)
            .await
            .ok_or_else(|| Error::device_not_found(&address))?;
        connection.force_reconnect().await
    }

    /// Disconnect and forget a device.
    ///
    /// Returns `false` if the device was not known.
    pub async fn remove(&self, address: &str) -> Result<bool> {
        let address = normalize_address(address);
        self.cancel_tasks(&address).await;

        let managed = self.devices.write().await.remove(&address);
        if let Some(managed) = &managed {
            managed.monitor.cancel();
            managed.connection.disconnect().await?;
        }

        let deleted = self.store.lock().await.delete_device(&address)?;
        self.refresh_any_connected().await;

        if let Some(managed) = managed {
            self.events.send(DeviceEvent::Removed {
                device: DeviceId::new(address.clone(), managed.connection.device_family()),
            });
        }
        if deleted {
            info!("Removed device {}", address);
        }
        Ok(deleted)
    }

    /// Tear down every connection and cancel all retry tasks.
    ///
    /// Desired states are kept so a later [`load`](Self::load) resumes them.
    pub async fn reset(&self) {
        let tasks: Vec<DeviceTasks> = self.tasks.lock().await.drain().map(|(_, t)| t).collect();
        for task in &tasks {
            task.cancel.cancel();
        }

        let connections: Vec<Arc<DeviceConnection>> = self
            .devices
            .read()
            .await
            .values()
            .map(|m| Arc::clone(&m.connection))
            .collect();
        for connection in connections {
            if let Err(e) = connection
                .disconnect_with_reason(DisconnectReason::Shutdown)
                .await
            {
                debug!("Disconnect of {} during reset failed: {}", connection.address(), e);
            }
            connection.clear_reconnecting().await;
        }

        for task in tasks {
            if let Some(handle) = task.keeper {
                let _ = handle.await;
            }
        }
        self.factory.shutdown();
        info!("Supervisor reset");
    }

    /// Live connection of a device.
    pub async fn connection(&self, address: &str) -> Option<Arc<DeviceConnection>> {
        self.devices
            .read()
            .await
            .get(&normalize_address(address))
            .map(|m| Arc::clone(&m.connection))
    }

    /// Snapshots of every known device, ordered by address.
    pub async fn devices(&self) -> Result<Vec<DeviceSnapshot>> {
        let records = self.store.lock().await.list_devices()?;
        let mut snapshots = Vec::with_capacity(records.len());
        for record in records {
            let (state, readings) = match self.connection(&record.address).await {
                Some(connection) => (connection.state(), connection.cached_readings().await),
                None => (record.actual_state, Vec::new()),
            };
            snapshots.push(DeviceSnapshot {
                record,
                state,
                readings,
            });
        }
        Ok(snapshots)
    }

    /// Number of known devices.
    pub async fn device_count(&self) -> Result<usize> {
        Ok(self.store.lock().await.list_devices()?.len())
    }

    /// Number of devices the user wants connected.
    pub async fn desired_connected_count(&self) -> Result<usize> {
        Ok(self
            .store
            .lock()
            .await
            .list_devices()?
            .iter()
            .filter(|r| r.desired_state == ConnectionState::Connected)
            .count())
    }

    async fn addresses(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Get or create the connection of a device and its monitor.
    async fn ensure_connection(
        &self,
        address: &str,
        family: DeviceFamily,
    ) -> Result<Arc<DeviceConnection>> {
        if let Some(managed) = self.devices.read().await.get(address) {
            return Ok(Arc::clone(&managed.connection));
        }

        let mut devices = self.devices.write().await;
        if let Some(managed) = devices.get(address) {
            return Ok(Arc::clone(&managed.connection));
        }

        let transport = self.factory.create(address, family)?;
        let connection = Arc::new(
            DeviceConnection::new(address, family, transport, self.config.transport)
                .with_events(self.events.clone()),
        );

        let monitor = CancellationToken::new();
        self.spawn_monitor(Arc::clone(&connection), monitor.clone());
        devices.insert(
            address.to_string(),
            ManagedDevice {
                connection: Arc::clone(&connection),
                monitor,
            },
        );
        Ok(connection)
    }

    /// Persist state changes and forward readings of one connection.
    fn spawn_monitor(&self, connection: Arc<DeviceConnection>, cancel: CancellationToken) {
        let supervisor = self.this.clone();
        let mut states = connection.subscribe_state();
        let mut readings = connection.subscribe_readings();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        let Some(supervisor) = supervisor.upgrade() else { break };
                        supervisor.record_actual_state(connection.address(), state).await;
                    }
                    reading = readings.recv() => match reading {
                        Ok(reading) => {
                            let Some(supervisor) = supervisor.upgrade() else { break };
                            let _ = supervisor.readings.send(reading);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Dropped {} readings from {}", skipped, connection.address());
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn record_actual_state(&self, address: &str, state: ConnectionState) {
        if let Err(e) = self.store.lock().await.set_actual_state(address, state) {
            debug!("Could not persist state of {}: {}", address, e);
        }
        self.refresh_any_connected().await;
    }

    async fn refresh_any_connected(&self) {
        let any = self
            .devices
            .read()
            .await
            .values()
            .any(|m| m.connection.state() == ConnectionState::Connected);
        self.any_connected.send_if_modified(|current| {
            let changed = *current != any;
            *current = any;
            changed
        });
    }

    fn spawn_connect(&self, address: String, family: DeviceFamily) {
        let supervisor = self.this.clone();
        tokio::spawn(async move {
            let Some(supervisor) = supervisor.upgrade() else {
                return;
            };
            if let Err(e) = supervisor.connect(&address, family, true).await {
                warn!("Could not restore connection to {}: {}", address, e);
            }
        });
    }

    /// Register this call as the connect in progress, or join the one running.
    async fn join_or_lead(&self, address: &str) -> ConnectTurn {
        let mut tasks = self.tasks.lock().await;
        let entry = tasks.entry(address.to_string()).or_default();
        if entry.cancel.is_cancelled() {
            *entry = DeviceTasks::default();
        }
        if let Some(pending) = &entry.pending
            && pending.has_changed().is_ok()
            && pending.borrow().is_none()
        {
            return ConnectTurn::Join(pending.clone());
        }

        let (outcome, pending) = watch::channel(None);
        entry.pending = Some(pending);
        ConnectTurn::Lead {
            cancel: entry.cancel.clone(),
            outcome,
        }
    }

    async fn run_connect(
        &self,
        address: &str,
        family: DeviceFamily,
        connection: &Arc<DeviceConnection>,
        with_retry: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.store
            .lock()
            .await
            .set_desired_state(address, ConnectionState::Connected)?;
        let options = &self.config.reconnect;

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match establish(connection).await {
                Ok(()) => break,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) if with_retry && e.is_retryable() && options.allows_attempt(attempt + 1) => {
                    let delay = options.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(
                        "Connect to {} failed (attempt {}), retrying in {:?}: {}",
                        address, attempt, delay, e
                    );
                    connection.mark_reconnecting().await;
                    self.events.send(DeviceEvent::ReconnectStarted {
                        device: DeviceId::new(address, family),
                        attempt,
                    });
                    if !sleep_or_cancel(delay, cancel).await {
                        connection.clear_reconnecting().await;
                        return Err(Error::Cancelled);
                    }
                }
                Err(e) => {
                    warn!("Giving up on {}: {}", address, e);
                    self.cancel_tasks(address).await;
                    connection.clear_reconnecting().await;
                    self.store
                        .lock()
                        .await
                        .set_desired_state(address, ConnectionState::Disconnected)?;
                    return Err(e);
                }
            }
        }

        if attempt > 0 {
            self.events.send(DeviceEvent::ReconnectSucceeded {
                device: DeviceId::new(address, family),
                attempts: attempt,
            });
        }
        self.spawn_keeper(address, Arc::clone(connection)).await;
        Ok(())
    }

    async fn cancel_tasks(&self, address: &str) {
        if let Some(tasks) = self.tasks.lock().await.remove(address) {
            tasks.cancel.cancel();
        }
    }

    /// Start the reconnect keeper of a device unless one is running.
    async fn spawn_keeper(&self, address: &str, connection: Arc<DeviceConnection>) {
        let mut tasks = self.tasks.lock().await;
        let entry = tasks.entry(address.to_string()).or_default();
        if entry.cancel.is_cancelled() {
            return;
        }
        if entry.keeper.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let cancel = entry.cancel.clone();
        let options = self.config.reconnect.clone();
        let events = self.events.clone();
        entry.keeper = Some(tokio::spawn(keep_connected(
            connection, options, events, cancel,
        )));
    }
}

/// Wait for the connect another caller is running.
async fn wait_for_outcome(
    address: &str,
    outcome: &mut watch::Receiver<Option<ConnectOutcome>>,
) -> Result<()> {
    let finished = outcome
        .wait_for(|o| o.is_some())
        .await
        .ok()
        .and_then(|o| o.clone());
    match finished {
        Some(ConnectOutcome::Connected) => Ok(()),
        Some(ConnectOutcome::Failed(reason)) => Err(Error::transport_str(address, reason)),
        Some(ConnectOutcome::Cancelled) | None => Err(Error::Cancelled),
    }
}

/// One connection attempt that only succeeds once the device is connected.
///
/// [`DeviceConnection::connect`] returns early while a handshake started
/// elsewhere is still running; that handshake decides the result.
async fn establish(connection: &Arc<DeviceConnection>) -> Result<()> {
    connection.connect().await?;
    let mut states = connection.subscribe_state();
    let state = *states
        .wait_for(|s| *s != ConnectionState::Connecting)
        .await
        .map_err(|_| Error::Cancelled)?;
    if state == ConnectionState::Connected {
        Ok(())
    } else {
        Err(Error::transport(
            connection.address(),
            TransportFailure::LinkLost,
        ))
    }
}

/// Reconnect a device with backoff every time its link drops.
async fn keep_connected(
    connection: Arc<DeviceConnection>,
    options: ReconnectOptions,
    events: EventDispatcher,
    cancel: CancellationToken,
) {
    let mut states = connection.subscribe_state();
    let device = DeviceId::new(connection.address(), connection.device_family());

    loop {
        let dropped = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            changed = async {
                states
                    .wait_for(|s| *s == ConnectionState::Disconnected)
                    .await
                    .is_ok()
            } => changed,
        };
        if !dropped {
            return;
        }

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }
            connection.mark_reconnecting().await;
            events.send(DeviceEvent::ReconnectStarted {
                device: device.clone(),
                attempt: attempt + 1,
            });

            let delay = options.delay_for_attempt(attempt);
            debug!("Reconnecting {} in {:?}", device.address, delay);
            if !sleep_or_cancel(delay, &cancel).await {
                connection.clear_reconnecting().await;
                return;
            }
            attempt += 1;

            match connection.connect().await {
                Ok(()) => {
                    info!("Reconnected to {} after {} attempt(s)", device.address, attempt);
                    events.send(DeviceEvent::ReconnectSucceeded {
                        device: device.clone(),
                        attempts: attempt,
                    });
                    break;
                }
                Err(Error::Cancelled) => return,
                Err(e) if e.is_retryable() && options.allows_attempt(attempt) => {
                    warn!("Reconnect to {} failed: {}", device.address, e);
                }
                Err(e) => {
                    warn!("Stopped reconnecting {}: {}", device.address, e);
                    return;
                }
            }
        }
    }
}
