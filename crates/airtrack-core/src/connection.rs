//! Per-device connection state machine.
//!
//! A [`DeviceConnection`] owns the transport of one physical device, runs
//! every received payload through the decoder and exposes readiness and
//! readings as observable streams:
//!
//! ```text
//! None/Disconnected --connect--> Connecting --handshake ok--> Connected
//! Connecting/Connected/Reconnecting --drop, disconnect, force--> Disconnected
//! Disconnected --supervisor backoff--> Reconnecting --next attempt--> Connecting
//! ```
//!
//! State transitions are serialized by an internal lock. Every teardown,
//! whether requested, caused by the link or by the idle timeout, goes through
//! one path so `Disconnected` is entered exactly once per session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airtrack_types::{ConnectionState, DeviceFamily, MeasurementKind, Reading, decode};

use crate::error::{Error, Result};
use crate::events::{DeviceEvent, DeviceId, DisconnectReason, EventDispatcher};
use crate::transport::{PayloadStream, Transport, TransportSettings};

const READING_CHANNEL_CAPACITY: usize = 64;

#[derive(Default)]
struct Session {
    /// Cancels the running handshake or payload pump.
    cancel: Option<CancellationToken>,
    /// Bumped on every connect and teardown; stale pumps compare against it.
    generation: u64,
}

/// One physical device behind a uniform lifecycle.
pub struct DeviceConnection {
    address: String,
    family: DeviceFamily,
    transport: Arc<dyn Transport>,
    settings: TransportSettings,
    session: Mutex<Session>,
    state: watch::Sender<ConnectionState>,
    cache: RwLock<HashMap<MeasurementKind, Reading>>,
    readings: broadcast::Sender<Reading>,
    events: EventDispatcher,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("address", &self.address)
            .field("family", &self.family)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceConnection {
    /// Create a connection in state `None`.
    pub fn new(
        address: impl Into<String>,
        family: DeviceFamily,
        transport: Arc<dyn Transport>,
        settings: TransportSettings,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::None);
        let (readings, _) = broadcast::channel(READING_CHANNEL_CAPACITY);
        Self {
            address: address.into(),
            family,
            transport,
            settings,
            session: Mutex::new(Session::default()),
            state,
            cache: RwLock::new(HashMap::new()),
            readings,
            events: EventDispatcher::default(),
        }
    }

    /// Publish lifecycle events on a shared dispatcher.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = events;
        self
    }

    /// Hardware address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Device family.
    pub fn device_family(&self) -> DeviceFamily {
        self.family
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Observe decoded readings.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<Reading> {
        self.readings.subscribe()
    }

    /// Lifecycle events of this connection.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// The most recent reading of a measurement kind.
    pub async fn last_reading(&self, kind: MeasurementKind) -> Option<Reading> {
        self.cache.read().await.get(&kind).cloned()
    }

    /// The most recent reading of every measurement kind, ordered by kind.
    pub async fn cached_readings(&self) -> Vec<Reading> {
        let cache = self.cache.read().await;
        let mut readings: Vec<Reading> = cache.values().cloned().collect();
        readings.sort_by_key(|r| r.kind);
        readings
    }

    fn device_id(&self) -> DeviceId {
        DeviceId::new(self.address.clone(), self.family)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("{}: {} -> {}", self.address, previous, state);
            self.events.send(DeviceEvent::StateChanged {
                device: self.device_id(),
                state,
            });
        }
    }

    /// Establish the transport.
    ///
    /// A no-op when the device is already connecting or connected. If a
    /// disconnect arrives while the handshake is running, the attempt is
    /// abandoned, a late link is closed and [`Error::Cancelled`] is returned.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let (cancel, generation) = {
            let mut session = self.session.lock().await;
            if self.state().is_establishing_or_up() {
                debug!("{} is already {}", self.address, self.state());
                return Ok(());
            }
            session.generation += 1;
            let cancel = CancellationToken::new();
            session.cancel = Some(cancel.clone());
            self.set_state(ConnectionState::Connecting);
            (cancel, session.generation)
        };

        info!("Connecting to {} ({})", self.address, self.family);
        let connect_timeout = self.settings.connect_timeout;
        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = timeout(connect_timeout, self.transport.open()) => {
                result.unwrap_or_else(|_| Err(Error::timeout("connect", connect_timeout)))
            }
        };

        let mut session = self.session.lock().await;
        if cancel.is_cancelled() || session.generation != generation {
            drop(session);
            debug!("Connect to {} was cancelled", self.address);
            if let Err(e) = self.transport.close().await {
                debug!("Closing abandoned link to {} failed: {}", self.address, e);
            }
            return Err(Error::Cancelled);
        }

        match opened {
            Ok(stream) => {
                self.set_state(ConnectionState::Connected);
                self.events.send(DeviceEvent::Connected {
                    device: self.device_id(),
                });
                info!("Connected to {}", self.address);

                let connection = Arc::clone(self);
                tokio::spawn(async move {
                    connection.pump(stream, cancel, generation).await;
                });
                Ok(())
            }
            Err(e) => {
                session.cancel = None;
                session.generation += 1;
                drop(session);
                warn!("Failed to connect to {}: {}", self.address, e);
                if let Err(close_err) = self.transport.close().await {
                    debug!("Closing failed link to {} failed: {}", self.address, close_err);
                }
                self.set_state(ConnectionState::Disconnected);
                self.events.send(DeviceEvent::Error {
                    device: self.device_id(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Tear the connection down at the user's request.
    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with_reason(DisconnectReason::UserRequested)
            .await
    }

    /// Close the live link as if it had dropped.
    ///
    /// Recovery is left to whoever wants the device connected.
    pub async fn force_reconnect(&self) -> Result<()> {
        info!("Forcing reconnect of {}", self.address);
        self.disconnect_with_reason(DisconnectReason::Forced).await
    }

    /// The single teardown path.
    ///
    /// Returns without side effects when there is no session to tear down.
    pub async fn disconnect_with_reason(&self, reason: DisconnectReason) -> Result<()> {
        self.teardown(None, reason).await
    }

    /// Mark a disconnected device as waiting for a reconnect attempt.
    pub async fn mark_reconnecting(&self) {
        let _session = self.session.lock().await;
        if matches!(
            self.state(),
            ConnectionState::Disconnected | ConnectionState::None
        ) {
            self.set_state(ConnectionState::Reconnecting);
        }
    }

    /// Return a reconnecting device to disconnected without an attempt.
    pub async fn clear_reconnecting(&self) {
        let _session = self.session.lock().await;
        if self.state() == ConnectionState::Reconnecting {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn teardown(
        &self,
        expected_generation: Option<u64>,
        reason: DisconnectReason,
    ) -> Result<()> {
        let mut session = self.session.lock().await;
        if expected_generation.is_some_and(|g| g != session.generation) {
            return Ok(());
        }
        let Some(cancel) = session.cancel.take() else {
            return Ok(());
        };
        session.generation += 1;
        cancel.cancel();

        info!("Disconnecting {} ({})", self.address, reason);
        let result = self.transport.close().await;
        self.set_state(ConnectionState::Disconnected);
        self.events.send(DeviceEvent::Disconnected {
            device: self.device_id(),
            reason,
        });
        result
    }

    async fn pump(&self, mut stream: PayloadStream, cancel: CancellationToken, generation: u64) {
        let idle = self.settings.idle_timeout_for(self.transport.kind());

        let reason = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = next_payload(&mut stream, idle) => next,
            };

            match next {
                Next::Payload(payload) => self.handle_payload(&payload).await,
                Next::Failed(e) => break DisconnectReason::TransportLost(e.to_string()),
                Next::Ended => break DisconnectReason::TransportLost("link closed".to_string()),
                Next::Idle => {
                    info!("No advertisement from {} within {:?}", self.address, idle);
                    break DisconnectReason::IdleTimeout;
                }
            }
        };

        if let Err(e) = self.teardown(Some(generation), reason).await {
            debug!("Teardown of {} reported: {}", self.address, e);
        }
    }

    async fn handle_payload(&self, payload: &[u8]) {
        match decode::decode(&self.address, self.family, payload, OffsetDateTime::now_utc()) {
            Ok(readings) => {
                let mut cache = self.cache.write().await;
                for reading in readings {
                    cache.insert(reading.kind, reading.clone());
                    let _ = self.readings.send(reading.clone());
                    self.events.send(DeviceEvent::Reading {
                        device: self.device_id(),
                        reading,
                    });
                }
            }
            Err(e) => {
                debug!("Dropping payload from {}: {}", self.address, e);
            }
        }
    }
}

enum Next {
    Payload(Vec<u8>),
    Failed(Error),
    Ended,
    Idle,
}

async fn next_payload(stream: &mut PayloadStream, idle: Option<Duration>) -> Next {
    let item = match idle {
        Some(idle) => match timeout(idle, stream.next()).await {
            Ok(item) => item,
            Err(_) => return Next::Idle,
        },
        None => stream.next().await,
    };
    match item {
        Some(Ok(payload)) => Next::Payload(payload),
        Some(Err(e)) => Next::Failed(e),
        None => Next::Ended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use airtrack_types::TransportKind;

    const AIRBEAM3: &str = "00:18:96:10:57:A2";

    fn connection(
        kind: TransportKind,
        family: DeviceFamily,
    ) -> (Arc<DeviceConnection>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new(AIRBEAM3, kind));
        let connection = Arc::new(DeviceConnection::new(
            AIRBEAM3,
            family,
            transport.clone(),
            TransportSettings::default(),
        ));
        (connection, transport)
    }

    async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, state: ConnectionState) {
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_decodes_lines() {
        let (connection, transport) = connection(TransportKind::Gatt, DeviceFamily::AirBeam3);
        let mut readings = connection.subscribe_readings();

        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);

        transport
            .push_line("12.3;AirBeam3:0018961057a2;AirBeam3-PM2.5;PM;ug/m3")
            .await;
        let reading = readings.recv().await.unwrap();
        assert_eq!(reading.kind, MeasurementKind::Pm2_5);
        assert_eq!(reading.value, Some(12.3));
        assert_eq!(reading.sensor_id, AIRBEAM3);

        let cached = connection.last_reading(MeasurementKind::Pm2_5).await.unwrap();
        assert_eq!(cached, reading);
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let (connection, transport) = connection(TransportKind::Gatt, DeviceFamily::AirBeam3);
        connection.connect().await.unwrap();
        connection.connect().await.unwrap();
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_decode_errors_do_not_disconnect() {
        let (connection, transport) = connection(TransportKind::Gatt, DeviceFamily::AirBeam3);
        let mut readings = connection.subscribe_readings();
        connection.connect().await.unwrap();

        transport.push_line("garbage").await;
        transport.push_payload(vec![0xFF, 0xFE]).await;
        transport.push_line("1;x;AirBeam3-CO2").await;
        transport.push_line("71.6;x;AirBeam3-F").await;

        let reading = readings.recv().await.unwrap();
        assert_eq!(reading.kind, MeasurementKind::Temperature);
        assert!((reading.value.unwrap() - 22.0).abs() < 1e-9);
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_link_drop_disconnects_exactly_once() {
        let (connection, transport) =
            connection(TransportKind::ClassicSocket, DeviceFamily::AirBeam2);
        let mut events = connection.events().subscribe();
        let mut state = connection.subscribe_state();
        connection.connect().await.unwrap();

        transport.drop_link().await;
        wait_for_state(&mut state, ConnectionState::Disconnected).await;

        // A later user disconnect finds no session and changes nothing.
        connection.disconnect().await.unwrap();
        assert_eq!(transport.close_count(), 1);

        let mut disconnects = 0;
        while let Ok(event) = events.try_recv() {
            if let DeviceEvent::Disconnected { reason, .. } = event {
                assert!(matches!(reason, DisconnectReason::TransportLost(_)));
                disconnects += 1;
            }
        }
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn test_broken_link_disconnects() {
        let (connection, transport) = connection(TransportKind::Gatt, DeviceFamily::AirBeamMini);
        let mut state = connection.subscribe_state();
        connection.connect().await.unwrap();

        transport.break_link().await;
        wait_for_state(&mut state, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let (connection, transport) = connection(TransportKind::Gatt, DeviceFamily::AirBeam3);
        transport.set_should_fail(true);

        let err = connection.connect().await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        transport.set_should_fail(false);
        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (connection, transport) = connection(TransportKind::Gatt, DeviceFamily::AirBeam3);
        transport.set_open_latency(Duration::from_secs(60));

        let err = connection.connect().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_connect() {
        let (connection, transport) = connection(TransportKind::Gatt, DeviceFamily::AirBeam3);
        transport.set_open_latency(Duration::from_secs(5));

        let pending = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move { connection.connect().await })
        };
        let mut state = connection.subscribe_state();
        wait_for_state(&mut state, ConnectionState::Connecting).await;

        connection.disconnect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!transport.is_open().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advertisement_idle_timeout() {
        let (connection, transport) =
            connection(TransportKind::Advertisement, DeviceFamily::RuuviTag);
        let mut events = connection.events().subscribe();
        connection.connect().await.unwrap();

        let frame = [
            0x05, 0x12, 0xFC, 0x53, 0x94, 0xC3, 0x7C, 0x00, 0x04, 0xFF, 0xFC, 0x04, 0x0C, 0xAC,
            0x36, 0x42, 0x00, 0xCD, 0xCB, 0xB8, 0x33, 0x4C, 0x88, 0x4F,
        ];
        tokio::time::sleep(Duration::from_secs(45)).await;
        transport.push_payload(frame.to_vec()).await;
        tokio::time::sleep(Duration::from_secs(45)).await;
        assert_eq!(connection.state(), ConnectionState::Connected);
        assert_eq!(connection.cached_readings().await.len(), 3);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        let idle = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
            matches!(
                e,
                DeviceEvent::Disconnected {
                    reason: DisconnectReason::IdleTimeout,
                    ..
                }
            )
        });
        assert!(idle);
    }

    #[tokio::test]
    async fn test_force_reconnect_closes_link() {
        let (connection, transport) =
            connection(TransportKind::ClassicSocket, DeviceFamily::AirBeam2);
        connection.connect().await.unwrap();

        connection.force_reconnect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(!transport.is_open().await);

        connection.connect().await.unwrap();
        assert_eq!(transport.open_count(), 2);
    }

    #[tokio::test]
    async fn test_mark_reconnecting_only_from_disconnected() {
        let (connection, _transport) = connection(TransportKind::Gatt, DeviceFamily::AirBeam3);
        connection.mark_reconnecting().await;
        assert_eq!(connection.state(), ConnectionState::Reconnecting);
        connection.clear_reconnecting().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        connection.connect().await.unwrap();
        connection.mark_reconnecting().await;
        assert_eq!(connection.state(), ConnectionState::Connected);
    }
}
