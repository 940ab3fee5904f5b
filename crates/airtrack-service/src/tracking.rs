//! Tracking session.
//!
//! A session decides what is transmitted. On start it evaluates the mode
//! once:
//!
//! - [`TrackingState::LocationOnly`] when the identity holds the track-only
//!   role and no device is configured, or when no device is meant to be
//!   connected. Only location fixes are forwarded.
//! - [`TrackingState::Tracking`] otherwise. Every reading from the device set
//!   is forwarded, stamped with the latest location fix.
//!
//! Both modes send a heartbeat every period. All messages of a session carry
//! its id and a monotonic sequence number that restarts at 1 with every
//! session.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use airtrack_core::ConnectionSupervisor;
use airtrack_store::TelemetryMessage;
use airtrack_types::{Heartbeat, LocationFix, Reading};

use crate::config::{ResourceRole, TrackingConfig};
use crate::error::Result;
use crate::identity::IdentityProvider;
use crate::location::LocationProvider;
use crate::messages::MessageContext;
use crate::power::PowerStatus;
use crate::publisher::TelemetryPublisher;
use crate::topics::TopicSet;

/// What a session transmits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    /// Nothing is transmitted.
    NotTracking,
    /// Location fixes and heartbeats.
    LocationOnly,
    /// Readings and heartbeats.
    Tracking,
}

impl TrackingState {
    /// Whether a session is running.
    pub fn is_active(&self) -> bool {
        !matches!(self, TrackingState::NotTracking)
    }
}

impl std::fmt::Display for TrackingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TrackingState::NotTracking => "not tracking",
            TrackingState::LocationOnly => "location only",
            TrackingState::Tracking => "tracking",
        };
        f.write_str(name)
    }
}

/// Session parameters.
#[derive(Debug, Clone)]
pub struct TrackingSettings {
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Topic flavor.
    pub topics: TopicSet,
    /// Version stamped on every message.
    pub app_version: String,
    /// Role that allows tracking without devices.
    pub track_only: ResourceRole,
}

impl TrackingSettings {
    /// Settings from the daemon configuration.
    pub fn from_config(config: &TrackingConfig, track_only: ResourceRole) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_period(),
            topics: TopicSet::new(config.debug_topics),
            app_version: config.app_version.clone(),
            track_only,
        }
    }
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            topics: TopicSet::production(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            track_only: ResourceRole::new("airtrack-app", "track-only"),
        }
    }
}

struct ActiveSession {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Tracking task ended abnormally: {}", e);
            }
        }
    }
}

/// Everything a session task needs to produce messages.
#[derive(Clone)]
struct Producer {
    publisher: Arc<TelemetryPublisher>,
    context: Arc<MessageContext>,
    sequence: Arc<AtomicU64>,
}

impl Producer {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn send(&self, message: airtrack_store::Result<TelemetryMessage>) {
        let result = match message {
            Ok(message) => self.publisher.enqueue(message).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to queue telemetry: {}", e);
        }
    }
}

/// Controller deciding what is handed to the publisher.
pub struct TrackingSession {
    supervisor: Arc<ConnectionSupervisor>,
    publisher: Arc<TelemetryPublisher>,
    identity: Arc<dyn IdentityProvider>,
    location: Arc<dyn LocationProvider>,
    power: Arc<dyn PowerStatus>,
    settings: TrackingSettings,
    state: watch::Sender<TrackingState>,
    session_id: watch::Sender<Option<String>>,
    active: Mutex<Option<ActiveSession>>,
}

impl TrackingSession {
    /// Create an idle session controller.
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        publisher: Arc<TelemetryPublisher>,
        identity: Arc<dyn IdentityProvider>,
        location: Arc<dyn LocationProvider>,
        power: Arc<dyn PowerStatus>,
        settings: TrackingSettings,
    ) -> Self {
        let (state, _) = watch::channel(TrackingState::NotTracking);
        let (session_id, _) = watch::channel(None);
        Self {
            supervisor,
            publisher,
            identity,
            location,
            power,
            settings,
            state,
            session_id,
            active: Mutex::new(None),
        }
    }

    /// Stream of the tracking mode.
    pub fn tracking_state(&self) -> watch::Receiver<TrackingState> {
        self.state.subscribe()
    }

    /// Current tracking mode.
    pub fn state(&self) -> TrackingState {
        *self.state.borrow()
    }

    /// Id of the running session.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.borrow().clone()
    }

    /// Start a session, replacing a running one.
    ///
    /// Returns the mode the new session runs in.
    pub async fn start(&self) -> Result<TrackingState> {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            debug!("Replacing running tracking session");
            previous.stop().await;
        }

        let mode = self.evaluate_mode().await?;
        let session_id = Uuid::new_v4().to_string();
        let app_id = self.supervisor.store().lock().await.app_id()?;
        let username = match self.identity.require_identity() {
            Ok(identity) => Some(identity.username),
            Err(e) => {
                warn!("{}; messages are held until someone signs in", e);
                None
            }
        };

        let producer = Producer {
            publisher: Arc::clone(&self.publisher),
            context: Arc::new(MessageContext {
                app_id,
                app_version: self.settings.app_version.clone(),
                username,
                session_id: session_id.clone(),
                topics: self.settings.topics,
            }),
            sequence: Arc::new(AtomicU64::new(0)),
        };

        self.publisher.connect_with_retry().await;

        let cancel = CancellationToken::new();
        let mut tasks = vec![tokio::spawn(send_heartbeats(
            producer.clone(),
            Arc::clone(&self.power),
            self.settings.heartbeat_interval,
            cancel.clone(),
        ))];
        match mode {
            TrackingState::Tracking => tasks.push(tokio::spawn(forward_readings(
                producer,
                self.supervisor.subscribe_readings(),
                Arc::clone(&self.location),
                cancel.clone(),
            ))),
            TrackingState::LocationOnly => tasks.push(tokio::spawn(forward_locations(
                producer,
                self.location.subscribe(),
                cancel.clone(),
            ))),
            TrackingState::NotTracking => {}
        }
        *active = Some(ActiveSession { cancel, tasks });

        info!("Tracking started ({}), session {}", mode, session_id);
        self.session_id.send_replace(Some(session_id));
        self.state.send_replace(mode);
        Ok(mode)
    }

    /// Stop the session and close the publisher's network leg.
    ///
    /// Queued messages stay in the store. Stopping an idle session is a no-op
    /// apart from closing the leg.
    pub async fn stop(&self) {
        let previous = self.active.lock().await.take();
        if let Some(previous) = previous {
            previous.stop().await;
            info!("Tracking stopped");
        }
        self.session_id.send_replace(None);
        self.state.send_replace(TrackingState::NotTracking);
        self.publisher.disconnect().await;
    }

    async fn evaluate_mode(&self) -> Result<TrackingState> {
        let track_only = self
            .identity
            .has_capability(&self.settings.track_only.resource, &self.settings.track_only.role);
        let configured = self.supervisor.device_count().await?;
        let wanted = self.supervisor.desired_connected_count().await?;
        Ok(select_mode(track_only, configured, wanted))
    }
}

/// Mode for a session given the identity and the device set.
pub fn select_mode(track_only: bool, configured: usize, desired_connected: usize) -> TrackingState {
    if (track_only && configured == 0) || desired_connected == 0 {
        TrackingState::LocationOnly
    } else {
        TrackingState::Tracking
    }
}

async fn send_heartbeats(
    producer: Producer,
    power: Arc<dyn PowerStatus>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticks.tick() => {}
        }

        let heartbeat = Heartbeat {
            timestamp: OffsetDateTime::now_utc(),
            app_id: producer.context.app_id.clone(),
            battery_percentage: power.battery_percentage().await,
            power_save: power.power_save().await,
        };
        let sequence = producer.next_sequence();
        debug!("Heartbeat {}", sequence);
        producer
            .send(producer.context.heartbeat(heartbeat, sequence))
            .await;
    }
}

async fn forward_readings(
    producer: Producer,
    mut readings: broadcast::Receiver<Reading>,
    location: Arc<dyn LocationProvider>,
    cancel: CancellationToken,
) {
    loop {
        let reading = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            reading = readings.recv() => reading,
        };
        match reading {
            Ok(reading) => {
                let sequence = producer.next_sequence();
                let reading = reading
                    .with_location(location.current_fix())
                    .with_sequence(sequence);
                producer.send(producer.context.reading(reading, sequence)).await;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!("Tracking fell behind, {} readings not forwarded", skipped);
            }
            Err(RecvError::Closed) => return,
        }
    }
}

async fn forward_locations(
    producer: Producer,
    mut fixes: watch::Receiver<Option<LocationFix>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            changed = fixes.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
        let fix = fixes.borrow_and_update().clone();
        if let Some(fix) = fix {
            let sequence = producer.next_sequence();
            producer.send(producer.context.location(fix, sequence)).await;
        }
    }
}
