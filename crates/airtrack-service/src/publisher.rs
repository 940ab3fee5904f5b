//! Durable at-least-once telemetry publisher.
//!
//! [`TelemetryPublisher::enqueue`] writes a message to the store before it
//! returns. A single delivery task drains the queue in enqueue order: it
//! marks the oldest message in flight, publishes it, and deletes it only
//! when the broker has confirmed it. A failed publish puts the same message
//! back to pending and backs off; the loop never skips ahead.
//!
//! The network leg is independent of the queue. [`TelemetryPublisher::disconnect`]
//! stops delivery but leaves undelivered messages in the store for the next
//! [`TelemetryPublisher::connect_with_retry`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airtrack_core::reconnect::sleep_or_cancel;
use airtrack_core::{ReconnectOptions, SharedStore};
use airtrack_store::{QueueStats, QueuedMessage, TelemetryMessage};

use crate::error::PublishError;
use crate::identity::{Identity, IdentityProvider};
use crate::mqtt::{Credentials, PublishTransport};
use crate::topics;

/// How often an idle delivery loop checks that the link is still up.
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Backoff settings for the publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Backoff between broker connection attempts.
    pub reconnect: ReconnectOptions,
    /// Backoff between attempts to publish the same message.
    pub publish_retry: ReconnectOptions,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectOptions::unlimited(),
            publish_retry: ReconnectOptions::unlimited()
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(30)),
        }
    }
}

struct Leg {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

enum LegEnd {
    Cancelled,
    LinkLost,
    IdentityChanged,
}

/// Queue plus outbound broker connection.
pub struct TelemetryPublisher {
    store: SharedStore,
    transport: Arc<dyn PublishTransport>,
    identity: Arc<dyn IdentityProvider>,
    config: PublisherConfig,
    connected: watch::Sender<bool>,
    wake: Notify,
    leg: Mutex<Option<Leg>>,
}

impl TelemetryPublisher {
    /// Create a publisher; nothing is sent until [`connect_with_retry`](Self::connect_with_retry).
    pub fn new(
        store: SharedStore,
        transport: Arc<dyn PublishTransport>,
        identity: Arc<dyn IdentityProvider>,
        config: PublisherConfig,
    ) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            store,
            transport,
            identity,
            config,
            connected,
            wake: Notify::new(),
            leg: Mutex::new(None),
        })
    }

    /// Persist a message for delivery and return its queue id.
    ///
    /// Messages without a username are accepted and held until an identity
    /// is signed in.
    pub async fn enqueue(&self, message: TelemetryMessage) -> Result<i64, PublishError> {
        let id = self.store.lock().await.enqueue(&message)?;
        debug!("Queued {} message {}", message.kind.as_str(), id);
        self.wake.notify_one();
        Ok(id)
    }

    /// Start the network leg.
    ///
    /// Connects with exponential backoff, indefinitely, then delivers the
    /// queue. A lost connection is re-established the same way. Calling this
    /// while the leg is running is a no-op.
    pub async fn connect_with_retry(self: &Arc<Self>) {
        let mut leg = self.leg.lock().await;
        if leg.as_ref().is_some_and(|l| !l.task.is_finished()) {
            debug!("Publisher leg already running");
            return;
        }

        let cancel = CancellationToken::new();
        let publisher = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move { publisher.run_leg(token).await });
        *leg = Some(Leg { cancel, task });
    }

    /// Stop delivery and close the broker connection.
    ///
    /// Undelivered messages stay in the store. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let leg = self.leg.lock().await.take();
        if let Some(leg) = leg {
            leg.cancel.cancel();
            if let Err(e) = leg.task.await {
                warn!("Publisher task ended abnormally: {}", e);
            }
        }
        self.transport.disconnect().await;
        self.connected.send_replace(false);
    }

    /// Whether the network leg is running.
    pub async fn is_running(&self) -> bool {
        self.leg
            .lock()
            .await
            .as_ref()
            .is_some_and(|l| !l.task.is_finished())
    }

    /// Stream of the broker connection state.
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Number of undelivered messages.
    pub async fn queue_len(&self) -> Result<usize, PublishError> {
        Ok(self.store.lock().await.queue_len()?)
    }

    /// Queue occupancy.
    pub async fn queue_stats(&self) -> Result<QueueStats, PublishError> {
        Ok(self.store.lock().await.queue_stats()?)
    }

    async fn run_leg(self: Arc<Self>, cancel: CancellationToken) {
        let mut identities = self.identity.current_identity();
        let mut attempt = 0u32;

        loop {
            let current = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                current = identities.wait_for(|i| i.is_some()) => match current {
                    Ok(current) => current.clone(),
                    Err(_) => return,
                },
            };
            let Some(identity) = current else {
                continue;
            };

            let credentials = Credentials {
                username: identity.username.clone(),
                password: identity.credential.clone(),
            };
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = self.transport.connect(&credentials) => result,
            };
            if let Err(e) = connected {
                attempt = attempt.saturating_add(1);
                let delay = self.config.reconnect.delay_for_attempt(attempt - 1);
                warn!(
                    "Broker connection attempt {} failed: {}. Retrying in {:?}",
                    attempt, e, delay
                );
                if !sleep_or_cancel(delay, &cancel).await {
                    return;
                }
                continue;
            }

            attempt = 0;
            self.connected.send_replace(true);
            let end = self.deliver(&identity, &mut identities, &cancel).await;
            self.connected.send_replace(false);

            match end {
                LegEnd::Cancelled => return,
                LegEnd::LinkLost => {
                    warn!("Broker connection lost, reconnecting");
                    if !sleep_or_cancel(self.config.reconnect.delay_for_attempt(0), &cancel).await
                    {
                        return;
                    }
                }
                LegEnd::IdentityChanged => {
                    info!("Identity changed, reconnecting to broker");
                    self.transport.disconnect().await;
                }
            }
        }
    }

    async fn deliver(
        &self,
        identity: &Identity,
        identities: &mut watch::Receiver<Option<Identity>>,
        cancel: &CancellationToken,
    ) -> LegEnd {
        let mut failures = 0u32;

        loop {
            if cancel.is_cancelled() {
                return LegEnd::Cancelled;
            }
            if identities.has_changed().unwrap_or(false) {
                let same = identities
                    .borrow_and_update()
                    .as_ref()
                    .is_some_and(|i| i.username == identity.username);
                if !same {
                    return LegEnd::IdentityChanged;
                }
            }

            let next = self.next_message(&identity.username).await;
            let queued = match next {
                Ok(Some(queued)) => queued,
                Ok(None) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return LegEnd::Cancelled,
                        _ = self.wake.notified() => {}
                        _ = identities.changed() => {}
                        _ = tokio::time::sleep(LINK_CHECK_INTERVAL) => {
                            if !self.transport.is_connected() {
                                return LegEnd::LinkLost;
                            }
                        }
                    }
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read telemetry queue: {}", e);
                    let delay = self.config.publish_retry.delay_for_attempt(0);
                    if !sleep_or_cancel(delay, cancel).await {
                        return LegEnd::Cancelled;
                    }
                    continue;
                }
            };

            match self.publish(&queued, cancel).await {
                Ok(()) => failures = 0,
                Err(PublishError::Cancelled) => return LegEnd::Cancelled,
                Err(e) if e.is_connection_failure() => {
                    debug!("Message {} stays queued: {}", queued.id, e);
                    return LegEnd::LinkLost;
                }
                Err(e) => {
                    let delay = self.config.publish_retry.delay_for_attempt(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        "Publishing message {} failed ({} attempts): {}. Retrying in {:?}",
                        queued.id,
                        queued.attempts + 1,
                        e,
                        delay
                    );
                    if !sleep_or_cancel(delay, cancel).await {
                        return LegEnd::Cancelled;
                    }
                }
            }
        }
    }

    /// Oldest undelivered message, claiming ownerless messages for `username`.
    async fn next_message(&self, username: &str) -> Result<Option<QueuedMessage>, PublishError> {
        let store = self.store.lock().await;
        let next = store.next_pending()?;
        if next
            .as_ref()
            .is_some_and(|queued| queued.message.username.is_none())
        {
            let claimed = store.claim_unowned(username)?;
            info!("Claimed {} queued messages for {}", claimed, username);
            return Ok(store.next_pending()?);
        }
        Ok(next)
    }

    async fn publish(
        &self,
        queued: &QueuedMessage,
        cancel: &CancellationToken,
    ) -> Result<(), PublishError> {
        let Some(username) = queued.message.username.as_deref() else {
            return Err(PublishError::NotConnected);
        };
        let topic = topics::render(&queued.message.topic_pattern, username);

        self.store.lock().await.mark_in_flight(queued.id)?;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PublishError::Cancelled),
            result = self.transport.publish(&topic, queued.message.payload.as_bytes()) => result,
        };

        let store = self.store.lock().await;
        match result {
            Ok(()) => {
                store.acknowledge(queued.id)?;
                debug!("Delivered message {} to {}", queued.id, topic);
                Ok(())
            }
            Err(e) => {
                store.mark_pending(queued.id)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceRole;
    use crate::identity::StaticIdentityProvider;
    use crate::mock::MockBroker;
    use airtrack_store::Store;
    use airtrack_types::TelemetryKind;

    fn store() -> SharedStore {
        Arc::new(Mutex::new(Store::open_in_memory().unwrap()))
    }

    fn identity_provider(signed_in: bool) -> Arc<StaticIdentityProvider> {
        let provider = Arc::new(StaticIdentityProvider::new(ResourceRole::new(
            "airtrack-app",
            "mqtt",
        )));
        if signed_in {
            provider.sign_in(alice()).unwrap();
        }
        provider
    }

    fn alice() -> Identity {
        Identity::new("alice")
            .with_role("airtrack-app", "mqtt")
            .with_credential("token")
    }

    fn message(n: u32, username: Option<&str>) -> TelemetryMessage {
        TelemetryMessage::new(
            TelemetryKind::Heartbeat,
            format!(r#"{{"n":{}}}"#, n),
            "heartbeats/{username}/airtrack",
            "0.1.0",
        )
        .with_username(username.map(str::to_string))
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_order_and_purges() {
        let broker = Arc::new(MockBroker::new());
        let publisher = TelemetryPublisher::new(
            store(),
            broker.clone(),
            identity_provider(true),
            PublisherConfig::default(),
        );

        for n in 0..3 {
            publisher.enqueue(message(n, Some("alice"))).await.unwrap();
        }
        publisher.connect_with_retry().await;
        broker.wait_for_published(3).await;

        let payloads: Vec<_> = broker
            .published()
            .await
            .into_iter()
            .map(|m| m.payload)
            .collect();
        assert_eq!(payloads, vec![r#"{"n":0}"#, r#"{"n":1}"#, r#"{"n":2}"#]);
        assert_eq!(broker.last_username().await.as_deref(), Some("alice"));
        assert_eq!(publisher.queue_len().await.unwrap(), 0);

        publisher.disconnect().await;
        assert!(!broker.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_same_message_after_failure() {
        let broker = Arc::new(MockBroker::new());
        let publisher = TelemetryPublisher::new(
            store(),
            broker.clone(),
            identity_provider(true),
            PublisherConfig::default(),
        );
        broker.fail_next(3);

        publisher.enqueue(message(0, Some("alice"))).await.unwrap();
        publisher.enqueue(message(1, Some("alice"))).await.unwrap();
        publisher.connect_with_retry().await;
        broker.wait_for_published(2).await;

        let published = broker.published().await;
        assert_eq!(published[0].payload, r#"{"n":0}"#);
        assert_eq!(published[1].payload, r#"{"n":1}"#);
        assert_eq!(broker.publish_attempts(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_broker_is_reachable() {
        let broker = Arc::new(MockBroker::new());
        broker.set_available(false);
        let publisher = TelemetryPublisher::new(
            store(),
            broker.clone(),
            identity_provider(true),
            PublisherConfig::default(),
        );
        let mut connected = publisher.connected();

        publisher.connect_with_retry().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!*connected.borrow_and_update());

        broker.set_available(true);
        connected.wait_for(|c| *c).await.unwrap();
        assert_eq!(broker.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_link_loss() {
        let broker = Arc::new(MockBroker::new());
        let publisher = TelemetryPublisher::new(
            store(),
            broker.clone(),
            identity_provider(true),
            PublisherConfig::default(),
        );
        publisher.connect_with_retry().await;
        publisher.enqueue(message(0, Some("alice"))).await.unwrap();
        broker.wait_for_published(1).await;

        broker.drop_connection();
        publisher.enqueue(message(1, Some("alice"))).await.unwrap();
        broker.wait_for_published(2).await;
        assert_eq!(broker.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unowned_messages_wait_for_identity() {
        let broker = Arc::new(MockBroker::new());
        let identity = identity_provider(false);
        let publisher = TelemetryPublisher::new(
            store(),
            broker.clone(),
            identity.clone(),
            PublisherConfig::default(),
        );

        publisher.enqueue(message(0, None)).await.unwrap();
        publisher.connect_with_retry().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(broker.connect_count(), 0);
        assert_eq!(publisher.queue_stats().await.unwrap().unowned, 1);

        identity.sign_in(alice()).unwrap();
        broker.wait_for_published(1).await;
        assert_eq!(
            broker.published().await[0].topic,
            "heartbeats/alice/airtrack"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_keeps_queue() {
        let broker = Arc::new(MockBroker::new());
        let publisher = TelemetryPublisher::new(
            store(),
            broker.clone(),
            identity_provider(true),
            PublisherConfig::default(),
        );
        publisher.connect_with_retry().await;
        publisher.disconnect().await;
        publisher.disconnect().await;
        assert!(!publisher.is_running().await);

        publisher.enqueue(message(0, Some("alice"))).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(publisher.queue_len().await.unwrap(), 1);
        assert!(broker.published().await.is_empty());

        publisher.connect_with_retry().await;
        broker.wait_for_published(1).await;
        assert_eq!(publisher.queue_len().await.unwrap(), 0);
    }
}
