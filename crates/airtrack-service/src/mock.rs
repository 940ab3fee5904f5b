//! Mock broker for testing.
//!
//! [`MockBroker`] implements [`PublishTransport`] in memory. Tests can make
//! the broker unreachable, fail individual publishes, drop the connection
//! and inspect what was delivered.
//!
//! # Example
//!
//! ```
//! use airtrack_service::mock::MockBroker;
//! use airtrack_service::mqtt::{Credentials, PublishTransport};
//!
//! #[tokio::main]
//! async fn main() {
//!     let broker = MockBroker::new();
//!     let credentials = Credentials { username: "alice".into(), password: None };
//!     broker.connect(&credentials).await.unwrap();
//!     broker.publish("heartbeats/alice/airtrack", b"{}").await.unwrap();
//!     assert_eq!(broker.published().await.len(), 1);
//! }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, watch};

use crate::error::PublishError;
use crate::mqtt::{Credentials, PublishTransport};

/// A message the mock broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Rendered topic.
    pub topic: String,
    /// Payload as UTF-8.
    pub payload: String,
}

impl PublishedMessage {
    /// Parse the payload as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// In-memory [`PublishTransport`].
#[derive(Debug)]
pub struct MockBroker {
    published: Mutex<Vec<PublishedMessage>>,
    published_count: watch::Sender<usize>,
    connected: AtomicBool,
    available: AtomicBool,
    connect_count: AtomicU32,
    publish_attempts: AtomicU32,
    /// Number of publishes to fail before succeeding.
    remaining_failures: AtomicU32,
    last_username: Mutex<Option<String>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// Create a reachable broker.
    pub fn new() -> Self {
        let (published_count, _) = watch::channel(0);
        Self {
            published: Mutex::new(Vec::new()),
            published_count,
            connected: AtomicBool::new(false),
            available: AtomicBool::new(true),
            connect_count: AtomicU32::new(0),
            publish_attempts: AtomicU32::new(0),
            remaining_failures: AtomicU32::new(0),
            last_username: Mutex::new(None),
        }
    }

    /// Make connects succeed or fail.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` publishes without confirmation.
    pub fn fail_next(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::SeqCst);
    }

    /// Drop the connection as a network outage would.
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Number of successful connects.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Number of publish calls, confirmed or not.
    pub fn publish_attempts(&self) -> u32 {
        self.publish_attempts.load(Ordering::SeqCst)
    }

    /// Username of the last successful connect.
    pub async fn last_username(&self) -> Option<String> {
        self.last_username.lock().await.clone()
    }

    /// Messages confirmed so far, in delivery order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().await.clone()
    }

    /// Wait until at least `count` messages were confirmed.
    pub async fn wait_for_published(&self, count: usize) {
        let mut rx = self.published_count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Wait until at least `count` messages were confirmed, or give up.
    pub async fn wait_for_published_within(&self, count: usize, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait_for_published(count))
            .await
            .is_ok()
    }
}

#[async_trait]
impl PublishTransport for MockBroker {
    async fn connect(&self, credentials: &Credentials) -> Result<(), PublishError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PublishError::Connect("broker unreachable".to_string()));
        }
        *self.last_username.lock().await = Some(credentials.username.clone());
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.connected.load(Ordering::SeqCst) {
            return Err(PublishError::NotConnected);
        }

        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PublishError::AckTimeout {
                pkid: 1,
                timeout: Duration::from_secs(1),
            });
        }

        let mut published = self.published.lock().await;
        published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
        self.published_count.send_replace(published.len());
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
