//! Mock transports for testing.
//!
//! This module provides a transport that can be driven from tests without
//! requiring BLE hardware or sockets.
//!
//! # Features
//!
//! - **Failure injection**: fail the next N opens, or every open
//! - **Latency simulation**: delay the handshake to exercise races and timeouts
//! - **Payload injection**: push lines or frames into an open link
//! - **Link loss**: end or break the payload stream as a dropped link would
//!
//! # Example
//!
//! ```
//! use airtrack_core::mock::MockTransport;
//! use airtrack_core::transport::Transport;
//! use airtrack_types::TransportKind;
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = MockTransport::new("00:18:96:10:57:A2", TransportKind::Gatt);
//!     let mut stream = transport.open().await.unwrap();
//!     transport.push_line("12.3;AirBeam3:0018961057a2;AirBeam3-PM2.5").await;
//!     assert!(stream.next().await.is_some());
//! }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};

use airtrack_types::{DeviceFamily, TransportKind};

use crate::error::{Error, Result, TransportFailure};
use crate::transport::{PayloadStream, Transport, TransportFactory};

type LinkSender = mpsc::UnboundedSender<Result<Vec<u8>>>;

/// A transport whose link is controlled by the test.
pub struct MockTransport {
    address: String,
    kind: TransportKind,
    link: Mutex<Option<LinkSender>>,
    open_count: AtomicU32,
    close_count: AtomicU32,
    should_fail: AtomicBool,
    /// Number of opens to fail before succeeding.
    remaining_failures: AtomicU32,
    /// Simulated handshake latency in milliseconds (0 = no delay).
    open_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("address", &self.address)
            .field("kind", &self.kind)
            .field("open_count", &self.open_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockTransport {
    /// Create a mock transport of the given kind.
    pub fn new(address: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            address: address.into(),
            kind,
            link: Mutex::new(None),
            open_count: AtomicU32::new(0),
            close_count: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
            remaining_failures: AtomicU32::new(0),
            open_latency_ms: AtomicU64::new(0),
        }
    }

    /// Fail every open while `fail` is set.
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` opens, then succeed.
    pub fn fail_next(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every handshake by `latency`.
    pub fn set_open_latency(&self, latency: Duration) {
        self.open_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of times `open` was called.
    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    /// Number of times `close` was called.
    pub fn close_count(&self) -> u32 {
        self.close_count.load(Ordering::SeqCst)
    }

    /// Whether a link is currently open.
    pub async fn is_open(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .is_some_and(|link| !link.is_closed())
    }

    /// Deliver a raw payload on the open link. Returns `false` if no link is open.
    pub async fn push_payload(&self, payload: impl Into<Vec<u8>>) -> bool {
        match self.link.lock().await.as_ref() {
            Some(link) => link.send(Ok(payload.into())).is_ok(),
            None => false,
        }
    }

    /// Deliver one text line on the open link.
    pub async fn push_line(&self, line: &str) -> bool {
        self.push_payload(line.as_bytes().to_vec()).await
    }

    /// End the payload stream as if the peer went away.
    pub async fn drop_link(&self) {
        self.link.lock().await.take();
    }

    /// Break the payload stream with a transport error.
    pub async fn break_link(&self) {
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.send(Err(Error::transport(
                self.address.clone(),
                TransportFailure::LinkLost,
            )));
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn open(&self) -> Result<PayloadStream> {
        self.open_count.fetch_add(1, Ordering::SeqCst);

        let latency = self.open_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::transport_str(&self.address, "mock open failure"));
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(Error::transport_str(&self.address, "mock open failure"));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        *self.link.lock().await = Some(sender);

        Ok(futures::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|item| (item, receiver))
        })
        .boxed())
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.link.lock().await.take();
        Ok(())
    }
}

/// Factory handing out one [`MockTransport`] per address.
#[derive(Debug, Default)]
pub struct MockTransportFactory {
    transports: std::sync::Mutex<HashMap<String, Arc<MockTransport>>>,
    create_count: AtomicU32,
    shutdown_count: AtomicU32,
}

impl MockTransportFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport for `address`, created on first use.
    pub fn transport(&self, address: &str, family: DeviceFamily) -> Arc<MockTransport> {
        let mut transports = self
            .transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            transports
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(MockTransport::new(address, family.transport()))),
        )
    }

    /// Number of times [`TransportFactory::create`] was called.
    pub fn create_count(&self) -> u32 {
        self.create_count.load(Ordering::SeqCst)
    }

    /// Number of times [`TransportFactory::shutdown`] was called.
    pub fn shutdown_count(&self) -> u32 {
        self.shutdown_count.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, address: &str, family: DeviceFamily) -> Result<Arc<dyn Transport>> {
        self.create_count.fetch_add(1, Ordering::SeqCst);
        Ok(self.transport(address, family))
    }

    fn shutdown(&self) {
        self.shutdown_count.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_and_drop() {
        let transport = MockTransport::new("AA", TransportKind::ClassicSocket);
        assert!(!transport.push_line("x").await);

        let mut stream = transport.open().await.unwrap();
        assert!(transport.is_open().await);
        assert!(transport.push_line("12.3;a;AirBeam2-PM1").await);
        assert_eq!(stream.next().await.unwrap().unwrap(), b"12.3;a;AirBeam2-PM1");

        transport.drop_link().await;
        assert!(stream.next().await.is_none());
        assert!(!transport.is_open().await);
    }

    #[tokio::test]
    async fn test_break_link_yields_error() {
        let transport = MockTransport::new("AA", TransportKind::Gatt);
        let mut stream = transport.open().await.unwrap();
        transport.break_link().await;
        assert!(stream.next().await.unwrap().is_err());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fail_next() {
        let transport = MockTransport::new("AA", TransportKind::Gatt);
        transport.fail_next(2);
        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_err());
        assert!(transport.open().await.is_ok());
        assert_eq!(transport.open_count(), 3);
    }

    #[test]
    fn test_factory_reuses_transport() {
        let factory = MockTransportFactory::new();
        let a = factory.create("AA", DeviceFamily::RuuviTag).unwrap();
        let b = factory.transport("AA", DeviceFamily::RuuviTag);
        assert_eq!(a.kind(), TransportKind::Advertisement);
        assert_eq!(b.open_count(), 0);
        assert_eq!(factory.create_count(), 1);
    }
}
