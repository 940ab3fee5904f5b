//! Advertisement-only transport for RuuviTag beacons.
//!
//! RuuviTags never accept connections; their readings are carried in BLE
//! manufacturer data. One [`AdvertisementScanner`] listens to the adapter for
//! every beacon and fans advertisements out over a broadcast channel; each
//! [`AdvertisementTransport`] filters that channel down to its own address.
//!
//! "Connected" for a beacon means the transport is listening. The owning
//! connection applies an idle timeout that is reset by every matching
//! advertisement.

use std::sync::{Arc, PoisonError};

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, PeripheralId};
use futures::StreamExt;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airtrack_types::TransportKind;
use airtrack_types::uuid::RUUVI_MANUFACTURER_ID;

use crate::error::Result;
use crate::scan::{addresses_match, get_adapter};
use crate::transport::{PayloadStream, Transport};
use crate::util::{create_identifier, format_peripheral_id};

/// Manufacturer payload received from one beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Address (or platform identifier) of the advertising device.
    pub address: String,
    /// Manufacturer data after the company id.
    pub data: Vec<u8>,
}

/// Shared listener for RuuviTag manufacturer data.
pub struct AdvertisementScanner {
    sender: broadcast::Sender<Advertisement>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Stops the current listener; replaced on every start.
    cancel: std::sync::Mutex<CancellationToken>,
}

impl AdvertisementScanner {
    /// Create a scanner. Nothing is scanned until the first transport opens.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            listener: Mutex::new(None),
            cancel: std::sync::Mutex::new(CancellationToken::new()),
        }
    }

    /// Subscribe to every received advertisement.
    pub fn subscribe(&self) -> broadcast::Receiver<Advertisement> {
        self.sender.subscribe()
    }

    /// Inject an advertisement as if it came from the adapter.
    pub fn publish(&self, advertisement: Advertisement) {
        let _ = self.sender.send(advertisement);
    }

    /// Start the adapter listener unless it is already running.
    pub async fn ensure_started(&self) -> Result<()> {
        let mut listener = self.listener.lock().await;
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) && !self.is_stopped() {
            return Ok(());
        }

        let adapter = get_adapter().await?;
        let events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;
        info!("Listening for beacon advertisements");

        let sender = self.sender.clone();
        let cancel = self.renew_token();
        *listener = Some(tokio::spawn(async move {
            let mut events = events;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        if let Err(e) = adapter.stop_scan().await {
                            debug!("Failed to stop scan: {}", e);
                        }
                        break;
                    }
                    event = events.next() => match event {
                        Some(CentralEvent::ManufacturerDataAdvertisement {
                            id,
                            manufacturer_data,
                        }) => {
                            if let Some(data) = manufacturer_data.get(&RUUVI_MANUFACTURER_ID) {
                                let address = resolve_address(&adapter, &id).await;
                                let _ = sender.send(Advertisement {
                                    address,
                                    data: data.clone(),
                                });
                            }
                        }
                        Some(_) => {}
                        None => {
                            warn!("Adapter event stream ended");
                            break;
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    /// Stop listening to the adapter.
    ///
    /// The next [`ensure_started`](Self::ensure_started) starts a new listener.
    pub fn stop(&self) {
        let cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        if !cancel.is_cancelled() {
            debug!("Stopping beacon listener");
            cancel.cancel();
        }
    }

    /// Whether [`stop`](Self::stop) was called since the last start.
    pub fn is_stopped(&self) -> bool {
        self.cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_cancelled()
    }

    /// Cancel the previous listener and hand out the token of the next one.
    fn renew_token(&self) -> CancellationToken {
        let mut cancel = self.cancel.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = CancellationToken::new();
        std::mem::replace(&mut *cancel, fresh.clone()).cancel();
        fresh
    }
}

impl Default for AdvertisementScanner {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve_address(adapter: &Adapter, id: &PeripheralId) -> String {
    match adapter.peripheral(id).await {
        Ok(peripheral) => match peripheral.properties().await {
            Ok(Some(props)) => create_identifier(&props.address.to_string(), id),
            _ => format_peripheral_id(id),
        },
        Err(_) => format_peripheral_id(id),
    }
}

/// Transport yielding the manufacturer data of one beacon.
pub struct AdvertisementTransport {
    address: String,
    scanner: Arc<AdvertisementScanner>,
    session: Mutex<Option<CancellationToken>>,
    listen_only: bool,
}

impl AdvertisementTransport {
    /// Create a transport for the beacon at `address`.
    pub fn new(address: impl Into<String>, scanner: Arc<AdvertisementScanner>) -> Self {
        Self {
            address: address.into(),
            scanner,
            session: Mutex::new(None),
            listen_only: false,
        }
    }

    /// Create a transport that never starts the adapter listener.
    ///
    /// Advertisements must be injected with [`AdvertisementScanner::publish`].
    pub fn detached(address: impl Into<String>, scanner: Arc<AdvertisementScanner>) -> Self {
        Self {
            listen_only: true,
            ..Self::new(address, scanner)
        }
    }
}

#[async_trait]
impl Transport for AdvertisementTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Advertisement
    }

    async fn open(&self) -> Result<PayloadStream> {
        if !self.listen_only {
            self.scanner.ensure_started().await?;
        }

        let token = CancellationToken::new();
        if let Some(previous) = self.session.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let receiver = self.scanner.subscribe();
        let address = self.address.clone();
        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let address = address.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(adv) if addresses_match(&adv.address, &address) => {
                            return Some((Ok(adv.data), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Dropped {} advertisements for {}", skipped, address);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(stream.take_until(token.cancelled_owned()).boxed())
    }

    async fn close(&self) -> Result<()> {
        if let Some(token) = self.session.lock().await.take() {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement(address: &str, byte: u8) -> Advertisement {
        Advertisement {
            address: address.to_string(),
            data: vec![0x05, byte],
        }
    }

    #[tokio::test]
    async fn test_transport_filters_by_address() {
        let scanner = Arc::new(AdvertisementScanner::new());
        let transport =
            AdvertisementTransport::detached("C4:D9:12:AB:3F:1C", Arc::clone(&scanner));
        assert_eq!(transport.kind(), TransportKind::Advertisement);

        let mut stream = transport.open().await.unwrap();
        scanner.publish(advertisement("11:22:33:44:55:66", 1));
        scanner.publish(advertisement("c4:d9:12:ab:3f:1c", 2));

        let data = stream.next().await.unwrap().unwrap();
        assert_eq!(data, vec![0x05, 2]);
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let scanner = Arc::new(AdvertisementScanner::new());
        let transport =
            AdvertisementTransport::detached("C4:D9:12:AB:3F:1C", Arc::clone(&scanner));

        let mut stream = transport.open().await.unwrap();
        transport.close().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_reopen_cancels_previous_stream() {
        let scanner = Arc::new(AdvertisementScanner::new());
        let transport =
            AdvertisementTransport::detached("AA:BB:CC:DD:EE:FF", Arc::clone(&scanner));

        let mut first = transport.open().await.unwrap();
        let _second = transport.open().await.unwrap();
        assert!(first.next().await.is_none());
    }

    #[test]
    fn test_stop_then_restart_gets_live_token() {
        let scanner = AdvertisementScanner::new();
        assert!(!scanner.is_stopped());

        scanner.stop();
        assert!(scanner.is_stopped());
        scanner.stop();

        let previous = scanner
            .cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let token = scanner.renew_token();
        assert!(previous.is_cancelled());
        assert!(!token.is_cancelled());
        assert!(!scanner.is_stopped());

        scanner.stop();
        assert!(token.is_cancelled());
    }
}
