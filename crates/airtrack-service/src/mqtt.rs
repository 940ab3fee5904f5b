//! MQTT leg of the telemetry publisher.
//!
//! [`PublishTransport`] is the connect/publish/disconnect contract the
//! publisher drives. [`MqttTransport`] implements it over `rumqttc`: the
//! event loop runs on its own task and reports sent packet ids, broker
//! acknowledgements and link loss back to the caller, so `publish` only
//! returns once the broker has confirmed the packet.
//!
//! # Example Configuration
//!
//! ```toml
//! [mqtt]
//! broker = "mqtts://broker.example.com"
//! client_id = "airtrack-van-7"
//! keep_alive = 60
//! qos = 1
//! ```
//!
//! `mqtt://` defaults to port 1883 and `mqtts://` to port 8883 over TLS.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::error::PublishError;

/// Credentials presented to the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Broker username.
    pub username: String,
    /// Broker password (the identity's access token).
    pub password: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Connection to a publish/subscribe broker.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    /// Open the connection.
    async fn connect(&self, credentials: &Credentials) -> Result<(), PublishError>;

    /// Publish `payload` to `topic`, returning once the broker confirmed it.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// Close the connection. Closing a closed connection is a no-op.
    async fn disconnect(&self);

    /// Whether the connection is up.
    fn is_connected(&self) -> bool;
}

/// A parsed broker URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    /// Host name or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether to use TLS.
    pub tls: bool,
}

impl BrokerAddress {
    /// Parse `mqtt://host[:port]` or `mqtts://host[:port]`.
    pub fn parse(url: &str) -> Result<Self, PublishError> {
        let invalid = |reason: String| PublishError::InvalidBrokerUrl {
            url: url.to_string(),
            reason,
        };

        let (tls, rest) = if let Some(stripped) = url.strip_prefix("mqtt://") {
            (false, stripped)
        } else if let Some(stripped) = url.strip_prefix("mqtts://") {
            (true, stripped)
        } else {
            return Err(invalid(
                "Invalid scheme: URL must start with mqtt:// or mqtts://".to_string(),
            ));
        };
        let default_port = if tls { 8883 } else { 1883 };

        let (host, port) = if let Some((h, p)) = rest.rsplit_once(':') {
            let port = p
                .parse::<u16>()
                .map_err(|_| invalid(format!("Invalid port: {}", p)))?;
            (h.to_string(), port)
        } else {
            (rest.to_string(), default_port)
        };

        if host.is_empty() {
            return Err(invalid("Host cannot be empty".to_string()));
        }

        Ok(Self { host, port, tls })
    }
}

/// Map a configured QoS level to the client's.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

#[derive(Debug)]
enum LinkEvent {
    Sent(u16),
    Confirmed(u16),
    Lost(String),
}

struct MqttSession {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    task: JoinHandle<()>,
}

/// [`PublishTransport`] over an MQTT broker.
pub struct MqttTransport {
    broker: BrokerAddress,
    client_id: String,
    keep_alive: Duration,
    qos: QoS,
    connect_timeout: Duration,
    ack_timeout: Duration,
    session: Mutex<Option<MqttSession>>,
    connected: Arc<watch::Sender<bool>>,
}

impl MqttTransport {
    /// Create a transport for the configured broker.
    pub fn new(config: &MqttConfig) -> Result<Self, PublishError> {
        let (connected, _) = watch::channel(false);
        Ok(Self {
            broker: BrokerAddress::parse(&config.broker)?,
            client_id: config.client_id.clone(),
            keep_alive: Duration::from_secs(config.keep_alive),
            qos: qos_from_level(config.qos),
            connect_timeout: Duration::from_secs(config.connect_timeout),
            ack_timeout: Duration::from_secs(config.ack_timeout),
            session: Mutex::new(None),
            connected: Arc::new(connected),
        })
    }

    fn options(&self, credentials: &Credentials) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.broker.host, self.broker.port);
        options.set_keep_alive(self.keep_alive);
        options.set_credentials(
            &credentials.username,
            credentials.password.as_deref().unwrap_or_default(),
        );
        if self.broker.tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    async fn close(&self, session: MqttSession) {
        let MqttSession {
            client,
            mut events,
            task,
        } = session;
        if let Err(e) = client.disconnect().await {
            debug!("MQTT disconnect request failed: {}", e);
        }
        // Give the event loop a moment to flush the DISCONNECT packet.
        let drained = timeout(Duration::from_millis(500), async {
            while events.recv().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            task.abort();
        }
        self.connected.send_replace(false);
    }
}

#[async_trait]
impl PublishTransport for MqttTransport {
    async fn connect(&self, credentials: &Credentials) -> Result<(), PublishError> {
        let mut session = self.session.lock().await;
        if let Some(previous) = session.take() {
            self.close(previous).await;
        }

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            self.broker.host, self.broker.port, credentials.username
        );
        let (client, mut eventloop) = AsyncClient::new(self.options(credentials), 100);
        let (events_tx, mut events) = mpsc::unbounded_channel();
        let connected = Arc::clone(&self.connected);

        let task = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == ConnectReturnCode::Success {
                            connected.send_replace(true);
                        } else {
                            let _ = events_tx.send(LinkEvent::Lost(format!(
                                "broker refused connection: {:?}",
                                ack.code
                            )));
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::PubAck(ack))) => {
                        let _ = events_tx.send(LinkEvent::Confirmed(ack.pkid));
                    }
                    Ok(Event::Incoming(Packet::PubComp(comp))) => {
                        let _ = events_tx.send(LinkEvent::Confirmed(comp.pkid));
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response received");
                    }
                    Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                        let _ = events_tx.send(LinkEvent::Sent(pkid));
                    }
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        let _ = events_tx.send(LinkEvent::Lost(e.to_string()));
                        break;
                    }
                }
            }
            connected.send_replace(false);
        });

        let mut up = self.connected.subscribe();
        let result = timeout(self.connect_timeout, async {
            tokio::select! {
                _ = up.wait_for(|c| *c) => Ok(()),
                event = events.recv() => match event {
                    Some(LinkEvent::Lost(reason)) => Err(PublishError::Connect(reason)),
                    _ => Err(PublishError::Connect("event loop stopped".to_string())),
                },
            }
        })
        .await
        .unwrap_or_else(|_| {
            Err(PublishError::Connect(format!(
                "no CONNACK within {:?}",
                self.connect_timeout
            )))
        });

        match result {
            Ok(()) => {
                info!("MQTT connected to {}", self.broker.host);
                *session = Some(MqttSession {
                    client,
                    events,
                    task,
                });
                Ok(())
            }
            Err(e) => {
                task.abort();
                self.connected.send_replace(false);
                Err(e)
            }
        }
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(PublishError::NotConnected)?;
        if !*self.connected.borrow() {
            return Err(PublishError::NotConnected);
        }

        // Drop confirmations of earlier publishes that timed out.
        while let Ok(event) = session.events.try_recv() {
            if let LinkEvent::Lost(reason) = event {
                return Err(PublishError::ConnectionLost(reason));
            }
        }

        session
            .client
            .publish(topic, self.qos, false, payload.to_vec())
            .await?;

        let deadline = Instant::now() + self.ack_timeout;
        let mut sent = None;
        loop {
            let event = match timeout_at(deadline, session.events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(PublishError::ConnectionLost(
                        "event loop stopped".to_string(),
                    ));
                }
                Err(_) => {
                    return Err(PublishError::AckTimeout {
                        pkid: sent.unwrap_or_default(),
                        timeout: self.ack_timeout,
                    });
                }
            };
            match event {
                LinkEvent::Sent(pkid) if sent.is_none() => {
                    if self.qos == QoS::AtMostOnce {
                        return Ok(());
                    }
                    sent = Some(pkid);
                }
                LinkEvent::Confirmed(pkid) if sent == Some(pkid) => {
                    debug!("Broker confirmed packet {} on {}", pkid, topic);
                    return Ok(());
                }
                LinkEvent::Lost(reason) => {
                    warn!("MQTT connection lost: {}", reason);
                    return Err(PublishError::ConnectionLost(reason));
                }
                other => debug!("Ignoring stale MQTT event {:?}", other),
            }
        }
    }

    async fn disconnect(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            info!("Disconnecting from MQTT broker {}", self.broker.host);
            self.close(session).await;
        }
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_url_mqtt() {
        let broker = BrokerAddress::parse("mqtt://localhost:1883").unwrap();
        assert_eq!(broker.host, "localhost");
        assert_eq!(broker.port, 1883);
        assert!(!broker.tls);
    }

    #[test]
    fn test_parse_broker_url_mqtts() {
        let broker = BrokerAddress::parse("mqtts://broker.example.com:8883").unwrap();
        assert_eq!(broker.host, "broker.example.com");
        assert_eq!(broker.port, 8883);
        assert!(broker.tls);
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        let broker = BrokerAddress::parse("mqtt://localhost").unwrap();
        assert_eq!(broker.port, 1883);

        let broker = BrokerAddress::parse("mqtts://secure.example.com").unwrap();
        assert_eq!(broker.port, 8883);
        assert!(broker.tls);
    }

    #[test]
    fn test_parse_broker_url_invalid() {
        assert!(matches!(
            BrokerAddress::parse("http://localhost"),
            Err(PublishError::InvalidBrokerUrl { .. })
        ));
        assert!(BrokerAddress::parse("mqtt://").is_err());
        assert!(BrokerAddress::parse("mqtt://localhost:notaport").is_err());
    }

    #[test]
    fn test_qos_from_level() {
        assert_eq!(qos_from_level(0), QoS::AtMostOnce);
        assert_eq!(qos_from_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_level(2), QoS::ExactlyOnce);
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let credentials = Credentials {
            username: "alice".into(),
            password: Some("token".into()),
        };
        assert!(!format!("{:?}", credentials).contains("token"));
    }

    #[tokio::test]
    async fn test_publish_without_connection() {
        let transport = MqttTransport::new(&MqttConfig::default()).unwrap();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.publish("sensors/alice/airtrack-v1", b"{}").await,
            Err(PublishError::NotConnected)
        ));
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind and drop a listener to find a closed port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = MqttConfig {
            broker: format!("mqtt://127.0.0.1:{}", port),
            connect_timeout: 5,
            ..Default::default()
        };
        let transport = MqttTransport::new(&config).unwrap();
        let credentials = Credentials {
            username: "alice".into(),
            password: None,
        };
        assert!(matches!(
            transport.connect(&credentials).await,
            Err(PublishError::Connect(_))
        ));
        assert!(!transport.is_connected());
    }
}
