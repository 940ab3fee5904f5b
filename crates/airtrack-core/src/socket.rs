//! Line-oriented socket transport for AirBeam2.
//!
//! AirBeam2 streams newline-delimited records over the Bluetooth Serial Port
//! Profile. On Linux the RFCOMM channel is reached either through a bound
//! tty (`rfcomm bind` creates `/dev/rfcommN`) or through a TCP bridge, so the
//! endpoint is configured per device.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use airtrack_types::TransportKind;

use crate::error::{Error, Result};
use crate::transport::{PayloadStream, Transport};

const TCP_SCHEME: &str = "tcp://";

/// Where the serial stream of a classic-socket device can be read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEndpoint {
    /// A bound RFCOMM tty such as `/dev/rfcomm0`.
    Tty(PathBuf),
    /// A TCP bridge, `host:port`.
    Tcp(String),
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tty(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => write!(f, "{TCP_SCHEME}{addr}"),
        }
    }
}

impl FromStr for SocketEndpoint {
    type Err = Error;

    /// Parse `tcp://host:port` or a tty path.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(addr) = s.strip_prefix(TCP_SCHEME) {
            if addr.is_empty() || !addr.contains(':') {
                return Err(Error::invalid_config(format!(
                    "socket endpoint '{s}' must be tcp://host:port"
                )));
            }
            return Ok(Self::Tcp(addr.to_string()));
        }
        if s.is_empty() {
            return Err(Error::invalid_config("socket endpoint is empty"));
        }
        Ok(Self::Tty(PathBuf::from(s)))
    }
}

/// Transport reading text lines from a socket endpoint.
pub struct SocketTransport {
    address: String,
    endpoint: SocketEndpoint,
    session: Mutex<Option<CancellationToken>>,
}

impl SocketTransport {
    /// Create a transport for the device at `address`.
    pub fn new(address: impl Into<String>, endpoint: SocketEndpoint) -> Self {
        Self {
            address: address.into(),
            endpoint,
            session: Mutex::new(None),
        }
    }

    /// The configured endpoint.
    pub fn endpoint(&self) -> &SocketEndpoint {
        &self.endpoint
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ClassicSocket
    }

    async fn open(&self) -> Result<PayloadStream> {
        info!("Opening {} for {}", self.endpoint, self.address);
        let reader: Box<dyn AsyncRead + Send + Unpin> = match &self.endpoint {
            SocketEndpoint::Tcp(addr) => Box::new(TcpStream::connect(addr).await?),
            SocketEndpoint::Tty(path) => Box::new(tokio::fs::File::open(path).await?),
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.session.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        Ok(line_stream(reader)
            .take_until(token.cancelled_owned())
            .boxed())
    }

    async fn close(&self) -> Result<()> {
        if let Some(token) = self.session.lock().await.take() {
            debug!("Closing {} for {}", self.endpoint, self.address);
            token.cancel();
        }
        Ok(())
    }
}

/// Turn a reader into a stream of non-empty lines; EOF ends the stream.
pub(crate) fn line_stream<R>(reader: R) -> PayloadStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let lines = BufReader::new(reader).lines();
    futures::stream::unfold(lines, |mut lines| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => return Some((Ok(line.into_bytes()), lines)),
                Ok(None) => return None,
                Err(e) => return Some((Err(Error::Io(e)), lines)),
            }
        }
    })
    .boxed()
}
