//! gpsd client feeding the location provider.
//!
//! Connects to gpsd over TCP, enables JSON watch mode and turns every `TPV`
//! report with a 2D or 3D fix into a [`LocationFix`]. A dropped or refused
//! connection is retried with backoff until the token is cancelled.

use std::sync::Arc;

use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use airtrack_core::ReconnectOptions;
use airtrack_core::reconnect::sleep_or_cancel;
use airtrack_types::LocationFix;

use crate::location::LocationFeed;

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";
const PROVIDER: &str = "gpsd";

/// Streams gpsd fixes into a [`LocationFeed`].
pub struct GpsdClient {
    address: String,
    feed: Arc<LocationFeed>,
    reconnect: ReconnectOptions,
}

impl GpsdClient {
    /// Create a client for the gpsd at `address` (`host:port`).
    pub fn new(
        address: impl Into<String>,
        feed: Arc<LocationFeed>,
        reconnect: ReconnectOptions,
    ) -> Self {
        Self {
            address: address.into(),
            feed,
            reconnect,
        }
    }

    /// Run the client on a background task.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    /// Read fixes until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        info!("Reading location fixes from gpsd at {}", self.address);
        let mut attempt = 0u32;

        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.stream_fixes(&mut attempt) => result,
            };
            match result {
                Ok(()) => debug!("gpsd at {} closed the connection", self.address),
                Err(e) => warn!("gpsd connection to {} failed: {}", self.address, e),
            }

            let delay = self.reconnect.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            if !sleep_or_cancel(delay, &cancel).await {
                return;
            }
        }
    }

    async fn stream_fixes(&self, attempt: &mut u32) -> std::io::Result<()> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.write_all(WATCH_COMMAND).await?;
        *attempt = 0;

        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(fix) = parse_tpv(&line) {
                self.feed.update(fix);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TpvReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    time: Option<String>,
    eph: Option<f64>,
    epx: Option<f64>,
    epy: Option<f64>,
    speed: Option<f64>,
    track: Option<f64>,
    #[serde(rename = "altMSL")]
    alt_msl: Option<f64>,
    alt: Option<f64>,
}

/// Parse one gpsd JSON report into a fix.
///
/// Returns `None` for other report classes, reports without a 2D fix and
/// lines that are not JSON.
pub fn parse_tpv(line: &str) -> Option<LocationFix> {
    let report: TpvReport = match serde_json::from_str(line) {
        Ok(report) => report,
        Err(e) => {
            debug!("Ignoring gpsd line: {}", e);
            return None;
        }
    };
    if report.class != "TPV" || report.mode < 2 {
        return None;
    }

    let timestamp = report
        .time
        .as_deref()
        .and_then(|t| OffsetDateTime::parse(t, &Rfc3339).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    let accuracy = report.eph.or(match (report.epx, report.epy) {
        (Some(x), Some(y)) => Some(x.max(y)),
        (x, y) => x.or(y),
    });

    Some(LocationFix {
        latitude: report.lat?,
        longitude: report.lon?,
        provider: PROVIDER.to_string(),
        timestamp,
        accuracy: accuracy.map(|a| a as f32),
        speed: report.speed.map(|s| s as f32),
        bearing: report.track.map(|t| t as f32),
        altitude: report.alt_msl.or(report.alt),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    use crate::location::LocationProvider;

    const TPV: &str = r#"{"class":"TPV","device":"/dev/ttyACM0","mode":3,"time":"2026-03-14T09:21:07.000Z","lat":50.061947,"lon":19.936856,"altMSL":219.4,"epx":3.1,"epy":4.2,"track":87.5,"speed":1.25}"#;

    #[test]
    fn test_parse_tpv() {
        let fix = parse_tpv(TPV).unwrap();
        assert_eq!(fix.latitude, 50.061947);
        assert_eq!(fix.longitude, 19.936856);
        assert_eq!(fix.provider, "gpsd");
        assert_eq!(fix.accuracy, Some(4.2));
        assert_eq!(fix.bearing, Some(87.5));
        assert_eq!(fix.speed, Some(1.25));
        assert_eq!(fix.altitude, Some(219.4));
        assert_eq!(fix.timestamp.year(), 2026);
    }

    #[test]
    fn test_parse_tpv_prefers_eph() {
        let line = r#"{"class":"TPV","mode":2,"lat":1.0,"lon":2.0,"eph":7.5,"epx":3.0,"alt":12.0}"#;
        let fix = parse_tpv(line).unwrap();
        assert_eq!(fix.accuracy, Some(7.5));
        assert_eq!(fix.altitude, Some(12.0));
    }

    #[test]
    fn test_parse_tpv_rejects_non_fixes() {
        assert!(parse_tpv(r#"{"class":"VERSION","release":"3.25"}"#).is_none());
        assert!(parse_tpv(r#"{"class":"TPV","mode":1}"#).is_none());
        assert!(parse_tpv(r#"{"class":"TPV","mode":2,"lat":1.0}"#).is_none());
        assert!(parse_tpv("not json").is_none());
        assert!(parse_tpv("").is_none());
    }

    #[tokio::test]
    async fn test_client_feeds_fixes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let watch = lines.next_line().await.unwrap().unwrap();
            assert!(watch.starts_with("?WATCH="));
            write
                .write_all(b"{\"class\":\"VERSION\"}\n")
                .await
                .unwrap();
            write.write_all(TPV.as_bytes()).await.unwrap();
            write.write_all(b"\n").await.unwrap();
            // Keep the connection open until the test is done.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let feed = Arc::new(LocationFeed::new());
        let mut fixes = feed.subscribe();
        let cancel = CancellationToken::new();
        let handle =
            GpsdClient::new(address, feed.clone(), ReconnectOptions::new()).spawn(cancel.clone());

        tokio::time::timeout(Duration::from_secs(5), fixes.wait_for(|f| f.is_some()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(feed.current_fix().unwrap().latitude, 50.061947);

        cancel.cancel();
        handle.await.unwrap();
    }
}
