//! End-to-end tracking scenarios.
//!
//! The daemon is wired exactly as in production, with mock device
//! transports, an in-memory store and a mock broker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use airtrack_core::{DeviceFamily, MockTransportFactory};
use airtrack_service::config::DeviceConfig;
use airtrack_service::mock::MockBroker;
use airtrack_service::{App, Components, Config, Identity, StaticPowerStatus, TrackingState};
use airtrack_store::Store;
use airtrack_types::LocationFix;

const AIRBEAM3: &str = "00:18:96:10:57:A2";

fn config(roles: &[&str]) -> Config {
    let mut config = Config::default();
    config.identity.username = Some("alice".to_string());
    config.identity.token = Some("token".to_string());
    config.identity.roles = HashMap::from([(
        "airtrack-app".to_string(),
        roles.iter().map(|r| r.to_string()).collect(),
    )]);
    config
}

fn airbeam3() -> DeviceConfig {
    DeviceConfig {
        address: AIRBEAM3.to_string(),
        family: DeviceFamily::AirBeam3,
        label: None,
        endpoint: None,
        connect: true,
    }
}

fn fix() -> LocationFix {
    LocationFix {
        latitude: 50.061947,
        longitude: 19.936856,
        provider: "gpsd".to_string(),
        timestamp: OffsetDateTime::now_utc(),
        accuracy: Some(4.2),
        speed: Some(1.25),
        bearing: None,
        altitude: None,
    }
}

struct Harness {
    app: App,
    factory: Arc<MockTransportFactory>,
    broker: Arc<MockBroker>,
}

async fn start(config: Config) -> Harness {
    let factory = Arc::new(MockTransportFactory::new());
    let broker = Arc::new(MockBroker::new());
    let components = Components {
        factory: factory.clone(),
        broker: broker.clone(),
        power: Arc::new(StaticPowerStatus {
            battery_percentage: Some(76),
            power_save: Some(false),
        }),
    };
    let app = App::start_with(&config, Store::open_in_memory().unwrap(), components)
        .await
        .unwrap();
    Harness {
        app,
        factory,
        broker,
    }
}

#[tokio::test(start_paused = true)]
async fn test_track_only_without_devices_sends_locations() {
    let harness = start(config(&["mqtt", "track-only"])).await;
    assert_eq!(harness.app.tracking.state(), TrackingState::LocationOnly);

    harness.app.location.update(fix());
    harness.broker.wait_for_published(1).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let published = harness.broker.published().await;
    assert_eq!(published.len(), 1, "exactly one location message");
    assert_eq!(published[0].topic, "locations/alice/airtrack");

    let json = published[0].json();
    assert_eq!(json["value"]["latitude"], 50.061947);
    assert_eq!(json["sequence"], 1);
    assert_eq!(json["username"], "alice");
    assert_eq!(
        json["session_id"].as_str(),
        harness.app.tracking.session_id().as_deref()
    );

    harness.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_streaming_device_readings_are_forwarded() {
    let mut config = config(&["mqtt"]);
    config.devices.push(airbeam3());
    let harness = start(config).await;
    assert_eq!(harness.app.tracking.state(), TrackingState::Tracking);

    let mut any = harness.app.supervisor.has_any_connected();
    any.wait_for(|c| *c).await.unwrap();

    harness.app.location.update(fix());
    let transport = harness.factory.transport(AIRBEAM3, DeviceFamily::AirBeam3);
    assert!(
        transport
            .push_line("12.3;AirBeam3:0018961057a2;AirBeam3-PM2.5")
            .await
    );
    harness.broker.wait_for_published(1).await;

    let published = harness.broker.published().await;
    assert_eq!(published[0].topic, "sensors/alice/airtrack-v1");
    let json = published[0].json();
    assert_eq!(json["value"]["value"], 12.3);
    assert_eq!(json["value"]["kind"], "pm2_5");
    assert_eq!(json["value"]["sensor_id"], AIRBEAM3);
    assert_eq!(json["value"]["location"]["latitude"], 50.061947);
    assert_eq!(json["value"]["sequence"], 1);

    harness.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_location_fixes_ignored_while_tracking_devices() {
    let mut config = config(&["mqtt"]);
    config.devices.push(airbeam3());
    let harness = start(config).await;

    harness.app.location.update(fix());
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(harness.broker.published().await.is_empty());

    harness.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_keeps_single_heartbeat_timer() {
    let mut config = config(&["mqtt", "track-only"]);
    config.tracking.heartbeat_interval = 60;
    let harness = start(config).await;
    let first_session = harness.app.tracking.session_id().unwrap();

    harness.app.tracking.start().await.unwrap();
    let second_session = harness.app.tracking.session_id().unwrap();
    assert_ne!(first_session, second_session);

    tokio::time::sleep(Duration::from_secs(150)).await;
    harness.broker.wait_for_published(2).await;

    let heartbeats: Vec<_> = harness
        .broker
        .published()
        .await
        .into_iter()
        .filter(|m| m.topic == "heartbeats/alice/airtrack")
        .collect();
    assert_eq!(heartbeats.len(), 2, "one heartbeat per period");

    let json = heartbeats[0].json();
    assert_eq!(json["session_id"], second_session.as_str());
    assert_eq!(json["sequence"], 1);
    assert_eq!(json["value"]["battery_percentage"], 76);
    assert_eq!(json["value"]["power_save"], false);
    assert_eq!(heartbeats[1].json()["sequence"], 2);

    harness.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_drops_inputs_and_keeps_queue() {
    let harness = start(config(&["mqtt", "track-only"])).await;
    let mut state = harness.app.tracking.tracking_state();

    harness.app.tracking.stop().await;
    assert_eq!(*state.borrow_and_update(), TrackingState::NotTracking);
    assert!(harness.app.tracking.session_id().is_none());
    assert!(!harness.app.publisher.is_running().await);

    harness.app.location.update(fix());
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(harness.broker.published().await.is_empty());
    assert_eq!(harness.app.publisher.queue_len().await.unwrap(), 0);

    // Stopping twice is harmless.
    harness.app.tracking.stop().await;
    harness.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_messages_before_sign_in_are_delivered_after() {
    let harness = start(Config::default()).await;
    assert_eq!(harness.app.tracking.state(), TrackingState::LocationOnly);

    harness.app.location.update(fix());
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(harness.broker.published().await.is_empty());
    assert_eq!(
        harness.app.publisher.queue_stats().await.unwrap().unowned,
        1
    );

    harness
        .app
        .identity
        .sign_in(Identity::new("bob").with_role("airtrack-app", "mqtt"))
        .unwrap();
    harness.broker.wait_for_published(1).await;

    let published = harness.broker.published().await;
    assert_eq!(published[0].topic, "locations/bob/airtrack");
    assert_eq!(harness.broker.last_username().await.as_deref(), Some("bob"));

    harness.app.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_identity_without_broker_access_is_rejected() {
    let config = config(&["track-only"]);
    let factory = Arc::new(MockTransportFactory::new());
    let components = Components {
        factory,
        broker: Arc::new(MockBroker::new()),
        power: Arc::new(StaticPowerStatus::default()),
    };

    let result = App::start_with(&config, Store::open_in_memory().unwrap(), components).await;
    assert!(matches!(
        result,
        Err(airtrack_service::Error::Authorization(_))
    ));
}
