//! Daemon configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use airtrack_core::{ReconnectOptions, SocketEndpoint, TransportSettings};
use airtrack_types::{DeviceFamily, TransportKind};

use crate::mqtt::BrokerAddress;

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection.
    pub mqtt: MqttConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Tracking session settings.
    pub tracking: TrackingConfig,
    /// Signed-in identity.
    pub identity: IdentityConfig,
    /// Device connection timing.
    pub bluetooth: BluetoothConfig,
    /// Location source.
    pub location: LocationConfig,
    /// Devices to track.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// # Example
    ///
    /// ```
    /// use airtrack_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.mqtt.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.tracking.validate());
        errors.extend(self.identity.validate());
        errors.extend(self.bluetooth.validate());
        errors.extend(self.location.validate());

        let mut seen_addresses = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if !seen_addresses.insert(device.address.trim().to_uppercase()) {
                errors.push(ValidationError {
                    field: format!("{}.address", prefix),
                    message: format!("duplicate device address '{}'", device.address),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// MQTT broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker URL, `mqtt://host[:port]` or `mqtts://host[:port]`.
    pub broker: String,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Keep-alive interval in seconds.
    pub keep_alive: u64,
    /// Quality of service for telemetry (0, 1 or 2).
    pub qos: u8,
    /// Seconds to wait for the broker to accept a connection.
    pub connect_timeout: u64,
    /// Seconds to wait for the broker to confirm a publish.
    pub ack_timeout: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "mqtt://localhost:1883".to_string(),
            client_id: "airtrack".to_string(),
            keep_alive: 60,
            qos: 1,
            connect_timeout: 30,
            ack_timeout: 30,
        }
    }
}

impl MqttConfig {
    /// Validate broker configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = BrokerAddress::parse(&self.broker) {
            errors.push(ValidationError {
                field: "mqtt.broker".to_string(),
                message: e.to_string(),
            });
        }
        if self.client_id.trim().is_empty() {
            errors.push(ValidationError {
                field: "mqtt.client_id".to_string(),
                message: "client id cannot be empty".to_string(),
            });
        }
        if self.qos > 2 {
            errors.push(ValidationError {
                field: "mqtt.qos".to_string(),
                message: format!("invalid QoS {}: must be 0, 1 or 2", self.qos),
            });
        }
        if self.keep_alive < 5 {
            errors.push(ValidationError {
                field: "mqtt.keep_alive".to_string(),
                message: format!(
                    "keep-alive {} is too short (minimum 5 seconds)",
                    self.keep_alive
                ),
            });
        }
        if self.connect_timeout == 0 || self.ack_timeout == 0 {
            errors.push(ValidationError {
                field: "mqtt".to_string(),
                message: "timeouts must be at least 1 second".to_string(),
            });
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: airtrack_store::default_db_path(),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// Minimum heartbeat interval in seconds.
pub const MIN_HEARTBEAT_INTERVAL: u64 = 5;
/// Maximum heartbeat interval in seconds (1 hour).
pub const MAX_HEARTBEAT_INTERVAL: u64 = 3600;

/// Tracking session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    /// Heartbeat period in seconds.
    pub heartbeat_interval: u64,
    /// Publish to the `-debug` topic variants.
    pub debug_topics: bool,
    /// Version string stamped on every message.
    pub app_version: String,
    /// Start tracking as soon as the daemon is up.
    pub start_on_launch: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 60,
            debug_topics: false,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            start_on_launch: true,
        }
    }
}

impl TrackingConfig {
    /// Heartbeat period.
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }

    /// Validate tracking configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.heartbeat_interval < MIN_HEARTBEAT_INTERVAL {
            errors.push(ValidationError {
                field: "tracking.heartbeat_interval".to_string(),
                message: format!(
                    "heartbeat interval {} is too short (minimum {} seconds)",
                    self.heartbeat_interval, MIN_HEARTBEAT_INTERVAL
                ),
            });
        } else if self.heartbeat_interval > MAX_HEARTBEAT_INTERVAL {
            errors.push(ValidationError {
                field: "tracking.heartbeat_interval".to_string(),
                message: format!(
                    "heartbeat interval {} is too long (maximum {} seconds / 1 hour)",
                    self.heartbeat_interval, MAX_HEARTBEAT_INTERVAL
                ),
            });
        }
        if self.app_version.trim().is_empty() {
            errors.push(ValidationError {
                field: "tracking.app_version".to_string(),
                message: "app version cannot be empty".to_string(),
            });
        }

        errors
    }
}

/// A role on a resource, as carried in the identity's role map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRole {
    /// Resource (client) the role is granted on.
    pub resource: String,
    /// Role name.
    pub role: String,
}

impl ResourceRole {
    /// Create a resource role.
    pub fn new(resource: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            role: role.into(),
        }
    }

    fn validate(&self, field: &str) -> Option<ValidationError> {
        (self.resource.trim().is_empty() || self.role.trim().is_empty()).then(|| ValidationError {
            field: field.to_string(),
            message: "resource and role cannot be empty".to_string(),
        })
    }
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Username; nobody is signed in when unset.
    pub username: Option<String>,
    /// Access token used as the broker password.
    pub token: Option<String>,
    /// Roles per resource.
    pub roles: HashMap<String, Vec<String>>,
    /// Role that allows tracking without paired devices.
    pub track_only: ResourceRole,
    /// Role required to publish to the broker.
    pub broker_access: ResourceRole,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            username: None,
            token: None,
            roles: HashMap::new(),
            track_only: ResourceRole::new("airtrack-app", "track-only"),
            broker_access: ResourceRole::new("airtrack-app", "mqtt"),
        }
    }
}

impl IdentityConfig {
    /// Validate identity configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Some(username) = &self.username
            && username.trim().is_empty()
        {
            errors.push(ValidationError {
                field: "identity.username".to_string(),
                message: "username cannot be empty string (omit it instead)".to_string(),
            });
        }
        if self.token.is_some() && self.username.is_none() {
            errors.push(ValidationError {
                field: "identity.token".to_string(),
                message: "token is set but no username is configured".to_string(),
            });
        }
        errors.extend(self.track_only.validate("identity.track_only"));
        errors.extend(self.broker_access.validate("identity.broker_access"));

        errors
    }
}

/// Device connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Seconds a handshake may take.
    pub connect_timeout: u64,
    /// Seconds without an advertisement before a beacon counts as gone.
    pub idle_timeout: u64,
    /// Seconds to scan for a GATT peripheral the adapter has not seen yet.
    pub scan_duration: u64,
    /// First reconnect delay in milliseconds.
    pub reconnect_initial_delay_ms: u64,
    /// Upper bound for the reconnect delay in seconds.
    pub reconnect_max_delay: u64,
    /// Backoff multiplier between attempts.
    pub reconnect_multiplier: f64,
    /// Randomize reconnect delays.
    pub jitter: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 15,
            idle_timeout: 60,
            scan_duration: 5,
            reconnect_initial_delay_ms: 1000,
            reconnect_max_delay: 60,
            reconnect_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BluetoothConfig {
    /// Backoff for device and broker reconnects.
    pub fn reconnect_options(&self) -> ReconnectOptions {
        ReconnectOptions::unlimited()
            .initial_delay(Duration::from_millis(self.reconnect_initial_delay_ms))
            .max_delay(Duration::from_secs(self.reconnect_max_delay))
            .backoff_multiplier(self.reconnect_multiplier)
            .jitter(self.jitter)
    }

    /// Timing handed to every device connection.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            scan_duration: Duration::from_secs(self.scan_duration),
        }
    }

    /// Validate connection timing.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.connect_timeout == 0 {
            errors.push(ValidationError {
                field: "bluetooth.connect_timeout".to_string(),
                message: "connect timeout must be at least 1 second".to_string(),
            });
        }
        if self.idle_timeout == 0 {
            errors.push(ValidationError {
                field: "bluetooth.idle_timeout".to_string(),
                message: "idle timeout must be at least 1 second".to_string(),
            });
        }
        if let Err(e) = self.reconnect_options().validate() {
            errors.push(ValidationError {
                field: "bluetooth.reconnect".to_string(),
                message: e.to_string(),
            });
        }

        errors
    }
}

/// Location source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Read fixes from gpsd.
    pub enabled: bool,
    /// gpsd address, `host:port`.
    pub gpsd: String,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gpsd: "127.0.0.1:2947".to_string(),
        }
    }
}

impl LocationConfig {
    /// Validate location configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.enabled {
            let valid = self
                .gpsd
                .rsplit_once(':')
                .is_some_and(|(host, port)| {
                    !host.is_empty() && port.parse::<u16>().is_ok_and(|p| p != 0)
                });
            if !valid {
                errors.push(ValidationError {
                    field: "location.gpsd".to_string(),
                    message: format!(
                        "invalid gpsd address '{}': expected format 'host:port'",
                        self.gpsd
                    ),
                });
            }
        }

        errors
    }
}

/// Configuration for a device to track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Hardware address.
    pub address: String,
    /// Device family.
    pub family: DeviceFamily,
    /// Friendly label.
    #[serde(default)]
    pub label: Option<String>,
    /// Serial endpoint for classic-socket devices (`/dev/rfcomm0` or `tcp://host:port`).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Connect on start-up.
    #[serde(default = "default_connect")]
    pub connect: bool,
}

fn default_connect() -> bool {
    true
}

impl DeviceConfig {
    /// Parsed socket endpoint, if any.
    pub fn socket_endpoint(&self) -> Option<SocketEndpoint> {
        self.endpoint.as_deref().and_then(|e| e.parse().ok())
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        let hex_digits = self.address.chars().filter(|c| c.is_ascii_hexdigit()).count();
        if self.address.trim().is_empty() {
            errors.push(ValidationError {
                field: format!("{}.address", prefix),
                message: "device address cannot be empty".to_string(),
            });
        } else if hex_digits < 4 {
            errors.push(ValidationError {
                field: format!("{}.address", prefix),
                message: format!(
                    "device address '{}' is too short (minimum 4 hex digits)",
                    self.address
                ),
            });
        }

        if let Some(label) = &self.label
            && label.is_empty()
        {
            errors.push(ValidationError {
                field: format!("{}.label", prefix),
                message: "label cannot be empty string (use null/omit instead)".to_string(),
            });
        }

        let is_socket = self.family.transport() == TransportKind::ClassicSocket;
        match (&self.endpoint, is_socket) {
            (Some(endpoint), true) => {
                if let Err(e) = endpoint.parse::<SocketEndpoint>() {
                    errors.push(ValidationError {
                        field: format!("{}.endpoint", prefix),
                        message: e.to_string(),
                    });
                }
            }
            (None, true) => errors.push(ValidationError {
                field: format!("{}.endpoint", prefix),
                message: format!("{} devices need a socket endpoint", self.family),
            }),
            (Some(_), false) => errors.push(ValidationError {
                field: format!("{}.endpoint", prefix),
                message: format!("{} devices do not use a socket endpoint", self.family),
            }),
            (None, false) => {}
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `mqtt.broker` or `devices[0].address`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("airtrack")
        .join("airtrack.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn airbeam3(address: &str) -> DeviceConfig {
        DeviceConfig {
            address: address.to_string(),
            family: DeviceFamily::AirBeam3,
            label: None,
            endpoint: None,
            connect: true,
        }
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.mqtt.broker, "mqtt://localhost:1883");
        assert_eq!(config.mqtt.qos, 1);
        assert_eq!(config.tracking.heartbeat_interval, 60);
        assert!(config.identity.username.is_none());
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_device_config_defaults() {
        let toml = r#"
            address = "00:18:96:10:57:A2"
            family = "AirBeam3"
        "#;
        let config: DeviceConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.family, DeviceFamily::AirBeam3);
        assert!(config.connect);
        assert_eq!(config.label, None);
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [mqtt]
            broker = "mqtts://broker.example.com"
            client_id = "van-7"
            qos = 1

            [storage]
            path = "/data/airtrack.db"

            [tracking]
            heartbeat_interval = 30
            debug_topics = true

            [identity]
            username = "alice"
            token = "secret"
            roles = { "airtrack-app" = ["mqtt", "track-only"] }

            [bluetooth]
            idle_timeout = 90

            [location]
            enabled = true
            gpsd = "localhost:2947"

            [[devices]]
            address = "00:18:96:10:57:A2"
            family = "AirBeam3"
            label = "Backpack"

            [[devices]]
            address = "00:18:96:10:33:07"
            family = "AirBeam2"
            endpoint = "/dev/rfcomm0"
            connect = false
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.mqtt.client_id, "van-7");
        assert_eq!(config.mqtt.keep_alive, 60);
        assert_eq!(config.storage.path, PathBuf::from("/data/airtrack.db"));
        assert_eq!(config.tracking.heartbeat_period(), Duration::from_secs(30));
        assert!(config.tracking.debug_topics);
        assert_eq!(config.identity.roles["airtrack-app"].len(), 2);
        assert_eq!(config.identity.track_only.role, "track-only");
        assert_eq!(
            config.bluetooth.transport_settings().idle_timeout,
            Duration::from_secs(90)
        );
        assert!(config.location.enabled);
        assert_eq!(config.devices.len(), 2);
        assert_eq!(
            config.devices[1].socket_endpoint(),
            Some(SocketEndpoint::Tty(PathBuf::from("/dev/rfcomm0")))
        );
        assert!(!config.devices[1].connect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("airtrack.toml");

        let mut config = Config::default();
        config.identity.username = Some("alice".to_string());
        config.devices.push(DeviceConfig {
            label: Some("Balcony".to_string()),
            ..airbeam3("00:18:96:10:57:A2")
        });

        config.save(&config_path).unwrap();
        let loaded = Config::load(&config_path).unwrap();

        assert_eq!(loaded.identity.username.as_deref(), Some("alice"));
        assert_eq!(loaded.devices.len(), 1);
        assert_eq!(loaded.devices[0].label.as_deref(), Some("Balcony"));
    }

    #[test]
    fn test_config_load_errors() {
        let result = Config::load("/nonexistent/path/config.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));

        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("invalid.toml");
        std::fs::write(&config_path, "this is not valid { toml").unwrap();
        assert!(matches!(
            Config::load(&config_path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_mqtt_validation() {
        let config = MqttConfig {
            broker: "http://localhost".to_string(),
            qos: 3,
            keep_alive: 1,
            ..Default::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.field == "mqtt.broker"));
        assert!(errors.iter().any(|e| e.message.contains("QoS")));
    }

    #[test]
    fn test_tracking_validation() {
        let short = TrackingConfig {
            heartbeat_interval: 1,
            ..Default::default()
        };
        assert!(short.validate()[0].message.contains("too short"));

        let long = TrackingConfig {
            heartbeat_interval: 7200,
            ..Default::default()
        };
        assert!(long.validate()[0].message.contains("too long"));
    }

    #[test]
    fn test_identity_validation() {
        let config = IdentityConfig {
            token: Some("secret".to_string()),
            ..Default::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("no username"));
    }

    #[test]
    fn test_bluetooth_validation() {
        let config = BluetoothConfig {
            reconnect_multiplier: 0.5,
            ..Default::default()
        };
        assert_eq!(config.validate().len(), 1);
    }

    #[test]
    fn test_location_validation() {
        let disabled = LocationConfig {
            enabled: false,
            gpsd: "nonsense".to_string(),
        };
        assert!(disabled.validate().is_empty());

        let enabled = LocationConfig {
            enabled: true,
            gpsd: "nonsense".to_string(),
        };
        assert_eq!(enabled.validate().len(), 1);
    }

    #[test]
    fn test_device_validation() {
        assert!(airbeam3("00:18:96:10:57:A2").validate("devices[0]").is_empty());

        let short = airbeam3("AB");
        assert!(short.validate("devices[0]")[0].message.contains("too short"));

        let empty_label = DeviceConfig {
            label: Some(String::new()),
            ..airbeam3("00:18:96:10:57:A2")
        };
        assert_eq!(empty_label.validate("devices[0]").len(), 1);

        let stray_endpoint = DeviceConfig {
            endpoint: Some("/dev/rfcomm0".to_string()),
            ..airbeam3("00:18:96:10:57:A2")
        };
        assert!(stray_endpoint.validate("devices[0]")[0]
            .message
            .contains("do not use"));

        let socket = DeviceConfig {
            family: DeviceFamily::AirBeam2,
            ..airbeam3("00:18:96:10:33:07")
        };
        assert!(socket.validate("devices[0]")[0]
            .message
            .contains("need a socket endpoint"));

        let bad_endpoint = DeviceConfig {
            endpoint: Some("tcp://nohost".to_string()),
            ..socket
        };
        assert_eq!(bad_endpoint.validate("devices[0]").len(), 1);
    }

    #[test]
    fn test_duplicate_addresses_case_insensitive() {
        let config = Config {
            devices: vec![
                airbeam3("00:18:96:10:57:a2"),
                airbeam3("00:18:96:10:57:A2"),
            ],
            ..Default::default()
        };

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert!(errors.iter().any(|e| e.message.contains("duplicate")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_path() {
        assert!(default_config_path().ends_with("airtrack/airtrack.toml"));
    }

    #[test]
    fn test_config_validation_error_display() {
        let error = ConfigError::Validation(vec![
            ValidationError {
                field: "mqtt.qos".to_string(),
                message: "invalid QoS 3".to_string(),
            },
            ValidationError {
                field: "devices[0].address".to_string(),
                message: "cannot be empty".to_string(),
            },
        ]);
        let display = format!("{}", error);
        assert!(display.contains("mqtt.qos"));
        assert!(display.contains("devices[0].address"));
    }
}
