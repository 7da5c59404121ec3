//! Relay configuration.
//!
//! Configuration is a single JSON settings file loaded once at startup and
//! treated as immutable afterwards:
//!
//! ```json
//! {
//!   "devices": { "3c:71:bf:84:b3:86": "gps" },
//!   "gps": { "fixQualityThreshold": 5 },
//!   "outbox": { "backend": "redis", "redisUrl": "redis://127.0.0.1/" },
//!   "mqtt": { "host": "broker.example.com", "port": 8883 },
//!   "relay": { "pollIntervalMs": 1000 }
//! }
//! ```
//!
//! Every section and field is optional except `mqtt.host`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::aggregator::DEFAULT_FIX_QUALITY_THRESHOLD;
use crate::model::DeviceKind;

/// Errors that can occur while loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The configuration file was not found.
    NotFound(String),
    /// Failed to read the configuration file.
    ReadError(String),
    /// Configuration data is invalid.
    InvalidData(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(path) => write!(f, "Configuration not found: {}", path),
            ConfigError::ReadError(msg) => write!(f, "Read error: {}", msg),
            ConfigError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Identity used in the publish topic; defaults to the system hostname.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_identity: Option<String>,

    /// Allow-list: hardware address to device type.
    pub devices: BTreeMap<String, DeviceKind>,

    pub gps: GpsSettings,
    pub outbox: OutboxSettings,
    pub mqtt: MqttSettings,
    pub relay: RelaySettings,
    pub ble: BleSettings,
}

/// Fix acceptance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GpsSettings {
    /// Fixes with a quality code at or above this value are dropped.
    pub fix_quality_threshold: u8,
}

impl Default for GpsSettings {
    fn default() -> Self {
        Self {
            fix_quality_threshold: DEFAULT_FIX_QUALITY_THRESHOLD,
        }
    }
}

/// Outbox storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxBackend {
    /// Durable Redis list + hashes.
    Redis,
    /// In-process queue, lost on restart.
    Memory,
}

/// Outbox storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxSettings {
    pub backend: OutboxBackend,
    pub redis_url: String,
    /// Name of the ordered key list.
    pub list_key: String,
    /// Prefix of the per-entry field-map names (`<prefix>:<key>`).
    pub entry_prefix: String,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            backend: OutboxBackend::Redis,
            redis_url: "redis://127.0.0.1/".to_string(),
            list_key: "gpsentries".to_string(),
            entry_prefix: "gpsdata".to_string(),
        }
    }
}

/// MQTT broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    /// CA certificate (PEM) used to verify the broker.
    pub ca_cert: PathBuf,
    /// Client certificate (PEM).
    pub client_cert: PathBuf,
    /// Client private key (PEM).
    pub client_key: PathBuf,
    pub topic_prefix: String,
    /// MQTT client id; defaults to the host identity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// How long to wait for the broker to acknowledge a publish.
    pub ack_timeout_secs: u64,
    /// Delay before the event loop reconnects after a connection error.
    pub reconnect_delay_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8883,
            keep_alive_secs: 45,
            ca_cert: PathBuf::from("secure/root-ca.pem"),
            client_cert: PathBuf::from("secure/certificate.pem.crt"),
            client_key: PathBuf::from("secure/private.pem.key"),
            topic_prefix: "gps-data".to_string(),
            client_id: None,
            ack_timeout_secs: 10,
            reconnect_delay_secs: 5,
        }
    }
}

impl MqttSettings {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Relay drain loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelaySettings {
    /// Wait between outbox polls when the queue is empty.
    pub poll_interval_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
        }
    }
}

impl RelaySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// BLE adapter settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BleSettings {
    /// Index of the adapter to use (0 = first, usually hci0).
    pub adapter_index: usize,
}

impl RelayConfig {
    /// Parse and validate configuration from JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig =
            serde_json::from_str(text).map_err(|e| ConfigError::InvalidData(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.display().to_string()),
            _ => ConfigError::ReadError(format!("{}: {}", path.display(), e)),
        })?;
        Self::from_json(&text)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(address) = self.devices.keys().find(|a| !is_hardware_address(a)) {
            return Err(ConfigError::InvalidData(format!(
                "Invalid device address: {}",
                address
            )));
        }
        if self.gps.fix_quality_threshold == 0 {
            return Err(ConfigError::InvalidData(
                "gps.fixQualityThreshold must be at least 1".to_string(),
            ));
        }
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::InvalidData("mqtt.host is required".to_string()));
        }
        if self.mqtt.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidData(
                "mqtt.keepAliveSecs must be at least 5".to_string(),
            ));
        }
        if self.relay.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidData(
                "relay.pollIntervalMs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Six colon separated hex octets.
fn is_hardware_address(address: &str) -> bool {
    let octets: Vec<&str> = address.trim().split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{ "mqtt": { "host": "broker.example.com" } }"#;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_json(MINIMAL).unwrap();

        assert!(config.devices.is_empty());
        assert_eq!(config.gps.fix_quality_threshold, 5);
        assert_eq!(config.outbox.backend, OutboxBackend::Redis);
        assert_eq!(config.outbox.list_key, "gpsentries");
        assert_eq!(config.outbox.entry_prefix, "gpsdata");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.keep_alive(), Duration::from_secs(45));
        assert_eq!(config.mqtt.topic_prefix, "gps-data");
        assert_eq!(config.relay.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.ble.adapter_index, 0);
    }

    #[test]
    fn test_full_config() {
        let json = r#"{
            "hostIdentity": "edge-01",
            "devices": {
                "3c:71:bf:84:b3:86": "gps",
                "AA:BB:CC:DD:EE:FF": "imu",
                "11:22:33:44:55:66": "generic"
            },
            "gps": { "fixQualityThreshold": 3 },
            "outbox": { "backend": "memory", "listKey": "fixes" },
            "mqtt": {
                "host": "broker.example.com",
                "port": 8884,
                "keepAliveSecs": 30,
                "caCert": "/etc/fixrelay/ca.pem",
                "clientId": "edge-01-relay"
            },
            "relay": { "pollIntervalMs": 250 },
            "ble": { "adapterIndex": 1 }
        }"#;

        let config = RelayConfig::from_json(json).unwrap();

        assert_eq!(config.host_identity.as_deref(), Some("edge-01"));
        assert_eq!(config.devices.len(), 3);
        assert_eq!(config.devices["3c:71:bf:84:b3:86"], DeviceKind::GpsSource);
        assert_eq!(config.devices["AA:BB:CC:DD:EE:FF"], DeviceKind::ImuSource);
        assert_eq!(config.gps.fix_quality_threshold, 3);
        assert_eq!(config.outbox.backend, OutboxBackend::Memory);
        assert_eq!(config.outbox.list_key, "fixes");
        assert_eq!(config.outbox.entry_prefix, "gpsdata");
        assert_eq!(config.mqtt.port, 8884);
        assert_eq!(config.mqtt.ca_cert, PathBuf::from("/etc/fixrelay/ca.pem"));
        assert_eq!(config.mqtt.client_id.as_deref(), Some("edge-01-relay"));
        assert_eq!(config.relay.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.ble.adapter_index, 1);
    }

    #[test]
    fn test_rejects_bad_address() {
        let json = r#"{ "devices": { "3c:71:bf:84:b3": "gps" }, "mqtt": { "host": "h" } }"#;
        let err = RelayConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("3c:71:bf:84:b3"));
    }

    #[test]
    fn test_rejects_unknown_device_type() {
        let json = r#"{ "devices": { "3c:71:bf:84:b3:86": "lidar" }, "mqtt": { "host": "h" } }"#;
        assert!(matches!(
            RelayConfig::from_json(json),
            Err(ConfigError::InvalidData(_))
        ));
    }

    #[test]
    fn test_requires_broker_host() {
        assert!(matches!(
            RelayConfig::from_json("{}"),
            Err(ConfigError::InvalidData(_))
        ));
    }

    #[test]
    fn test_rejects_zero_threshold() {
        let json = r#"{ "gps": { "fixQualityThreshold": 0 }, "mqtt": { "host": "h" } }"#;
        assert!(RelayConfig::from_json(json).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = RelayConfig::load(Path::new("/nonexistent/fixrelay.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
