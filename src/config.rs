//! Service configuration
//!
//! Immutable-per-session parameters for the cloud service: backend
//! endpoint, device identity, broker connection, and session tuning knobs.
//! Loadable from TOML; validated before any task is spawned.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Top-level service configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub cloud: CloudSection,
    pub device: DeviceSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// Backend API endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudSection {
    /// Base URL of the device backend, e.g. `http://api.example.io`.
    pub base_url: String,
}

/// Device identity and login credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Hardware identifier (WiFi BSSID) of this device.
    pub bssid: String,
    pub product_id: String,
    /// Product key; combined with the bssid to derive the device token.
    pub product_key: String,
    /// User/login token forwarded to activate/authorize requests.
    #[serde(default)]
    pub user_token: String,
    /// Version of the firmware image this build was made from.
    #[serde(default)]
    pub rom_version: String,
}

/// MQTT broker connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Subscription QoS: 0, 1 or 2. Publishes are always QoS 0.
    #[serde(default)]
    pub subscribe_qos: u8,
}

/// Session manager tuning. The defaults mirror long-standing field
/// behavior; change them deliberately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// Cap on activation attempts; `None` retries forever, which is the
    /// historical behavior for unattended devices.
    #[serde(default)]
    pub activation_max_attempts: Option<u32>,
    /// Delay between failed activation attempts.
    #[serde(default = "default_activation_retry_secs")]
    pub activation_retry_secs: u64,
    /// Upper bound on how long an engine state change can go unnoticed.
    #[serde(default = "default_status_poll_secs")]
    pub status_poll_secs: u64,
    /// Poll bound for the network-up wait so stop stays observable.
    #[serde(default = "default_network_poll_ms")]
    pub network_poll_ms: u64,
    /// Capacity of the engine's publish mailbox.
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive_secs() -> u64 {
    60
}

fn default_activation_retry_secs() -> u64 {
    1
}

fn default_status_poll_secs() -> u64 {
    3
}

fn default_network_poll_ms() -> u64 {
    500
}

fn default_mailbox_capacity() -> usize {
    64
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            activation_max_attempts: None,
            activation_retry_secs: default_activation_retry_secs(),
            status_poll_secs: default_status_poll_secs(),
            network_poll_ms: default_network_poll_ms(),
            mailbox_capacity: default_mailbox_capacity(),
        }
    }
}

impl SessionSection {
    pub fn activation_retry(&self) -> Duration {
        Duration::from_secs(self.activation_retry_secs)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_secs(self.status_poll_secs)
    }

    pub fn network_poll(&self) -> Duration {
        Duration::from_millis(self.network_poll_ms)
    }
}

impl BrokerSection {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    FileRead(#[source] std::io::Error),
    #[error("failed to parse config file")]
    Parse(#[source] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ServiceConfig {
    /// Load and validate a configuration from a TOML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::FileRead)?;
        let config: ServiceConfig = toml::from_str(&contents).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the parameters a session cannot run without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if Url::parse(&self.cloud.base_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "cloud.base_url is not a valid url: {:?}",
                self.cloud.base_url
            )));
        }
        if self.device.bssid.is_empty() {
            return Err(ConfigError::Invalid("device.bssid must not be empty".into()));
        }
        if self.device.product_id.is_empty() {
            return Err(ConfigError::Invalid(
                "device.product_id must not be empty".into(),
            ));
        }
        if self.device.product_key.is_empty() {
            return Err(ConfigError::Invalid(
                "device.product_key must not be empty".into(),
            ));
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker.host must not be empty".into()));
        }
        if self.broker.subscribe_qos > 2 {
            return Err(ConfigError::Invalid(format!(
                "broker.subscribe_qos must be 0..=2, got {}",
                self.broker.subscribe_qos
            )));
        }
        if self.session.mailbox_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session.mailbox_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_toml() -> &'static str {
        r#"
            [cloud]
            base_url = "http://api.example.io"

            [device]
            bssid = "c8:93:46:00:00:01"
            product_id = "prod-1"
            product_key = "secret-key"
            user_token = "user-1"
            rom_version = "1.0.0"

            [broker]
            host = "broker.example.io"
        "#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config: ServiceConfig = toml::from_str(valid_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.keepalive_secs, 60);
        assert_eq!(config.session.activation_max_attempts, None);
        assert_eq!(config.session.status_poll_secs, 3);
        assert_eq!(config.session.mailbox_capacity, 64);
    }

    #[test]
    fn empty_bssid_rejected() {
        let mut config: ServiceConfig = toml::from_str(valid_toml()).unwrap();
        config.device.bssid.clear();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_base_url_rejected() {
        let mut config: ServiceConfig = toml::from_str(valid_toml()).unwrap();
        config.cloud.base_url = "not a url".into();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn out_of_range_qos_rejected() {
        let mut config: ServiceConfig = toml::from_str(valid_toml()).unwrap();
        config.broker.subscribe_qos = 3;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cloudlink.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        let config = ServiceConfig::load_from_file(&path).unwrap();
        assert_eq!(config.device.product_id, "prod-1");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let result = ServiceConfig::load_from_file("/nonexistent/cloudlink.toml");
        assert!(matches!(result, Err(ConfigError::FileRead(_))));
    }
}
