//! Configuration for the playground binary
//!
//! Loaded from a TOML file with `[mqtt]` and `[console]` sections. Every field
//! has a default, so an empty file (or no file at all) is a valid configuration.
//! Credentials are never stored in the file: it names environment variables
//! that are read when connection options are built.

use crate::transport::{qos_from_level, ConnectOptions, QoS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_BROKER_URL: &str = "mqtt://localhost:1883";
pub const DEFAULT_TOPIC: &str = "test/topic";
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlaygroundConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub console: ConsoleSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MqttSection {
    /// Broker URL, e.g. `mqtt://host:1883` or `wss://host:8084/mqtt`
    pub broker_url: String,
    /// Fixed client id; a random `playground_` id is generated when unset
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    pub clean_session: bool,
    /// Delay between reconnect attempts; 0 disables reconnects
    pub reconnect_interval_ms: u64,
    pub keep_alive_secs: u64,
    /// PEM CA bundle for `mqtts://` and `wss://` brokers
    pub ca_file: Option<PathBuf>,
    /// Capacity of the outgoing request queue
    pub request_capacity: usize,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            client_id: None,
            username_env: None,
            password_env: None,
            clean_session: true,
            reconnect_interval_ms: 3000,
            keep_alive_secs: 60,
            ca_file: None,
            request_capacity: 10,
        }
    }
}

/// Settings for the interactive console
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleSection {
    /// Topic subscribed on startup and used when no topic is given
    pub default_topic: String,
    /// Received messages kept in memory
    pub history_limit: usize,
    /// QoS for subscriptions and publishes (0, 1 or 2)
    pub qos: u8,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            default_topic: DEFAULT_TOPIC.to_string(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            qos: 0,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PlaygroundConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: PlaygroundConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.broker_url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.broker_url must not be empty".to_string(),
            ));
        }
        if self.mqtt.request_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.request_capacity must be at least 1".to_string(),
            ));
        }
        if self.console.history_limit == 0 {
            return Err(ConfigError::InvalidConfig(
                "console.history_limit must be at least 1".to_string(),
            ));
        }
        self.qos()?;
        Ok(())
    }

    /// Subscribe/publish QoS from `console.qos`
    pub fn qos(&self) -> Result<QoS, ConfigError> {
        qos_from_level(self.console.qos).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Build connection options, resolving credentials from the environment.
    ///
    /// A configured `username_env` that is not set is an error; a missing
    /// password is treated as empty.
    pub fn connect_options(&self) -> Result<ConnectOptions, ConfigError> {
        let mqtt = &self.mqtt;
        let mut options = ConnectOptions::new()
            .with_clean_session(mqtt.clean_session)
            .with_reconnect_interval(Duration::from_millis(mqtt.reconnect_interval_ms))
            .with_keep_alive(Duration::from_secs(mqtt.keep_alive_secs))
            .with_request_capacity(mqtt.request_capacity);

        if let Some(client_id) = &mqtt.client_id {
            options = options.with_client_id(client_id.clone());
        }
        if let Some(ca_file) = &mqtt.ca_file {
            options = options.with_ca_file(ca_file.clone());
        }

        if let Some(username_env) = &mqtt.username_env {
            let username = self
                .get_mqtt_username()
                .ok_or_else(|| ConfigError::EnvVarNotFound(username_env.clone()))?;
            let password = self.get_mqtt_password().unwrap_or_default();
            options = options.with_credentials(username, password);
        }

        Ok(options)
    }

    /// Render as TOML, for `config --show`
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
broker_url = "wss://broker.emqx.io:8084/mqtt"
client_id = "bench-01"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
clean_session = false
reconnect_interval_ms = 500
keep_alive_secs = 30
request_capacity = 64

[console]
default_topic = "sensors/#"
history_limit = 20
qos = 1
"#;

        let config: PlaygroundConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.mqtt.broker_url, "wss://broker.emqx.io:8084/mqtt");
        assert_eq!(config.mqtt.client_id.as_deref(), Some("bench-01"));
        assert!(!config.mqtt.clean_session);
        assert_eq!(config.mqtt.request_capacity, 64);
        assert_eq!(config.console.default_topic, "sensors/#");
        assert_eq!(config.console.history_limit, 20);
        assert_eq!(config.qos().unwrap(), QoS::AtLeastOnce);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: PlaygroundConfig = toml::from_str("").unwrap();
        assert_eq!(config, PlaygroundConfig::default());
        assert_eq!(config.mqtt.broker_url, DEFAULT_BROKER_URL);
        assert_eq!(config.console.history_limit, 100);
        assert!(config.mqtt.clean_session);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: PlaygroundConfig = toml::from_str(
            r#"
[mqtt]
broker_url = "mqtt://10.0.0.5"
"#,
        )
        .unwrap();

        assert_eq!(config.mqtt.broker_url, "mqtt://10.0.0.5");
        assert_eq!(config.mqtt.reconnect_interval_ms, 3000);
        assert_eq!(config.console.default_topic, DEFAULT_TOPIC);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = PlaygroundConfig::default();
        config.console.qos = 3;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));

        let mut config = PlaygroundConfig::default();
        config.mqtt.broker_url = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = PlaygroundConfig::default();
        config.console.history_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_connect_options_from_defaults() {
        let options = PlaygroundConfig::default().connect_options().unwrap();
        assert_eq!(options.clean_session, Some(true));
        assert_eq!(options.reconnect_interval, Some(Duration::from_millis(3000)));
        assert_eq!(options.keep_alive, Some(Duration::from_secs(60)));
        assert!(options.client_id.is_none());
        assert!(options.credentials.is_none());
    }

    #[test]
    fn test_missing_username_env_var_is_an_error() {
        let mut config = PlaygroundConfig::default();
        config.mqtt.username_env = Some("PLAYGROUND_TEST_UNSET_USERNAME_VAR".to_string());

        let result = config.connect_options();
        assert!(matches!(result, Err(ConfigError::EnvVarNotFound(ref name)) if name == "PLAYGROUND_TEST_UNSET_USERNAME_VAR"));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = PlaygroundConfig::default();
        let rendered = config.to_toml().unwrap();
        let parsed: PlaygroundConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
