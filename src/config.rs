//! Client configuration
//!
//! Configuration is read from TOML. Every section and every field has a
//! default, so an empty file (or [`BusConfig::default`]) yields a client that
//! talks to `mqtt://localhost:1883` as a member of the `default` group with a
//! 10 second request timeout.

use crate::observability::redaction::screen_text;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default deadline for correlated requests
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Default group name
pub const DEFAULT_GROUP: &str = "default";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Client behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// Group used for queue-worker subscriptions (must match [a-zA-Z0-9._-]+)
    #[serde(default = "default_group")]
    pub group: String,
    /// Deadline applied to every request made by this client
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Terminate the process when the initial connection cannot be established
    #[serde(default = "default_exit_on_connection_failure")]
    pub exit_on_connection_failure: bool,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            group: default_group(),
            request_timeout_ms: default_request_timeout_ms(),
            exit_on_connection_failure: default_exit_on_connection_failure(),
        }
    }
}

/// MQTT broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL with protocol and port (`mqtt://` or `mqtts://`)
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Keep alive interval in seconds
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Reconnection backoff
///
/// Reconnection is unlimited: the transport keeps retrying until the client
/// is closed. Delays follow `backoff_ms` and then stay at `sustained_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_sustained_delay_ms")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            sustained_delay_ms: default_sustained_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before the given reconnection attempt (1-based)
    pub fn calculate_backoff_delay(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        let delay = self
            .backoff_ms
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay_ms);
        Duration::from_millis(delay)
    }
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_exit_on_connection_failure() -> bool {
    true
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_keep_alive_secs() -> u64 {
    60
}

fn default_backoff_ms() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay_ms() -> u64 {
    250
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid group name: {0}")]
    InvalidGroup(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BusConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check field formats and ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_group(&self.client.group)?;

        if self.client.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "request_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let url = Url::parse(&self.mqtt.broker_url).map_err(|e| {
            ConfigError::InvalidConfig(format!(
                "broker_url '{}' is not a valid URL: {e}",
                screen_text(&self.mqtt.broker_url)
            ))
        })?;
        if !matches!(url.scheme(), "mqtt" | "mqtts") {
            return Err(ConfigError::InvalidConfig(format!(
                "broker_url scheme must be mqtt or mqtts, got '{}'",
                url.scheme()
            )));
        }

        Ok(())
    }

    /// Deadline applied to requests
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.client.request_timeout_ms)
    }

    /// Builder-style group override
    pub fn with_group<S: Into<String>>(mut self, group: S) -> Self {
        self.client.group = group.into();
        self
    }

    /// Builder-style request timeout override
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.client.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder-style broker URL override
    pub fn with_broker_url<S: Into<String>>(mut self, url: S) -> Self {
        self.mqtt.broker_url = url.into();
        self
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }
}

/// Group names end up inside queue group labels, so keep them to a safe alphabet
fn validate_group(group: &str) -> Result<(), ConfigError> {
    let valid_chars = group
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if group.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidGroup(format!(
            "Group '{group}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
