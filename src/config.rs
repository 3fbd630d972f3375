//! # Configuration
//!
//! Application settings loaded from a TOML file, with environment overrides.
//!
//! Lookup order for the file:
//! 1. `$AVATARSYNC_CONFIG`
//! 2. `<config_dir>/avatarsync/config.toml`
//!
//! A missing file is not an error: every field has a default, so the service
//! starts against a local broker with no configuration at all. The environment
//! variables below are applied on top of the file:
//!
//! | Variable                   | Field                        |
//! |----------------------------|------------------------------|
//! | `MQTT_BROKER`              | `mqtt.broker`                |
//! | `MQTT_PORT`                | `mqtt.port`                  |
//! | `MQTT_TOPIC`               | `mqtt.topic_filter`          |
//! | `MQTT_KEEP_ALIVE_INTERVAL` | `mqtt.keep_alive_secs`       |
//! | `SERVER_ADDRESS`           | `server.address`             |
//! | `SERVER_PORT`              | `server.port`                |
//! | `ACTIVITY_TIMEOUT`         | `activity_timeout_secs`      |

use crate::mqtt::config::MqttConfig;
use crate::state::store::DEFAULT_ACTIVITY_TIMEOUT;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_ENV: &str = "AVATARSYNC_CONFIG";
const CONFIG_DIR: &str = "avatarsync";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Seconds without a mutation before the state falls back to baseline
    pub activity_timeout_secs: u64,
    /// Default tracing filter when `RUST_LOG` is not set
    pub log_level: String,
    pub mqtt: MqttConfig,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: DEFAULT_ACTIVITY_TIMEOUT.as_secs(),
            log_level: "info".to_string(),
            mqtt: MqttConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads the file (if any), applies environment overrides and validates the result
    pub async fn load() -> Result<Self> {
        let path = config_path();
        let mut config = match &path {
            Some(path) => Self::from_file(path).await?,
            None => {
                debug!("No configuration directory available, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?;
        if !exists {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config = Self::from_toml(&content)
            .map_err(|e| eyre!("Invalid config file {}: {}", path.display(), e))?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| eyre!("Failed to parse config: {}", e))
    }

    /// Applies the deployment environment variables; `lookup` is `std::env::var` outside tests
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(broker) = lookup("MQTT_BROKER") {
            self.mqtt.broker = broker;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = parse_var("MQTT_PORT", &port)?;
        }
        if let Some(topic) = lookup("MQTT_TOPIC") {
            self.mqtt.topic_filter = topic;
        }
        if let Some(keep_alive) = lookup("MQTT_KEEP_ALIVE_INTERVAL") {
            self.mqtt.keep_alive_secs = parse_var("MQTT_KEEP_ALIVE_INTERVAL", &keep_alive)?;
        }
        if let Some(address) = lookup("SERVER_ADDRESS") {
            self.server.address = address;
        }
        if let Some(port) = lookup("SERVER_PORT") {
            self.server.port = parse_var("SERVER_PORT", &port)?;
        }
        if let Some(timeout) = lookup("ACTIVITY_TIMEOUT") {
            self.activity_timeout_secs = parse_var("ACTIVITY_TIMEOUT", &timeout)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.activity_timeout_secs == 0 {
            return Err(eyre!("activity_timeout_secs must be greater than zero"));
        }
        if self.mqtt.broker.trim().is_empty() {
            return Err(eyre!("mqtt.broker must not be empty"));
        }
        if self.mqtt.port == 0 || self.server.port == 0 {
            return Err(eyre!("ports must be greater than zero"));
        }
        if self.mqtt.channel_capacity == 0 {
            return Err(eyre!("mqtt.channel_capacity must be greater than zero"));
        }
        if !filter_covers_prefix(&self.mqtt.topic_filter, &self.mqtt.topic_prefix) {
            return Err(eyre!(
                "mqtt.topic_filter '{}' does not cover topics under '{}'",
                self.mqtt.topic_filter,
                self.mqtt.topic_prefix
            ));
        }
        Ok(())
    }

    pub fn activity_timeout(&self) -> Duration {
        Duration::from_secs(self.activity_timeout_secs)
    }
}

fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|mut path| {
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    })
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| eyre!("Invalid value '{}' for {}: {}", value, name, e))
}

/// Whether a subscription filter matches `<prefix>/<anything>`
fn filter_covers_prefix(filter: &str, prefix: &str) -> bool {
    let mut filter_levels = filter.split('/');
    for level in prefix.split('/') {
        match filter_levels.next() {
            Some("#") => return true,
            Some("+") => continue,
            Some(f) if f == level => continue,
            _ => return false,
        }
    }
    matches!(filter_levels.next(), Some("#") | Some("+"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_yields_defaults() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config.activity_timeout_secs, 30);
        assert_eq!(config.mqtt.topic_filter, "avatar/#");
        assert_eq!(config.mqtt.reconnect_interval_secs, 5);
        assert_eq!(config.server.bind_address(), "127.0.0.1:8765");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_values_override_defaults() {
        let config = AppConfig::from_toml(
            r#"
            activity_timeout_secs = 45

            [mqtt]
            broker = "broker.local"
            port = 8883
            user = "neko"
            password = "secret"

            [server]
            address = "0.0.0.0"
            "#,
        )
        .unwrap();

        assert_eq!(config.activity_timeout(), Duration::from_secs(45));
        assert_eq!(config.mqtt.broker, "broker.local");
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.mqtt.user.as_deref(), Some("neko"));
        assert_eq!(config.mqtt.topic_prefix, "avatar");
        assert_eq!(config.server.bind_address(), "0.0.0.0:8765");
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("MQTT_BROKER", "10.0.0.2"),
            ("MQTT_PORT", "1884"),
            ("SERVER_PORT", "9000"),
            ("ACTIVITY_TIMEOUT", "10"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config
            .apply_env_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.mqtt.broker, "10.0.0.2");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.activity_timeout_secs, 10);
    }

    #[test]
    fn malformed_environment_value_is_an_error() {
        let mut config = AppConfig::default();
        let result = config.apply_env_overrides(|key| {
            (key == "MQTT_PORT").then(|| "eighteen".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let mut config = AppConfig {
            activity_timeout_secs: 0,
            ..AppConfig::default()
        };
        assert!(config.validate().is_err());

        config.activity_timeout_secs = 30;
        config.mqtt.topic_filter = "robot/#".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn topic_filter_coverage() {
        assert!(filter_covers_prefix("avatar/#", "avatar"));
        assert!(filter_covers_prefix("#", "avatar"));
        assert!(filter_covers_prefix("avatar/+", "avatar"));
        assert!(filter_covers_prefix("+/#", "avatar"));
        assert!(!filter_covers_prefix("avatar", "avatar"));
        assert!(!filter_covers_prefix("avatar/emotion", "avatar"));
        assert!(!filter_covers_prefix("robot/#", "avatar"));
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("avatarsync-does-not-exist/config.toml");
        let config = AppConfig::from_file(&path).await.unwrap();
        assert_eq!(config.server, ServerConfig::default());
    }
}
