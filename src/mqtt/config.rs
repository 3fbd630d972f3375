use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection and topic settings for the MQTT link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    /// Subscription filter, e.g. `avatar/#`
    pub topic_filter: String,
    /// Prefix of inbound field topics and of the `<prefix>/<field>/state` republishes
    pub topic_prefix: String,
    pub reconnect_interval_secs: u64,
    /// Capacity of the inbound and outbound message queues
    pub channel_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: 1883,
            client_id: format!("avatarsync-{}", std::process::id()),
            user: None,
            password: None,
            keep_alive_secs: 60,
            topic_filter: "avatar/#".to_string(),
            topic_prefix: "avatar".to_string(),
            reconnect_interval_secs: 5,
            channel_capacity: 100,
        }
    }
}

impl MqttConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

/// Topic on which the current value of `field` is republished
pub fn state_topic(prefix: &str, field: &str) -> String {
    format!("{}/{}/state", prefix, field)
}
