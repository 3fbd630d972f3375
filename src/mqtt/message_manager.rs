use chrono::NaiveDateTime;
use std::fmt;
use tokio::sync::mpsc;

/// A message travelling between the broker and the bridge, in either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttMessage {
    pub topic: String,
    pub content: String,
    pub timestamp: NaiveDateTime,
}

impl fmt::Display for MqttMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.content.chars().take(40).collect();
        if preview.len() < self.content.len() {
            write!(f, "{} - {}: {}...", self.timestamp, self.topic, preview)
        } else {
            write!(f, "{} - {}: {}", self.timestamp, self.topic, preview)
        }
    }
}

impl MqttMessage {
    pub fn from_topic(topic: impl Into<String>, content: impl Into<String>) -> Self {
        MqttMessage {
            topic: topic.into(),
            content: content.into(),
            timestamp: chrono::Local::now().naive_local(),
        }
    }
}

/// Channel ends owned by the link
pub struct MsgManager {
    /// Messages received from the broker, consumed by the bridge
    pub received_msg: mpsc::Sender<MqttMessage>,
    /// Messages from the bridge waiting to be published
    pub distribution_msg: mpsc::Receiver<MqttMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_truncates_long_payloads() {
        let long = MqttMessage::from_topic("avatar/voice", "x".repeat(100));
        let shown = long.to_string();
        assert!(shown.ends_with("..."));
        assert!(shown.contains("avatar/voice"));

        let short = MqttMessage::from_topic("avatar/emotion", "happy");
        assert!(short.to_string().ends_with("avatar/emotion: happy"));
    }
}
