//! # MQTT Link
//!
//! Persistent broker connection for the avatar topics.
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker, topic and reconnect settings
//! ├── message_manager.rs  - Message representation and the link's channel ends
//! └── mqtt_handler.rs     - Connection loop, subscribe, publish, reconnect
//! ```
//!
//! The link knows nothing about presentation state. It subscribes to the
//! configured filter (default `avatar/#`), hands every incoming publish to the
//! bridge over an mpsc queue and publishes whatever the bridge queues in the
//! other direction. Publishing is best-effort: while disconnected, outbound
//! messages are logged and dropped.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
