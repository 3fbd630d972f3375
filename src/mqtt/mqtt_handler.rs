use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::MqttConfig;
use super::message_manager::{MqttMessage, MsgManager};
use crate::error::SyncError;

#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MqttStatus {
    pub connection_state: ConnectionState,
    pub error_messages: VecDeque<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

// Older errors are dropped once this many are kept
const MAX_ERROR_MESSAGES: usize = 20;

// Upper bound for flushing queued publishes and the DISCONNECT on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Persistent broker connection
///
/// Forwards every incoming publish to the bridge and publishes what the bridge
/// queues. Connection errors never end the link: it waits the configured
/// reconnect interval and polls again, forever.
pub struct MqttLink {
    status: watch::Sender<MqttStatus>,
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
    msg_manager: MsgManager,
}

impl MqttLink {
    pub fn new(
        config: MqttConfig,
        msg_in: mpsc::Receiver<MqttMessage>,
        msg_out: mpsc::Sender<MqttMessage>,
    ) -> Self {
        let msg_manager = MsgManager {
            received_msg: msg_out,
            distribution_msg: msg_in,
        };

        let mut mqtt_options =
            MqttOptions::new(config.client_id.clone(), config.broker.clone(), config.port);
        mqtt_options.set_keep_alive(config.keep_alive());
        if let Some(user) = &config.user {
            mqtt_options.set_credentials(user.clone(), config.password.clone().unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, config.channel_capacity);
        let (status, _) = watch::channel(MqttStatus::default());

        MqttLink {
            status,
            client,
            eventloop,
            config,
            msg_manager,
        }
    }

    pub fn status(&self) -> watch::Receiver<MqttStatus> {
        self.status.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.status.borrow().connection_state == ConnectionState::Connected
    }

    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| {
            if status.connection_state != state {
                debug!("MQTT state {:?} -> {:?}", status.connection_state, state);
            }
            status.connection_state = state;
        });
    }

    fn record_error(&self, message: String) {
        self.status.send_modify(|status| {
            status.error_messages.push_back(message);
            if status.error_messages.len() > MAX_ERROR_MESSAGES {
                status.error_messages.pop_front();
            }
        });
    }

    /// Drives the connection until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            "MQTT: connecting to {}:{} as {}",
            self.config.broker, self.config.port, self.config.client_id
        );
        self.set_state(ConnectionState::Connecting);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    self.close().await;
                    break;
                }

                Some(msg) = self.msg_manager.distribution_msg.recv() => {
                    self.publish(msg);
                }

                event = self.eventloop.poll() => match event {
                    Ok(event) => self.handle_event(event).await,
                    Err(e) => {
                        let err = SyncError::TransportUnavailable(e.to_string());
                        warn!(
                            "MQTT: {} - retrying in {:?}",
                            err,
                            self.config.reconnect_interval()
                        );
                        self.record_error(err.to_string());
                        self.set_state(ConnectionState::Reconnecting);

                        tokio::select! {
                            _ = shutdown.cancelled() => {}
                            _ = tokio::time::sleep(self.config.reconnect_interval()) => {}
                        }
                    }
                }
            }
        }
    }

    /// Publishes whatever the bridge queued before shutdown, then disconnects
    ///
    /// The event loop is polled until the DISCONNECT has been written, the
    /// connection fails, or [`SHUTDOWN_GRACE`] runs out.
    async fn close(&mut self) {
        info!("MQTT: shutting down link");
        while let Ok(msg) = self.msg_manager.distribution_msg.try_recv() {
            self.publish(msg);
        }

        if self.is_connected() {
            match self.client.try_disconnect() {
                Ok(()) => self.flush_until_disconnect().await,
                Err(e) => debug!("MQTT: disconnect request failed: {}", e),
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn flush_until_disconnect(&mut self) {
        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(SHUTDOWN_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                        debug!("MQTT: disconnect sent");
                        break;
                    }
                    Ok(event) => debug!("MQTT: {:?}", event),
                    Err(e) => {
                        debug!("MQTT: connection closed during shutdown: {}", e);
                        break;
                    }
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("MQTT: disconnect not confirmed within {:?}", SHUTDOWN_GRACE);
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(ack)) => {
                info!(
                    "MQTT: connected to {}:{} ({:?})",
                    self.config.broker, self.config.port, ack.code
                );
                self.set_state(ConnectionState::Connected);
                if let Err(e) = self
                    .client
                    .try_subscribe(self.config.topic_filter.clone(), QoS::AtLeastOnce)
                {
                    error!(
                        "MQTT: failed to subscribe to {}: {}",
                        self.config.topic_filter, e
                    );
                    self.record_error(e.to_string());
                }
            }
            Event::Incoming(Packet::SubAck(_)) => {
                info!("MQTT: subscribed to topic {}", self.config.topic_filter);
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let content = String::from_utf8_lossy(&publish.payload).into_owned();
                let msg = MqttMessage::from_topic(publish.topic, content);
                debug!("MQTT: received {}", msg);
                self.status.send_modify(|status| {
                    status.messages_received += 1;
                    status.last_activity = Some(chrono::Local::now());
                });

                if self.msg_manager.received_msg.send(msg).await.is_err() {
                    warn!("MQTT: bridge is gone, dropping inbound message");
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("MQTT: broker closed the session");
                self.set_state(ConnectionState::Reconnecting);
            }
            other => debug!("MQTT: {:?}", other),
        }
    }

    /// Best-effort publish; failures are logged and dropped
    fn publish(&mut self, msg: MqttMessage) {
        if !self.is_connected() {
            let err = SyncError::TransportUnavailable(format!(
                "not connected, dropping publish to {}",
                msg.topic
            ));
            warn!("MQTT: {}", err);
            return;
        }

        match self
            .client
            .try_publish(msg.topic.clone(), QoS::AtMostOnce, false, msg.content.into_bytes())
        {
            Ok(()) => {
                debug!("MQTT: published to {}", msg.topic);
                self.status.send_modify(|status| {
                    status.messages_sent += 1;
                    status.last_activity = Some(chrono::Local::now());
                });
            }
            Err(e) => {
                let err = SyncError::TransportUnavailable(e.to_string());
                warn!("MQTT: publish to {} failed: {}", msg.topic, err);
                self.record_error(err.to_string());
            }
        }
    }
}

/// Logs every connection state transition until shutdown or until the link is gone
pub async fn log_status_changes(
    mut status: watch::Receiver<MqttStatus>,
    shutdown: CancellationToken,
) {
    let mut last_state = status.borrow().connection_state.clone();
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if current.connection_state != last_state {
                    info!(
                        "MQTT link {:?} (received {}, sent {}, last error: {})",
                        current.connection_state,
                        current.messages_received,
                        current.messages_sent,
                        current.error_messages.back().map_or("none", String::as_str)
                    );
                    last_state = current.connection_state;
                }
            }
        }
    }
}
