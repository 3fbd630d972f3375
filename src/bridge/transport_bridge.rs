use super::inbound::{InboundEvent, InboundKind, InboundSource};
use crate::error::SyncError;
use crate::mqtt::config::state_topic;
use crate::mqtt::message_manager::MqttMessage;
use crate::realtime::{initial_sync, RealtimeEvent, RealtimeHub};
use crate::state::store::{ResetReceiver, StateStore};
use crate::state::{Snapshot, StateChange};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Routes inbound changes into the store and fans accepted changes out to all transports
///
/// The bridge is the only component that broadcasts. It never holds the store
/// lock while emitting: every broadcast uses the snapshot the store returned.
///
/// Commits and their broadcasts are serialized by the `fanout` lock, so viewers
/// and broker subscribers see changes in the order the store committed them.
/// Timer resets are the exception: they commit under the store lock alone and
/// are broadcast later, see [`TransportBridge::forward_reset`].
#[derive(Debug)]
pub struct TransportBridge {
    store: StateStore,
    realtime: RealtimeHub,
    mqtt_out: mpsc::Sender<MqttMessage>,
    topic_prefix: String,
    fanout: Mutex<()>,
}

impl TransportBridge {
    pub fn new(
        store: StateStore,
        realtime: RealtimeHub,
        mqtt_out: mpsc::Sender<MqttMessage>,
        topic_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            realtime,
            mqtt_out,
            topic_prefix: topic_prefix.into(),
            fanout: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn realtime(&self) -> &RealtimeHub {
        &self.realtime
    }

    /// Decodes, applies and broadcasts one inbound event
    ///
    /// Returns the committed snapshot, or `None` for state-inert events
    /// (`Reload`). A rejected event changes nothing and broadcasts nothing.
    pub async fn handle_inbound(
        &self,
        source: InboundSource,
        kind: InboundKind,
        payload: &str,
    ) -> Result<Option<Snapshot>, SyncError> {
        let event = InboundEvent::receive(source, kind, payload);
        let _fanout = self.fanout.lock().await;

        let applied = match event.decode() {
            Ok(decoded) => decoded.apply(&self.store).await,
            Err(e) => Err(e),
        };
        let event = match applied {
            Ok(event) => event,
            Err(e) => {
                warn!("Rejected {} event from {}: {}", kind, source, e);
                return Err(e);
            }
        };

        if event.kind() == InboundKind::Reload {
            self.handle_reload();
        } else {
            for change in event.changes() {
                self.broadcast(change);
            }
        }
        Ok(event.into_snapshot())
    }

    /// Applies an `{OverallEmotion, audio_url}` message as a unit, then broadcasts
    /// emotion and audio
    pub async fn handle_voice_composite(
        &self,
        source: InboundSource,
        payload: &str,
    ) -> Result<Snapshot, SyncError> {
        self.handle_inbound(source, InboundKind::Voice, payload)
            .await?
            .ok_or_else(|| SyncError::InvalidPayload("voice message carried no change".to_string()))
    }

    /// Tells viewers to reload; no state change and nothing goes to MQTT
    pub fn handle_reload(&self) {
        info!("Broadcasting page reload");
        self.realtime.emit(RealtimeEvent::ReloadPage {});
    }

    /// Routes a broker message by topic
    ///
    /// Foreign topics and our own `/state` republishes are ignored.
    pub async fn handle_mqtt_message(
        &self,
        msg: &MqttMessage,
    ) -> Result<Option<Snapshot>, SyncError> {
        match InboundKind::from_topic(&msg.topic, &self.topic_prefix) {
            Some(kind) => {
                info!("MQTT: {} {}", msg.topic, msg.content);
                self.handle_inbound(InboundSource::Mqtt, kind, &msg.content).await
            }
            None => {
                debug!("Ignoring message on topic {}", msg.topic);
                Ok(None)
            }
        }
    }

    /// Emits one accepted change to viewers and republishes it to the broker
    pub fn broadcast(&self, change: &StateChange) {
        self.realtime.emit(RealtimeEvent::for_change(change));
        self.republish(change.field(), change.value());
    }

    /// One `state_reset` to viewers plus the baseline values to the broker
    fn broadcast_reset(&self, snapshot: &Snapshot) {
        info!("Broadcasting state reset (epoch {})", snapshot.epoch);
        self.realtime.emit(RealtimeEvent::reset(snapshot));
        self.republish_snapshot(snapshot);
    }

    /// Explicit reset to baseline, broadcast like a timer reset
    pub async fn reset(&self) -> Snapshot {
        let _fanout = self.fanout.lock().await;
        let snapshot = self.store.reset_to_baseline().await;
        self.broadcast_reset(&snapshot);
        snapshot
    }

    /// Broadcasts a reset committed by the inactivity timer
    ///
    /// Between the commit and this call another task may already have applied
    /// and broadcast a newer change. In that case the transports get the reset
    /// followed by the current state, so nobody ends on baseline while the store
    /// holds the newer value. A reset superseded by a later one is skipped; the
    /// later reset is broadcast on its own.
    pub async fn forward_reset(&self, snapshot: &Snapshot) {
        let _fanout = self.fanout.lock().await;
        let current = self.store.current_snapshot();

        if current.epoch != snapshot.epoch {
            debug!(
                "Skipping reset of epoch {}, store is at epoch {}",
                snapshot.epoch, current.epoch
            );
            return;
        }

        self.broadcast_reset(snapshot);
        if current != *snapshot {
            info!("State changed after the reset, resending current state");
            for event in initial_sync(&current) {
                self.realtime.emit(event);
            }
            self.republish_snapshot(&current);
        }
    }

    fn republish_snapshot(&self, snapshot: &Snapshot) {
        self.republish("emotion", snapshot.state.emotion.to_string());
        self.republish("animation", snapshot.state.animation.to_string());
        self.republish("audio", snapshot.state.audio.clone().unwrap_or_default());
    }

    // Best-effort: a full queue or a gone link is logged, never returned
    fn republish(&self, field: &str, value: String) {
        let topic = state_topic(&self.topic_prefix, field);
        if let Err(e) = self.mqtt_out.try_send(MqttMessage::from_topic(topic.clone(), value)) {
            warn!(
                "Republish to {} skipped: {}",
                topic,
                SyncError::TransportUnavailable(e.to_string())
            );
        }
    }

    /// Drains broker messages and timer resets until `shutdown` is cancelled
    ///
    /// Messages are handled one at a time, each to completion including its broadcast.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<MqttMessage>,
        mut resets: ResetReceiver,
        shutdown: CancellationToken,
    ) {
        info!("Transport bridge running");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Transport bridge stopping");
                    break;
                }

                Some(msg) = inbound.recv() => {
                    // rejections are already logged
                    let _ = self.handle_mqtt_message(&msg).await;
                }

                Some(snapshot) = resets.recv() => {
                    self.forward_reset(&snapshot).await;
                }

                else => break,
            }
        }
    }
}
