//! # Realtime Channel
//!
//! Fan-out of presentation events to connected viewers.
//!
//! [`RealtimeHub`] wraps a `tokio::sync::broadcast` channel. Every WebSocket
//! session (see [`socket`]) holds its own receiver and forwards events as JSON
//! text frames:
//!
//! ```text
//! {"event":"set_emotion","data":{"emotion":"happy"}}
//! {"event":"state_reset","data":{"emotion":"neutral","animation":"none"}}
//! {"event":"reload_page","data":{}}
//! ```

pub mod socket;

use crate::state::{Animation, Emotion, Snapshot, StateChange};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Buffered events per viewer before a slow viewer starts lagging
pub const DEFAULT_CAPACITY: usize = 100;

/// Events delivered to viewers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum RealtimeEvent {
    SetEmotion { emotion: Emotion },
    SetAnimation { animation: Animation },
    SetAudio { audio_url: String },
    StateReset { emotion: Emotion, animation: Animation },
    ReloadPage {},
}

impl RealtimeEvent {
    pub fn for_change(change: &StateChange) -> Self {
        match change {
            StateChange::Emotion(emotion) => RealtimeEvent::SetEmotion { emotion: *emotion },
            StateChange::Animation(animation) => RealtimeEvent::SetAnimation {
                animation: *animation,
            },
            StateChange::Audio(url) => RealtimeEvent::SetAudio {
                audio_url: url.clone(),
            },
        }
    }

    pub fn reset(snapshot: &Snapshot) -> Self {
        RealtimeEvent::StateReset {
            emotion: snapshot.state.emotion,
            animation: snapshot.state.animation,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RealtimeEvent::SetEmotion { .. } => "set_emotion",
            RealtimeEvent::SetAnimation { .. } => "set_animation",
            RealtimeEvent::SetAudio { .. } => "set_audio",
            RealtimeEvent::StateReset { .. } => "state_reset",
            RealtimeEvent::ReloadPage {} => "reload_page",
        }
    }
}

/// Events a freshly connected viewer needs to converge on `snapshot`
pub fn initial_sync(snapshot: &Snapshot) -> Vec<RealtimeEvent> {
    let mut events = vec![
        RealtimeEvent::SetEmotion {
            emotion: snapshot.state.emotion,
        },
        RealtimeEvent::SetAnimation {
            animation: snapshot.state.animation,
        },
    ];
    if let Some(url) = &snapshot.state.audio {
        events.push(RealtimeEvent::SetAudio {
            audio_url: url.clone(),
        });
    }
    events
}

#[derive(Debug, Clone)]
pub struct RealtimeHub {
    tx: broadcast::Sender<RealtimeEvent>,
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Sends `event` to every connected viewer and returns how many were reached
    pub fn emit(&self, event: RealtimeEvent) -> usize {
        let name = event.name();
        match self.tx.send(event) {
            Ok(viewers) => {
                debug!("Emitted {} to {} viewer(s)", name, viewers);
                viewers
            }
            Err(_) => {
                debug!("Emitted {} with no viewers connected", name);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.tx.subscribe()
    }

    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
