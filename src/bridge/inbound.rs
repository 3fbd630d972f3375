//! Inbound event pipeline with statum stages
//!
//! ```text
//! Decoding ──► Applying ──► Broadcasting
//!    │            │
//!    └────────────┴──► rejected (no state change, no broadcast)
//! ```
//!
//! Every payload is fully decoded before the store is touched, so a composite
//! message either applies as a whole or not at all.

use crate::error::SyncError;
use crate::state::store::StateStore;
use crate::state::{Snapshot, StateChange};
use serde::Deserialize;
use statum::{machine, state};
use std::fmt;
use tracing::debug;

/// Transport an inbound event arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundSource {
    Mqtt,
    Api,
}

impl fmt::Display for InboundSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InboundSource::Mqtt => write!(f, "mqtt"),
            InboundSource::Api => write!(f, "api"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Emotion,
    Animation,
    Audio,
    /// Composite emotion + audio message
    Voice,
    /// Stateless page reload
    Reload,
}

impl InboundKind {
    /// Maps `<prefix>/<kind>` to a kind
    ///
    /// Anything else, including `<prefix>/<field>/state`, is `None`.
    pub fn from_topic(topic: &str, prefix: &str) -> Option<Self> {
        let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
        match rest {
            "emotion" => Some(InboundKind::Emotion),
            "animation" => Some(InboundKind::Animation),
            "audio" => Some(InboundKind::Audio),
            "voice" => Some(InboundKind::Voice),
            "reload" => Some(InboundKind::Reload),
            _ => None,
        }
    }
}

impl fmt::Display for InboundKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            InboundKind::Emotion => "emotion",
            InboundKind::Animation => "animation",
            InboundKind::Audio => "audio",
            InboundKind::Voice => "voice",
            InboundKind::Reload => "reload",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Deserialize)]
struct VoiceMessage {
    #[serde(rename = "OverallEmotion")]
    overall_emotion: String,
    audio_url: String,
}

/// Decodes a payload into the typed changes it carries
///
/// Single-field payloads are a bare literal, a JSON string, or a JSON object
/// keyed by the field name. `Reload` carries no change.
pub fn decode_payload(kind: InboundKind, payload: &str) -> Result<Vec<StateChange>, SyncError> {
    match kind {
        InboundKind::Emotion => {
            let literal = field_literal(payload, &["emotion"])?;
            Ok(vec![StateChange::Emotion(literal.parse()?)])
        }
        InboundKind::Animation => {
            let literal = field_literal(payload, &["animation"])?;
            Ok(vec![StateChange::Animation(literal.parse()?)])
        }
        InboundKind::Audio => {
            let url = field_literal(payload, &["audio_url", "url", "audioUrl", "audio"])?;
            let change = StateChange::Audio(url);
            change.validate()?;
            Ok(vec![change])
        }
        InboundKind::Voice => decode_voice(payload),
        InboundKind::Reload => Ok(Vec::new()),
    }
}

fn decode_voice(payload: &str) -> Result<Vec<StateChange>, SyncError> {
    let voice: VoiceMessage = serde_json::from_str(payload)
        .map_err(|e| SyncError::InvalidPayload(format!("voice message: {}", e)))?;

    let emotion = StateChange::Emotion(voice.overall_emotion.parse()?);
    let audio = StateChange::Audio(voice.audio_url);
    audio.validate()?;
    // emotion first, audio second: this is also the broadcast order
    Ok(vec![emotion, audio])
}

fn field_literal(payload: &str, keys: &[&str]) -> Result<String, SyncError> {
    let trimmed = payload.trim();
    if trimmed.starts_with('{') {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(trimmed)
            .map_err(|e| SyncError::InvalidPayload(e.to_string()))?;
        return keys
            .iter()
            .find_map(|key| object.get(*key).and_then(|v| v.as_str()))
            .map(str::to_string)
            .ok_or_else(|| SyncError::InvalidPayload(format!("missing key '{}'", keys[0])));
    }
    if trimmed.starts_with('"') {
        return serde_json::from_str::<String>(trimmed)
            .map_err(|e| SyncError::InvalidPayload(e.to_string()));
    }
    Ok(trimmed.to_string())
}

#[state]
#[derive(Debug, Clone)]
pub enum EventStage {
    Decoding,
    Applying,
    Broadcasting,
}

/// One inbound event moving through the pipeline
#[machine]
#[derive(Debug)]
pub struct InboundEvent<S: EventStage> {
    source: InboundSource,
    kind: InboundKind,
    payload: String,
    changes: Vec<StateChange>,
    snapshot: Option<Snapshot>,
}

impl<S: EventStage> InboundEvent<S> {
    pub fn source(&self) -> InboundSource {
        self.source
    }

    pub fn kind(&self) -> InboundKind {
        self.kind
    }
}

impl InboundEvent<Decoding> {
    pub fn receive(source: InboundSource, kind: InboundKind, payload: &str) -> Self {
        Self::new(source, kind, payload.to_string(), Vec::new(), None)
    }

    pub fn decode(mut self) -> Result<InboundEvent<Applying>, SyncError> {
        self.changes = decode_payload(self.kind, &self.payload)?;
        debug!(
            "Decoded {} event from {} into {} change(s)",
            self.kind,
            self.source,
            self.changes.len()
        );
        Ok(self.transition())
    }
}

impl InboundEvent<Applying> {
    /// Commits all decoded changes in one store transaction; state-inert events pass through
    pub async fn apply(
        mut self,
        store: &StateStore,
    ) -> Result<InboundEvent<Broadcasting>, SyncError> {
        if !self.changes.is_empty() {
            self.snapshot = Some(store.apply_all(&self.changes).await?);
        }
        Ok(self.transition())
    }
}

impl InboundEvent<Broadcasting> {
    pub fn changes(&self) -> &[StateChange] {
        &self.changes
    }

    pub fn into_snapshot(self) -> Option<Snapshot> {
        self.snapshot
    }
}
