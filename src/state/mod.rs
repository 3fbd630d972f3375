//! # Presentation State
//!
//! Data model for the avatar presentation state and the store that owns it.
//!
//! ```text
//! state/
//! ├── mod.rs    - Emotion, Animation, PresentationState, StateChange, Snapshot
//! └── store.rs  - StateStore with the inactivity reset timer
//! ```
//!
//! The three presentation fields are always read and written together. Readers
//! never see one field of a change without the others; see [`store::StateStore`].

pub mod store;

use crate::error::SyncError;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Facial emotion shown by the avatar
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Emotion {
    #[default]
    Neutral,
    Happy,
    Sad,
    Angry,
    Surprised,
}

impl Emotion {
    pub const ALL: [Emotion; 5] = [
        Emotion::Neutral,
        Emotion::Happy,
        Emotion::Sad,
        Emotion::Angry,
        Emotion::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Neutral => "neutral",
            Emotion::Happy => "happy",
            Emotion::Sad => "sad",
            Emotion::Angry => "angry",
            Emotion::Surprised => "surprised",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let literal = s.trim().to_ascii_lowercase();
        Emotion::ALL
            .into_iter()
            .find(|e| e.as_str() == literal)
            .ok_or_else(|| SyncError::InvalidValue(format!("unknown emotion '{}'", s.trim())))
    }
}

/// Body animation played by the avatar
///
/// `Dancing` travels on the wire as `silly_dancing`; plain `dancing` is accepted on input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Animation {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "silly_dancing", alias = "dancing")]
    Dancing,
    #[serde(rename = "angry")]
    Angry,
    #[serde(rename = "dagger")]
    Dagger,
}

impl Animation {
    pub const ALL: [Animation; 4] = [
        Animation::None,
        Animation::Dancing,
        Animation::Angry,
        Animation::Dagger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Animation::None => "none",
            Animation::Dancing => "silly_dancing",
            Animation::Angry => "angry",
            Animation::Dagger => "dagger",
        }
    }
}

impl fmt::Display for Animation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Animation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let literal = s.trim().to_ascii_lowercase();
        if literal == "dancing" {
            return Ok(Animation::Dancing);
        }
        Animation::ALL
            .into_iter()
            .find(|a| a.as_str() == literal)
            .ok_or_else(|| SyncError::InvalidValue(format!("unknown animation '{}'", s.trim())))
    }
}

/// The three presentation fields; `Default` is the baseline `{neutral, none, absent}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PresentationState {
    pub emotion: Emotion,
    pub animation: Animation,
    pub audio: Option<String>,
}

impl PresentationState {
    pub fn is_baseline(&self) -> bool {
        *self == PresentationState::default()
    }
}

/// A single typed field change, already decoded from its transport payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateChange {
    Emotion(Emotion),
    Animation(Animation),
    Audio(String),
}

impl StateChange {
    /// Rejects changes that cannot be applied; only audio carries free-form input
    pub fn validate(&self) -> Result<(), SyncError> {
        match self {
            StateChange::Audio(url) if url.trim().is_empty() => Err(SyncError::InvalidValue(
                "audio url must not be empty".to_string(),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn apply_to(&self, state: &mut PresentationState) {
        match self {
            StateChange::Emotion(e) => state.emotion = *e,
            StateChange::Animation(a) => state.animation = *a,
            StateChange::Audio(url) => state.audio = Some(url.clone()),
        }
    }

    /// Field name used for topics and log lines
    pub fn field(&self) -> &'static str {
        match self {
            StateChange::Emotion(_) => "emotion",
            StateChange::Animation(_) => "animation",
            StateChange::Audio(_) => "audio",
        }
    }

    /// String representation of the new value
    pub fn value(&self) -> String {
        match self {
            StateChange::Emotion(e) => e.to_string(),
            StateChange::Animation(a) => a.to_string(),
            StateChange::Audio(url) => url.clone(),
        }
    }
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.field(), self.value())
    }
}

/// Point-in-time copy of the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub state: PresentationState,
    /// Wall-clock time of the last accepted mutation; `None` until the first one
    pub last_activity_at: Option<DateTime<Local>>,
    /// Number of resets since process start
    pub epoch: u64,
}
