//! Error definitions for the synchronization core

use thiserror::Error;

/// Errors raised while decoding, applying or fanning out presentation changes
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// A literal that does not name a known emotion or animation, or an empty audio url
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// A message whose structure could not be decoded (malformed composite JSON)
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The broker connection or the outbound queue could not take a publish
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    /// A reset timer fired after a newer mutation re-armed it
    #[error("Stale reset timer (fired generation {fired}, current generation {current})")]
    TimerRaceDetected { fired: u64, current: u64 },
}
