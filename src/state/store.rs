//! # State Store
//!
//! Owns the single [`PresentationState`] of the process together with the
//! inactivity reset timer.
//!
//! ## Exclusion Domain
//!
//! The three presentation fields, the pending timer handle and the generation
//! counter live behind one `tokio::sync::Mutex`. Every mutation, every explicit
//! reset and every timer fire goes through it, so:
//! - a reader never sees half of a change
//! - "cancel the old timer, arm a new one" is atomic with respect to other mutations
//! - a timer fire and a mutation never both apply
//!
//! Reads do not take the mutex. The last committed snapshot is published into a
//! `watch` channel while the lock is still held, and [`StateStore::current_snapshot`]
//! reads from there.
//!
//! ## Timer Lifecycle
//!
//! ```text
//! mutation ──► abort pending task ──► generation += 1 ──► spawn sleep_until(deadline)
//!                                                              │
//!                                    generation unchanged? ◄───┘ (takes the mutex)
//!                                       │yes            │no
//!                                       ▼               ▼
//!                              reset + notify      stale fire, ignored
//! ```
//!
//! A fire that lost the race against a newer mutation finds a newer generation
//! and does nothing. The store never broadcasts; timer resets are handed to the
//! bridge through the reset channel returned by [`StateStore::new`].

use super::{Animation, Emotion, PresentationState, Snapshot, StateChange};
use crate::error::SyncError;
use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default inactivity period before the state falls back to baseline
pub const DEFAULT_ACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Receiving side of the timer reset notifications
pub type ResetReceiver = mpsc::UnboundedReceiver<Snapshot>;

#[derive(Debug, Default)]
struct StoreInner {
    state: PresentationState,
    last_activity_at: Option<DateTime<Local>>,
    epoch: u64,
    // Bumped on every arm and every reset; a timer only fires for its own generation
    generation: u64,
    pending_reset: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
}

impl StoreInner {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.clone(),
            last_activity_at: self.last_activity_at,
            epoch: self.epoch,
        }
    }
}

/// Cloneable handle to the process-wide presentation state
#[derive(Clone, Debug)]
pub struct StateStore {
    inner: Arc<Mutex<StoreInner>>,
    snapshot_tx: Arc<watch::Sender<Snapshot>>,
    reset_tx: mpsc::UnboundedSender<Snapshot>,
    activity_timeout: Duration,
}

impl StateStore {
    /// Creates the store at baseline and returns the channel on which timer resets arrive
    pub fn new(activity_timeout: Duration) -> (Self, ResetReceiver) {
        let (snapshot_tx, _) = watch::channel(Snapshot::default());
        let (reset_tx, reset_rx) = mpsc::unbounded_channel();
        info!(
            "Creating state store with activity timeout of {:?}",
            activity_timeout
        );

        let store = Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            snapshot_tx: Arc::new(snapshot_tx),
            reset_tx,
            activity_timeout,
        };
        (store, reset_rx)
    }

    pub fn activity_timeout(&self) -> Duration {
        self.activity_timeout
    }

    pub async fn apply_emotion(&self, emotion: Emotion) -> Result<Snapshot, SyncError> {
        self.apply(StateChange::Emotion(emotion)).await
    }

    pub async fn apply_animation(&self, animation: Animation) -> Result<Snapshot, SyncError> {
        self.apply(StateChange::Animation(animation)).await
    }

    /// Stores the audio url as-is; only empty input is rejected
    pub async fn apply_audio(&self, url: impl Into<String>) -> Result<Snapshot, SyncError> {
        self.apply(StateChange::Audio(url.into())).await
    }

    pub async fn apply(&self, change: StateChange) -> Result<Snapshot, SyncError> {
        self.apply_all(std::slice::from_ref(&change)).await
    }

    /// Applies several changes as one commit
    ///
    /// Every change is validated before the lock is taken. If any of them is
    /// rejected nothing is applied, `last_activity_at` stays untouched and the
    /// timer is left alone. On success the timer is re-armed once.
    pub async fn apply_all(&self, changes: &[StateChange]) -> Result<Snapshot, SyncError> {
        if changes.is_empty() {
            return Err(SyncError::InvalidPayload("no changes to apply".to_string()));
        }
        for change in changes {
            change.validate()?;
        }

        let mut inner = self.inner.lock().await;
        for change in changes {
            change.apply_to(&mut inner.state);
        }
        inner.last_activity_at = Some(Local::now());
        self.arm_reset_timer(&mut inner);

        let snapshot = inner.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        drop(inner);

        for change in changes {
            info!("State changed: {}", change);
        }
        Ok(snapshot)
    }

    /// Puts the state back to `{neutral, none, absent}`
    ///
    /// Cancels a pending timer and does not arm a new one: baseline is the idle state.
    pub async fn reset_to_baseline(&self) -> Snapshot {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.pending_reset.take() {
            handle.abort();
        }
        self.reset_locked(&mut inner)
    }

    pub fn current_snapshot(&self) -> Snapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Instant at which the pending reset fires, `None` when idle
    pub async fn reset_deadline(&self) -> Option<Instant> {
        self.inner.lock().await.deadline
    }

    // The only place where fields go back to baseline; used by explicit resets and timer fires
    fn reset_locked(&self, inner: &mut StoreInner) -> Snapshot {
        inner.state = PresentationState::default();
        inner.deadline = None;
        inner.generation += 1;
        inner.epoch += 1;

        let snapshot = inner.snapshot();
        self.snapshot_tx.send_replace(snapshot.clone());
        info!("State reset to baseline, epoch {}", inner.epoch);
        snapshot
    }

    fn arm_reset_timer(&self, inner: &mut StoreInner) {
        if let Some(handle) = inner.pending_reset.take() {
            handle.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;
        let deadline = Instant::now() + self.activity_timeout;
        inner.deadline = Some(deadline);

        let store = self.clone();
        inner.pending_reset = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            match store.expire(generation).await {
                Ok(snapshot) => debug!("Inactivity reset committed, epoch {}", snapshot.epoch),
                Err(e) => debug!("Ignoring reset timer: {}", e),
            }
        }));
        debug!("Reset timer armed (generation {})", generation);
    }

    /// Timer fire path, serialized through the same mutex as mutations
    async fn expire(&self, generation: u64) -> Result<Snapshot, SyncError> {
        let mut inner = self.inner.lock().await;
        if inner.generation != generation {
            return Err(SyncError::TimerRaceDetected {
                fired: generation,
                current: inner.generation,
            });
        }

        // Our own handle; dropping it detaches the running task
        inner.pending_reset = None;
        info!(
            "No activity for {:?}, resetting to baseline",
            self.activity_timeout
        );
        let snapshot = self.reset_locked(&mut inner);
        if self.reset_tx.send(snapshot.clone()).is_err() {
            warn!("No listener for inactivity resets");
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, sleep, timeout};

    const TIMEOUT: Duration = Duration::from_secs(30);

    async fn generation(store: &StateStore) -> u64 {
        store.inner.lock().await.generation
    }

    #[tokio::test(start_paused = true)]
    async fn apply_updates_only_its_own_field() {
        let (store, _resets) = StateStore::new(TIMEOUT);

        for emotion in Emotion::ALL {
            let snapshot = store.apply_emotion(emotion).await.unwrap();
            assert_eq!(snapshot.state.emotion, emotion);
            assert_eq!(snapshot.state.animation, Animation::None);
            assert_eq!(snapshot.state.audio, None);
        }

        store.apply_audio("/static/mp3/dearbaby.mp3").await.unwrap();
        for animation in Animation::ALL {
            let snapshot = store.apply_animation(animation).await.unwrap();
            assert_eq!(snapshot.state.animation, animation);
            assert_eq!(snapshot.state.emotion, Emotion::Surprised);
            assert_eq!(
                snapshot.state.audio.as_deref(),
                Some("/static/mp3/dearbaby.mp3")
            );
        }
        assert!(store.current_snapshot().last_activity_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_change_leaves_everything_untouched() {
        let (store, _resets) = StateStore::new(TIMEOUT);
        store.apply_emotion(Emotion::Happy).await.unwrap();
        let before = store.current_snapshot();
        let deadline = store.reset_deadline().await;
        let generation_before = generation(&store).await;

        advance(Duration::from_secs(5)).await;
        let err = store
            .apply_all(&[
                StateChange::Emotion(Emotion::Sad),
                StateChange::Audio(String::new()),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::InvalidValue(_)));
        assert_eq!(store.current_snapshot(), before);
        assert_eq!(store.reset_deadline().await, deadline);
        assert_eq!(generation(&store).await, generation_before);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_value_extends_the_deadline() {
        let (store, _resets) = StateStore::new(TIMEOUT);

        let first = store.apply_emotion(Emotion::Angry).await.unwrap();
        let first_deadline = store.reset_deadline().await.unwrap();
        advance(Duration::from_secs(10)).await;
        let second = store.apply_emotion(Emotion::Angry).await.unwrap();
        let second_deadline = store.reset_deadline().await.unwrap();

        assert_eq!(first.state, second.state);
        assert_eq!(second_deadline - first_deadline, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn inactivity_resets_exactly_once() {
        let (store, mut resets) = StateStore::new(TIMEOUT);
        store.apply_emotion(Emotion::Happy).await.unwrap();
        store.apply_audio("http://host/clip.mp3").await.unwrap();

        assert!(timeout(Duration::from_secs(29), resets.recv()).await.is_err());
        assert_eq!(store.current_snapshot().state.emotion, Emotion::Happy);

        let reset = resets.recv().await.unwrap();
        assert!(reset.state.is_baseline());
        assert_eq!(reset.epoch, 1);
        assert!(store.current_snapshot().state.is_baseline());
        assert_eq!(store.reset_deadline().await, None);

        // idle state has no pending timer
        assert!(timeout(Duration::from_secs(300), resets.recv()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_within_timeout_postpone_the_reset() {
        let (store, mut resets) = StateStore::new(TIMEOUT);
        let start = Instant::now();

        for emotion in [Emotion::Happy, Emotion::Sad, Emotion::Angry, Emotion::Happy] {
            store.apply_emotion(emotion).await.unwrap();
            sleep(Duration::from_secs(20)).await;
            assert!(resets.try_recv().is_err());
        }

        resets.recv().await.unwrap();
        // last mutation at t=60s
        let elapsed = Instant::now() - start;
        assert!(elapsed >= Duration::from_secs(90) && elapsed < Duration::from_secs(91));
        assert!(resets.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_fire_is_ignored() {
        let (store, mut resets) = StateStore::new(TIMEOUT);
        store.apply_emotion(Emotion::Sad).await.unwrap();
        let stale = generation(&store).await;
        store.apply_animation(Animation::Dagger).await.unwrap();

        let err = store.expire(stale).await.unwrap_err();
        assert!(matches!(err, SyncError::TimerRaceDetected { .. }));
        assert_eq!(store.current_snapshot().state.animation, Animation::Dagger);
        assert!(resets.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_reset_cancels_pending_timer() {
        let (store, mut resets) = StateStore::new(TIMEOUT);
        store.apply_animation(Animation::Dancing).await.unwrap();

        let snapshot = store.reset_to_baseline().await;
        assert!(snapshot.state.is_baseline());
        assert_eq!(snapshot.epoch, 1);
        assert_eq!(store.reset_deadline().await, None);
        assert!(timeout(Duration::from_secs(120), resets.recv()).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_writers_leave_a_consistent_state() {
        let (store, _resets) = StateStore::new(TIMEOUT);
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let emotion = Emotion::ALL[i % Emotion::ALL.len()];
                let animation = Animation::ALL[i % Animation::ALL.len()];
                store
                    .apply_all(&[
                        StateChange::Emotion(emotion),
                        StateChange::Animation(animation),
                    ])
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let snapshot = store.current_snapshot();
        let paired = (0..50).any(|i| {
            snapshot.state.emotion == Emotion::ALL[i % Emotion::ALL.len()]
                && snapshot.state.animation == Animation::ALL[i % Animation::ALL.len()]
        });
        assert!(paired);
        assert!(store.reset_deadline().await.is_some());
    }
}
