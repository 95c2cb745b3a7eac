//! The authoritative stage machine of one interview room.
//!
//! All transitions run under one async lock, so the `(current_stage,
//! stage_entered_at)` pair, the fallback timer and the write-through to the
//! shared store always move together. The local copy is only a cache: every
//! authoritative read re-checks the shared store first.

use crate::config::InterviewConfig;
use crate::error::StageError;
use crate::stage::Stage;
use crate::store::StageStore;
use crate::timer::{TimerId, TimerRegistry};
use crate::transcript::{Role, TranscriptEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};

/// Per-room interview state.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    room_id: Option<String>,
    current_stage: Stage,
    stage_entered_at: Option<DateTime<Utc>>,
    // Stages whose opening action has been taken.
    openings: HashSet<Stage>,
}

impl SessionState {
    fn new(room_id: Option<String>) -> Self {
        Self {
            room_id,
            current_stage: Stage::Start,
            stage_entered_at: None,
            openings: HashSet::new(),
        }
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn current_stage(&self) -> Stage {
        self.current_stage
    }

    pub fn stage_entered_at(&self) -> Option<DateTime<Utc>> {
        self.stage_entered_at
    }

    // The only way the stage changes: both fields at once.
    fn enter(&mut self, stage: Stage, at: DateTime<Utc>) {
        self.current_stage = stage;
        self.stage_entered_at = Some(at);
    }

    fn take_opening(&mut self, stage: Stage) -> bool {
        self.openings.insert(stage)
    }

    fn duration(&self) -> Duration {
        self.stage_entered_at
            .and_then(|at| (Utc::now() - at).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

/// Point-in-time view of a room, as reported to a control layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStatus {
    pub room_id: String,
    pub stage: Stage,
    pub stage_entered_at: Option<DateTime<Utc>>,
    /// Seconds since `stage_entered_at`.
    pub stage_duration: f64,
    pub status: SessionStatus,
}

struct MachineState {
    session: SessionState,
    timers: TimerRegistry,
    // Last write-through failed; the store may hold an older stage than we do.
    unsynced: bool,
}

struct Inner {
    config: Arc<InterviewConfig>,
    store: Option<StageStore>,
    state: Mutex<MachineState>,
    stage_tx: watch::Sender<Stage>,
}

/// Cheap to clone; every clone drives the same room.
#[derive(Clone)]
pub struct StageMachine {
    inner: Arc<Inner>,
}

impl StageMachine {
    /// Without a store the machine runs purely on local memory.
    pub fn new(config: Arc<InterviewConfig>, store: Option<StageStore>) -> Self {
        let (stage_tx, _) = watch::channel(Stage::Start);
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                state: Mutex::new(MachineState {
                    session: SessionState::new(None),
                    timers: TimerRegistry::new(),
                    unsynced: false,
                }),
                stage_tx,
            }),
        }
    }

    pub fn config(&self) -> &InterviewConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Option<&StageStore> {
        self.inner.store.as_ref()
    }

    /// Whether both handles drive the same machine.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Starts a fresh interview for `room_id` at `Start`, persisting it and
    /// arming the `Start` fallback timer when configured.
    pub async fn initialize(&self, room_id: impl Into<String>) {
        let room_id = room_id.into();
        let mut state = self.inner.state.lock().await;
        state.session = SessionState::new(Some(room_id.clone()));
        state.unsynced = false;
        self.inner.enter_stage(&mut state, Stage::Start).await;
        tracing::info!(room_id = %room_id, "Stage machine initialized");
    }

    /// Attaches to a room some other process is driving. Adopts the stored
    /// stage without writing anything or arming timers. Returns whether a
    /// stored stage was found.
    pub async fn resume(&self, room_id: impl Into<String>) -> bool {
        let room_id = room_id.into();
        let mut state = self.inner.state.lock().await;
        state.timers.cancel();
        state.session = SessionState::new(Some(room_id.clone()));
        state.unsynced = false;
        let Some(store) = &self.inner.store else {
            return false;
        };
        match store.load_stage(&room_id).await {
            Some(persisted) => {
                let entered_at = persisted.entered_at.unwrap_or_else(Utc::now);
                state.session.enter(persisted.stage, entered_at);
                self.inner.stage_tx.send_replace(persisted.stage);
                tracing::info!(room_id = %room_id, stage = %persisted.stage, "Resumed stage machine");
                true
            }
            None => false,
        }
    }

    /// The current stage, re-read from the shared store when one is configured.
    pub async fn get_current_stage(&self) -> Stage {
        let mut state = self.inner.state.lock().await;
        self.inner.reconcile(&mut state).await;
        state.session.current_stage()
    }

    /// The single-active-speaker check every handler makes before producing output.
    pub async fn should_agent_speak(&self, stage: Stage) -> bool {
        self.get_current_stage().await == stage
    }

    /// Advances along the linear script. `Ok(false)` means already at `End`.
    pub async fn transition_to_next(&self) -> Result<bool, StageError> {
        let mut state = self.inner.state.lock().await;
        Inner::require_room(&state)?;
        self.inner.reconcile(&mut state).await;
        self.inner.advance(&mut state).await
    }

    /// Advances past `from`, but only if the room is still in `from`. The
    /// check and the advance share one lock, so a handler finishing its stage
    /// can never advance a stage a fallback timer already moved into.
    /// `Ok(false)` means the room had already left `from`.
    pub async fn complete_stage(&self, from: Stage) -> Result<bool, StageError> {
        let mut state = self.inner.state.lock().await;
        Inner::require_room(&state)?;
        self.inner.reconcile(&mut state).await;
        let current = state.session.current_stage();
        if current != from {
            tracing::info!("{} already moved on to {}; nothing to complete", from, current);
            return Ok(false);
        }
        self.inner.advance(&mut state).await
    }

    /// Jumps to `target` if the adjacency table has the edge. A rejected
    /// transition leaves the state, the timer and the store untouched.
    pub async fn transition_to_stage(&self, target: Stage) -> Result<(), StageError> {
        let mut state = self.inner.state.lock().await;
        Inner::require_room(&state)?;
        self.inner.reconcile(&mut state).await;
        let current = state.session.current_stage();
        if !current.can_transition_to(target) {
            tracing::warn!("Invalid transition: {} -> {}", current, target);
            return Err(StageError::InvalidTransition {
                from: current,
                to: target,
            });
        }
        self.inner.enter_stage(&mut state, target).await;
        Ok(())
    }

    /// Time since the current stage was entered; zero before the first entry.
    pub async fn get_stage_duration(&self) -> Duration {
        self.inner.state.lock().await.session.duration()
    }

    /// True exactly once per stage per interview: the caller owns the
    /// stage's opening action.
    pub async fn take_opening(&self, stage: Stage) -> bool {
        self.inner.state.lock().await.session.take_opening(stage)
    }

    pub fn check_silence_timeout(&self, silence: Duration) -> bool {
        silence >= self.inner.config.silence_timeout()
    }

    /// Stage of the live fallback timer, if one is pending.
    pub async fn pending_timer(&self) -> Option<Stage> {
        self.inner.state.lock().await.timers.pending()
    }

    pub async fn room_id(&self) -> Option<String> {
        self.inner.state.lock().await.session.room_id.clone()
    }

    pub async fn session(&self) -> SessionState {
        self.inner.state.lock().await.session.clone()
    }

    pub async fn snapshot(&self) -> Result<StageStatus, StageError> {
        let mut state = self.inner.state.lock().await;
        let room_id = Inner::require_room(&state)?;
        self.inner.reconcile(&mut state).await;
        let stage = state.session.current_stage();
        Ok(StageStatus {
            room_id,
            stage,
            stage_entered_at: state.session.stage_entered_at(),
            stage_duration: state.session.duration().as_secs_f64(),
            status: if stage.is_terminal() {
                SessionStatus::Completed
            } else {
                SessionStatus::Active
            },
        })
    }

    /// Appends a turn to the room's transcript. Best-effort; a no-op without
    /// a store or a room.
    pub async fn record_turn(&self, role: Role, content: &str) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let Some(room_id) = self.room_id().await else {
            return;
        };
        store
            .append_transcript(&room_id, &TranscriptEntry::new(role, content))
            .await;
    }

    /// Local stage changes, for waking up watchers without waiting for a poll.
    pub fn subscribe(&self) -> watch::Receiver<Stage> {
        self.inner.stage_tx.subscribe()
    }

    /// Cancels the fallback timer and deletes the room's persisted keys.
    /// Safe to call repeatedly and while a timer is about to fire: whichever
    /// takes the lock second finds nothing left to act on.
    pub async fn cleanup(&self) {
        let mut state = self.inner.state.lock().await;
        state.timers.cancel();
        let Some(room_id) = state.session.room_id.take() else {
            tracing::debug!("Cleanup requested with no active room");
            return;
        };
        state.unsynced = false;
        if let Some(store) = &self.inner.store {
            store.clear_session(&room_id).await;
        }
        tracing::info!(room_id = %room_id, "Stage machine cleaned up");
    }
}

impl Inner {
    fn require_room(state: &MachineState) -> Result<String, StageError> {
        state
            .session
            .room_id
            .clone()
            .ok_or(StageError::NotInitialized)
    }

    /// Brings the local cache in line with the shared store.
    async fn reconcile(&self, state: &mut MachineState) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(room_id) = state.session.room_id.clone() else {
            return;
        };

        if state.unsynced {
            // Our last write never landed; push it instead of adopting the
            // older value still sitting in the store.
            let (stage, entered_at) = (state.session.current_stage, state.session.stage_entered_at);
            if let Some(at) = entered_at {
                state.unsynced = !store.save_stage(&room_id, stage, at).await;
            }
            return;
        }

        let Some(persisted) = store.load_stage(&room_id).await else {
            return;
        };
        if persisted.stage == state.session.current_stage {
            // Same stage, but someone may have re-entered it since.
            if let Some(at) = persisted.entered_at {
                if state.session.stage_entered_at.is_none_or(|local| at > local) {
                    state.session.stage_entered_at = Some(at);
                }
            }
            return;
        }
        tracing::info!(
            room_id = %room_id,
            "Adopting stage {} from shared store (local was {})",
            persisted.stage,
            state.session.current_stage
        );
        state
            .session
            .enter(persisted.stage, persisted.entered_at.unwrap_or_else(Utc::now));
        // The process that made the transition owns the new stage's timer.
        if state
            .timers
            .pending()
            .is_some_and(|pending| pending != persisted.stage)
        {
            state.timers.cancel();
        }
        self.stage_tx.send_replace(persisted.stage);
    }

    async fn advance(self: &Arc<Self>, state: &mut MachineState) -> Result<bool, StageError> {
        Self::require_room(state)?;
        match state.session.current_stage().next() {
            Some(next) => {
                self.enter_stage(state, next).await;
                Ok(true)
            }
            None => {
                tracing::debug!("Already at the final stage; nothing to advance");
                Ok(false)
            }
        }
    }

    /// Cancel the outgoing timer, record the new pair, write through, arm the
    /// new stage's timer. Callers hold the state lock.
    async fn enter_stage(self: &Arc<Self>, state: &mut MachineState, stage: Stage) {
        let previous = state.session.current_stage();
        state.timers.cancel();

        let now = Utc::now();
        state.session.enter(stage, now);

        if let (Some(store), Some(room_id)) = (&self.store, state.session.room_id.clone()) {
            state.unsynced = !store.save_stage(&room_id, stage, now).await;
        }

        tracing::info!("Stage transition: {} -> {}", previous, stage);

        self.arm_fallback(state, stage);
        self.stage_tx.send_replace(stage);
    }

    fn arm_fallback(self: &Arc<Self>, state: &mut MachineState, stage: Stage) {
        let Some(delay) = self.config.fallback_timeout(stage) else {
            return;
        };
        let weak = Arc::downgrade(self);
        state.timers.arm(stage, delay, move |id| async move {
            match weak.upgrade() {
                Some(inner) => inner.fire_fallback(stage, id, delay).await,
                // Machine dropped while we slept.
                None => Ok(()),
            }
        });
    }

    fn fire_fallback(
        self: Arc<Self>,
        stage: Stage,
        id: TimerId,
        delay: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<(), StageError>> + Send>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.timers.release(id) {
                tracing::debug!(%stage, id, "Fallback timer was superseded; ignoring");
                return Ok(());
            }
            self.reconcile(&mut state).await;
            if state.session.current_stage() != stage {
                tracing::debug!(%stage, "Stage already moved on; fallback timer is a no-op");
                return Ok(());
            }
            tracing::warn!(
                "Fallback timer triggered for {} after {}s",
                stage,
                delay.as_secs()
            );
            self.advance(&mut state).await.map(|_| ())
        })
    }
}
