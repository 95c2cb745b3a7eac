//! Room-keyed entry points for a control layer (HTTP API, operator tools).

use crate::config::InterviewConfig;
use crate::error::ControlError;
use crate::machine::{SessionStatus, StageMachine, StageStatus};
use crate::stage::Stage;
use crate::store::StageStore;
use crate::transcript::TranscriptEntry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct SessionRegistry {
    config: Arc<InterviewConfig>,
    store: Option<StageStore>,
    sessions: Mutex<HashMap<String, StageMachine>>,
}

impl SessionRegistry {
    pub fn new(config: Arc<InterviewConfig>, store: Option<StageStore>) -> Self {
        Self {
            config,
            store,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> Option<&StageStore> {
        self.store.as_ref()
    }

    /// Starts (or restarts) the interview of `room_id` and moves it straight
    /// into `SelfIntro`.
    pub async fn start(
        &self,
        room_id: &str,
        candidate_name: Option<&str>,
    ) -> Result<StageStatus, ControlError> {
        let previous = self.sessions.lock().await.remove(room_id);
        if let Some(previous) = previous {
            tracing::info!(room_id, "Restarting interview; cleaning up previous session");
            previous.cleanup().await;
        }

        let machine = StageMachine::new(self.config.clone(), self.store.clone());
        machine.initialize(room_id).await;
        machine.transition_to_next().await?;

        if let Some(store) = &self.store {
            let name = candidate_name.unwrap_or("Unknown");
            store
                .save_metadata(room_id, &format!("candidate_name:{name}"))
                .await;
        }

        let status = machine.snapshot().await?;
        self.sessions
            .lock()
            .await
            .insert(room_id.to_string(), machine);
        tracing::info!(room_id, "Interview started");
        Ok(status)
    }

    /// With a store, a finished room is reported once more and then released;
    /// later lookups are answered from the store.
    pub async fn status(&self, room_id: &str) -> Result<StageStatus, ControlError> {
        let machine = self.machine(room_id).await?;
        let status = machine.snapshot().await?;
        if status.status == SessionStatus::Completed && self.store.is_some() {
            self.forget(room_id, &machine).await;
        }
        Ok(status)
    }

    /// Jumps to `target` when given, otherwise advances one stage.
    pub async fn transition(
        &self,
        room_id: &str,
        target: Option<&str>,
    ) -> Result<StageStatus, ControlError> {
        let machine = self.machine(room_id).await?;
        match target {
            Some(name) => {
                let stage: Stage = name.parse()?;
                machine.transition_to_stage(stage).await?;
            }
            None => {
                if !machine.transition_to_next().await? {
                    return Err(ControlError::NoFurtherStage);
                }
            }
        }
        Ok(machine.snapshot().await?)
    }

    /// Ends the interview and releases the room. Returns the stage the room
    /// finished in, which is `End` unless the current stage has no edge to it.
    pub async fn stop(&self, room_id: &str) -> Result<Stage, ControlError> {
        let active = self.sessions.lock().await.remove(room_id);
        let machine = match active {
            Some(machine) => machine,
            None => self.resume(room_id).await?,
        };

        let current = machine.get_current_stage().await;
        if current.can_transition_to(Stage::End) {
            if let Err(e) = machine.transition_to_stage(Stage::End).await {
                tracing::warn!(room_id, "Could not end interview cleanly: {}", e);
            }
        } else if !current.is_terminal() {
            tracing::warn!(room_id, "Stopping interview from {} without entering end", current);
        }

        let final_stage = machine.session().await.current_stage();
        machine.cleanup().await;
        tracing::info!(room_id, %final_stage, "Interview stopped");
        Ok(final_stage)
    }

    /// The transcript outlives the session, so this reads the store directly.
    pub async fn transcript(&self, room_id: &str) -> Result<Vec<TranscriptEntry>, ControlError> {
        let store = self
            .store
            .as_ref()
            .ok_or(ControlError::TranscriptUnavailable)?;
        Ok(store.transcript(room_id).await)
    }

    /// Rooms still in progress. Rooms that reached `End` on their own are
    /// left out, and released when a store can answer for them.
    pub async fn active_sessions(&self) -> Vec<String> {
        let sessions: Vec<(String, StageMachine)> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(room, machine)| (room.clone(), machine.clone()))
            .collect();

        let mut rooms = Vec::with_capacity(sessions.len());
        for (room, machine) in sessions {
            if machine.get_current_stage().await.is_terminal() {
                if self.store.is_some() {
                    self.forget(&room, &machine).await;
                }
            } else {
                rooms.push(room);
            }
        }
        rooms.sort();
        rooms
    }

    // Only removes the entry if it is still `machine`; a restart may have
    // replaced it meanwhile.
    async fn forget(&self, room_id: &str, machine: &StageMachine) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(room_id).is_some_and(|current| current.ptr_eq(machine)) {
            sessions.remove(room_id);
            tracing::debug!(room_id, "Released finished session");
        }
    }

    /// `None` when running without a store.
    pub async fn store_healthy(&self) -> Option<bool> {
        match &self.store {
            Some(store) => Some(store.is_healthy().await),
            None => None,
        }
    }

    async fn machine(&self, room_id: &str) -> Result<StageMachine, ControlError> {
        if let Some(machine) = self.sessions.lock().await.get(room_id) {
            return Ok(machine.clone());
        }
        let machine = self.resume(room_id).await?;
        let mut sessions = self.sessions.lock().await;
        Ok(sessions
            .entry(room_id.to_string())
            .or_insert(machine)
            .clone())
    }

    // A room another process started; only the shared store knows about it.
    async fn resume(&self, room_id: &str) -> Result<StageMachine, ControlError> {
        let machine = StageMachine::new(self.config.clone(), self.store.clone());
        if machine.resume(room_id).await {
            Ok(machine)
        } else {
            Err(ControlError::NotFound(room_id.to_string()))
        }
    }
}
