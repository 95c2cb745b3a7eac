//! Binds exactly one registered handler to the room's current stage.

use crate::machine::StageMachine;
use crate::stage::Stage;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What an active handler is given when its stage begins.
#[derive(Clone)]
pub struct HandlerContext {
    pub room_id: String,
    pub stage: Stage,
    pub machine: StageMachine,
}

/// A conversational handler for one stage.
///
/// Handlers must still call `should_agent_speak` before producing output: the
/// orchestrator only guarantees that no two handlers are active at once.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn activate(&self, ctx: HandlerContext) -> Result<()>;

    /// Stop producing output. Returns once the handler has wound down.
    async fn deactivate(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorOutcome {
    /// The interview reached `End`.
    Completed,
    Cancelled,
}

pub struct Orchestrator {
    machine: StageMachine,
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(machine: StageMachine) -> Self {
        let poll_interval = machine.config().poll_interval();
        Self {
            machine,
            handlers: HashMap::new(),
            poll_interval,
            cancel: CancellationToken::new(),
        }
    }

    /// Registers `handler` for `stage`, replacing any earlier registration.
    pub fn register(mut self, stage: Stage, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(stage, handler);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Cancelling this token stops `run` after deactivating the active handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Watches the stage until the interview ends or the token is cancelled.
    ///
    /// The shared store is re-read on every poll; local transitions also wake
    /// the loop immediately. On a change the outgoing handler is fully
    /// deactivated before the incoming one is activated.
    pub async fn run(self) -> OrchestratorOutcome {
        let mut changes = self.machine.subscribe();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_stage: Option<Stage> = None;
        let mut active: Option<(Stage, Arc<dyn StageHandler>)> = None;

        loop {
            let current = self.machine.get_current_stage().await;

            if last_stage != Some(current) {
                tracing::info!("Stage changed to: {}", current);

                if let Some((stage, handler)) = active.take() {
                    Self::deactivate(stage, handler).await;
                }

                if current.is_terminal() {
                    tracing::info!("Interview ended");
                    return OrchestratorOutcome::Completed;
                }

                active = self.activate(current).await;
                last_stage = Some(current);
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Orchestrator cancelled");
                    if let Some((stage, handler)) = active.take() {
                        Self::deactivate(stage, handler).await;
                    }
                    return OrchestratorOutcome::Cancelled;
                }
                _ = ticker.tick() => {}
                Ok(()) = changes.changed() => {}
            }
        }
    }

    async fn activate(&self, stage: Stage) -> Option<(Stage, Arc<dyn StageHandler>)> {
        let Some(handler) = self.handlers.get(&stage).cloned() else {
            tracing::debug!("No handler registered for {}", stage);
            return None;
        };
        let Some(room_id) = self.machine.room_id().await else {
            tracing::warn!("Stage machine has no room; not activating {} handler", stage);
            return None;
        };
        let ctx = HandlerContext {
            room_id,
            stage,
            machine: self.machine.clone(),
        };
        match handler.activate(ctx).await {
            Ok(()) => {
                tracing::info!("{} handler activated", stage);
                Some((stage, handler))
            }
            Err(e) => {
                tracing::error!("Error activating {} handler: {:?}", stage, e);
                None
            }
        }
    }

    async fn deactivate(stage: Stage, handler: Arc<dyn StageHandler>) {
        match handler.deactivate().await {
            Ok(()) => tracing::info!("{} handler deactivated", stage),
            Err(e) => tracing::error!("Error closing {} handler: {:?}", stage, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterviewConfig;
    use crate::store::{KeyValueStore, MemoryStore, StageStore};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records lifecycle calls and the peak number of concurrently active handlers.
    #[derive(Clone, Default)]
    struct Journal {
        events: Arc<Mutex<Vec<String>>>,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Journal {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    struct RecordingHandler {
        name: &'static str,
        journal: Journal,
        fail_activation: bool,
    }

    impl RecordingHandler {
        fn new(name: &'static str, journal: &Journal) -> Arc<Self> {
            Arc::new(Self {
                name,
                journal: journal.clone(),
                fail_activation: false,
            })
        }

        fn failing(name: &'static str, journal: &Journal) -> Arc<Self> {
            Arc::new(Self {
                name,
                journal: journal.clone(),
                fail_activation: true,
            })
        }
    }

    #[async_trait]
    impl StageHandler for RecordingHandler {
        async fn activate(&self, ctx: HandlerContext) -> Result<()> {
            if self.fail_activation {
                self.journal.events.lock().unwrap().push(format!("fail {}", self.name));
                anyhow::bail!("{} could not start", self.name);
            }
            assert!(ctx.machine.should_agent_speak(ctx.stage).await);
            let now = self.journal.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.journal.peak.fetch_max(now, Ordering::SeqCst);
            self.journal.events.lock().unwrap().push(format!("activate {}", self.name));
            Ok(())
        }

        async fn deactivate(&self) -> Result<()> {
            // Graceful shutdown takes a while; the next handler must wait for it.
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.journal.active.fetch_sub(1, Ordering::SeqCst);
            self.journal.events.lock().unwrap().push(format!("deactivate {}", self.name));
            Ok(())
        }
    }

    fn machine_with(config: InterviewConfig) -> StageMachine {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        StageMachine::new(Arc::new(config), Some(StageStore::new(backend)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_swap_in_stage_order() {
        let machine = machine_with(InterviewConfig::default());
        machine.initialize("orc").await;
        let journal = Journal::default();
        let orchestrator = Orchestrator::new(machine.clone())
            .register(Stage::SelfIntro, RecordingHandler::new("intro", &journal))
            .register(Stage::Experience, RecordingHandler::new("experience", &journal));
        let run = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        machine.transition_to_next().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        machine.transition_to_next().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        machine.transition_to_next().await.unwrap();

        assert_eq!(run.await.unwrap(), OrchestratorOutcome::Completed);
        assert_eq!(
            journal.events(),
            vec![
                "activate intro",
                "deactivate intro",
                "activate experience",
                "deactivate experience",
            ]
        );
        assert_eq!(journal.peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_timers_drive_interview_to_completion() {
        let config = InterviewConfig::default()
            .with_fallback_timeout(Stage::Start, 1)
            .with_fallback_timeout(Stage::SelfIntro, 2)
            .with_fallback_timeout(Stage::Experience, 2);
        let machine = machine_with(config);
        machine.initialize("auto").await;
        let journal = Journal::default();
        let orchestrator = Orchestrator::new(machine.clone())
            .register(Stage::SelfIntro, RecordingHandler::new("intro", &journal))
            .register(Stage::Experience, RecordingHandler::new("experience", &journal));

        let outcome = tokio::time::timeout(Duration::from_secs(30), orchestrator.run())
            .await
            .expect("interview should finish on fallback timers alone");
        assert_eq!(outcome, OrchestratorOutcome::Completed);
        assert_eq!(machine.get_current_stage().await, Stage::End);
        assert_eq!(journal.events().len(), 4);
        assert_eq!(journal.peak(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_deactivates_active_handler() {
        let machine = machine_with(InterviewConfig::default());
        machine.initialize("cancel").await;
        machine.transition_to_next().await.unwrap();
        let journal = Journal::default();
        let orchestrator = Orchestrator::new(machine.clone())
            .register(Stage::SelfIntro, RecordingHandler::new("intro", &journal));
        let token = orchestrator.cancellation_token();
        let run = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        assert_eq!(run.await.unwrap(), OrchestratorOutcome::Cancelled);
        assert_eq!(journal.events(), vec!["activate intro", "deactivate intro"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_activation_leaves_nothing_active() {
        let machine = machine_with(InterviewConfig::default());
        machine.initialize("broken").await;
        machine.transition_to_next().await.unwrap();
        let journal = Journal::default();
        let orchestrator = Orchestrator::new(machine.clone())
            .register(Stage::SelfIntro, RecordingHandler::failing("intro", &journal))
            .register(Stage::Experience, RecordingHandler::new("experience", &journal));
        let run = tokio::spawn(orchestrator.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        machine.transition_to_next().await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        machine.transition_to_next().await.unwrap();

        assert_eq!(run.await.unwrap(), OrchestratorOutcome::Completed);
        assert_eq!(
            journal.events(),
            vec!["fail intro", "activate experience", "deactivate experience"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_follows_transitions_made_by_another_process() {
        let backend: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = Arc::new(InterviewConfig::default());
        let driver = StageMachine::new(config.clone(), Some(StageStore::new(backend.clone())));
        let follower = StageMachine::new(config, Some(StageStore::new(backend)));
        driver.initialize("remote").await;
        assert!(follower.resume("remote").await);

        let journal = Journal::default();
        let orchestrator = Orchestrator::new(follower)
            .register(Stage::SelfIntro, RecordingHandler::new("intro", &journal))
            .with_poll_interval(Duration::from_millis(100));
        let run = tokio::spawn(orchestrator.run());

        driver.transition_to_next().await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(journal.events(), vec!["activate intro"]);

        driver.transition_to_stage(Stage::End).await.unwrap();
        assert_eq!(run.await.unwrap(), OrchestratorOutcome::Completed);
        assert_eq!(journal.events(), vec!["activate intro", "deactivate intro"]);
    }
}
