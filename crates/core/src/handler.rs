use crate::Command;
use crate::orchestrator::{HandlerContext, StageHandler};
use crate::stage::Stage;
use crate::transcript::Role;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, mpsc};

/// Phrases in an interviewer turn that mean the stage has run its course.
pub const COMPLETION_PHRASES: [&str; 4] = ["let's move on", "next stage", "move to", "let's discuss"];

pub fn signals_stage_complete(text: &str) -> bool {
    let text = text.to_lowercase();
    COMPLETION_PHRASES.iter().any(|phrase| text.contains(phrase))
}

/// A stage handler that leaves the actual talking to the runtime.
///
/// It opens its stage once, asks the runtime for a reply to each candidate
/// turn while the stage has follow-ups and time left, and moves the interview
/// on when either runs out or the interviewer signals the stage is done.
pub struct ScriptedStageHandler {
    stage: Stage,
    opening: String,
    commands: mpsc::Sender<Command>,
    active: Mutex<Option<HandlerContext>>,
    follow_ups: AtomicU32,
}

impl ScriptedStageHandler {
    pub fn new(stage: Stage, opening: impl Into<String>, commands: mpsc::Sender<Command>) -> Self {
        Self {
            stage,
            opening: opening.into(),
            commands,
            active: Mutex::new(None),
            follow_ups: AtomicU32::new(0),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    async fn context(&self) -> Option<HandlerContext> {
        self.active.lock().await.clone()
    }

    async fn stage_exhausted(&self, ctx: &HandlerContext) -> bool {
        let config = ctx.machine.config();
        if self.follow_ups.load(Ordering::SeqCst) >= config.max_follow_ups(self.stage) {
            return true;
        }
        match config.max_duration(self.stage) {
            Some(max) => ctx.machine.get_stage_duration().await >= max,
            None => false,
        }
    }

    /// Handles a finished candidate turn. Ignored unless this handler is active.
    pub async fn on_user_turn(&self, text: &str) -> Result<()> {
        let Some(ctx) = self.context().await else {
            return Ok(());
        };
        ctx.machine.record_turn(Role::User, text).await;

        if !ctx.machine.should_agent_speak(self.stage).await {
            tracing::info!("Stage changed, {} handler stays silent", self.stage);
            return Ok(());
        }

        if self.stage_exhausted(&ctx).await {
            let duration = ctx.machine.get_stage_duration().await;
            tracing::info!(
                "Transitioning from {} after {:.1}s",
                self.stage,
                duration.as_secs_f64()
            );
            ctx.machine.complete_stage(self.stage).await?;
            return Ok(());
        }

        self.follow_ups.fetch_add(1, Ordering::SeqCst);
        self.commands
            .send(Command::Reply {
                stage: self.stage,
                user_text: text.to_string(),
            })
            .await
            .context("Failed to send Reply command")?;
        Ok(())
    }

    /// Handles a finished interviewer turn produced by the runtime. Returns
    /// whether it closed the stage.
    pub async fn on_agent_turn(&self, text: &str) -> Result<bool> {
        let Some(ctx) = self.context().await else {
            return Ok(false);
        };
        ctx.machine.record_turn(Role::Assistant, text).await;

        if signals_stage_complete(text) {
            tracing::info!("Interviewer indicated {} is complete", self.stage);
            return Ok(ctx.machine.complete_stage(self.stage).await?);
        }
        Ok(false)
    }
}

#[async_trait]
impl StageHandler for ScriptedStageHandler {
    async fn activate(&self, ctx: HandlerContext) -> Result<()> {
        let machine = ctx.machine.clone();
        *self.active.lock().await = Some(ctx);
        self.follow_ups.store(0, Ordering::SeqCst);

        if machine.should_agent_speak(self.stage).await && machine.take_opening(self.stage).await {
            machine.record_turn(Role::Assistant, &self.opening).await;
            self.commands
                .send(Command::Speak {
                    stage: self.stage,
                    text: self.opening.clone(),
                })
                .await
                .context("Failed to send opening Speak command")?;
            tracing::info!("{} stage started", self.stage);
        }
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.active.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterviewConfig;
    use crate::machine::StageMachine;
    use crate::store::{MemoryStore, StageStore};
    use crate::test_support::FlakyStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn active_handler(
        config: InterviewConfig,
    ) -> (StageMachine, ScriptedStageHandler, mpsc::Receiver<Command>, StageStore) {
        let store = StageStore::new(Arc::new(MemoryStore::new()));
        let machine = StageMachine::new(Arc::new(config), Some(store.clone()));
        machine.initialize("h1").await;
        machine.transition_to_next().await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let handler = ScriptedStageHandler::new(Stage::SelfIntro, "Tell me about yourself.", tx);
        handler
            .activate(HandlerContext {
                room_id: "h1".to_string(),
                stage: Stage::SelfIntro,
                machine: machine.clone(),
            })
            .await
            .unwrap();
        (machine, handler, rx, store)
    }

    #[tokio::test]
    async fn test_opening_is_spoken_once() {
        let (machine, handler, mut rx, _) = active_handler(InterviewConfig::default()).await;
        assert_eq!(
            rx.try_recv().unwrap(),
            Command::Speak {
                stage: Stage::SelfIntro,
                text: "Tell me about yourself.".to_string()
            }
        );

        handler.deactivate().await.unwrap();
        handler
            .activate(HandlerContext {
                room_id: "h1".to_string(),
                stage: Stage::SelfIntro,
                machine,
            })
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_follow_ups_then_hand_over() {
        let config = InterviewConfig::default().with_max_follow_ups(Stage::SelfIntro, 2);
        let (machine, handler, mut rx, _) = active_handler(config).await;
        rx.try_recv().unwrap();

        handler.on_user_turn("I'm a backend engineer.").await.unwrap();
        handler.on_user_turn("Mostly Rust and Go.").await.unwrap();
        assert!(matches!(rx.try_recv().unwrap(), Command::Reply { .. }));
        assert!(matches!(rx.try_recv().unwrap(), Command::Reply { .. }));
        assert_eq!(machine.get_current_stage().await, Stage::SelfIntro);

        handler.on_user_turn("That's about it.").await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(machine.get_current_stage().await, Stage::Experience);
    }

    #[tokio::test]
    async fn test_max_duration_hands_over_immediately() {
        let config = InterviewConfig::default().with_max_duration(Stage::SelfIntro, 0);
        let (machine, handler, mut rx, _) = active_handler(config).await;
        rx.try_recv().unwrap();

        handler.on_user_turn("Hello").await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(machine.get_current_stage().await, Stage::Experience);
    }

    #[tokio::test]
    async fn test_silent_once_stage_moved_on() {
        let (machine, handler, mut rx, _) = active_handler(InterviewConfig::default()).await;
        rx.try_recv().unwrap();
        machine.transition_to_stage(Stage::End).await.unwrap();

        handler.on_user_turn("Are you still there?").await.unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(machine.get_current_stage().await, Stage::End);
    }

    #[tokio::test]
    async fn test_inactive_handler_ignores_turns() {
        let (tx, mut rx) = mpsc::channel(8);
        let handler = ScriptedStageHandler::new(Stage::Experience, "Tell me about a project.", tx);
        handler.on_user_turn("Hello?").await.unwrap();
        assert!(!handler.on_agent_turn("Let's move on.").await.unwrap());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_completion_phrase_closes_stage() {
        let (machine, handler, _rx, store) = active_handler(InterviewConfig::default()).await;

        assert!(!handler.on_agent_turn("Interesting, go on.").await.unwrap());
        assert!(handler
            .on_agent_turn("Great, let's move on to your experience.")
            .await
            .unwrap());
        assert_eq!(machine.get_current_stage().await, Stage::Experience);

        let transcript = store.transcript("h1").await;
        let contents: Vec<_> = transcript.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "Tell me about yourself.",
                "Interesting, go on.",
                "Great, let's move on to your experience."
            ]
        );
    }

    #[test]
    fn test_completion_phrases_are_case_insensitive() {
        assert!(signals_stage_complete("Next stage, please."));
        assert!(signals_stage_complete("LET'S DISCUSS your projects"));
        assert!(!signals_stage_complete("Tell me more."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_firing_mid_turn_does_not_skip_a_stage() {
        let config = InterviewConfig::default()
            .with_fallback_timeout(Stage::SelfIntro, 2)
            .with_max_follow_ups(Stage::SelfIntro, 0);
        let backend = Arc::new(FlakyStore::new());
        let machine = StageMachine::new(
            Arc::new(config),
            Some(StageStore::new(backend.clone())),
        );
        machine.initialize("slow").await;
        machine.transition_to_next().await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let handler = ScriptedStageHandler::new(Stage::SelfIntro, "Tell me about yourself.", tx);
        handler
            .activate(HandlerContext {
                room_id: "slow".to_string(),
                stage: Stage::SelfIntro,
                machine: machine.clone(),
            })
            .await
            .unwrap();

        // Stage reads now take a second, so the self_intro timer comes due
        // while the handler is still deciding whether it may speak.
        backend.set_read_delay(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handler.on_user_turn("done").await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(machine.get_current_stage().await, Stage::Experience);
        assert_eq!(machine.pending_timer().await, Some(Stage::Experience));
    }

    #[tokio::test]
    async fn test_completion_phrase_after_stage_moved_on_is_ignored() {
        let (machine, handler, _rx, _) = active_handler(InterviewConfig::default()).await;
        machine.transition_to_next().await.unwrap();

        assert!(!handler.on_agent_turn("Let's move on.").await.unwrap());
        assert_eq!(machine.get_current_stage().await, Stage::Experience);
    }
}
