pub mod config;
pub mod control;
pub mod error;
pub mod handler;
pub mod machine;
pub mod orchestrator;
pub mod stage;
pub mod store;
pub mod timer;
pub mod transcript;

#[cfg(test)]
mod test_support;

pub use config::InterviewConfig;
pub use control::SessionRegistry;
pub use error::{ConfigError, ControlError, StageError, StoreError};
pub use handler::ScriptedStageHandler;
pub use machine::{SessionStatus, StageMachine, StageStatus};
pub use orchestrator::{HandlerContext, Orchestrator, OrchestratorOutcome, StageHandler};
pub use stage::Stage;
pub use store::{KeyValueStore, MemoryStore, RedisStore, StageStore};
pub use transcript::{Role, TranscriptEntry};

/// Commands stage handlers issue to the runtime.
///
/// Handlers decide *what* should happen; the runtime owns the side effects
/// (speech synthesis, language model calls) and reports the resulting turns
/// back through the handler's `on_agent_turn`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Say `text` to the candidate verbatim.
    Speak { stage: Stage, text: String },
    /// Produce an interviewer reply to the candidate's last turn.
    Reply { stage: Stage, user_text: String },
}
