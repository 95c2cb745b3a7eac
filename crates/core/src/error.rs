use crate::stage::Stage;
use std::time::Duration;

/// Failures of the stage machine itself. These are the only errors a caller of
/// a transition ever sees; store problems are logged and swallowed.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: Stage, to: Stage },
    #[error("stage machine has no room; call initialize first")]
    NotInitialized,
}

/// Failures of a key-value backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures loading the interview settings file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Failures surfaced by the session registry to a control layer.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("interview not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("cannot transition further")]
    NoFurtherStage,
    #[error("transcript storage is not configured")]
    TranscriptUnavailable,
}
