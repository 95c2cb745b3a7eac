//! Interview settings.
//!
//! The stage policy is read from a YAML settings file shared by every process
//! that takes part in an interview. Sections this crate does not understand
//! (LLM, speech, ...) are ignored so the same file can serve the whole deployment.

use crate::error::ConfigError;
use crate::stage::Stage;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Follow-up questions a handler may ask before it hands the stage over.
pub const DEFAULT_MAX_FOLLOW_UPS: u32 = 2;
/// How often the orchestrator re-reads the authoritative stage.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
/// Silence after which a handler is expected to prompt the candidate again.
pub const DEFAULT_SILENCE_TIMEOUT_SECONDS: f64 = 10.0;

/// The one place per-stage fallback defaults live. `End` never gets a timer.
pub fn default_fallback_timeout_seconds(stage: Stage) -> Option<u64> {
    match stage {
        Stage::Start => Some(45),
        Stage::SelfIntro => Some(45),
        Stage::Experience => Some(120),
        Stage::End => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct StageSettings {
    pub fallback_timeout_seconds: Option<u64>,
    /// Arm a fallback timer on entry. Defaults to on, `Start` included.
    pub fallback_enabled: Option<bool>,
    /// Handler-side bound: a handler stops asking and advances past this age.
    pub max_duration_seconds: Option<u64>,
    pub max_follow_ups: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub poll_interval_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    pub silence_timeout_seconds: f64,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            silence_timeout_seconds: DEFAULT_SILENCE_TIMEOUT_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct InterviewConfig {
    pub stages: HashMap<Stage, StageSettings>,
    pub orchestrator: OrchestratorSettings,
    pub audio: AudioSettings,
}

impl InterviewConfig {
    /// Loads the settings file, failing on a missing or malformed file.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to a mapping.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    /// Loads the settings file, falling back to the built-in defaults when it
    /// cannot be read. Interviews still run without a settings file.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load interview settings: {}, using defaults", e);
                Self::default()
            }
        }
    }

    fn stage(&self, stage: Stage) -> Option<&StageSettings> {
        self.stages.get(&stage)
    }

    /// Delay before the stage's fallback timer fires, or `None` if the stage
    /// must not be armed (terminal stage or timer switched off).
    pub fn fallback_timeout(&self, stage: Stage) -> Option<Duration> {
        if stage.is_terminal() {
            return None;
        }
        let settings = self.stage(stage);
        if settings.and_then(|s| s.fallback_enabled) == Some(false) {
            return None;
        }
        settings
            .and_then(|s| s.fallback_timeout_seconds)
            .or_else(|| default_fallback_timeout_seconds(stage))
            .map(Duration::from_secs)
    }

    pub fn max_duration(&self, stage: Stage) -> Option<Duration> {
        self.stage(stage)
            .and_then(|s| s.max_duration_seconds)
            .map(Duration::from_secs)
            .or_else(|| self.fallback_timeout(stage))
    }

    pub fn max_follow_ups(&self, stage: Stage) -> u32 {
        self.stage(stage)
            .and_then(|s| s.max_follow_ups)
            .unwrap_or(DEFAULT_MAX_FOLLOW_UPS)
    }

    pub fn poll_interval(&self) -> Duration {
        // A zero interval would spin the orchestrator.
        Duration::from_millis(self.orchestrator.poll_interval_ms.max(1))
    }

    pub fn silence_timeout(&self) -> Duration {
        // `.inf` is valid YAML; treat it as "never".
        Duration::try_from_secs_f64(self.audio.silence_timeout_seconds.max(0.0))
            .unwrap_or(Duration::MAX)
    }

    pub fn with_fallback_timeout(mut self, stage: Stage, seconds: u64) -> Self {
        self.stages.entry(stage).or_default().fallback_timeout_seconds = Some(seconds);
        self
    }

    pub fn with_fallback_enabled(mut self, stage: Stage, enabled: bool) -> Self {
        self.stages.entry(stage).or_default().fallback_enabled = Some(enabled);
        self
    }

    pub fn with_max_follow_ups(mut self, stage: Stage, follow_ups: u32) -> Self {
        self.stages.entry(stage).or_default().max_follow_ups = Some(follow_ups);
        self
    }

    pub fn with_max_duration(mut self, stage: Stage, seconds: u64) -> Self {
        self.stages.entry(stage).or_default().max_duration_seconds = Some(seconds);
        self
    }

    pub fn with_poll_interval_ms(mut self, millis: u64) -> Self {
        self.orchestrator.poll_interval_ms = millis;
        self
    }
}
