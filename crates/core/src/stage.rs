use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One phase of the interview script.
///
/// The string form (`start`, `self_intro`, ...) is what gets persisted in the
/// shared store and what the settings file uses as keys, so it must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Start,
    SelfIntro,
    Experience,
    End,
}

impl Stage {
    /// Every stage in script order.
    pub const ALL: [Stage; 4] = [Stage::Start, Stage::SelfIntro, Stage::Experience, Stage::End];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Start => "start",
            Stage::SelfIntro => "self_intro",
            Stage::Experience => "experience",
            Stage::End => "end",
        }
    }

    /// The successor on the canonical linear path, or `None` once the interview is over.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Stage::Start => Some(Stage::SelfIntro),
            Stage::SelfIntro => Some(Stage::Experience),
            Stage::Experience => Some(Stage::End),
            Stage::End => None,
        }
    }

    /// Whether `self -> target` is an edge of the adjacency table.
    ///
    /// `SelfIntro -> End` is the only shortcut; everything else follows the script.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        matches!(
            (self, target),
            (Stage::Start, Stage::SelfIntro)
                | (Stage::SelfIntro, Stage::Experience)
                | (Stage::SelfIntro, Stage::End)
                | (Stage::Experience, Stage::End)
        )
    }

    pub fn is_terminal(&self) -> bool {
        *self == Stage::End
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.trim())
            .ok_or_else(|| StageError::UnknownStage(s.to_string()))
    }
}
