use anyhow::{Context, Result};
use interview_core::Stage;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const SELF_INTRO_OPENING: &str = "Hello! I'm conducting your interview today. To start, could you tell me a bit about yourself - your background, what you're passionate about, and what brings you here today?";
const EXPERIENCE_OPENING: &str = "Let's dive into your past experience. Can you tell me about a project you're particularly proud of? What was your role, and what challenges did you face?";
const CLOSING: &str = "Thank you! The interview is complete.";

/// Loads `<stage>.md` opening lines from `dir_path`. Markdown files that do
/// not name a stage are skipped.
pub fn load_openings(dir_path: &Path) -> Result<HashMap<Stage, String>> {
    let mut openings = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for prompt file")?;
            let Ok(stage) = stem.parse::<Stage>() else {
                tracing::debug!("Skipping prompt file for unknown stage: {}", path.display());
                continue;
            };

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
            openings.insert(stage, content.trim().to_string());
        }
    }

    Ok(openings)
}

/// The loaded opening for `stage`, or the built-in line when none was given.
pub fn opening_for(openings: &HashMap<Stage, String>, stage: Stage) -> String {
    match openings.get(&stage) {
        Some(text) if !text.is_empty() => text.clone(),
        _ => default_opening(stage).to_string(),
    }
}

pub fn default_opening(stage: Stage) -> &'static str {
    match stage {
        Stage::Start | Stage::SelfIntro => SELF_INTRO_OPENING,
        Stage::Experience => EXPERIENCE_OPENING,
        Stage::End => CLOSING,
    }
}
