//! Runtime configuration of the console agent.
//!
//! Settings come from the environment (and a `.env` file when present). The
//! stage policy itself lives in the YAML file named by `INTERVIEW_SETTINGS`.

use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_SETTINGS_PATH: &str = "config/settings.yaml";
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` runs the interview on local state only.
    pub redis_url: Option<String>,
    pub store_timeout: Duration,
    pub settings_path: PathBuf,
    pub log_level: Level,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// *   `REDIS_URL`: Full connection URL of the shared store. Takes precedence over the parts below.
    /// *   `REDIS_HOST`, `REDIS_PORT`, `REDIS_DB`, `REDIS_PASSWORD`: (Optional) Store location in parts.
    /// *   `STORE_TIMEOUT_MS`: (Optional) Per-operation store timeout. Defaults to 500.
    /// *   `INTERVIEW_SETTINGS`: (Optional) Stage settings file. Defaults to `config/settings.yaml`.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let store_timeout = match var("STORE_TIMEOUT_MS") {
            Some(raw) => raw.parse::<u64>().map(Duration::from_millis).map_err(|e| {
                ConfigError::InvalidValue("STORE_TIMEOUT_MS".to_string(), e.to_string())
            })?,
            None => Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        };

        let settings_path = var("INTERVIEW_SETTINGS")
            .unwrap_or_else(|| DEFAULT_SETTINGS_PATH.to_string())
            .into();

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            redis_url: redis_url(&var)?,
            store_timeout,
            settings_path,
            log_level,
        })
    }
}

fn redis_url(var: &impl Fn(&str) -> Option<String>) -> Result<Option<String>, ConfigError> {
    if let Some(url) = var("REDIS_URL") {
        return Ok(Some(url));
    }
    let Some(host) = var("REDIS_HOST") else {
        return Ok(None);
    };
    let port = var("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
    port.parse::<u16>()
        .map_err(|e| ConfigError::InvalidValue("REDIS_PORT".to_string(), e.to_string()))?;
    let db = var("REDIS_DB").unwrap_or_else(|| "0".to_string());
    let auth = match var("REDIS_PASSWORD") {
        Some(password) if !password.is_empty() => format!(":{password}@"),
        _ => String::new(),
    };
    Ok(Some(format!("redis://{auth}{host}:{port}/{db}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.redis_url, None);
        assert_eq!(config.store_timeout, Duration::from_millis(500));
        assert_eq!(config.settings_path, PathBuf::from("config/settings.yaml"));
        assert_eq!(config.log_level, Level::INFO);
    }

    #[test]
    fn test_redis_url_from_parts() {
        let config = Config::from_lookup(lookup(&[
            ("REDIS_HOST", "cache"),
            ("REDIS_PORT", "6380"),
            ("REDIS_DB", "2"),
            ("REDIS_PASSWORD", "hunter2"),
        ]))
        .unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://:hunter2@cache:6380/2"));
    }

    #[test]
    fn test_redis_url_wins_over_parts() {
        let config = Config::from_lookup(lookup(&[
            ("REDIS_URL", "redis://elsewhere:6379/0"),
            ("REDIS_HOST", "cache"),
        ]))
        .unwrap();
        assert_eq!(config.redis_url.as_deref(), Some("redis://elsewhere:6379/0"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Config::from_lookup(lookup(&[("RUST_LOG", "chatty")])).is_err());
        assert!(Config::from_lookup(lookup(&[("STORE_TIMEOUT_MS", "soon")])).is_err());
        assert!(
            Config::from_lookup(lookup(&[("REDIS_HOST", "cache"), ("REDIS_PORT", "abc")])).is_err()
        );
    }
}
