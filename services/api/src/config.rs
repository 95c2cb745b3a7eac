use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    /// `None` keeps every session in this process only.
    pub redis_url: Option<String>,
    pub store_timeout: Duration,
    pub settings_path: PathBuf,
    pub log_level: Level,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// This function will look for a `.env` file in the current directory
    /// and load the following variables:
    ///
    /// *   `BIND_ADDRESS`: The address and port to bind the server to. Defaults to "0.0.0.0:8080".
    /// *   `REDIS_URL`: (Optional) Connection URL of the shared store.
    /// *   `REDIS_HOST`, `REDIS_PORT`, `REDIS_DB`, `REDIS_PASSWORD`: (Optional) The same, in parts.
    /// *   `STORE_TIMEOUT_MS`: (Optional) Per-operation store timeout. Defaults to 500.
    /// *   `INTERVIEW_SETTINGS`: (Optional) Stage settings file. Defaults to "config/settings.yaml".
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_address_str = var("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let redis_url = match (var("REDIS_URL"), var("REDIS_HOST")) {
            (Some(url), _) => Some(url),
            (None, Some(host)) => {
                let port = var("REDIS_PORT").unwrap_or_else(|| "6379".to_string());
                let db = var("REDIS_DB").unwrap_or_else(|| "0".to_string());
                match var("REDIS_PASSWORD") {
                    Some(password) if !password.is_empty() => {
                        Some(format!("redis://:{password}@{host}:{port}/{db}"))
                    }
                    _ => Some(format!("redis://{host}:{port}/{db}")),
                }
            }
            (None, None) => None,
        };

        let store_timeout = match var("STORE_TIMEOUT_MS") {
            Some(raw) => raw.parse::<u64>().map(Duration::from_millis).map_err(|e| {
                ConfigError::InvalidValue("STORE_TIMEOUT_MS".to_string(), e.to_string())
            })?,
            None => Duration::from_millis(500),
        };

        let settings_path = var("INTERVIEW_SETTINGS")
            .unwrap_or_else(|| "config/settings.yaml".to_string())
            .into();

        let log_level_str = var("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            redis_url,
            store_timeout,
            settings_path,
            log_level,
        })
    }
}
