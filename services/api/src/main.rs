mod config;
mod routes;

use crate::config::Config;
use crate::routes::AppState;
use anyhow::Context;
use interview_core::{InterviewConfig, RedisStore, SessionRegistry, StageStore};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::fmt::time::ChronoLocal;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("Failed to load application configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    let interview_config = Arc::new(InterviewConfig::load_or_default(&config.settings_path));

    let store = match &config.redis_url {
        Some(url) => {
            let backend = RedisStore::open(url, config.store_timeout)
                .context("Failed to configure the shared store")?;
            let store = StageStore::new(Arc::new(backend));
            if store.is_healthy().await {
                info!("Shared store connection established");
            } else {
                tracing::warn!("Shared store is not reachable yet; will retry on use");
            }
            Some(store)
        }
        None => {
            tracing::warn!("No shared store configured; sessions live in this process only");
            None
        }
    };

    let state = AppState {
        registry: Arc::new(SessionRegistry::new(interview_config, store)),
    };

    // Configure a permissive CORS policy so a separate frontend can drive interviews.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::router(state).layer(cors);

    info!("Starting interview API, listening on {}", config.bind_address);
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
