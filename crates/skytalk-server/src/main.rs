//! # skytalk-server
//!
//! Single-process realtime messaging server. Serves the WebSocket endpoint
//! and the HTTP API from one listener; all presence lives in memory and is
//! lost on restart.

use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skytalk_server::api::{self, AppState};
use skytalk_server::config::ServerConfig;
use skytalk_server::store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,skytalk_server=debug")),
        )
        .init();

    info!("Starting SkyTalk server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.uses_dev_secrets() {
        warn!("JWT_SECRET / JWT_REFRESH_SECRET not set, using development secrets");
    }

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = SqliteStore::open(&config.database_path)?;
    let http_addr = config.http_addr;
    let state = AppState::build(config, store).await?;

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Every 5 minutes, evict HTTP rate-limit buckets idle for over 10 minutes
    let rl = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let evicted = rl.purge_idle(Duration::from_secs(600)).await;
            if evicted > 0 {
                tracing::debug!(evicted, "Purged idle rate-limit buckets");
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
