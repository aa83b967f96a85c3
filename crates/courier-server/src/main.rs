//! # courier-server
//!
//! Real-time messaging backend.
//!
//! This binary provides:
//! - **Direct messages** with per-participant conversation previews, recall
//!   and delete
//! - **Group messages** over an append-only log where recalls apply to every
//!   member and deletes only to the member who made them
//! - **Call signaling** for one-to-one calls, with a ring timeout and
//!   deduplicated call records in the chat history
//! - **WebSocket transport** for pushes, and a REST API (axum) for the same
//!   operations
//! - **Per-IP and per-user rate limiting**

mod api;
mod auth;
mod calls;
mod chat;
mod config;
mod conversations;
mod dispatcher;
mod error;
mod extract;
mod forward;
mod groups;
mod membership;
mod overlay;
mod rate_limit;
mod sessions;
mod store;
mod ws;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_server=debug")),
        )
        .init();

    info!("Starting courier server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.uses_dev_secret() {
        warn!("JWT_SECRET is not set; using the development secret");
    }

    // -----------------------------------------------------------------------
    // 3. Open the database and build the engines
    // -----------------------------------------------------------------------
    let store = Store::open(&config.database_path).with_context(|| {
        format!("failed to open database at {}", config.database_path.display())
    })?;
    let http_addr = config.http_addr;
    let app_state = AppState::new(config, store);

    // Calls left ringing by a previous run get their timers back.
    app_state.calls.recover_ringing().await?;

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let http_limiter = app_state.rate_limiter.clone();
    let event_limiter = app_state.event_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            http_limiter.purge_stale(600.0).await;
            event_limiter.purge_stale(600.0).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
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
