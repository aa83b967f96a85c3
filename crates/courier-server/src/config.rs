//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development. A `.env` file in the working
//! directory is loaded first when present.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use courier_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_RING_TIMEOUT_SECS, RECALL_WINDOW_HOURS};

const DEV_JWT_SECRET: &str = "courier-dev-secret-change-me";

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `./courier.db`
    pub database_path: PathBuf,

    /// HS256 secret used to verify access tokens.
    /// Env: `JWT_SECRET`
    /// Default: a fixed development secret (warned about at startup).
    pub jwt_secret: String,

    /// How long a call may ring before it is marked missed.
    /// Env: `CALL_RING_TIMEOUT_SECS`
    /// Default: `30`
    pub call_ring_timeout: Duration,

    /// How long after sending a message can still be recalled.
    /// Env: `RECALL_WINDOW_HOURS`
    /// Default: `24`
    pub recall_window: chrono::Duration,

    /// Capacity of each session's outbound event queue.
    /// Env: `SESSION_QUEUE_SIZE`
    /// Default: `256`
    pub session_queue_size: usize,

    /// Sustained request rate per client.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `10`
    pub rate_limit_per_sec: f64,

    /// Burst capacity per client.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `30`
    pub rate_limit_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./courier.db"),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            call_ring_timeout: Duration::from_secs(DEFAULT_RING_TIMEOUT_SECS),
            recall_window: chrono::Duration::hours(RECALL_WINDOW_HOURS),
            session_queue_size: 256,
            rate_limit_per_sec: 10.0,
            rate_limit_burst: 30.0,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(addr) = parse_var::<SocketAddr>("HTTP_ADDR") {
            config.http_addr = addr;
        }

        if let Ok(path) = std::env::var("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.is_empty() {
                config.jwt_secret = secret;
            }
        }

        if let Some(secs) = parse_var::<u64>("CALL_RING_TIMEOUT_SECS") {
            config.call_ring_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(hours) = parse_var::<i64>("RECALL_WINDOW_HOURS") {
            config.recall_window = chrono::Duration::hours(hours.max(0));
        }

        if let Some(size) = parse_var::<usize>("SESSION_QUEUE_SIZE") {
            config.session_queue_size = size.max(1);
        }

        if let Some(rate) = parse_var::<f64>("RATE_LIMIT_PER_SEC") {
            config.rate_limit_per_sec = rate;
        }

        if let Some(burst) = parse_var::<f64>("RATE_LIMIT_BURST") {
            config.rate_limit_burst = burst;
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

// Keeps the secret out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("call_ring_timeout", &self.call_ring_timeout)
            .field("recall_window_hours", &self.recall_window.num_hours())
            .field("session_queue_size", &self.session_queue_size)
            .field("rate_limit_per_sec", &self.rate_limit_per_sec)
            .field("rate_limit_burst", &self.rate_limit_burst)
            .finish_non_exhaustive()
    }
}

fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Invalid value, using default");
            None
        }
    }
}
