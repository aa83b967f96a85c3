use std::collections::HashMap;
use std::hash::Hash;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Remaining allowance for one key, refilled lazily on each check.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    refilled_at: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            refilled_at: now,
        }
    }

    fn take(&mut self, now: Instant, rate: f64, capacity: f64) -> bool {
        let idle = now.saturating_duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + idle * rate).min(capacity);
        self.refilled_at = now;

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        allowed
    }

    fn idle_for(&self, now: Instant) -> f64 {
        now.saturating_duration_since(self.refilled_at).as_secs_f64()
    }
}

/// Token buckets keyed by client IP for HTTP, or by user for transport
/// events.
#[derive(Clone)]
pub struct RateLimiter<K = IpAddr> {
    buckets: Arc<Mutex<HashMap<K, Bucket>>>,
    rate: f64,
    capacity: f64,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    /// `rate` tokens per second, bursts of up to `capacity`.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            capacity,
        }
    }

    pub async fn check(&self, key: &K) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::full(self.capacity, now))
            .take(now, self.rate, self.capacity)
    }

    /// Forget keys that have not been checked for `max_idle_secs`.
    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.idle_for(now) < max_idle_secs);
        let purged = before - buckets.len();
        if purged > 0 {
            debug!(purged, "Purged idle rate limit buckets");
        }
    }

    #[cfg(test)]
    pub async fn tracked(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter<IpAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    match extract_client_ip(&req) {
        Some(ip) if !limiter.check(&ip).await => {
            warn!(ip = %ip, path = %req.uri().path(), "Request rate limit exceeded");
            Err(StatusCode::TOO_MANY_REQUESTS)
        }
        _ => Ok(next.run(req).await),
    }
}

/// The peer address when the server was started with connect info, otherwise
/// the first address a proxy header names.
fn extract_client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<std::net::SocketAddr>>() {
        return Some(connect_info.0.ip());
    }

    let header_ip = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok())
    };

    header_ip("x-forwarded-for").or_else(|| header_ip("x-real-ip"))
}
