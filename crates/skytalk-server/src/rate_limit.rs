//! Token-bucket throttling.
//!
//! One limiter guards the HTTP surface per client address; the session
//! manager keeps a second one keyed by user for inbound socket events.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use skytalk_shared::RelayError;

use crate::error::ServerError;

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    touched: Instant,
}

impl Bucket {
    fn full(burst: f64) -> Self {
        Self {
            tokens: burst,
            touched: Instant::now(),
        }
    }

    /// Refill for the time since the last touch, then spend one token.
    fn take(&mut self, rate: f64, burst: f64) -> bool {
        let now = Instant::now();
        let idle = now.saturating_duration_since(self.touched).as_secs_f64();
        self.touched = now;
        self.tokens = (self.tokens + idle * rate).min(burst);

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens -= 1.0;
        }
        allowed
    }
}

/// Allows `burst` calls at once per key, refilled at `rate` per second.
#[derive(Clone)]
pub struct RateLimiter<K = IpAddr> {
    buckets: Arc<Mutex<HashMap<K, Bucket>>>,
    rate: f64,
    burst: f64,
}

impl<K: Eq + Hash> RateLimiter<K> {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            rate,
            burst,
        }
    }

    pub async fn check(&self, key: K) -> bool {
        let (rate, burst) = (self.rate, self.burst);
        self.buckets
            .lock()
            .await
            .entry(key)
            .or_insert_with(|| Bucket::full(burst))
            .take(rate, burst)
    }

    pub async fn forget(&self, key: &K) {
        self.buckets.lock().await.remove(key);
    }

    /// Drop buckets untouched for `max_idle`. Returns how many were removed.
    pub async fn purge_idle(&self, max_idle: Duration) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        let now = Instant::now();
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.touched) < max_idle);
        before - buckets.len()
    }

    pub async fn tracked(&self) -> usize {
        self.buckets.lock().await.len()
    }
}

/// Rejects over-limit requests with the usual `{"error"}` body and 429.
pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter<IpAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if let Some(ip) = client_ip(&req) {
        if !limiter.check(ip).await {
            warn!(ip = %ip, path = %req.uri().path(), "HTTP rate limit exceeded");
            return ServerError::from(RelayError::RateLimited).into_response();
        }
    }
    next.run(req).await
}

/// Peer address when served with connect info, else the proxy headers.
fn client_ip<B>(req: &Request<B>) -> Option<IpAddr> {
    if let Some(ConnectInfo(addr)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return Some(addr.ip());
    }

    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());

    header("x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse().ok())
        .or_else(|| header("x-real-ip").and_then(|value| value.trim().parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use skytalk_shared::UserId;

    #[tokio::test]
    async fn test_burst_then_reject() {
        let limiter = RateLimiter::new(10.0, 5.0);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        for _ in 0..5 {
            assert!(limiter.check(ip).await);
        }
        assert!(!limiter.check(ip).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_over_time() {
        let limiter: RateLimiter<UserId> = RateLimiter::new(2.0, 1.0);
        let alice = UserId::new();

        assert!(limiter.check(alice).await);
        assert!(!limiter.check(alice).await);

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.check(alice).await);
        assert!(!limiter.check(alice).await);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter: RateLimiter<UserId> = RateLimiter::new(1.0, 2.0);
        let alice = UserId::new();
        let bob = UserId::new();

        assert!(limiter.check(alice).await);
        assert!(limiter.check(alice).await);
        assert!(!limiter.check(alice).await);
        assert!(limiter.check(bob).await);

        limiter.forget(&alice).await;
        assert!(limiter.check(alice).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle() {
        let limiter = RateLimiter::new(10.0, 5.0);
        assert!(limiter.check("10.0.0.1".parse::<IpAddr>().unwrap()).await);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(limiter.check("10.0.0.2".parse::<IpAddr>().unwrap()).await);

        assert_eq!(limiter.purge_idle(Duration::from_secs(10)).await, 1);
        assert_eq!(limiter.tracked().await, 1);
    }

    #[test]
    fn test_client_ip_from_proxy_headers() {
        let req = Request::builder()
            .header("x-forwarded-for", "10.0.0.7, 172.16.0.1")
            .body(())
            .unwrap();
        assert_eq!(client_ip(&req), Some("10.0.0.7".parse().unwrap()));

        let req = Request::builder().header("x-real-ip", "10.0.0.9").body(()).unwrap();
        assert_eq!(client_ip(&req), Some("10.0.0.9".parse().unwrap()));
    }
}
