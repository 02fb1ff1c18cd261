//! Token-bucket rate limiter (part of component C10).

use axum::http::HeaderMap;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        let now = Instant::now();
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
        self.last_seen = now;
    }

    fn take(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

pub struct RateLimiter {
    capacity: RwLock<f64>,
    refill_rate: RwLock<f64>,
    idle_eviction: Duration,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(requests_per_second: f64, burst: u32, idle_eviction: Duration) -> Self {
        Self {
            capacity: RwLock::new(burst as f64),
            refill_rate: RwLock::new(requests_per_second),
            idle_eviction,
            buckets: DashMap::new(),
        }
    }

    /// Updates capacity and refill rate for all buckets going forward, in place.
    pub fn update_rate(&self, requests_per_second: f64, burst: u32) {
        *self.capacity.write().unwrap() = burst as f64;
        *self.refill_rate.write().unwrap() = requests_per_second;
    }

    pub fn allow(&self, key: &str) -> bool {
        let capacity = *self.capacity.read().unwrap();
        let refill_rate = *self.refill_rate.read().unwrap();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| Bucket::new(capacity, refill_rate));
        bucket.capacity = capacity;
        bucket.refill_rate = refill_rate;
        bucket.take()
    }

    pub fn evict_idle(&self) {
        let cutoff = self.idle_eviction;
        self.buckets
            .retain(|_, bucket| bucket.last_seen.elapsed() < cutoff);
    }

    /// Spawns the background eviction task (spec §4.8: idle buckets older than the
    /// configured duration are reclaimed).
    pub fn spawn_eviction_task(self: std::sync::Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                self.evict_idle();
            }
        })
    }
}

/// Prefers `X-Plugin-Runtime-ID`, falls back to the peer address (spec §4.8).
pub fn rate_limit_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(value) = headers
        .get(meshplane_sdk::protocol::HEADER_RUNTIME_ID)
        .and_then(|v| v.to_str().ok())
    {
        return value.to_string();
    }
    peer.map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_denies_until_refill() {
        let limiter = RateLimiter::new(10.0, 5, Duration::from_secs(300));
        for _ in 0..5 {
            assert!(limiter.allow("k"));
        }
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn update_rate_applies_to_existing_bucket() {
        let limiter = RateLimiter::new(1.0, 1, Duration::from_secs(300));
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        limiter.update_rate(1.0, 5);
        assert!(limiter.allow("k"));
    }

    #[test]
    fn eviction_drops_idle_buckets() {
        let limiter = RateLimiter::new(1.0, 1, Duration::from_millis(1));
        limiter.allow("k");
        std::thread::sleep(Duration::from_millis(5));
        limiter.evict_idle();
        assert!(limiter.buckets.is_empty());
    }
}
