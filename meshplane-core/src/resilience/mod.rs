//! Resilience interceptors (component C10): retry, circuit breaker, rate limit,
//! authentication. The circuit breaker itself lives in `meshplane_sdk::circuit_breaker`
//! since the plugin client shim reuses it too; this module re-exports it alongside the
//! host-only pieces.

pub mod auth;
pub mod rate_limit;
pub mod retry;

pub use meshplane_sdk::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use crate::config::ResilienceConfig;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

/// Per-provider circuit breakers plus the shared retry/rate-limit policy, threaded into the
/// router so every downstream call goes through the same resilience stack.
pub struct ResilienceStack {
    pub retry: retry::RetryPolicy,
    pub rate_limiter: Arc<rate_limit::RateLimiter>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    breaker_config: CircuitBreakerConfig,
}

impl ResilienceStack {
    pub fn new(config: &ResilienceConfig) -> Self {
        let retry = retry::RetryPolicy {
            max_attempts: config.retry.max_attempts,
            initial_backoff: config.retry.initial_backoff,
            max_backoff: config.retry.max_backoff,
            multiplier: config.retry.multiplier,
            jitter: config.retry.jitter,
        };
        let breaker_config = CircuitBreakerConfig {
            failure_threshold: config.breaker.failure_threshold,
            success_threshold: config.breaker.success_threshold,
            timeout: config.breaker.timeout,
        };
        let rate_limiter = Arc::new(rate_limit::RateLimiter::new(
            config.rate_limit.requests_per_second,
            config.rate_limit.burst,
            config.rate_limit.idle_eviction,
        ));
        Self {
            retry,
            rate_limiter,
            breakers: DashMap::new(),
            breaker_config,
        }
    }

    /// Returns the circuit breaker for a given downstream key (provider `runtime_id`),
    /// creating it on first use.
    pub fn breaker_for(&self, key: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(key.to_string(), self.breaker_config.clone()))
            })
            .clone()
    }

    pub fn spawn_rate_limiter_eviction(&self) -> tokio::task::JoinHandle<()> {
        self.rate_limiter.clone().spawn_eviction_task()
    }
}

#[allow(dead_code)]
fn _assert_duration_usable(_d: Duration) {}
