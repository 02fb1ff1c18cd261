//! Circuit breaker resilience primitive (component C10).
//!
//! Shared between the host's resilience interceptor stack and any plugin-side code that
//! wants the same failure-isolation behavior when calling out over the router. States:
//! `Closed -> Open -> HalfOpen -> Closed`, matching spec §4.8.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before tripping to `Open`. Default 5.
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` before returning to `Closed`. Default 2.
    pub success_threshold: u32,
    /// How long `Open` blocks calls before allowing a probe. Default 10s.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_time: Option<Instant>,
}

impl Default for CircuitState {
    fn default() -> Self {
        CircuitState::Closed
    }
}

/// Callback invoked on every state transition, with the lock released (spec §5) so it can
/// safely re-enter the breaker or log without risking deadlock.
pub type OnStateChange = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Arc<RwLock<State>>,
    on_state_change: Option<OnStateChange>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Arc::new(RwLock::new(State::default())),
            on_state_change: None,
        }
    }

    pub fn with_on_state_change(mut self, callback: OnStateChange) -> Self {
        self.on_state_change = Some(callback);
        self
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Returns `true` if a call may proceed right now, transitioning `Open -> HalfOpen`
    /// when the timeout has elapsed.
    pub async fn permit(&self) -> bool {
        let mut guard = self.state.write().await;
        match guard.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = guard
                    .last_failure_time
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout {
                    self.transition(&mut guard, CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut guard = self.state.write().await;
        guard.consecutive_failures = 0;
        match guard.state {
            CircuitState::HalfOpen => {
                guard.consecutive_successes += 1;
                if guard.consecutive_successes >= self.config.success_threshold {
                    guard.consecutive_successes = 0;
                    self.transition(&mut guard, CircuitState::Closed);
                }
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                tracing::warn!(breaker = %self.name, "recorded success while circuit was open");
            }
        }
    }

    pub async fn record_failure(&self) {
        let mut guard = self.state.write().await;
        guard.last_failure_time = Some(Instant::now());
        guard.consecutive_successes = 0;
        match guard.state {
            CircuitState::Closed => {
                guard.consecutive_failures += 1;
                if guard.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut guard, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut guard, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Manually forces a state, for tests and emergency operator overrides.
    pub async fn force(&self, new_state: CircuitState) {
        let mut guard = self.state.write().await;
        guard.consecutive_failures = 0;
        guard.consecutive_successes = 0;
        if new_state == CircuitState::Open {
            guard.last_failure_time = Some(Instant::now());
        }
        self.transition(&mut guard, new_state);
    }

    fn transition(&self, guard: &mut State, new_state: CircuitState) {
        let old_state = guard.state;
        if old_state == new_state {
            return;
        }
        guard.state = new_state;
        tracing::info!(breaker = %self.name, ?old_state, ?new_state, "circuit breaker state change");
        if let Some(callback) = self.on_state_change.clone() {
            // Drop the lock before invoking the callback (spec §5: avoid re-entrancy deadlock).
            let state_arc = self.state.clone();
            tokio::spawn(async move {
                drop(state_arc);
                callback(old_state, new_state);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            success_threshold: 2,
            timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", config(5));
        for _ in 0..4 {
            assert!(breaker.permit().await);
            breaker.record_failure().await;
            assert_eq!(breaker.state().await, CircuitState::Closed);
        }
        assert!(breaker.permit().await);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(!breaker.permit().await);
    }

    #[tokio::test]
    async fn half_opens_after_timeout_then_closes_on_success_streak() {
        let breaker = CircuitBreaker::new("test", config(1));
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.permit().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", config(1));
        breaker.record_failure().await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.permit().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }
}
