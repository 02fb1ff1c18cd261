//! Metrics collection (ambient, SPEC_FULL §4.10): process-local counters behind a
//! `MetricsCollector`, grounded on the teacher's `metrics.rs` shape (`MetricsConfig` with
//! `enabled`/`max_requests`/`retention_duration`/`cleanup_interval`).
//!
//! Never load-bearing for core logic: every recording method no-ops when disabled, so
//! nothing here can change routing, registration, or auth outcomes.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub max_requests: usize,
    pub retention_duration: Duration,
    pub cleanup_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 10_000,
            retention_duration: Duration::from_secs(24 * 3600),
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

#[derive(Default)]
struct Counters {
    handshake_admissions: AtomicU64,
    handshake_rejections: AtomicU64,
    registry_registrations: AtomicU64,
    registry_discoveries: AtomicU64,
    registry_misses: AtomicU64,
    rate_limit_denials: AtomicU64,
}

pub struct MetricsCollector {
    config: MetricsConfig,
    counters: Counters,
    router_calls_by_status: DashMap<u16, AtomicU64>,
    breaker_transitions: DashMap<String, AtomicU64>,
}

impl MetricsCollector {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            counters: Counters::default(),
            router_calls_by_status: DashMap::new(),
            breaker_transitions: DashMap::new(),
        }
    }

    pub fn record_handshake_admission(&self) {
        if !self.config.enabled {
            return;
        }
        self.counters.handshake_admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handshake_rejection(&self) {
        if !self.config.enabled {
            return;
        }
        self.counters.handshake_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_registration(&self) {
        if !self.config.enabled {
            return;
        }
        self.counters.registry_registrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discovery(&self, found: bool) {
        if !self.config.enabled {
            return;
        }
        if found {
            self.counters.registry_discoveries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.registry_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_router_call(&self, status: u16) {
        if !self.config.enabled {
            return;
        }
        self.router_calls_by_status
            .entry(status)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_transition(&self, breaker_name: &str) {
        if !self.config.enabled {
            return;
        }
        self.breaker_transitions
            .entry(breaker_name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_denial(&self) {
        if !self.config.enabled {
            return;
        }
        self.counters.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            enabled: self.config.enabled,
            handshake_admissions: self.counters.handshake_admissions.load(Ordering::Relaxed),
            handshake_rejections: self.counters.handshake_rejections.load(Ordering::Relaxed),
            registry_registrations: self.counters.registry_registrations.load(Ordering::Relaxed),
            registry_discoveries: self.counters.registry_discoveries.load(Ordering::Relaxed),
            registry_misses: self.counters.registry_misses.load(Ordering::Relaxed),
            rate_limit_denials: self.counters.rate_limit_denials.load(Ordering::Relaxed),
            router_calls_by_status: self
                .router_calls_by_status
                .iter()
                .map(|entry| (*entry.key(), entry.value().load(Ordering::Relaxed)))
                .collect(),
            breaker_transitions: self
                .breaker_transitions
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = String::new();
        out.push_str(&format!(
            "meshplane_handshake_admissions_total {}\n",
            snapshot.handshake_admissions
        ));
        out.push_str(&format!(
            "meshplane_handshake_rejections_total {}\n",
            snapshot.handshake_rejections
        ));
        out.push_str(&format!(
            "meshplane_registry_registrations_total {}\n",
            snapshot.registry_registrations
        ));
        out.push_str(&format!(
            "meshplane_registry_discoveries_total {}\n",
            snapshot.registry_discoveries
        ));
        out.push_str(&format!(
            "meshplane_registry_misses_total {}\n",
            snapshot.registry_misses
        ));
        out.push_str(&format!(
            "meshplane_rate_limit_denials_total {}\n",
            snapshot.rate_limit_denials
        ));
        for (status, count) in &snapshot.router_calls_by_status {
            out.push_str(&format!(
                "meshplane_router_calls_total{{status=\"{status}\"}} {count}\n"
            ));
        }
        for (breaker, count) in &snapshot.breaker_transitions {
            out.push_str(&format!(
                "meshplane_breaker_transitions_total{{breaker=\"{breaker}\"}} {count}\n"
            ));
        }
        out
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub enabled: bool,
    pub handshake_admissions: u64,
    pub handshake_rejections: u64,
    pub registry_registrations: u64,
    pub registry_discoveries: u64,
    pub registry_misses: u64,
    pub rate_limit_denials: u64,
    pub router_calls_by_status: Vec<(u16, u64)>,
    pub breaker_transitions: Vec<(String, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_collector_records_nothing() {
        let metrics = MetricsCollector::new(MetricsConfig {
            enabled: false,
            ..MetricsConfig::default()
        });
        metrics.record_handshake_admission();
        assert_eq!(metrics.snapshot().handshake_admissions, 0);
    }

    #[test]
    fn enabled_collector_counts() {
        let metrics = MetricsCollector::new(MetricsConfig::default());
        metrics.record_handshake_admission();
        metrics.record_handshake_admission();
        metrics.record_router_call(200);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.handshake_admissions, 2);
        assert_eq!(snapshot.router_calls_by_status, vec![(200, 1)]);
    }
}
