//! Lifecycle / health tracker (component C6): records plugin self-reported health and
//! exposes the routing predicate the registry and router consult.

use crate::error::CoreError;
use dashmap::DashMap;
use meshplane_sdk::protocol::HealthState;
use std::time::SystemTime;

#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub state: HealthState,
    pub reason: Option<String>,
    pub unavailable_dependencies: Vec<String>,
    pub reported_at: SystemTime,
}

pub struct LifecycleTracker {
    health: DashMap<String, HealthRecord>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self {
            health: DashMap::new(),
        }
    }

    pub fn report(
        &self,
        runtime_id: &str,
        state: HealthState,
        reason: Option<String>,
        unavailable_dependencies: Vec<String>,
    ) -> Result<(), CoreError> {
        self.health.insert(
            runtime_id.to_string(),
            HealthRecord {
                state,
                reason,
                unavailable_dependencies,
                reported_at: SystemTime::now(),
            },
        );
        tracing::debug!(runtime_id = %runtime_id, ?state, "recorded health report");
        Ok(())
    }

    pub fn get(&self, runtime_id: &str) -> Option<HealthRecord> {
        self.health.get(runtime_id).map(|r| r.clone())
    }

    pub fn remove(&self, runtime_id: &str) {
        self.health.remove(runtime_id);
    }

    /// `Healthy`/`Degraded` route; `Unhealthy` does not; absent reports route (spec §4.3).
    pub fn should_route_traffic(&self, runtime_id: &str) -> bool {
        match self.health.get(runtime_id) {
            None => true,
            Some(record) => !matches!(record.state, HealthState::Unhealthy),
        }
    }

    /// `routable` predicate from the glossary: true for Healthy and Degraded.
    pub fn is_routable(state: HealthState) -> bool {
        !matches!(state, HealthState::Unhealthy)
    }

    pub fn list(&self) -> Vec<(String, HealthRecord)> {
        self.health
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl Default for LifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_report_routes_by_default() {
        let tracker = LifecycleTracker::new();
        assert!(tracker.should_route_traffic("unknown"));
    }

    #[test]
    fn unhealthy_blocks_routing_degraded_does_not() {
        let tracker = LifecycleTracker::new();
        tracker
            .report("p1", HealthState::Degraded, None, vec![])
            .unwrap();
        assert!(tracker.should_route_traffic("p1"));

        tracker
            .report("p1", HealthState::Unhealthy, Some("db down".into()), vec![])
            .unwrap();
        assert!(!tracker.should_route_traffic("p1"));
    }
}
