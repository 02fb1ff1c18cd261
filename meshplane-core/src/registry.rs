//! Service registry (component C7): multi-provider registration, version/health-filtered
//! selection, streaming availability watches.

use crate::config::SelectionStrategy;
use crate::error::CoreError;
use crate::lifecycle::LifecycleTracker;
use crate::validation::{
    validate_endpoint_path, validate_identifier, validate_metadata, validate_version,
    version_at_least,
};
use dashmap::DashMap;
use meshplane_sdk::protocol::{WatchEvent, WatchState};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{mpsc, RwLock};

/// Bounded watch channel capacity (spec §5): slow subscribers drop intermediate events on a
/// non-blocking send but always see the first snapshot and converge eventually.
const WATCH_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Clone)]
pub struct ServiceProvider {
    pub registration_id: String,
    pub runtime_id: String,
    pub service_type: String,
    pub version: String,
    pub endpoint_path: String,
    pub metadata: HashMap<String, String>,
    pub registered_at: SystemTime,
}

#[derive(Default)]
struct RegistryState {
    providers_by_type: HashMap<String, Vec<ServiceProvider>>,
    providers_by_id: HashMap<String, (String, String)>,
    round_robin_index: HashMap<String, usize>,
    watchers: HashMap<String, Vec<mpsc::Sender<WatchEvent>>>,
    strategy_overrides: HashMap<String, SelectionStrategy>,
}

pub struct Registry {
    state: RwLock<RegistryState>,
    allow_lists: DashMap<String, Vec<String>>,
    default_strategy: SelectionStrategy,
    lifecycle: Arc<LifecycleTracker>,
}

#[derive(Debug)]
pub struct DiscoverResult {
    pub runtime_id: String,
    pub endpoint_url: String,
    pub single_provider: bool,
}

impl Registry {
    pub fn new(default_strategy: SelectionStrategy, lifecycle: Arc<LifecycleTracker>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            allow_lists: DashMap::new(),
            default_strategy,
            lifecycle,
        }
    }

    /// Empty list denies all; absence of an entry allows all (spec §9, load-bearing asymmetry).
    pub fn set_allowed_services(&self, runtime_id: &str, allowed: Option<Vec<String>>) {
        match allowed {
            Some(types) => {
                self.allow_lists.insert(runtime_id.to_string(), types);
            }
            None => {
                self.allow_lists.remove(runtime_id);
            }
        }
    }

    fn check_allowed(&self, runtime_id: &str, service_type: &str) -> Result<(), CoreError> {
        if let Some(allowed) = self.allow_lists.get(runtime_id) {
            if !allowed.iter().any(|t| t == service_type) {
                return Err(CoreError::PermissionDenied(format!(
                    "runtime {runtime_id} is not allowed to register service type {service_type}"
                )));
            }
        }
        Ok(())
    }

    pub async fn register_service(
        &self,
        runtime_id: &str,
        service_type: &str,
        version: &str,
        endpoint_path: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String, CoreError> {
        validate_identifier("service_type", service_type)?;
        validate_version(version)?;
        validate_endpoint_path(endpoint_path)?;
        validate_metadata(&metadata)?;
        self.check_allowed(runtime_id, service_type)?;

        let registration_id = uuid::Uuid::new_v4().to_string();
        let provider = ServiceProvider {
            registration_id: registration_id.clone(),
            runtime_id: runtime_id.to_string(),
            service_type: service_type.to_string(),
            version: version.to_string(),
            endpoint_path: endpoint_path.to_string(),
            metadata,
            registered_at: SystemTime::now(),
        };

        let mut state = self.state.write().await;
        state
            .providers_by_type
            .entry(service_type.to_string())
            .or_default()
            .push(provider);
        state.providers_by_id.insert(
            registration_id.clone(),
            (service_type.to_string(), runtime_id.to_string()),
        );
        self.notify_watchers_locked(&mut state, service_type);
        tracing::info!(
            runtime_id = %runtime_id,
            service_type = %service_type,
            registration_id = %registration_id,
            "registered service"
        );
        Ok(registration_id)
    }

    pub async fn unregister_service(&self, registration_id: &str) -> Result<(), CoreError> {
        let mut state = self.state.write().await;
        let Some((service_type, runtime_id)) = state.providers_by_id.remove(registration_id)
        else {
            return Err(CoreError::NotFound(format!(
                "no registration with id {registration_id}"
            )));
        };
        if let Some(providers) = state.providers_by_type.get_mut(&service_type) {
            providers.retain(|p| p.registration_id != registration_id);
        }
        self.notify_watchers_locked(&mut state, &service_type);
        tracing::info!(runtime_id = %runtime_id, service_type = %service_type, "unregistered service");
        Ok(())
    }

    /// Atomically removes every provider owned by `runtime_id` (spec §3 invariant).
    pub async fn unregister_plugin_services(&self, runtime_id: &str) {
        let mut state = self.state.write().await;
        let affected_types: Vec<String> = state
            .providers_by_id
            .values()
            .filter(|(_, rid)| rid == runtime_id)
            .map(|(service_type, _)| service_type.clone())
            .collect();
        state
            .providers_by_id
            .retain(|_, (_, rid)| rid != runtime_id);
        for providers in state.providers_by_type.values_mut() {
            providers.retain(|p| p.runtime_id != runtime_id);
        }
        for service_type in affected_types.into_iter().collect::<std::collections::HashSet<_>>() {
            self.notify_watchers_locked(&mut state, &service_type);
        }
        tracing::info!(runtime_id = %runtime_id, "unregistered all services for plugin");
    }

    pub async fn discover_service(
        &self,
        service_type: &str,
        min_version: &str,
    ) -> Result<DiscoverResult, CoreError> {
        let (routable, strategy) = {
            let state = self.state.read().await;
            let Some(providers) = state.providers_by_type.get(service_type) else {
                return Err(CoreError::NotFound(format!(
                    "no providers registered for service type {service_type}"
                )));
            };
            if providers.is_empty() {
                return Err(CoreError::NotFound(format!(
                    "no providers registered for service type {service_type}"
                )));
            }

            let version_compatible: Vec<&ServiceProvider> = providers
                .iter()
                .filter(|p| version_at_least(&p.version, min_version))
                .collect();
            if version_compatible.is_empty() {
                return Err(CoreError::NotFound(format!(
                    "no providers of {service_type} satisfy min_version {min_version}"
                )));
            }

            let routable: Vec<ServiceProvider> = version_compatible
                .iter()
                .copied()
                .filter(|p| self.lifecycle.should_route_traffic(&p.runtime_id))
                .cloned()
                .collect();
            if routable.is_empty() {
                return Err(CoreError::NotFound(format!(
                    "no routable providers of {service_type}"
                )));
            }

            let strategy = state
                .strategy_overrides
                .get(service_type)
                .copied()
                .unwrap_or(self.default_strategy);
            (routable, strategy)
        };

        let single_provider = routable.len() == 1;
        let chosen = self.select(service_type, &routable, strategy).await;

        Ok(DiscoverResult {
            endpoint_url: format!("/services/{}/{}", service_type, chosen.runtime_id),
            runtime_id: chosen.runtime_id.clone(),
            single_provider,
        })
    }

    async fn select<'a>(
        &self,
        service_type: &str,
        candidates: &'a [ServiceProvider],
        strategy: SelectionStrategy,
    ) -> &'a ServiceProvider {
        match strategy {
            SelectionStrategy::First => &candidates[0],
            SelectionStrategy::RoundRobin => {
                let mut write = self.state.write().await;
                let previous = write
                    .round_robin_index
                    .get(service_type)
                    .copied()
                    .unwrap_or(0);
                write
                    .round_robin_index
                    .insert(service_type.to_string(), previous + 1);
                let index = previous % candidates.len();
                &candidates[index]
            }
            SelectionStrategy::Random => {
                let index = rand::thread_rng().gen_range(0..candidates.len());
                &candidates[index]
            }
            // Weighted is reserved; falls back to First (spec §4.2).
            SelectionStrategy::Weighted => &candidates[0],
        }
    }

    /// Opens a watch subscription: the receiver yields one immediate snapshot, then one
    /// event per subsequent state transition.
    pub async fn watch_service(&self, service_type: &str) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let snapshot = self.snapshot_event(service_type).await;
        let _ = tx.try_send(snapshot);

        let mut state = self.state.write().await;
        state
            .watchers
            .entry(service_type.to_string())
            .or_default()
            .push(tx);
        rx
    }

    async fn snapshot_event(&self, service_type: &str) -> WatchEvent {
        let state = self.state.read().await;
        self.event_for_locked(&state, service_type)
    }

    fn event_for_locked(&self, state: &RegistryState, service_type: &str) -> WatchEvent {
        let providers = state.providers_by_type.get(service_type);
        match providers {
            None => WatchEvent {
                service_type: service_type.to_string(),
                state: WatchState::Unavailable,
                endpoint: None,
            },
            Some(providers) if providers.is_empty() => WatchEvent {
                service_type: service_type.to_string(),
                state: WatchState::Unavailable,
                endpoint: None,
            },
            Some(providers) => {
                let any_healthy = providers
                    .iter()
                    .any(|p| self.lifecycle.should_route_traffic(&p.runtime_id));
                let watch_state = if any_healthy {
                    WatchState::Available
                } else {
                    WatchState::Degraded
                };
                let endpoint = providers
                    .iter()
                    .find(|p| self.lifecycle.should_route_traffic(&p.runtime_id))
                    .or_else(|| providers.first())
                    .map(|p| format!("/services/{}/{}", service_type, p.runtime_id));
                WatchEvent {
                    service_type: service_type.to_string(),
                    state: watch_state,
                    endpoint,
                }
            }
        }
    }

    /// Notifies watchers of `service_type` with a non-blocking send; a full channel drops
    /// the event rather than blocking the writer holding the exclusive lock (spec §5).
    fn notify_watchers_locked(&self, state: &mut RegistryState, service_type: &str) {
        let event = self.event_for_locked(state, service_type);
        if let Some(senders) = state.watchers.get_mut(service_type) {
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
    }

    pub async fn list_by_type(&self) -> HashMap<String, Vec<ServiceProvider>> {
        self.state.read().await.providers_by_type.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(SelectionStrategy::First, Arc::new(LifecycleTracker::new()))
    }

    #[tokio::test]
    async fn lone_provider_discovery() {
        let reg = registry();
        reg.register_service("l-0001", "logger", "1.0.0", "/rpc", HashMap::new())
            .await
            .unwrap();
        let result = reg.discover_service("logger", "1.0.0").await.unwrap();
        assert_eq!(result.runtime_id, "l-0001");
        assert!(result.single_provider);
        assert_eq!(result.endpoint_url, "/services/logger/l-0001");
    }

    #[tokio::test]
    async fn multi_provider_round_robin_cycles() {
        let reg = Registry::new(SelectionStrategy::RoundRobin, Arc::new(LifecycleTracker::new()));
        for rid in ["r1", "r2", "r3"] {
            reg.register_service(rid, "cache", "1.0.0", "/rpc", HashMap::new())
                .await
                .unwrap();
        }
        let picks: Vec<String> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                v.push(reg.discover_service("cache", "1.0.0").await.unwrap().runtime_id);
            }
            v
        };
        assert_eq!(picks, vec!["r1", "r2", "r3", "r1"]);
    }

    #[tokio::test]
    async fn health_filtered_selection() {
        let lifecycle = Arc::new(LifecycleTracker::new());
        let reg = Registry::new(SelectionStrategy::First, lifecycle.clone());
        reg.register_service("a", "db", "1.0.0", "/rpc", HashMap::new())
            .await
            .unwrap();
        reg.register_service("b", "db", "1.0.0", "/rpc", HashMap::new())
            .await
            .unwrap();
        lifecycle
            .report("b", meshplane_sdk::protocol::HealthState::Unhealthy, None, vec![])
            .unwrap();

        let result = reg.discover_service("db", "1.0.0").await.unwrap();
        assert_eq!(result.runtime_id, "a");

        lifecycle
            .report("a", meshplane_sdk::protocol::HealthState::Unhealthy, None, vec![])
            .unwrap();
        assert!(reg.discover_service("db", "1.0.0").await.is_err());
    }

    #[tokio::test]
    async fn min_version_filters_out_older_providers() {
        let reg = registry();
        reg.register_service("a", "svc", "1.0.0", "/rpc", HashMap::new())
            .await
            .unwrap();
        reg.register_service("b", "svc", "2.0.0", "/rpc", HashMap::new())
            .await
            .unwrap();
        let err = reg.discover_service("svc", "3.0.0").await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn unregister_plugin_services_removes_all_and_notifies() {
        let reg = registry();
        reg.register_service("p", "a", "1.0.0", "/rpc", HashMap::new())
            .await
            .unwrap();
        reg.register_service("p", "b", "1.0.0", "/rpc", HashMap::new())
            .await
            .unwrap();
        reg.unregister_plugin_services("p").await;
        assert!(reg.discover_service("a", "1.0.0").await.is_err());
        assert!(reg.discover_service("b", "1.0.0").await.is_err());
    }

    #[tokio::test]
    async fn allow_list_empty_denies_all_absent_allows_all() {
        let reg = registry();
        reg.set_allowed_services("p", Some(vec![]));
        let err = reg
            .register_service("p", "a", "1.0.0", "/rpc", HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::PermissionDenied(_)));

        reg.set_allowed_services("p", None);
        assert!(reg
            .register_service("p", "a", "1.0.0", "/rpc", HashMap::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn watch_service_emits_initial_snapshot() {
        let reg = registry();
        reg.register_service("p", "a", "1.0.0", "/rpc", HashMap::new())
            .await
            .unwrap();
        let mut rx = reg.watch_service("a").await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.state, WatchState::Available);
    }
}
