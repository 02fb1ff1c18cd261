//! Platform orchestrator (component C12): admission, removal, and blue/green replacement
//! of managed plugins, tying the registry, dependency graph, lifecycle tracker, and router's
//! base-URL table together (spec §4.7).

use crate::dependency_graph::{
    DependencyGraph, ProvidesEntry as GraphProvidesEntry, RequiresEntry as GraphRequiresEntry,
};
use crate::error::CoreError;
use crate::identity::IdentityStore;
use crate::launch::{LaunchStrategy, LaunchedPlugin};
use crate::lifecycle::LifecycleTracker;
use crate::registry::Registry;
use crate::router::BaseUrlTable;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use meshplane_sdk::protocol::{paths, HealthState, PluginInfo, SetRuntimeIdentityRequest};
use meshplane_sdk::transport::{collect_body, MemoryHttpClient};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// A managed plugin's admission parameters, independent of which [`LaunchStrategy`] will
/// actually start it.
pub struct PluginAdmissionConfig {
    pub host_url: String,
    pub client_metadata: HashMap<String, String>,
    pub health_deadline: Duration,
}

/// Thin client for the host→plugin control link, abstracting over a process plugin's real
/// TCP endpoint and an in-memory plugin's pipe-backed one.
enum ControlLink {
    Http { client: reqwest::Client, base_url: String },
    Memory(MemoryHttpClient),
}

impl ControlLink {
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        match self {
            ControlLink::Http { client, base_url } => {
                let resp = client.get(format!("{base_url}{path}")).send().await?;
                Ok(resp.error_for_status()?.json().await?)
            }
            ControlLink::Memory(client) => {
                let req = hyper::Request::builder()
                    .method("GET")
                    .uri(format!("http://in-memory{path}"))
                    .body(Full::new(Bytes::new()))?;
                let resp = client.request(req).await?;
                let body = collect_body_compat(resp.into_body()).await?;
                Ok(serde_json::from_slice(&body)?)
            }
        }
    }

    async fn post_json<B: serde::Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> anyhow::Result<T> {
        match self {
            ControlLink::Http { client, base_url } => {
                let resp = client.post(format!("{base_url}{path}")).json(body).send().await?;
                Ok(resp.error_for_status()?.json().await?)
            }
            ControlLink::Memory(client) => {
                let payload = serde_json::to_vec(body)?;
                let req = hyper::Request::builder()
                    .method("POST")
                    .uri(format!("http://in-memory{path}"))
                    .header("content-type", "application/json")
                    .body(Full::new(Bytes::from(payload)))?;
                let resp = client.request(req).await?;
                let body = collect_body_compat(resp.into_body()).await?;
                Ok(serde_json::from_slice(&body)?)
            }
        }
    }
}

async fn collect_body_compat(body: Incoming) -> anyhow::Result<Bytes> {
    Ok(collect_body(body).await?)
}

/// Admitted plugin bookkeeping the orchestrator keeps so `RemovePlugin`/`ReplacePlugin` can
/// tear one down again.
struct AdmittedPlugin {
    launch: Arc<dyn LaunchStrategy>,
}

/// Ties registry + graph + lifecycle + router for managed plugins (spec §4.7). Does not
/// itself hold the self-registering path: those plugins handshake and register directly
/// against the RPC surface, and the platform only ever *observes* them through the shared
/// [`Registry`]/[`DependencyGraph`].
pub struct Platform {
    identity: Arc<IdentityStore>,
    registry: Arc<Registry>,
    lifecycle: Arc<LifecycleTracker>,
    graph: Arc<DependencyGraph>,
    base_urls: Arc<BaseUrlTable>,
    admitted: RwLock<HashMap<String, AdmittedPlugin>>,
}

impl Platform {
    pub fn new(
        identity: Arc<IdentityStore>,
        registry: Arc<Registry>,
        lifecycle: Arc<LifecycleTracker>,
        graph: Arc<DependencyGraph>,
        base_urls: Arc<BaseUrlTable>,
    ) -> Self {
        Self {
            identity,
            registry,
            lifecycle,
            graph,
            base_urls,
            admitted: RwLock::new(HashMap::new()),
        }
    }

    /// `AddPlugin(config)`: launches the plugin, pulls its `GetPluginInfo`, validates
    /// `required_for_startup` dependencies, issues a runtime identity, pushes it back via
    /// `SetRuntimeIdentity`, registers provided services and a dependency-graph node, waits
    /// for `Healthy`, and rolls everything back on timeout.
    pub async fn add_plugin(
        &self,
        launch: Arc<dyn LaunchStrategy>,
        admission: PluginAdmissionConfig,
    ) -> Result<String, CoreError> {
        let launched = launch
            .launch()
            .await
            .map_err(|err| CoreError::FailedPrecondition(format!("plugin failed to launch: {err}")))?;
        let link = self.control_link(&launched);

        let info: PluginInfo = link
            .get_json(paths::PLUGIN_INFO)
            .await
            .map_err(|err| CoreError::FailedPrecondition(format!("GetPluginInfo failed: {err}")))?;

        for requirement in info.requires.iter().filter(|r| r.required_for_startup) {
            if !self.graph.has_service(&requirement.service_type).await {
                let _ = launch.stop().await;
                return Err(CoreError::FailedPrecondition(format!(
                    "required_for_startup dependency {} is not yet provided",
                    requirement.service_type
                )));
            }
        }

        let (runtime_id, runtime_token) =
            self.identity.issue(&info.self_id, &info.self_version, admission.client_metadata)?;

        let push_result: anyhow::Result<serde_json::Value> = link
            .post_json(
                paths::PLUGIN_SET_RUNTIME_IDENTITY,
                &SetRuntimeIdentityRequest {
                    runtime_id: runtime_id.clone(),
                    runtime_token: runtime_token.clone(),
                    host_url: admission.host_url.clone(),
                },
            )
            .await;
        if let Err(err) = push_result {
            self.identity.remove(&runtime_id);
            let _ = launch.stop().await;
            return Err(CoreError::FailedPrecondition(format!(
                "SetRuntimeIdentity failed: {err}"
            )));
        }

        self.base_urls.set(&runtime_id, &launched.endpoint);
        self.graph
            .add_node(
                &runtime_id,
                info.provides
                    .iter()
                    .map(|p| GraphProvidesEntry {
                        service_type: p.service_type.clone(),
                        version: p.version.clone(),
                    })
                    .collect(),
                info.requires
                    .iter()
                    .map(|r| GraphRequiresEntry {
                        service_type: r.service_type.clone(),
                        min_version: r.min_version.clone(),
                        required_for_startup: r.required_for_startup,
                        watch_for_changes: r.watch_for_changes,
                    })
                    .collect(),
            )
            .await;

        for provides in &info.provides {
            if let Err(err) = self
                .registry
                .register_service(
                    &runtime_id,
                    &provides.service_type,
                    &provides.version,
                    &provides.endpoint_path,
                    HashMap::new(),
                )
                .await
            {
                tracing::warn!(%runtime_id, service_type = %provides.service_type, %err, "failed to register managed plugin's advertised service");
            }
        }

        if self
            .wait_for_healthy(&runtime_id, admission.health_deadline)
            .await
            .is_err()
        {
            self.rollback(&runtime_id, launch.as_ref()).await;
            return Err(CoreError::DeadlineExceeded(format!(
                "plugin {runtime_id} did not become healthy within {:?}",
                admission.health_deadline
            )));
        }

        self.admitted
            .write()
            .await
            .insert(runtime_id.clone(), AdmittedPlugin { launch });
        tracing::info!(%runtime_id, self_id = %info.self_id, "admitted managed plugin");
        Ok(runtime_id)
    }

    fn control_link(&self, launched: &LaunchedPlugin) -> ControlLink {
        match &launched.in_memory_client {
            Some(client) => ControlLink::Memory(client.clone()),
            None => ControlLink::Http {
                client: reqwest::Client::new(),
                base_url: launched.endpoint.clone(),
            },
        }
    }

    async fn wait_for_healthy(&self, runtime_id: &str, deadline: Duration) -> Result<(), ()> {
        let until = Instant::now() + deadline;
        loop {
            if let Some(record) = self.lifecycle.get(runtime_id) {
                if matches!(record.state, HealthState::Healthy) {
                    return Ok(());
                }
            }
            if Instant::now() >= until {
                return Err(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn rollback(&self, runtime_id: &str, launch: &dyn LaunchStrategy) {
        tracing::warn!(%runtime_id, "rolling back plugin admission after health timeout");
        self.registry.unregister_plugin_services(runtime_id).await;
        self.graph.remove_node(runtime_id).await;
        self.base_urls.remove(runtime_id);
        self.lifecycle.remove(runtime_id);
        self.identity.remove(runtime_id);
        let _ = launch.stop().await;
    }

    /// `RemovePlugin(runtime_id)`: computes impact, honors a grace period, unregisters
    /// services (watchers emit `Unavailable`), requests graceful shutdown, then removes the
    /// dependency-graph node.
    pub async fn remove_plugin(&self, runtime_id: &str, grace: Duration) -> Result<(), CoreError> {
        let impact = self.graph.get_impact(runtime_id).await;
        if !impact.affected_plugins.is_empty() {
            tracing::info!(
                %runtime_id,
                affected_plugins = ?impact.affected_plugins,
                affected_services = ?impact.affected_services,
                "removing plugin with active dependents; honoring grace period"
            );
            tokio::time::sleep(grace).await;
        }

        self.registry.unregister_plugin_services(runtime_id).await;

        let admitted = self.admitted.write().await.remove(runtime_id);
        if let Some(plugin) = admitted {
            plugin
                .launch
                .stop()
                .await
                .map_err(|err| CoreError::Internal(format!("plugin shutdown failed: {err}")))?;
        }

        self.graph.remove_node(runtime_id).await;
        self.base_urls.remove(runtime_id);
        self.lifecycle.remove(runtime_id);
        self.identity.remove(runtime_id);
        tracing::info!(%runtime_id, "removed plugin");
        Ok(())
    }

    /// `ReplacePlugin(old_rid, new_config)`: admits the new instance alongside the old one,
    /// waits for it to become healthy, then drains and removes the old instance. Discovery
    /// naturally prefers the new registration once the old one is unregistered; until then
    /// both are routable candidates (conservative, spec §9 Open Question decision).
    pub async fn replace_plugin(
        &self,
        old_runtime_id: &str,
        new_launch: Arc<dyn LaunchStrategy>,
        new_admission: PluginAdmissionConfig,
        drain_grace: Duration,
    ) -> Result<String, CoreError> {
        let new_runtime_id = self.add_plugin(new_launch, new_admission).await?;
        self.remove_plugin(old_runtime_id, drain_grace).await?;
        Ok(new_runtime_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionStrategy;
    use crate::launch::in_memory::InMemoryLaunchStrategy;
    use axum::routing::{get, post};
    use axum::{Json, Router as AxumRouter};
    use meshplane_sdk::protocol::ProvidesEntry;

    fn platform() -> (
        Platform,
        Arc<Registry>,
        Arc<LifecycleTracker>,
        Arc<DependencyGraph>,
    ) {
        let lifecycle = Arc::new(LifecycleTracker::new());
        let identity = Arc::new(IdentityStore::new(crate::config::Config::default().handshake));
        let registry = Arc::new(Registry::new(SelectionStrategy::First, lifecycle.clone()));
        let graph = Arc::new(DependencyGraph::new());
        let base_urls = Arc::new(BaseUrlTable::new());
        let platform = Platform::new(identity, registry.clone(), lifecycle.clone(), graph.clone(), base_urls);
        (platform, registry, lifecycle, graph)
    }

    async fn get_plugin_info() -> Json<PluginInfo> {
        Json(PluginInfo {
            self_id: "cache".to_string(),
            self_version: "1.0.0".to_string(),
            provides: vec![ProvidesEntry {
                service_type: "cache".to_string(),
                version: "1.0.0".to_string(),
                endpoint_path: "/rpc".to_string(),
            }],
            requires: vec![],
        })
    }

    async fn set_runtime_identity() -> Json<serde_json::Value> {
        Json(serde_json::json!({}))
    }

    fn stub_plugin_router() -> AxumRouter {
        AxumRouter::new()
            .route(paths::PLUGIN_INFO, get(get_plugin_info))
            .route(paths::PLUGIN_SET_RUNTIME_IDENTITY, post(set_runtime_identity))
    }

    #[tokio::test]
    async fn add_plugin_times_out_without_health_report() {
        let (platform, ..) = platform();
        let launch: Arc<dyn LaunchStrategy> =
            Arc::new(InMemoryLaunchStrategy::new(stub_plugin_router()));
        let err = platform
            .add_plugin(
                launch,
                PluginAdmissionConfig {
                    host_url: "http://host".to_string(),
                    client_metadata: HashMap::new(),
                    health_deadline: Duration::from_millis(100),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn add_plugin_succeeds_once_healthy_is_reported_concurrently() {
        let (platform, registry, lifecycle, graph) = platform();
        let launch: Arc<dyn LaunchStrategy> =
            Arc::new(InMemoryLaunchStrategy::new(stub_plugin_router()));

        // A real deployment reports health over the RPC surface; this simulates that by
        // writing to the shared lifecycle tracker directly once registration has landed.
        tokio::spawn(async move {
            loop {
                let providers = registry.list_by_type().await;
                if let Some(providers) = providers.get("cache") {
                    for provider in providers {
                        lifecycle
                            .report(&provider.runtime_id, HealthState::Healthy, None, vec![])
                            .unwrap();
                    }
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let runtime_id = platform
            .add_plugin(
                launch,
                PluginAdmissionConfig {
                    host_url: "http://host".to_string(),
                    client_metadata: HashMap::new(),
                    health_deadline: Duration::from_secs(2),
                },
            )
            .await
            .unwrap();
        assert!(runtime_id.starts_with("cache-"));
        assert!(graph.has_service("cache").await);
    }
}
