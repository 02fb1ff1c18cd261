//! HTTP surface assembly (component C1/ambient): builds the `AppState`, wires every route
//! named in spec §6 plus the `/admin/*` and `/metrics*` additions, grounded on the teacher's
//! `server.rs` `create_server(config) -> Router` pattern.

use crate::capability::CapabilityBroker;
use crate::config::Config;
use crate::dependency_graph::DependencyGraph;
use crate::error::CoreError;
use crate::identity::IdentityStore;
use crate::lifecycle::LifecycleTracker;
use crate::metrics::MetricsCollector;
use crate::middleware::{logging_middleware, metrics_middleware, rate_limit_middleware};
use crate::platform::Platform;
use crate::registry::Registry;
use crate::resilience::ResilienceStack;
use crate::router::{handle_proxy, BaseUrlTable, Router as ServiceRouter};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router as AxumRouter};
use dashmap::DashMap;
use futures::stream::{Stream, StreamExt};
use meshplane_sdk::protocol::{
    DiscoverServiceRequest, DiscoverServiceResponse, HandshakeRequest, HandshakeResponse,
    RegisterServiceRequest, RegisterServiceResponse, ReportHealthRequest, RequestCapabilityRequest,
    RequestCapabilityResponse, UnregisterServiceRequest, HEADER_RUNTIME_ID,
};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio_stream::wrappers::ReceiverStream;
use tower::ServiceExt;

/// Host-implemented capability handlers, mounted as ordinary axum sub-routers and looked up
/// by `capability_type` when a grant-bearing call arrives at `/capabilities/{type}/...`.
#[derive(Clone, Default)]
pub struct CapabilityHandlers(Arc<DashMap<String, AxumRouter>>);

impl CapabilityHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&self, capability_type: impl Into<String>, router: AxumRouter) {
        self.0.insert(capability_type.into(), router);
    }

    fn get(&self, capability_type: &str) -> Option<AxumRouter> {
        self.0.get(capability_type).map(|r| r.clone())
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub identity: Arc<IdentityStore>,
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleTracker>,
    pub graph: Arc<DependencyGraph>,
    pub capability_broker: Arc<CapabilityBroker>,
    pub capability_handlers: CapabilityHandlers,
    pub resilience: Arc<ResilienceStack>,
    pub service_router: Arc<ServiceRouter>,
    pub platform: Arc<Platform>,
    pub metrics: Arc<MetricsCollector>,
    pub base_urls: Arc<BaseUrlTable>,
    /// Flipped to `false` at the start of graceful shutdown so `/readyz` fails before the
    /// listener stops accepting connections.
    pub ready: Arc<AtomicBool>,
}

/// Builds the full application state and wires it to every route. Grounded on the teacher's
/// `create_server(config) -> anyhow::Result<Router>`; additionally returns the readiness flag
/// so the binary entry point can flip it to `false` at the start of graceful shutdown.
pub fn create_server(config: Config) -> anyhow::Result<(AxumRouter, Arc<AtomicBool>)> {
    let config = Arc::new(config);
    let lifecycle = Arc::new(LifecycleTracker::new());
    let identity = Arc::new(IdentityStore::new(config.handshake.clone()));
    let registry = Arc::new(Registry::new(
        config.registry.default_strategy,
        lifecycle.clone(),
    ));
    let graph = Arc::new(DependencyGraph::new());
    let capability_broker = Arc::new(CapabilityBroker::new(config.capabilities.grant_ttl));
    let capability_handlers = CapabilityHandlers::new();
    let resilience = Arc::new(ResilienceStack::new(&config.resilience));
    resilience.spawn_rate_limiter_eviction();
    let base_urls = Arc::new(BaseUrlTable::new());
    let metrics = Arc::new(MetricsCollector::new(crate::metrics::MetricsConfig::default()));

    let service_router = Arc::new(ServiceRouter {
        identity: identity.clone(),
        registry: registry.clone(),
        lifecycle: lifecycle.clone(),
        base_urls: base_urls.clone(),
        resilience: resilience.clone(),
        http: reqwest::Client::new(),
        downstream_timeout: config.router.downstream_timeout,
    });
    let platform = Arc::new(Platform::new(
        identity.clone(),
        registry.clone(),
        lifecycle.clone(),
        graph.clone(),
        base_urls.clone(),
    ));

    let state = AppState {
        config,
        identity,
        registry,
        lifecycle,
        graph,
        capability_broker,
        capability_handlers,
        resilience,
        service_router: service_router.clone(),
        platform,
        metrics,
        base_urls,
        ready: Arc::new(AtomicBool::new(true)),
    };

    let proxy_routes = AxumRouter::new()
        .route("/services/{service_type}/{runtime_id}/{*method}", any(handle_proxy))
        .with_state(service_router);

    let rpc_routes = AxumRouter::new()
        .route(meshplane_sdk::protocol::paths::HANDSHAKE, post(handshake_handler))
        .route(
            meshplane_sdk::protocol::paths::REGISTER_SERVICE,
            post(register_service_handler),
        )
        .route(
            meshplane_sdk::protocol::paths::UNREGISTER_SERVICE,
            post(unregister_service_handler),
        )
        .route(
            meshplane_sdk::protocol::paths::DISCOVER_SERVICE,
            get(discover_service_handler),
        )
        .route(meshplane_sdk::protocol::paths::WATCH_SERVICE, get(watch_service_handler))
        .route(meshplane_sdk::protocol::paths::REPORT_HEALTH, post(report_health_handler))
        .route(
            meshplane_sdk::protocol::paths::REQUEST_CAPABILITY,
            post(request_capability_handler),
        );

    let capability_routes = AxumRouter::new().route(
        "/capabilities/{capability_type}/{grant_id}/{*method}",
        any(capability_proxy_handler),
    );

    let admin_routes = AxumRouter::new()
        .route("/admin/plugins", get(admin_plugins_handler))
        .route("/admin/services", get(admin_services_handler))
        .route("/admin/dependency-graph", get(admin_dependency_graph_handler));

    let observability_routes = AxumRouter::new()
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .route("/metrics", get(metrics_json_handler))
        .route("/metrics/prometheus", get(metrics_prometheus_handler));

    let app = AxumRouter::new()
        .merge(rpc_routes)
        .merge(capability_routes)
        .merge(admin_routes)
        .merge(observability_routes)
        .with_state(state.clone())
        .merge(proxy_routes)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            metrics_middleware,
        ))
        .layer(axum::middleware::from_fn(logging_middleware))
        .layer(tower_http::timeout::TimeoutLayer::new(state.config.server.timeout));

    Ok((app, state.ready.clone()))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, CoreError> {
    let runtime_id = headers
        .get(HEADER_RUNTIME_ID)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| CoreError::Unauthenticated("missing X-Plugin-Runtime-ID".to_string()))?
        .to_string();
    let bearer = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            CoreError::Unauthenticated("missing or malformed Authorization header".to_string())
        })?;
    state.identity.validate(&runtime_id, bearer)?;
    Ok(runtime_id)
}

async fn handshake_handler(
    State(state): State<AppState>,
    Json(req): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, CoreError> {
    state.identity.verify_protocol(
        &req.magic_cookie_key,
        &req.magic_cookie_value,
        req.core_protocol_version,
        req.app_protocol_version,
    )?;

    let registered = state.registry.list_by_type().await;
    let available_plugins: Vec<String> = req
        .requested_plugins
        .iter()
        .filter(|name| registered.contains_key(*name))
        .cloned()
        .collect();

    let (runtime_id, runtime_token) = match req.self_id.as_deref() {
        Some(self_id) => {
            let self_version = req.self_version.as_deref().unwrap_or("0.0.0");
            let (runtime_id, runtime_token) =
                state.identity.issue(self_id, self_version, req.client_metadata)?;
            state.metrics.record_handshake_admission();
            (Some(runtime_id), Some(runtime_token))
        }
        None => (None, None),
    };

    Ok(Json(HandshakeResponse {
        core_protocol_version: state.config.handshake.core_protocol_version,
        app_protocol_version: state.config.handshake.app_protocol_version,
        available_plugins,
        host_capabilities: Vec::new(),
        runtime_id,
        runtime_token,
    }))
}

async fn register_service_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RegisterServiceRequest>,
) -> Result<Json<RegisterServiceResponse>, CoreError> {
    let runtime_id = authenticate(&state, &headers)?;
    let registration_id = state
        .registry
        .register_service(
            &runtime_id,
            &req.service_type,
            &req.version,
            &req.endpoint_path,
            req.metadata,
        )
        .await?;
    state.metrics.record_registration();
    Ok(Json(RegisterServiceResponse { registration_id }))
}

async fn unregister_service_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UnregisterServiceRequest>,
) -> Result<Json<serde_json::Value>, CoreError> {
    authenticate(&state, &headers)?;
    state.registry.unregister_service(&req.registration_id).await?;
    Ok(Json(serde_json::json!({})))
}

async fn discover_service_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Query(req): axum::extract::Query<DiscoverServiceRequest>,
) -> Result<Json<DiscoverServiceResponse>, CoreError> {
    authenticate(&state, &headers)?;
    let result = state
        .registry
        .discover_service(&req.service_type, &req.min_version)
        .await;
    state.metrics.record_discovery(result.is_ok());
    let result = result?;
    Ok(Json(DiscoverServiceResponse {
        endpoint_url: result.endpoint_url,
        runtime_id: result.runtime_id,
        single_provider: result.single_provider,
    }))
}

#[derive(serde::Deserialize)]
struct WatchQuery {
    service_type: String,
}

async fn watch_service_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    axum::extract::Query(query): axum::extract::Query<WatchQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, CoreError> {
    authenticate(&state, &headers)?;
    let rx = state.registry.watch_service(&query.service_type).await;
    let stream = ReceiverStream::new(rx).map(|event| {
        Ok(Event::default().json_data(&event).unwrap_or_else(|_| Event::default()))
    });
    Ok(Sse::new(stream))
}

async fn report_health_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReportHealthRequest>,
) -> Result<Json<serde_json::Value>, CoreError> {
    let runtime_id = authenticate(&state, &headers)?;
    state
        .lifecycle
        .report(&runtime_id, req.state, req.reason, req.unavailable_dependencies)?;
    Ok(Json(serde_json::json!({})))
}

async fn request_capability_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RequestCapabilityRequest>,
) -> Result<Json<RequestCapabilityResponse>, CoreError> {
    authenticate(&state, &headers)?;
    let (grant, version) =
        state
            .capability_broker
            .request_capability(&req.capability_type, &req.min_version, &req.reason)?;
    Ok(Json(RequestCapabilityResponse {
        endpoint_url: format!("/capabilities/{}/{}", grant.capability_type, grant.grant_id),
        grant_id: grant.grant_id,
        bearer_token: grant.bearer_token,
        capability_type: grant.capability_type,
        version,
    }))
}

/// `/capabilities/{type}/{grant_id}/{method...}` (spec §4.5): validates the grant's bearer
/// token in constant time, strips the capability prefix, and forwards to the host-mounted
/// sub-router for that capability type.
async fn capability_proxy_handler(
    State(state): State<AppState>,
    Path((capability_type, grant_id, method_path)): Path<(String, String, String)>,
    request: Request<Body>,
) -> Response {
    let bearer = match request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) => token.to_string(),
        None => {
            return CoreError::Unauthenticated("missing or malformed Authorization header".to_string())
                .into_response()
        }
    };

    if let Err(err) = state
        .capability_broker
        .validate_grant(&capability_type, &grant_id, &bearer)
    {
        return err.into_response();
    }

    let Some(handler) = state.capability_handlers.get(&capability_type) else {
        return CoreError::NotFound(format!("no handler mounted for capability {capability_type}"))
            .into_response();
    };

    let method_path = if method_path.starts_with('/') {
        method_path
    } else {
        format!("/{method_path}")
    };
    let query = request.uri().query().map(|q| q.to_string());
    let uri = match query {
        Some(q) => format!("{method_path}?{q}"),
        None => method_path,
    };

    let (mut parts, body) = request.into_parts();
    parts.uri = match uri.parse() {
        Ok(uri) => uri,
        Err(err) => return CoreError::Internal(format!("failed to rewrite capability URI: {err}")).into_response(),
    };
    let forwarded = Request::from_parts(parts, body);

    match handler.oneshot(forwarded).await {
        Ok(response) => response,
        Err(err) => match err {},
    }
}

async fn healthz_handler() -> StatusCode {
    StatusCode::OK
}

async fn readyz_handler(State(state): State<AppState>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_json_handler(State(state): State<AppState>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn metrics_prometheus_handler(State(state): State<AppState>) -> String {
    state.metrics.render_prometheus()
}

#[derive(serde::Serialize)]
struct AdminIdentity {
    runtime_id: String,
    self_id: String,
    self_version: String,
    issued_at: SystemTime,
    expires_at: SystemTime,
}

async fn admin_plugins_handler(State(state): State<AppState>) -> Json<Vec<AdminIdentity>> {
    let identities = state
        .identity
        .list()
        .into_iter()
        .map(|(runtime_id, record)| AdminIdentity {
            runtime_id,
            self_id: record.self_id,
            self_version: record.self_version,
            issued_at: record.issued_at,
            expires_at: record.expires_at,
        })
        .collect();
    Json(identities)
}

#[derive(serde::Serialize)]
struct AdminProvider {
    runtime_id: String,
    service_type: String,
    version: String,
    endpoint_path: String,
    routable: bool,
}

async fn admin_services_handler(State(state): State<AppState>) -> Json<Vec<AdminProvider>> {
    let providers = state
        .registry
        .list_by_type()
        .await
        .into_values()
        .flatten()
        .map(|p| AdminProvider {
            routable: state.lifecycle.should_route_traffic(&p.runtime_id),
            runtime_id: p.runtime_id,
            service_type: p.service_type,
            version: p.version,
            endpoint_path: p.endpoint_path,
        })
        .collect();
    Json(providers)
}

async fn admin_dependency_graph_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<String>>, CoreError> {
    let order = state.graph.startup_order().await?;
    Ok(Json(order))
}
