//! Service router (component C8): authenticated host-mediated proxy for plugin→plugin
//! calls, `/services/{type}/{runtime_id}/{method...}` (spec §4.4).

use crate::error::CoreError;
use crate::identity::IdentityStore;
use crate::lifecycle::LifecycleTracker;
use crate::registry::Registry;
use crate::resilience::ResilienceStack;
use crate::tls_warning::TlsWarner;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use meshplane_sdk::protocol::HEADER_RUNTIME_ID;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Base URLs registered out-of-band by the platform orchestrator for managed plugins.
/// Self-registering plugins fall back to `metadata["base_url"]` on their registration.
pub struct BaseUrlTable {
    urls: DashMap<String, String>,
    tls_warner: TlsWarner,
}

impl BaseUrlTable {
    pub fn new() -> Self {
        Self {
            urls: DashMap::new(),
            tls_warner: TlsWarner::new(),
        }
    }

    /// Records `runtime_id`'s base URL and emits a one-shot warning if its scheme isn't
    /// `https`/`unix` (spec §6).
    pub fn set(&self, runtime_id: &str, base_url: &str) {
        self.tls_warner.warn_if_insecure(runtime_id, base_url);
        self.urls.insert(runtime_id.to_string(), base_url.to_string());
    }

    /// Classifies and warns about a base URL learned outside of [`BaseUrlTable::set`] (the
    /// `metadata["base_url"]` fallback path for self-registering plugins).
    pub fn warn_if_insecure(&self, runtime_id: &str, base_url: &str) {
        self.tls_warner.warn_if_insecure(runtime_id, base_url);
    }

    pub fn remove(&self, runtime_id: &str) {
        self.urls.remove(runtime_id);
    }

    pub fn get(&self, runtime_id: &str) -> Option<String> {
        self.urls.get(runtime_id).map(|v| v.clone())
    }
}

impl Default for BaseUrlTable {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Router {
    pub identity: Arc<IdentityStore>,
    pub registry: Arc<Registry>,
    pub lifecycle: Arc<LifecycleTracker>,
    pub base_urls: Arc<BaseUrlTable>,
    pub resilience: Arc<ResilienceStack>,
    pub http: reqwest::Client,
    pub downstream_timeout: Duration,
}

const HOP_BY_HOP_STRIPPED: [&str; 2] = ["authorization", "x-plugin-runtime-id"];

impl Router {
    /// Steps 1-11 of spec §4.4, minus path parsing (handled by the axum route itself).
    pub async fn proxy(
        &self,
        service_type: &str,
        provider_runtime_id: &str,
        method_path: &str,
        query: Option<&str>,
        method: reqwest::Method,
        headers: HeaderMap,
        body: Body,
    ) -> Result<Response, CoreError> {
        let start = Instant::now();

        let caller_runtime_id = headers
            .get(HEADER_RUNTIME_ID)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| CoreError::Unauthenticated("missing X-Plugin-Runtime-ID".to_string()))?;
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or_else(|| {
                CoreError::Unauthenticated("missing or malformed Authorization header".to_string())
            })?;
        self.identity.validate(caller_runtime_id, bearer)?;

        let provider = self
            .registry
            .list_by_type()
            .await
            .get(service_type)
            .and_then(|providers| {
                providers
                    .iter()
                    .find(|p| p.runtime_id == provider_runtime_id)
                    .cloned()
            })
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "no provider {provider_runtime_id} for service {service_type}"
                ))
            })?;

        if !self.lifecycle.should_route_traffic(provider_runtime_id) {
            return Err(CoreError::Unavailable(format!(
                "provider {provider_runtime_id} is not currently routable"
            )));
        }

        let base_url = match self.base_urls.get(provider_runtime_id) {
            Some(base_url) => base_url,
            None => {
                let base_url = provider.metadata.get("base_url").cloned().ok_or_else(|| {
                    CoreError::Internal(format!(
                        "provider {provider_runtime_id} has no resolvable base URL"
                    ))
                })?;
                self.base_urls.warn_if_insecure(provider_runtime_id, &base_url);
                base_url
            }
        };

        let mut target = format!(
            "{}{}{}",
            base_url.trim_end_matches('/'),
            provider.endpoint_path,
            method_path
        );
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            target.push('?');
            target.push_str(query);
        }

        let mut forwarded = reqwest::header::HeaderMap::new();
        for (name, value) in headers.iter() {
            if HOP_BY_HOP_STRIPPED.contains(&name.as_str()) {
                continue;
            }
            if let Ok(name) = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()) {
                forwarded.insert(name, value.clone());
            }
        }

        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|err| CoreError::Internal(format!("failed to buffer request body: {err}")))?;

        let breaker = self.resilience.breaker_for(provider_runtime_id);
        if !breaker.permit().await {
            return Err(CoreError::Unavailable(format!(
                "circuit open for provider {provider_runtime_id}"
            )));
        }

        let downstream = self
            .http
            .request(method, &target)
            .headers(forwarded)
            .body(body_bytes)
            .timeout(self.downstream_timeout)
            .send()
            .await;

        let response = match downstream {
            Ok(resp) => {
                breaker.record_success().await;
                resp
            }
            Err(err) => {
                breaker.record_failure().await;
                tracing::warn!(
                    caller = %caller_runtime_id,
                    provider = %provider_runtime_id,
                    %service_type,
                    target = %target,
                    "downstream call failed: {err}"
                );
                return Err(CoreError::BadGateway(format!(
                    "downstream call to {provider_runtime_id} failed: {err}"
                )));
            }
        };

        let status = response.status();
        let mut out = Response::builder().status(status.as_u16());
        for (name, value) in response.headers().iter() {
            if let Ok(name) = HeaderName::from_bytes(name.as_str().as_bytes()) {
                out = out.header(name, value.as_bytes());
            }
        }
        let response_body = response
            .bytes()
            .await
            .map_err(|err| CoreError::BadGateway(format!("failed reading downstream body: {err}")))?;

        tracing::info!(
            caller = %caller_runtime_id,
            provider = %provider_runtime_id,
            service_type = %service_type,
            method = %method_path,
            status = status.as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "proxied call"
        );

        Ok(out
            .body(Body::from(response_body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
    }
}

pub async fn handle_proxy(
    State(router): State<Arc<Router>>,
    Path((service_type, provider_runtime_id, method_path)): Path<(String, String, String)>,
    request: Request<Body>,
) -> Response {
    let query = request.uri().query().map(|q| q.to_string());
    let method = request.method().clone();
    let headers = request.headers().clone();
    let body = request.into_body();
    let method_path = if method_path.starts_with('/') {
        method_path
    } else {
        format!("/{method_path}")
    };

    match router
        .proxy(
            &service_type,
            &provider_runtime_id,
            &method_path,
            query.as_deref(),
            method,
            headers,
            body,
        )
        .await
    {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}
