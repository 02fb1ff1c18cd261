//! HTTP middleware layers (ambient, grounded on the teacher's `middleware/mod.rs` pattern of
//! `State<AppState>, Request<Body>, Next -> Response` functions applied via
//! `axum::middleware::from_fn_with_state`).

use crate::error::CoreError;
use crate::resilience::rate_limit::rate_limit_key;
use crate::server::AppState;
use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::time::Instant;

const SKIP_METRICS_PREFIXES: [&str; 3] = ["/metrics", "/healthz", "/readyz"];

pub async fn logging_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();

    let response = next.run(req).await;

    tracing::info!(
        method = %method,
        uri = %uri,
        status = response.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "request processed"
    );
    response
}

pub async fn metrics_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let response = next.run(req).await;

    if !SKIP_METRICS_PREFIXES.iter().any(|p| path.starts_with(p)) {
        state.metrics.record_router_call(response.status().as_u16());
    }
    response
}

/// Token-bucket throttling keyed by `X-Plugin-Runtime-ID` (falling back to peer address),
/// applied ahead of every RPC and proxy route (spec §4.8).
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = rate_limit_key(req.headers(), peer);

    if !state.resilience.rate_limiter.allow(&key) {
        state.metrics.record_rate_limit_denial();
        return CoreError::ResourceExhausted(format!("rate limit exceeded for {key}")).into_response();
    }
    next.run(req).await
}
