//! Host-side coordination plane for a remote-first plugin platform: handshake and identity,
//! the service registry, the dependency graph, the capability broker, the authenticated
//! proxy router, resilience interceptors, and the managed-plugin orchestrator, assembled
//! behind one HTTP surface.

pub mod capability;
pub mod config;
pub mod dependency_graph;
pub mod error;
pub mod identity;
pub mod launch;
pub mod lifecycle;
pub mod metrics;
pub mod middleware;
pub mod platform;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod server;
pub mod tls_warning;
pub mod validation;

pub use server::create_server;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::StatusCode;
    use axum_test::TestServer;
    use meshplane_sdk::protocol::{
        paths, HandshakeRequest, HandshakeResponse, HealthState, RegisterServiceRequest,
        RegisterServiceResponse, ReportHealthRequest, HEADER_RUNTIME_ID,
    };
    use std::collections::HashMap;

    fn server() -> TestServer {
        let (app, _ready) = create_server(Config::default()).unwrap();
        TestServer::new(app).unwrap()
    }

    fn handshake_request(self_id: &str) -> HandshakeRequest {
        let defaults = Config::default().handshake;
        HandshakeRequest {
            core_protocol_version: defaults.core_protocol_version,
            app_protocol_version: defaults.app_protocol_version,
            magic_cookie_key: defaults.magic_cookie_key,
            magic_cookie_value: defaults.magic_cookie_value,
            requested_plugins: vec![],
            self_id: Some(self_id.to_string()),
            self_version: Some("1.0.0".to_string()),
            client_metadata: HashMap::new(),
        }
    }

    fn bearer_header(token: &str) -> String {
        format!("Bearer {token}")
    }

    #[tokio::test]
    async fn healthz_always_ok() {
        let server = server();
        let response = server.get("/healthz").await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_ok_before_shutdown() {
        let server = server();
        let response = server.get("/readyz").await;
        assert_eq!(response.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn handshake_rejects_cookie_mismatch() {
        let server = server();
        let mut req = handshake_request("logger");
        req.magic_cookie_value = "wrong".to_string();
        let response = server.post(paths::HANDSHAKE).json(&req).await;
        assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn handshake_issues_runtime_identity() {
        let server = server();
        let response = server.post(paths::HANDSHAKE).json(&handshake_request("logger")).await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: HandshakeResponse = response.json();
        assert!(body.runtime_id.unwrap().starts_with("logger-"));
        assert!(body.runtime_token.is_some());
    }

    #[tokio::test]
    async fn register_then_discover_round_trips_over_http() {
        let server = server();
        let handshake = server
            .post(paths::HANDSHAKE)
            .json(&handshake_request("cache"))
            .await
            .json::<HandshakeResponse>();
        let runtime_id = handshake.runtime_id.unwrap();
        let token = handshake.runtime_token.unwrap();

        let register = server
            .post(paths::REGISTER_SERVICE)
            .add_header(HEADER_RUNTIME_ID, &runtime_id)
            .add_header("Authorization", bearer_header(&token))
            .json(&RegisterServiceRequest {
                service_type: "cache".to_string(),
                version: "1.0.0".to_string(),
                endpoint_path: "/rpc".to_string(),
                metadata: HashMap::new(),
            })
            .await;
        assert_eq!(register.status_code(), StatusCode::OK);
        let _: RegisterServiceResponse = register.json();

        let discover = server
            .get(&format!(
                "{}?service_type=cache&min_version=1.0.0",
                paths::DISCOVER_SERVICE
            ))
            .add_header(HEADER_RUNTIME_ID, &runtime_id)
            .add_header("Authorization", bearer_header(&token))
            .await;
        assert_eq!(discover.status_code(), StatusCode::OK);
    }

    #[tokio::test]
    async fn router_rejects_call_without_runtime_header() {
        let server = server();
        let response = server.post("/services/cache/cache-0001/get").await;
        assert_eq!(response.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn router_returns_unavailable_for_unhealthy_provider() {
        let server = server();
        let handshake = server
            .post(paths::HANDSHAKE)
            .json(&handshake_request("cache"))
            .await
            .json::<HandshakeResponse>();
        let runtime_id = handshake.runtime_id.unwrap();
        let token = handshake.runtime_token.unwrap();

        let registered = server
            .post(paths::REGISTER_SERVICE)
            .add_header(HEADER_RUNTIME_ID, &runtime_id)
            .add_header("Authorization", bearer_header(&token))
            .json(&RegisterServiceRequest {
                service_type: "cache".to_string(),
                version: "1.0.0".to_string(),
                endpoint_path: "/rpc".to_string(),
                metadata: HashMap::new(),
            })
            .await;
        assert_eq!(registered.status_code(), StatusCode::OK);

        let reported = server
            .post(paths::REPORT_HEALTH)
            .add_header(HEADER_RUNTIME_ID, &runtime_id)
            .add_header("Authorization", bearer_header(&token))
            .json(&ReportHealthRequest {
                state: HealthState::Unhealthy,
                reason: Some("dependency down".to_string()),
                unavailable_dependencies: vec![],
            })
            .await;
        assert_eq!(reported.status_code(), StatusCode::OK);

        let proxied = server
            .post(&format!("/services/cache/{runtime_id}/get"))
            .add_header(HEADER_RUNTIME_ID, &runtime_id)
            .add_header("Authorization", bearer_header(&token))
            .await;
        assert_eq!(proxied.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn capability_request_without_registered_handler_is_not_found() {
        let server = server();
        let handshake = server
            .post(paths::HANDSHAKE)
            .json(&handshake_request("plugin"))
            .await
            .json::<HandshakeResponse>();
        let runtime_id = handshake.runtime_id.unwrap();
        let token = handshake.runtime_token.unwrap();

        let response = server
            .post(paths::REQUEST_CAPABILITY)
            .add_header(HEADER_RUNTIME_ID, &runtime_id)
            .add_header("Authorization", bearer_header(&token))
            .json(&meshplane_sdk::protocol::RequestCapabilityRequest {
                capability_type: "logger".to_string(),
                min_version: "1.0.0".to_string(),
                reason: "needs to log".to_string(),
            })
            .await;
        assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn admin_plugins_lists_issued_identities() {
        let server = server();
        let handshake_response = server.post(paths::HANDSHAKE).json(&handshake_request("logger")).await;
        assert_eq!(handshake_response.status_code(), StatusCode::OK);

        let response = server.get("/admin/plugins").await;
        assert_eq!(response.status_code(), StatusCode::OK);
        let body: serde_json::Value = response.json();
        assert_eq!(body.as_array().unwrap().len(), 1);
    }
}
