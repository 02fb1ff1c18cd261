//! Plugin-side connection shim (component C13).
//!
//! Handles the handshake, holds the issued runtime identity, transparently re-handshakes
//! if the host rejects a call as unauthenticated (e.g. after a host restart, since no state
//! survives one — spec §6 "Persisted state: none"), and reports health on an interval.

use crate::error::PluginClientError;
use crate::protocol::{
    paths, DiscoverServiceResponse, HandshakeRequest, HandshakeResponse, HealthState,
    RegisterServiceRequest, RegisterServiceResponse, ReportHealthRequest,
    RequestCapabilityRequest, RequestCapabilityResponse, HEADER_RUNTIME_ID,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Parameters a plugin supplies at construction time; stable for the plugin process's
/// lifetime even across re-handshakes.
#[derive(Debug, Clone)]
pub struct PluginClientConfig {
    pub host_url: String,
    pub self_id: String,
    pub self_version: String,
    pub core_protocol_version: u32,
    pub app_protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
    pub requested_plugins: Vec<String>,
    pub client_metadata: HashMap<String, String>,
}

impl PluginClientConfig {
    pub fn new(host_url: impl Into<String>, self_id: impl Into<String>) -> Self {
        Self {
            host_url: host_url.into(),
            self_id: self_id.into(),
            self_version: "1.0.0".to_string(),
            core_protocol_version: 1,
            app_protocol_version: 1,
            magic_cookie_key: "MESHPLANE_MAGIC_COOKIE".to_string(),
            magic_cookie_value: "meshplane-v1".to_string(),
            requested_plugins: Vec::new(),
            client_metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Identity {
    runtime_id: String,
    runtime_token: String,
}

/// A plugin's live connection to the host. Cheap to clone (shares an `Arc`-backed inner).
#[derive(Clone)]
pub struct PluginClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: PluginClientConfig,
    http: reqwest::Client,
    identity: RwLock<Option<Identity>>,
}

impl PluginClient {
    pub fn new(config: PluginClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                http: reqwest::Client::new(),
                identity: RwLock::new(None),
            }),
        }
    }

    pub async fn runtime_id(&self) -> Option<String> {
        self.inner
            .identity
            .read()
            .await
            .as_ref()
            .map(|i| i.runtime_id.clone())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.inner.config.host_url.trim_end_matches('/'), path)
    }

    /// Performs the handshake and, on success, stores the issued runtime identity.
    pub async fn handshake(&self) -> Result<HandshakeResponse, PluginClientError> {
        let cfg = &self.inner.config;
        let req = HandshakeRequest {
            core_protocol_version: cfg.core_protocol_version,
            app_protocol_version: cfg.app_protocol_version,
            magic_cookie_key: cfg.magic_cookie_key.clone(),
            magic_cookie_value: cfg.magic_cookie_value.clone(),
            requested_plugins: cfg.requested_plugins.clone(),
            self_id: Some(cfg.self_id.clone()),
            self_version: Some(cfg.self_version.clone()),
            client_metadata: cfg.client_metadata.clone(),
        };

        let resp = self
            .inner
            .http
            .post(self.url(paths::HANDSHAKE))
            .json(&req)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PluginClientError::HandshakeRejected {
                message: format!("status {status}: {body}"),
            });
        }

        let handshake: HandshakeResponse = resp.json().await?;
        if let (Some(runtime_id), Some(runtime_token)) =
            (handshake.runtime_id.clone(), handshake.runtime_token.clone())
        {
            let mut identity = self.inner.identity.write().await;
            *identity = Some(Identity {
                runtime_id,
                runtime_token,
            });
        }
        Ok(handshake)
    }

    async fn authed_runtime_id_header(&self) -> Result<(String, String), PluginClientError> {
        let identity = self.inner.identity.read().await;
        match identity.as_ref() {
            Some(id) => Ok((id.runtime_id.clone(), id.runtime_token.clone())),
            None => Err(PluginClientError::NotRegistered),
        }
    }

    /// Runs `call` with the current identity; if the host answers 401 (token expired or the
    /// host restarted and lost all state), re-handshakes once and retries.
    async fn with_reauth<T, F, Fut>(&self, mut call: F) -> Result<T, PluginClientError>
    where
        F: FnMut(String, String) -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
        T: serde::de::DeserializeOwned,
    {
        let (runtime_id, token) = self.authed_runtime_id_header().await?;
        let resp = call(runtime_id, token).await?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            tracing::warn!("host rejected runtime credentials; re-handshaking");
            self.handshake().await?;
            let (runtime_id, token) = self.authed_runtime_id_header().await?;
            let resp = call(runtime_id, token).await?;
            return Self::into_json(resp).await;
        }

        Self::into_json(resp).await
    }

    async fn into_json<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, PluginClientError> {
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PluginClientError::UnexpectedStatus { status, body });
        }
        Ok(resp.json().await?)
    }

    pub async fn register_service(
        &self,
        service_type: impl Into<String>,
        version: impl Into<String>,
        endpoint_path: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Result<RegisterServiceResponse, PluginClientError> {
        let service_type = service_type.into();
        let version = version.into();
        let endpoint_path = endpoint_path.into();

        self.with_reauth(|runtime_id, token| {
            let body = RegisterServiceRequest {
                service_type: service_type.clone(),
                version: version.clone(),
                endpoint_path: endpoint_path.clone(),
                metadata: metadata.clone(),
            };
            let http = self.inner.http.clone();
            let url = self.url(paths::REGISTER_SERVICE);
            async move {
                http.post(url)
                    .header(HEADER_RUNTIME_ID, runtime_id)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
                    .await
            }
        })
        .await
    }

    pub async fn report_health(
        &self,
        state: HealthState,
        reason: Option<String>,
        unavailable_dependencies: Vec<String>,
    ) -> Result<(), PluginClientError> {
        let body = ReportHealthRequest {
            state,
            reason,
            unavailable_dependencies,
        };
        let resp: serde_json::Value = self
            .with_reauth(|runtime_id, token| {
                let http = self.inner.http.clone();
                let url = self.url(paths::REPORT_HEALTH);
                let body = body.clone();
                async move {
                    http.post(url)
                        .header(HEADER_RUNTIME_ID, runtime_id)
                        .bearer_auth(token)
                        .json(&body)
                        .send()
                        .await
                }
            })
            .await?;
        let _ = resp;
        Ok(())
    }

    pub async fn discover_service(
        &self,
        service_type: impl Into<String>,
        min_version: impl Into<String>,
    ) -> Result<DiscoverServiceResponse, PluginClientError> {
        let service_type = service_type.into();
        let min_version = min_version.into();
        self.with_reauth(|runtime_id, token| {
            let http = self.inner.http.clone();
            let url = format!(
                "{}?service_type={}&min_version={}",
                self.url(paths::DISCOVER_SERVICE),
                urlencode(&service_type),
                urlencode(&min_version),
            );
            async move {
                http.get(url)
                    .header(HEADER_RUNTIME_ID, runtime_id)
                    .bearer_auth(token)
                    .send()
                    .await
            }
        })
        .await
    }

    pub async fn request_capability(
        &self,
        capability_type: impl Into<String>,
        min_version: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<RequestCapabilityResponse, PluginClientError> {
        let body = RequestCapabilityRequest {
            capability_type: capability_type.into(),
            min_version: min_version.into(),
            reason: reason.into(),
        };
        self.with_reauth(|runtime_id, token| {
            let http = self.inner.http.clone();
            let url = self.url(paths::REQUEST_CAPABILITY);
            let body = body.clone();
            async move {
                http.post(url)
                    .header(HEADER_RUNTIME_ID, runtime_id)
                    .bearer_auth(token)
                    .json(&body)
                    .send()
                    .await
            }
        })
        .await
    }

    /// Spawns a background task that reports `state` on a fixed interval until the handle is
    /// dropped. Returns the handle so the caller controls its lifetime.
    pub fn spawn_health_reporter(
        &self,
        interval: Duration,
        state: HealthState,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = client.report_health(state, None, Vec::new()).await {
                    tracing::warn!(%err, "health report failed");
                }
            }
        })
    }
}

fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~') {
                c.to_string()
            } else {
                format!("%{:02X}", c as u32)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_host_and_path_without_double_slash() {
        let config = PluginClientConfig::new("http://localhost:4000/", "logger");
        let client = PluginClient::new(config);
        assert_eq!(client.url("/rpc/handshake"), "http://localhost:4000/rpc/handshake");
    }

    #[test]
    fn urlencode_escapes_reserved_characters() {
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("v1.0.0"), "v1.0.0");
    }
}
