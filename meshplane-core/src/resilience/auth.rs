//! Authentication interceptor (part of component C10): a uniform `AuthProvider` abstraction
//! with client-side credential attachment and server-side validation, composable in order.

use crate::error::CoreError;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub identity: String,
    pub claims: HashMap<String, String>,
    pub provider: String,
}

pub trait AuthProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Server-side validation: inspects the incoming request's headers and returns an
    /// `AuthContext` if this provider recognizes valid credentials.
    fn authenticate(&self, headers: &HeaderMap) -> Option<AuthContext>;

    /// Client-side credential attachment for outgoing requests built on this provider's
    /// behalf (used by the plugin client shim and host-initiated calls).
    fn attach_credentials(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder;
}

/// Token auth: a configurable header (default `Authorization`) with a configurable prefix
/// (default `Bearer `).
pub struct TokenAuthProvider {
    header: String,
    prefix: String,
    expected_token: String,
}

impl TokenAuthProvider {
    pub fn new(expected_token: impl Into<String>) -> Self {
        Self {
            header: "authorization".to_string(),
            prefix: "Bearer ".to_string(),
            expected_token: expected_token.into(),
        }
    }

    pub fn with_header(mut self, header: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.header = header.into().to_lowercase();
        self.prefix = prefix.into();
        self
    }
}

impl AuthProvider for TokenAuthProvider {
    fn name(&self) -> &str {
        "token"
    }

    fn authenticate(&self, headers: &HeaderMap) -> Option<AuthContext> {
        let value = headers.get(&self.header)?.to_str().ok()?;
        let token = value.strip_prefix(&self.prefix)?;
        if token == self.expected_token {
            Some(AuthContext {
                identity: "token-holder".to_string(),
                claims: HashMap::new(),
                provider: self.name().to_string(),
            })
        } else {
            None
        }
    }

    fn attach_credentials(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header(&self.header, format!("{}{}", self.prefix, self.expected_token))
    }
}

/// API-key auth: a configurable header (default `X-API-Key`), no prefix.
pub struct ApiKeyAuthProvider {
    header: String,
    expected_key: String,
}

impl ApiKeyAuthProvider {
    pub fn new(expected_key: impl Into<String>) -> Self {
        Self {
            header: "x-api-key".to_string(),
            expected_key: expected_key.into(),
        }
    }
}

impl AuthProvider for ApiKeyAuthProvider {
    fn name(&self) -> &str {
        "api_key"
    }

    fn authenticate(&self, headers: &HeaderMap) -> Option<AuthContext> {
        let value = headers.get(&self.header)?.to_str().ok()?;
        if value == self.expected_key {
            Some(AuthContext {
                identity: "api-key-holder".to_string(),
                claims: HashMap::new(),
                provider: self.name().to_string(),
            })
        } else {
            None
        }
    }

    fn attach_credentials(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.header(&self.header, &self.expected_key)
    }
}

/// Tries each provider in order on the client side; the first provider wraps the request,
/// the next wraps the already-modified request (inner wraps outer).
pub struct ComposeAuthClient {
    providers: Vec<Arc<dyn AuthProvider>>,
}

impl ComposeAuthClient {
    pub fn new(providers: Vec<Arc<dyn AuthProvider>>) -> Self {
        Self { providers }
    }

    pub fn attach_credentials(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for provider in &self.providers {
            builder = provider.attach_credentials(builder);
        }
        builder
    }
}

/// Tries each provider sequentially on the server side; the first to populate an
/// `AuthContext` wins. All failing is `Unauthenticated`.
pub struct ComposeAuthServer {
    providers: Vec<Arc<dyn AuthProvider>>,
}

impl ComposeAuthServer {
    pub fn new(providers: Vec<Arc<dyn AuthProvider>>) -> Self {
        Self { providers }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthContext, CoreError> {
        for provider in &self.providers {
            if let Some(context) = provider.authenticate(headers) {
                return Ok(context);
            }
        }
        Err(CoreError::Unauthenticated(
            "no configured auth provider accepted the request".to_string(),
        ))
    }
}

/// Rejects unauthenticated calls (spec §4.8 `RequireAuth`).
pub fn require_auth(context: Option<AuthContext>) -> Result<AuthContext, CoreError> {
    context.ok_or_else(|| CoreError::Unauthenticated("authentication required".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn token_provider_accepts_matching_bearer() {
        let provider = TokenAuthProvider::new("secret");
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer secret"));
        assert!(provider.authenticate(&headers).is_some());
    }

    #[test]
    fn compose_server_tries_providers_in_order() {
        let compose = ComposeAuthServer::new(vec![
            Arc::new(TokenAuthProvider::new("secret")),
            Arc::new(ApiKeyAuthProvider::new("key-123")),
        ]);
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("key-123"));
        let ctx = compose.authenticate(&headers).unwrap();
        assert_eq!(ctx.provider, "api_key");
    }

    #[test]
    fn compose_server_fails_when_nothing_matches() {
        let compose = ComposeAuthServer::new(vec![Arc::new(TokenAuthProvider::new("secret"))]);
        assert!(compose.authenticate(&HeaderMap::new()).is_err());
    }

    #[test]
    fn require_auth_rejects_none() {
        assert!(require_auth(None).is_err());
    }
}
