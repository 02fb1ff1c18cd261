//! Capability broker (component C9): scoped, time-limited grants allowing plugins to call
//! host-provided capabilities.

use crate::error::CoreError;
use crate::validation::{validate_identifier, validate_version, version_at_least};
use dashmap::DashMap;
use rand::Rng;
use std::time::{Duration, SystemTime};
use subtle::ConstantTimeEq;

/// A host-implemented capability handler's advertised identity. The actual `http.Handler`
/// lives in the axum `Router` the host mounts at `/capabilities/{type}`; the broker only
/// tracks what exists and what has been granted.
#[derive(Debug, Clone)]
pub struct CapabilityDefinition {
    pub capability_type: String,
    pub version: String,
}

#[derive(Debug, Clone)]
pub struct CapabilityGrant {
    pub grant_id: String,
    pub capability_type: String,
    pub bearer_token: String,
    pub issued_at: SystemTime,
    pub expires_at: SystemTime,
}

pub struct CapabilityBroker {
    grant_ttl: Duration,
    definitions: DashMap<String, CapabilityDefinition>,
    grants: DashMap<String, CapabilityGrant>,
}

impl CapabilityBroker {
    pub fn new(grant_ttl: Duration) -> Self {
        Self {
            grant_ttl,
            definitions: DashMap::new(),
            grants: DashMap::new(),
        }
    }

    pub fn register_handler(&self, capability_type: &str, version: &str) {
        self.definitions.insert(
            capability_type.to_string(),
            CapabilityDefinition {
                capability_type: capability_type.to_string(),
                version: version.to_string(),
            },
        );
    }

    pub fn request_capability(
        &self,
        capability_type: &str,
        min_version: &str,
        reason: &str,
    ) -> Result<(CapabilityGrant, String), CoreError> {
        validate_identifier("capability_type", capability_type)?;
        validate_version(min_version)?;
        if reason.is_empty() {
            return Err(CoreError::InvalidArgument(
                "reason must not be empty".to_string(),
            ));
        }

        let definition = self
            .definitions
            .get(capability_type)
            .ok_or_else(|| CoreError::NotFound(format!("no capability of type {capability_type}")))?;
        if !version_at_least(&definition.version, min_version) {
            return Err(CoreError::NotFound(format!(
                "capability {capability_type} does not satisfy min_version {min_version}"
            )));
        }
        let version = definition.version.clone();
        drop(definition);

        let grant_id = uuid::Uuid::new_v4().to_string();
        let bearer_token = generate_grant_token()?;
        let issued_at = SystemTime::now();
        let expires_at = issued_at + self.grant_ttl;

        let grant = CapabilityGrant {
            grant_id: grant_id.clone(),
            capability_type: capability_type.to_string(),
            bearer_token: bearer_token.clone(),
            issued_at,
            expires_at,
        };
        self.grants.insert(grant_id, grant.clone());
        tracing::info!(capability_type = %capability_type, reason = %reason, "issued capability grant");
        Ok((grant, version))
    }

    /// Validates `(grant_id, token)` in constant time against the capability type addressed
    /// by the URL; refuses and purges expired grants lazily (spec §4.5).
    pub fn validate_grant(
        &self,
        capability_type: &str,
        grant_id: &str,
        bearer_token: &str,
    ) -> Result<(), CoreError> {
        let Some(grant) = self.grants.get(grant_id) else {
            return Err(CoreError::Unauthenticated("unknown grant".to_string()));
        };
        if grant.capability_type != capability_type {
            return Err(CoreError::Unauthenticated(
                "grant does not match capability type".to_string(),
            ));
        }
        if SystemTime::now() >= grant.expires_at {
            drop(grant);
            self.grants.remove(grant_id);
            return Err(CoreError::Unauthenticated("grant expired".to_string()));
        }
        let matches = bool::from(grant.bearer_token.as_bytes().ct_eq(bearer_token.as_bytes()));
        if !matches {
            return Err(CoreError::Unauthenticated("grant token mismatch".to_string()));
        }
        Ok(())
    }
}

fn generate_grant_token() -> Result<String, CoreError> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    let mut bytes = [0u8; 32];
    rand::thread_rng().try_fill(&mut bytes).map_err(|err| {
        CoreError::Internal(format!("failed to generate grant token: {err}"))
    })?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_then_validate_round_trips() {
        let broker = CapabilityBroker::new(Duration::from_millis(50));
        broker.register_handler("logger", "1.0.0");
        let (grant, version) = broker
            .request_capability("logger", "1.0.0", "plugin needs to log")
            .unwrap();
        assert_eq!(version, "1.0.0");
        assert!(broker
            .validate_grant("logger", &grant.grant_id, &grant.bearer_token)
            .is_ok());
    }

    #[test]
    fn wrong_token_is_rejected() {
        let broker = CapabilityBroker::new(Duration::from_secs(60));
        broker.register_handler("logger", "1.0.0");
        let (grant, _) = broker
            .request_capability("logger", "1.0.0", "reason")
            .unwrap();
        assert!(broker
            .validate_grant("logger", &grant.grant_id, "wrong-token")
            .is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn expired_grant_is_rejected_and_purged() {
        let broker = CapabilityBroker::new(Duration::from_millis(50));
        broker.register_handler("logger", "1.0.0");
        let (grant, _) = broker
            .request_capability("logger", "1.0.0", "reason")
            .unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(broker
            .validate_grant("logger", &grant.grant_id, &grant.bearer_token)
            .is_err());
        assert!(broker
            .validate_grant("logger", &grant.grant_id, &grant.bearer_token)
            .is_err());
    }

    #[test]
    fn unknown_capability_type_is_not_found() {
        let broker = CapabilityBroker::new(Duration::from_secs(60));
        let err = broker
            .request_capability("missing", "1.0.0", "reason")
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
