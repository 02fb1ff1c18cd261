//! Bounded string/map/version/path validators (component C2).
//!
//! Shared by the handshake server, registry, and capability broker so the boundary
//! rejects malformed input the same way everywhere (spec §8 boundary behaviors).

use crate::error::CoreError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

const MAX_IDENTIFIER_LEN: usize = 128;
const MAX_METADATA_ENTRIES: usize = 100;
const MAX_METADATA_KEY_LEN: usize = 256;
const MAX_METADATA_VALUE_LEN: usize = 4096;

static IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_.\-]*$").unwrap());

static VERSION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+\.\d+\.\d+(-[A-Za-z0-9.\-]+)?$").unwrap());

/// Validates `self_id`/`service_type`: non-empty, `<= 128` chars, `^[A-Za-z][A-Za-z0-9_.\-]*$`.
pub fn validate_identifier(field: &str, value: &str) -> Result<(), CoreError> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::InvalidArgument(format!(
            "{field} must be 1-{MAX_IDENTIFIER_LEN} characters, got {}",
            value.len()
        )));
    }
    if !IDENTIFIER_PATTERN.is_match(value) {
        return Err(CoreError::InvalidArgument(format!(
            "{field} must match ^[A-Za-z][A-Za-z0-9_.-]*$, got {value:?}"
        )));
    }
    Ok(())
}

/// Validates a version string of the form `N.N.N[-tag]`.
pub fn validate_version(value: &str) -> Result<(), CoreError> {
    if !VERSION_PATTERN.is_match(value) {
        return Err(CoreError::InvalidArgument(format!(
            "version must match N.N.N[-tag], got {value:?}"
        )));
    }
    Ok(())
}

/// Validates an `endpoint_path`: must start with `/` and must not contain `..` segments.
pub fn validate_endpoint_path(value: &str) -> Result<(), CoreError> {
    if !value.starts_with('/') {
        return Err(CoreError::InvalidArgument(format!(
            "endpoint_path must start with '/', got {value:?}"
        )));
    }
    if value.split('/').any(|segment| segment == "..") {
        return Err(CoreError::InvalidArgument(format!(
            "endpoint_path must not contain '..' segments, got {value:?}"
        )));
    }
    Ok(())
}

/// Validates a metadata map: `<= 100` entries, keys `<= 256` bytes, values `<= 4096` bytes,
/// no NUL bytes in either.
pub fn validate_metadata(metadata: &HashMap<String, String>) -> Result<(), CoreError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(CoreError::InvalidArgument(format!(
            "metadata must have at most {MAX_METADATA_ENTRIES} entries, got {}",
            metadata.len()
        )));
    }
    for (key, value) in metadata {
        if key.len() > MAX_METADATA_KEY_LEN {
            return Err(CoreError::InvalidArgument(format!(
                "metadata key must be at most {MAX_METADATA_KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        if value.len() > MAX_METADATA_VALUE_LEN {
            return Err(CoreError::InvalidArgument(format!(
                "metadata value must be at most {MAX_METADATA_VALUE_LEN} bytes, got {}",
                value.len()
            )));
        }
        if key.contains('\0') || value.contains('\0') {
            return Err(CoreError::InvalidArgument(
                "metadata must not contain NUL bytes".to_string(),
            ));
        }
    }
    Ok(())
}

/// Lexicographic version comparison (spec §9: a full semver comparator is explicitly out of
/// scope; this is the accepted compromise, correct only within single-digit ranges).
pub fn version_at_least(candidate: &str, min_version: &str) -> bool {
    candidate >= min_version
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_accepts_valid_and_rejects_invalid() {
        assert!(validate_identifier("self_id", "logger").is_ok());
        assert!(validate_identifier("self_id", "Logger-v2.Prod").is_ok());
        assert!(validate_identifier("self_id", "").is_err());
        assert!(validate_identifier("self_id", "1logger").is_err());
        assert!(validate_identifier("self_id", "logger/evil").is_err());
        assert!(validate_identifier("self_id", &"a".repeat(129)).is_err());
    }

    #[test]
    fn version_accepts_semver_and_rejects_prefixed() {
        assert!(validate_version("1.0.0").is_ok());
        assert!(validate_version("1.0.0-beta.1").is_ok());
        assert!(validate_version("v1.0.0").is_err());
        assert!(validate_version("1.0").is_err());
    }

    #[test]
    fn endpoint_path_requires_leading_slash_and_rejects_dotdot() {
        assert!(validate_endpoint_path("/rpc/log").is_ok());
        assert!(validate_endpoint_path("rpc/log").is_err());
        assert!(validate_endpoint_path("/rpc/../secret").is_err());
    }

    #[test]
    fn metadata_enforces_size_limits() {
        let mut metadata = HashMap::new();
        metadata.insert("key".to_string(), "value".to_string());
        assert!(validate_metadata(&metadata).is_ok());

        let mut too_many = HashMap::new();
        for i in 0..101 {
            too_many.insert(format!("k{i}"), "v".to_string());
        }
        assert!(validate_metadata(&too_many).is_err());

        let mut nul_value = HashMap::new();
        nul_value.insert("k".to_string(), "v\0".to_string());
        assert!(validate_metadata(&nul_value).is_err());
    }

    #[test]
    fn lexicographic_comparison_matches_spec_example() {
        assert!(!version_at_least("1.0.0", "3.0.0"));
        assert!(!version_at_least("2.0.0", "3.0.0"));
        assert!(version_at_least("3.0.0", "3.0.0"));
    }
}
