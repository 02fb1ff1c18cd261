//! Endpoint TLS classification and one-shot warning emission (spec §6, §9).
//!
//! The host never terminates or requires TLS itself; it only flags base URLs that look
//! unencrypted so an operator notices before traffic flows over them.

use dashmap::DashMap;

/// `https` and `unix` (a local domain socket, never traverses a network) are secure, as is
/// an endpoint with no scheme at all (an in-memory/local transport). Anything else --
/// notably plain `http` -- is not.
pub fn is_secure_endpoint(base_url: &str) -> bool {
    match base_url.split_once("://") {
        Some((scheme, _)) => matches!(scheme, "https" | "unix"),
        None => true,
    }
}

/// Warns at most once per distinct base URL, so a provider that re-registers on every
/// heartbeat doesn't spam the log.
#[derive(Default)]
pub struct TlsWarner {
    warned: DashMap<String, ()>,
}

impl TlsWarner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn_if_insecure(&self, runtime_id: &str, base_url: &str) {
        if is_secure_endpoint(base_url) || crate::config::Config::tls_warning_disabled() {
            return;
        }
        if self.warned.insert(base_url.to_string(), ()).is_none() {
            tracing::warn!(
                %runtime_id,
                endpoint = %base_url,
                "plugin endpoint is not using a secure transport (https/unix); set \
                 CONNECTPLUGIN_DISABLE_TLS_WARNING=1 to silence this warning"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_schemes() {
        assert!(is_secure_endpoint("https://plugin.local:9000"));
        assert!(is_secure_endpoint("unix:///tmp/plugin.sock"));
        assert!(is_secure_endpoint("in-memory"));
        assert!(!is_secure_endpoint("http://plugin.local:9000"));
    }

    #[test]
    fn warns_once_per_endpoint() {
        let warner = TlsWarner::new();
        assert!(warner.warned.is_empty());
        warner.warn_if_insecure("r-1", "http://plugin.local:9000");
        assert_eq!(warner.warned.len(), 1);
        warner.warn_if_insecure("r-1", "http://plugin.local:9000");
        assert_eq!(warner.warned.len(), 1);
        warner.warn_if_insecure("r-2", "http://other.local:9001");
        assert_eq!(warner.warned.len(), 2);
    }
}
