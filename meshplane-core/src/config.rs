//! Host configuration: TOML file, environment overrides, schema validation.
//!
//! Grounded on the teacher's `config.rs` — `Config::load` reads a TOML file via the `toml`
//! crate (not the `config` crate, which the teacher lists in `Cargo.toml` but never actually
//! calls), then applies environment overrides, then validates.

use meshplane_sdk::common::duration_serde;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub handshake: HandshakeConfig,
    pub registry: RegistryConfig,
    pub capabilities: CapabilitiesConfig,
    pub router: RouterConfig,
    pub resilience: ResilienceConfig,
    pub launch: LaunchConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    pub max_body_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
    pub core_protocol_version: u32,
    pub app_protocol_version: u32,
    #[serde(with = "duration_serde")]
    pub token_ttl: Duration,
}

/// Default selection strategy applied to a `service_type` with no explicit override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    First,
    RoundRobin,
    Random,
    Weighted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub default_strategy: SelectionStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    #[serde(with = "duration_serde")]
    pub grant_ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(with = "duration_serde")]
    pub downstream_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_serde")]
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    pub burst: u32,
    #[serde(with = "duration_serde")]
    pub idle_eviction: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(with = "duration_serde")]
    pub process_readiness_timeout: Duration,
    #[serde(with = "duration_serde")]
    pub process_shutdown_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 7700,
                timeout: Duration::from_secs(30),
                max_body_size: 10 * 1024 * 1024,
            },
            handshake: HandshakeConfig {
                magic_cookie_key: "MESHPLANE_MAGIC_COOKIE".to_string(),
                magic_cookie_value: "meshplane-v1".to_string(),
                core_protocol_version: 1,
                app_protocol_version: 1,
                token_ttl: Duration::from_secs(24 * 3600),
            },
            registry: RegistryConfig {
                default_strategy: SelectionStrategy::First,
            },
            capabilities: CapabilitiesConfig {
                grant_ttl: Duration::from_secs(3600),
            },
            router: RouterConfig {
                downstream_timeout: Duration::from_secs(30),
            },
            resilience: ResilienceConfig {
                retry: RetryConfig {
                    max_attempts: 3,
                    initial_backoff: Duration::from_millis(100),
                    max_backoff: Duration::from_secs(10),
                    multiplier: 2.0,
                    jitter: true,
                },
                breaker: BreakerConfig {
                    failure_threshold: 5,
                    success_threshold: 2,
                    timeout: Duration::from_secs(10),
                },
                rate_limit: RateLimitConfig {
                    requests_per_second: 10.0,
                    burst: 5,
                    idle_eviction: Duration::from_secs(5 * 60),
                },
            },
            launch: LaunchConfig {
                process_readiness_timeout: Duration::from_secs(10),
                process_shutdown_grace: Duration::from_secs(5),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("MESHPLANE_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port_str) = env::var("MESHPLANE_PORT") {
            let port: u16 = port_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid MESHPLANE_PORT: {port_str}"))?;
            if port > 0 {
                self.server.port = port;
            }
        }
        if let Ok(level) = env::var("MESHPLANE_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("server.host cannot be empty"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be between 1 and 65535"));
        }
        if self.server.max_body_size == 0 {
            return Err(anyhow::anyhow!("server.max_body_size cannot be 0"));
        }
        if self.handshake.core_protocol_version == 0 {
            return Err(anyhow::anyhow!(
                "handshake.core_protocol_version must be nonzero"
            ));
        }
        if self.handshake.token_ttl.is_zero() {
            return Err(anyhow::anyhow!("handshake.token_ttl cannot be 0"));
        }
        if self.capabilities.grant_ttl.is_zero() {
            return Err(anyhow::anyhow!("capabilities.grant_ttl cannot be 0"));
        }
        if self.router.downstream_timeout.is_zero() {
            return Err(anyhow::anyhow!("router.downstream_timeout cannot be 0"));
        }
        if self.resilience.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("resilience.retry.max_attempts cannot be 0"));
        }
        if self.resilience.retry.multiplier <= 1.0 {
            return Err(anyhow::anyhow!(
                "resilience.retry.multiplier must be greater than 1.0"
            ));
        }
        if self.resilience.breaker.failure_threshold == 0 {
            return Err(anyhow::anyhow!(
                "resilience.breaker.failure_threshold cannot be 0"
            ));
        }
        if self.resilience.rate_limit.requests_per_second <= 0.0 {
            return Err(anyhow::anyhow!(
                "resilience.rate_limit.requests_per_second must be positive"
            ));
        }
        Ok(())
    }

    /// Returns `true` if `CONNECTPLUGIN_DISABLE_TLS_WARNING` is set to a truthy value
    /// (`1`, `true`, `yes`, case-insensitive).
    pub fn tls_warning_disabled() -> bool {
        match env::var("CONNECTPLUGIN_DISABLE_TLS_WARNING") {
            Ok(value) => matches!(value.to_lowercase().as_str(), "1" | "true" | "yes"),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_rejected() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_retry_multiplier_is_rejected() {
        let mut config = Config::default();
        config.resilience.retry.multiplier = 1.0;
        assert!(config.validate().is_err());
    }
}
