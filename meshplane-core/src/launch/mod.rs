//! Launch strategies (component C11): a uniform abstraction over in-process and subprocess
//! plugin deployment.

pub mod in_memory;
pub mod process;

use async_trait::async_trait;
use std::time::Duration;

/// What starting a plugin must end up producing: a base URL the router can reach it at,
/// optionally an in-memory HTTP client for the in-process case, and a cleanup callback.
pub struct LaunchedPlugin {
    pub endpoint: String,
    pub in_memory_client: Option<meshplane_sdk::transport::MemoryHttpClient>,
}

#[derive(Debug, Clone)]
pub struct ProcessLaunchSpec {
    pub binary: String,
    pub args: Vec<String>,
    pub host_url: String,
    pub readiness_timeout: Duration,
    pub shutdown_grace: Duration,
}

#[async_trait]
pub trait LaunchStrategy: Send + Sync {
    async fn launch(&self) -> anyhow::Result<LaunchedPlugin>;
    async fn stop(&self) -> anyhow::Result<()>;
}
