//! Process launch strategy: spawns a plugin binary, waits for TCP + HTTP readiness, and
//! tears it down gracefully (Control `Shutdown` RPC, then a hard kill after the grace
//! period) on cleanup.

use crate::launch::{LaunchStrategy, LaunchedPlugin, ProcessLaunchSpec};
use async_trait::async_trait;
use meshplane_sdk::protocol::{paths, ShutdownRequest};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

pub struct ProcessLaunchStrategy {
    spec: ProcessLaunchSpec,
    port: u16,
    child: Mutex<Option<Child>>,
}

impl ProcessLaunchStrategy {
    pub fn new(spec: ProcessLaunchSpec, port: u16) -> Self {
        Self {
            spec,
            port,
            child: Mutex::new(None),
        }
    }

    fn endpoint(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    async fn wait_for_readiness(&self, http: &reqwest::Client) -> anyhow::Result<()> {
        let deadline = Instant::now() + self.spec.readiness_timeout;
        loop {
            if Instant::now() >= deadline {
                anyhow::bail!(
                    "plugin {} did not become ready within {:?}",
                    self.spec.binary,
                    self.spec.readiness_timeout
                );
            }
            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                let probe = http.get(format!("{}/healthz", self.endpoint())).send().await;
                if matches!(probe, Ok(resp) if resp.status().is_success()) {
                    return Ok(());
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}

#[async_trait]
impl LaunchStrategy for ProcessLaunchStrategy {
    async fn launch(&self) -> anyhow::Result<LaunchedPlugin> {
        let mut command = Command::new(&self.spec.binary);
        command
            .args(&self.spec.args)
            .env("PORT", self.port.to_string())
            .env("HOST_URL", &self.spec.host_url)
            .kill_on_drop(true);
        let child = command.spawn()?;
        *self.child.lock().await = Some(child);

        let http = reqwest::Client::new();
        self.wait_for_readiness(&http).await?;

        tracing::info!(binary = %self.spec.binary, port = self.port, "plugin process ready");
        Ok(LaunchedPlugin {
            endpoint: self.endpoint(),
            in_memory_client: None,
        })
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        let http = reqwest::Client::new();
        let shutdown = http
            .post(format!("{}{}", self.endpoint(), paths::PLUGIN_SHUTDOWN))
            .json(&ShutdownRequest {
                grace_seconds: self.spec.shutdown_grace.as_secs(),
                reason: "platform requested removal".to_string(),
            })
            .send()
            .await;
        if let Err(err) = shutdown {
            tracing::warn!(%err, "graceful shutdown request failed, will hard-kill after grace");
        }

        let graceful = tokio::time::timeout(self.spec.shutdown_grace, child.wait()).await;
        if graceful.is_err() {
            tracing::warn!(binary = %self.spec.binary, "plugin did not exit within grace period, killing");
            child.kill().await?;
        }
        Ok(())
    }
}
