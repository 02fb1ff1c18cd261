//! In-memory launch strategy: serves a plugin's axum handler over a pipe instead of a TCP
//! port, for tests and single-process deployments (spec §4.7, §4.9).
//!
//! `meshplane_sdk::transport::MemoryListener` has no `axum` dependency (mirroring the
//! teacher's sdk/gateway split), so it cannot implement the foreign `axum::serve::Listener`
//! trait directly — orphan rules require either the trait or the type to be local. This
//! module's `HostMemoryListener` is that local wrapper.

use crate::launch::{LaunchStrategy, LaunchedPlugin};
use async_trait::async_trait;
use meshplane_sdk::transport::{memory_http_client, memory_transport, MemoryListener};
use std::net::SocketAddr;
use tokio::io::DuplexStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct HostMemoryListener(pub MemoryListener);

impl axum::serve::Listener for HostMemoryListener {
    type Io = DuplexStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        self.0.accept().await
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        self.0.local_addr()
    }
}

pub struct InMemoryLaunchStrategy {
    router: axum::Router,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl InMemoryLaunchStrategy {
    pub fn new(router: axum::Router) -> Self {
        Self {
            router,
            serve_task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl LaunchStrategy for InMemoryLaunchStrategy {
    async fn launch(&self) -> anyhow::Result<LaunchedPlugin> {
        let (listener, dialer) = memory_transport();
        let router = self.router.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = axum::serve(HostMemoryListener(listener), router).await {
                tracing::error!(%err, "in-memory plugin server exited with error");
            }
        });
        *self.serve_task.lock().await = Some(task);

        Ok(LaunchedPlugin {
            endpoint: "http://in-memory".to_string(),
            in_memory_client: Some(memory_http_client(dialer)),
        })
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(task) = self.serve_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }
}
