//! Binary entry point for the meshplane host: parses CLI flags, loads configuration, builds
//! the server, and serves until a shutdown signal arrives. Grounded on the teacher's
//! `main.rs` (`clap::Parser` args, `tracing_subscriber::fmt().with_env_filter(...)`).

use clap::Parser;
use meshplane_core::config::Config;
use meshplane_core::server::create_server;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;

#[derive(Parser)]
#[command(author, version, about = "Host-side coordination plane for a remote-first plugin platform", long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Port the host listens on. Overrides `server.port` from the config file.
    #[arg(short, long)]
    port: Option<u16>,

    /// Host address to bind to. Overrides `server.host` from the config file.
    #[arg(long)]
    host: Option<String>,

    /// Logging level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt().with_env_filter(&args.log_level).init();

    let mut config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(%err, path = %args.config, "failed to load config file, using defaults");
            let mut config = Config::default();
            config.apply_env_overrides()?;
            config
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    config.validate()?;

    if !Config::tls_warning_disabled() {
        tracing::warn!(
            "control-plane traffic is not encrypted at this layer; terminate TLS upstream or set \
             CONNECTPLUGIN_DISABLE_TLS_WARNING=1 to silence this warning"
        );
    }

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let (app, ready) = create_server(config)?;
    tracing::info!(%addr, "starting meshplane host");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(ready))
    .await?;

    Ok(())
}

async fn shutdown_signal(ready: std::sync::Arc<std::sync::atomic::AtomicBool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    ready.store(false, Ordering::Relaxed);
    tracing::info!("shutdown signal received, draining in-flight requests");
}
