//! v6pool - Entry Point
//!
//! Prepares the host, then runs the proxy until Ctrl+C or SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use v6pool::config::{Cli, Config, LogConfig};
use v6pool::proxy::{AddressSelector, EgressProxy, ProxyServer};
use v6pool::setup::HostSetup;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli).context("Invalid configuration")?;

    init_tracing(&config.log);
    info!("Starting v6pool");

    let prefix = AddressSelector::from_cidr(&config.proxy.cidr)?.prefix();
    if config.setup.any_enabled() {
        info!("Preparing host to source traffic from {}", prefix);
    }
    HostSetup::from_config(&config.setup, &prefix)
        .apply()
        .await
        .context("Host setup failed")?;

    let hooks = EgressProxy::from_config(&config.proxy)?;
    if hooks.auth_enabled() {
        info!("Proxy authentication enabled");
    }

    let server = ProxyServer::new(config.proxy.clone(), Arc::new(hooks))?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut proxy_task = tokio::spawn(async move { server.run(shutdown_rx).await });

    info!(
        "Proxy started on {}, egress prefix {}",
        config.proxy_addr(),
        prefix
    );

    tokio::select! {
        result = &mut proxy_task => {
            result
                .context("Proxy server task failed")?
                .context("Proxy server error")?;
        }
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(true);
            proxy_task
                .await
                .context("Proxy server task failed")?
                .context("Proxy server error")?;
        }
    }

    info!("v6pool stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("v6pool={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if log.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
