#![forbid(unsafe_code)]

use anyhow::Result;
use beamd::bus::Bus;
use beamd::config::{Args, ServerConfig};
use beamd::{metrics, run_with_shutdown, ServerState};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ServerConfig::from_args(args)
        .map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let mut state = ServerState::new(config.clone());

    if config.metrics_enabled {
        state.prometheus = Some(metrics::install_recorder()?);
    }

    if let Some(url) = &config.redis_url {
        let bus = Bus::connect(
            url,
            &config.redis_prefix,
            &config.node_id,
            state.registry.clone(),
        )
        .await?;
        info!(node_id = %config.node_id, "cross-instance bus connected");
        state.bus = Some(bus);
    }

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    run_with_shutdown(listener, Arc::new(state), shutdown_signal()).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install sigterm handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
