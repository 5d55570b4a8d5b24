use crate::bus::Bus;
use crate::config::ServerConfig;
use crate::error::BeamdError;
use crate::http;
use crate::pairing::PairingTable;
use crate::ratelimit::SlidingWindow;
use crate::registry::{Outbound, PeerRegistry};
use beam_common::types::{close_code, close_reason};
use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::{Future, IntoFuture};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Bounded wait for supervisors to finish after shutdown closes them.
const DRAIN_WINDOW: Duration = Duration::from_secs(5);

/// Shared state for the relay server.
pub struct ServerState {
    /// Frozen runtime configuration.
    pub config: ServerConfig,
    /// Peer code → live connection handles.
    pub registry: PeerRegistry,
    /// Pairing state machine.
    pub pairing: PairingTable,
    /// Per-IP connection counter for enforcing connection limits.
    pub ip_connections: DashMap<IpAddr, usize>,
    /// Cross-instance bus, when configured.
    pub bus: Option<Bus>,
    /// Prometheus render handle, when metrics are enabled.
    pub prometheus: Option<PrometheusHandle>,
    /// Sliding-window limiter for static assets.
    pub static_limiter: SlidingWindow,
    /// Sliding-window limiter for /config.
    pub config_limiter: SlidingWindow,
}

impl ServerState {
    /// Builds state with a fresh registry and pairing table. The bus and
    /// Prometheus handle start unset; the caller wires them before
    /// serving.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let window = Duration::from_secs(config.http_window);
        Self {
            registry: PeerRegistry::new(),
            pairing: PairingTable::new(),
            ip_connections: DashMap::new(),
            bus: None,
            prometheus: None,
            static_limiter: SlidingWindow::new(window, config.static_max),
            config_limiter: SlidingWindow::new(window, config.config_max),
            config,
        }
    }
}

/// Serves until `shutdown` resolves, then drains.
///
/// Shutdown order: stop the heartbeat, stop accepting, close every
/// supervisor with a going-away code, wait out the bounded drain window,
/// close the bus.
///
/// # Errors
///
/// Returns an error if binding or serving fails.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    shutdown: impl Future<Output = ()> + Send,
) -> Result<(), BeamdError> {
    let local_addr = listener.local_addr().map_err(BeamdError::Io)?;
    info!("server listening on {}", local_addr);

    let heartbeat = tokio::spawn(heartbeat_loop(Arc::clone(&state)));

    let app = http::router(Arc::clone(&state));
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        })
        .into_future(),
    );

    shutdown.await;
    info!("shutdown signal received");

    heartbeat.abort();
    let _ = stop_tx.send(());

    for handle in state.registry.handles() {
        let _ = handle.tx.try_send(Outbound::Close {
            code: close_code::GOING_AWAY,
            reason: close_reason::GOING_AWAY,
        });
    }

    let drained = tokio::time::timeout(DRAIN_WINDOW, async {
        while !state.registry.is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = state.registry.len(),
            "drain window elapsed with connections still open"
        );
    }

    if let Some(bus) = &state.bus {
        bus.shutdown();
    }

    match tokio::time::timeout(Duration::from_secs(1), server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => return Err(BeamdError::Io(e)),
        Ok(Err(join_err)) => warn!("server task failed: {}", join_err),
        Err(_) => debug!("server task still busy at exit"),
    }

    info!("shutdown complete");
    Ok(())
}

/// Serves until interrupted. Convenience wrapper used by tests.
///
/// # Errors
///
/// Returns an error if serving fails.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), BeamdError> {
    run_with_shutdown(listener, state, std::future::pending()).await
}

/// Heartbeat scheduler: periodically sweep every live connection, evict
/// those with two consecutive missed acknowledgements, ping the rest.
/// Also prunes idle entries from the HTTP limiters.
async fn heartbeat_loop(state: Arc<ServerState>) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(state.config.ping_interval));
    interval.tick().await;
    loop {
        interval.tick().await;
        for handle in state.registry.handles() {
            if handle.sweep() {
                debug!(event = "heartbeat-evict", peer = %handle.code);
                let _ = handle.tx.try_send(Outbound::Terminate);
            } else {
                let _ = handle.tx.try_send(Outbound::Ping);
            }
        }
        state.static_limiter.prune();
        state.config_limiter.prune();
    }
}
