use crate::http::client_ip;
use crate::metrics::{counters, gauges, histograms};
use crate::pairing::Verdict;
use crate::ratelimit::TokenBucket;
use crate::registry::{ConnHandle, Outbound, OUTBOUND_QUEUE};
use crate::server::ServerState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use beam_common::types::{close_code, close_reason, MAX_MESSAGE_BYTES};
use beam_common::{ClientEnvelope, Inbound, ServerMessage, Signal, SignalKind};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

type WsSink = SplitSink<WebSocket, Message>;
type WsRecv = SplitStream<WebSocket>;

/// Half-open guard: the welcome write must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct IpGuard {
    state: Arc<ServerState>,
    ip: IpAddr,
}

impl Drop for IpGuard {
    fn drop(&mut self) {
        let mut remove = false;
        if let Some(mut entry) = self.state.ip_connections.get_mut(&self.ip) {
            *entry = entry.saturating_sub(1);
            if *entry == 0 {
                remove = true;
            }
        }
        if remove {
            self.state
                .ip_connections
                .remove_if(&self.ip, |_, v| *v == 0);
        }
    }
}

/// Why a supervisor stopped. Logged as the connection outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseCause {
    Client,
    Idle,
    Rate,
    Heartbeat,
    Shutdown,
    WriteFailed,
}

impl CloseCause {
    fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client-close",
            Self::Idle => "idle",
            Self::Rate => "rate",
            Self::Heartbeat => "heartbeat",
            Self::Shutdown => "going-away",
            Self::WriteFailed => "write-failed",
        }
    }
}

/// Validates the Origin header against the configured policy.
///
/// With an allowlist, exact match is required. Without one, the Origin
/// host must equal the request Host, scheme-agnostic. Requests without an
/// Origin header are non-browser clients and pass.
fn origin_allowed(headers: &HeaderMap, state: &ServerState) -> bool {
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };

    if !state.config.allowed_origins.is_empty() {
        let origin = origin.trim_end_matches('/');
        return state
            .config
            .allowed_origins
            .iter()
            .any(|allowed| allowed == origin);
    }

    let Some(host) = headers.get(header::HOST).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    match (host_of(origin), host_only(host)) {
        (Some(origin_host), host) => origin_host.eq_ignore_ascii_case(host),
        _ => false,
    }
}

/// Extracts the host from an origin value, dropping scheme and port.
fn host_of(origin: &str) -> Option<&str> {
    let rest = origin.split_once("://").map_or(origin, |(_, rest)| rest);
    let rest = rest.split('/').next()?;
    Some(host_only(rest))
}

/// Strips a `:port` suffix, leaving bracketed IPv6 literals intact.
fn host_only(host: &str) -> &str {
    if let Some(end) = host.find(']') {
        return &host[..=end];
    }
    host.split(':').next().unwrap_or(host)
}

/// Accepts a WebSocket upgrade at the signaling path.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&headers, &state) {
        tracing::debug!(event = "upgrade-rejected", reason = "origin", ip = %peer_addr.ip());
        return StatusCode::FORBIDDEN.into_response();
    }

    if state.registry.len() >= state.config.max_conns {
        tracing::warn!(event = "upgrade-rejected", reason = "capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let ip = client_ip(&headers, peer_addr);

    // Atomic check-and-increment via the entry API so the quota check and
    // the increment cannot race.
    let mut over_quota = false;
    match state.ip_connections.entry(ip) {
        dashmap::mapref::entry::Entry::Occupied(mut entry) => {
            if *entry.get() >= state.config.max_conns_ip {
                over_quota = true;
            } else {
                *entry.get_mut() += 1;
            }
        }
        dashmap::mapref::entry::Entry::Vacant(entry) => {
            entry.insert(1);
        }
    }
    if over_quota {
        tracing::debug!(event = "upgrade-rejected", reason = "ip-quota", ip = %ip);
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let guard = IpGuard {
        state: Arc::clone(&state),
        ip,
    };

    ws.max_message_size(MAX_MESSAGE_BYTES)
        .max_frame_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, ip, guard, state))
}

async fn handle_socket(socket: WebSocket, ip: IpAddr, guard: IpGuard, state: Arc<ServerState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let mut code = beam_common::code::mint();
    while state.registry.contains(&code) {
        code = beam_common::code::mint();
    }

    let welcome = ServerMessage::Welcome { id: code.clone() };
    match timeout(HANDSHAKE_TIMEOUT, send_json(&mut ws_tx, &welcome)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) | Err(_) => {
            tracing::debug!(event = "welcome-failed", peer = %code, ip = %ip);
            return;
        }
    }

    let (deliver_tx, deliver_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let handle = ConnHandle::new(deliver_tx, code.clone());

    if let Err(e) = state.registry.insert(code.clone(), handle.clone()) {
        tracing::error!(event = "register-failed", peer = %code, error = %e);
        send_close(&mut ws_tx, close_code::GOING_AWAY, close_reason::GOING_AWAY).await;
        return;
    }
    gauges::inc_ws_clients();

    if let Some(bus) = &state.bus {
        if let Err(e) = bus.register(&code).await {
            counters::errors_total();
            tracing::warn!(event = "bus-register-failed", peer = %code, error = %e);
        }
    }

    tracing::info!(event = "connected", peer = %code, ip = %ip);

    let cause = run_loop(&mut ws_tx, &mut ws_rx, deliver_rx, &handle, &code, &state).await;

    state.registry.remove(&code);
    gauges::dec_ws_clients();
    state.pairing.close(&code);
    gauges::set_ws_pairs(state.pairing.mutual_pairs());
    if let Some(bus) = &state.bus {
        if let Err(e) = bus.unregister(&code).await {
            counters::errors_total();
            tracing::warn!(event = "bus-unregister-failed", peer = %code, error = %e);
        }
    }

    tracing::info!(event = "disconnected", peer = %code, outcome = cause.as_str());
    drop(guard);
}

/// Drive the supervisor's select loop until the connection ends.
async fn run_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    mut deliver_rx: mpsc::Receiver<Outbound>,
    handle: &ConnHandle,
    code: &str,
    state: &ServerState,
) -> CloseCause {
    let mut bucket = TokenBucket::new(state.config.msg_burst, state.config.msg_rate);
    let idle = tokio::time::sleep(Duration::from_secs(state.config.idle_timeout));
    tokio::pin!(idle);
    let mut idle_armed = true;

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let start = Instant::now();
                        let flow = handle_frame(
                            &text,
                            ws_tx,
                            &mut bucket,
                            &mut idle_armed,
                            code,
                            state,
                        )
                        .await;
                        histograms::relay_latency_seconds(start.elapsed().as_secs_f64());
                        match flow {
                            Flow::Continue => {}
                            Flow::Rate => return CloseCause::Rate,
                            Flow::WriteFailed => return CloseCause::WriteFailed,
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        // The protocol is JSON text frames only.
                        counters::errors_total();
                        tracing::debug!(event = "bad-frame", peer = %code, outcome = "binary");
                    }
                    Some(Ok(Message::Pong(_))) => handle.mark_alive(),
                    // Pings are answered by the socket layer.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        return CloseCause::Client;
                    }
                }
            }
            out = deliver_rx.recv() => {
                match out {
                    Some(Outbound::Deliver(msg)) => {
                        if send_json(ws_tx, &msg).await.is_err() {
                            tracing::debug!(event = "write-failed", peer = %code);
                            return CloseCause::WriteFailed;
                        }
                    }
                    Some(Outbound::Ping) => {
                        if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                            tracing::debug!(event = "ping-failed", peer = %code, error = %e);
                        }
                    }
                    Some(Outbound::Close { code: close, reason }) => {
                        send_close(ws_tx, close, reason).await;
                        return CloseCause::Shutdown;
                    }
                    Some(Outbound::Terminate) | None => return CloseCause::Heartbeat,
                }
            }
            () = &mut idle, if idle_armed => {
                send_close(ws_tx, close_code::NORMAL, close_reason::IDLE).await;
                return CloseCause::Idle;
            }
        }
    }
}

enum Flow {
    Continue,
    Rate,
    WriteFailed,
}

/// Handle one inbound text frame: decode, rate-limit, validate, gate,
/// forward.
async fn handle_frame(
    text: &str,
    ws_tx: &mut WsSink,
    bucket: &mut TokenBucket,
    idle_armed: &mut bool,
    code: &str,
    state: &ServerState,
) -> Flow {
    // Malformed frames are ignored before costing a token: hostile input
    // must not amplify by forcing a reconnect.
    let envelope = match ClientEnvelope::from_json(text) {
        Ok(env) => env,
        Err(_) => {
            counters::errors_total();
            tracing::debug!(event = "bad-frame", peer = %code, outcome = "malformed");
            return Flow::Continue;
        }
    };

    if !bucket.try_consume() {
        counters::errors_total();
        tracing::debug!(event = "rate-breach", peer = %code);
        send_close(ws_tx, close_code::POLICY, close_reason::RATE).await;
        return Flow::Rate;
    }

    let signal = match envelope.classify() {
        Ok(Inbound::List) => {
            let reply = ServerMessage::Peers { peers: Vec::new() };
            if send_json(ws_tx, &reply).await.is_err() {
                return Flow::WriteFailed;
            }
            return Flow::Continue;
        }
        Ok(Inbound::Signal(signal)) => signal,
        Err(e) => {
            counters::errors_total();
            tracing::debug!(event = "bad-frame", peer = %code, outcome = %e);
            return Flow::Continue;
        }
    };

    let verdict = state.pairing.decide(code, &signal.to, signal.kind);
    gauges::set_ws_pairs(state.pairing.mutual_pairs());

    match verdict {
        Verdict::Forward => forward(code, &signal, state).await,
        Verdict::Busy => {
            tracing::debug!(
                event = "signal",
                peer = %code,
                counterpart = %signal.to,
                kind = %signal.kind,
                outcome = "busy"
            );
            let refusal = ServerMessage::busy(signal.to.clone());
            if send_json(ws_tx, &refusal).await.is_err() {
                return Flow::WriteFailed;
            }
        }
        Verdict::Drop => {
            tracing::debug!(
                event = "signal",
                peer = %code,
                counterpart = %signal.to,
                kind = %signal.kind,
                outcome = "dropped"
            );
        }
    }

    // The idle timer is one-shot: the first valid signaling message
    // disarms it for the life of the connection.
    if matches!(
        signal.kind,
        SignalKind::Offer | SignalKind::Answer | SignalKind::Candidate
    ) {
        *idle_armed = false;
    }

    Flow::Continue
}

/// Deliver a gated signal to its destination, locally or over the bus.
async fn forward(from: &str, signal: &Signal, state: &ServerState) {
    if let Some(dest) = state.registry.lookup(&signal.to) {
        let relayed = ServerMessage::Signal {
            from: from.to_string(),
            payload: signal.payload.clone(),
        };
        match dest.tx.try_send(Outbound::Deliver(relayed)) {
            Ok(()) => {
                counters::signals_total(signal.kind.as_str());
                tracing::debug!(
                    event = "signal",
                    peer = %from,
                    counterpart = %signal.to,
                    kind = %signal.kind,
                    outcome = "forwarded"
                );
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                // Never block the sender on a slow destination.
                counters::errors_total();
                tracing::warn!(
                    event = "signal",
                    peer = %from,
                    counterpart = %signal.to,
                    kind = %signal.kind,
                    outcome = "queue-full"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                state.registry.remove(&signal.to);
                tracing::debug!(
                    event = "signal",
                    peer = %from,
                    counterpart = %signal.to,
                    kind = %signal.kind,
                    outcome = "destination-closed"
                );
            }
        }
        return;
    }

    let Some(bus) = &state.bus else {
        // Destination misses are not errors: the peer may simply be gone.
        tracing::debug!(
            event = "signal",
            peer = %from,
            counterpart = %signal.to,
            kind = %signal.kind,
            outcome = "no-destination"
        );
        return;
    };

    match bus.route_remote(from, signal).await {
        Ok(true) => {
            counters::signals_total(signal.kind.as_str());
            tracing::debug!(
                event = "signal",
                peer = %from,
                counterpart = %signal.to,
                kind = %signal.kind,
                outcome = "published"
            );
        }
        Ok(false) => {
            tracing::debug!(
                event = "signal",
                peer = %from,
                counterpart = %signal.to,
                kind = %signal.kind,
                outcome = "no-destination"
            );
        }
        Err(e) => {
            counters::errors_total();
            tracing::warn!(
                event = "signal",
                peer = %from,
                counterpart = %signal.to,
                kind = %signal.kind,
                outcome = "bus-error",
                error = %e
            );
        }
    }
}

async fn send_json(ws_tx: &mut WsSink, msg: &ServerMessage) -> Result<(), axum::Error> {
    let text = msg.to_json().map_err(axum::Error::new)?;
    ws_tx.send(Message::Text(text)).await
}

async fn send_close(ws_tx: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
        tracing::debug!(event = "close-failed", error = %e);
    }
}
