//! Cross-instance fan-out over Redis.
//!
//! Each instance records its locally hosted codes in a shared hash
//! (`{prefix}peers`) and publishes signals for non-local destinations to a
//! shared channel (`{prefix}signals`). Receiving instances are dumb
//! delivery endpoints: pairing was already gated on the origin side, so a
//! received signal is handed straight to the local registry. Delivery is
//! at-most-once and best-effort.

use crate::error::BeamdError;
use crate::metrics::counters;
use crate::registry::{Outbound, PeerRegistry};
use beam_common::{BusEnvelope, ServerMessage, Signal};
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Delay before the subscriber retries after losing its connection.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Handle to the cross-instance bus.
pub struct Bus {
    conn: MultiplexedConnection,
    peers_key: String,
    signals_channel: String,
    node_id: String,
    subscriber: JoinHandle<()>,
}

impl Bus {
    /// Connects to Redis, verifies the connection, and starts the
    /// subscriber task delivering remote signals into `registry`.
    ///
    /// # Errors
    ///
    /// Returns the underlying Redis error when the URL is malformed or
    /// the server is unreachable.
    pub async fn connect(
        url: &str,
        prefix: &str,
        node_id: &str,
        registry: PeerRegistry,
    ) -> Result<Self, BeamdError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let channel = format!("{prefix}signals");
        let subscriber = tokio::spawn(subscribe_loop(
            client,
            channel,
            node_id.to_string(),
            registry,
        ));

        Ok(Self {
            conn,
            peers_key: format!("{prefix}peers"),
            signals_channel: format!("{prefix}signals"),
            node_id: node_id.to_string(),
            subscriber,
        })
    }

    /// Records a locally hosted code in the shared directory.
    ///
    /// # Errors
    ///
    /// Returns the Redis error on failure; the caller logs and counts it.
    pub async fn register(&self, code: &str) -> Result<(), BeamdError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(&self.peers_key, code, &self.node_id)
            .await?;
        Ok(())
    }

    /// Removes a code from the shared directory.
    ///
    /// # Errors
    ///
    /// Returns the Redis error on failure; the caller logs and counts it.
    pub async fn unregister(&self, code: &str) -> Result<(), BeamdError> {
        let mut conn = self.conn.clone();
        conn.hdel::<_, _, ()>(&self.peers_key, code).await?;
        Ok(())
    }

    /// Publishes a signal whose destination is not local. Returns whether
    /// the signal was actually published: an unknown destination, or a
    /// stale directory entry naming this instance, drops instead.
    ///
    /// # Errors
    ///
    /// Returns the Redis or encoding error on failure.
    pub async fn route_remote(&self, from: &str, signal: &Signal) -> Result<bool, BeamdError> {
        let mut conn = self.conn.clone();
        let owner: Option<String> = conn.hget(&self.peers_key, &signal.to).await?;
        match owner {
            None => Ok(false),
            Some(instance) if instance == self.node_id => Ok(false),
            Some(_) => {
                let envelope = BusEnvelope::new(
                    signal.to.clone(),
                    from.to_string(),
                    signal.payload.clone(),
                    &self.node_id,
                );
                conn.publish::<_, _, ()>(&self.signals_channel, envelope.to_json()?)
                    .await?;
                Ok(true)
            }
        }
    }

    /// Stops the subscriber task. Outstanding publishes are
    /// fire-and-forget.
    pub fn shutdown(&self) {
        self.subscriber.abort();
    }
}

/// Subscriber task: deliver remote signals to local peers, reconnecting
/// with a delay when the pub/sub connection drops.
async fn subscribe_loop(
    client: redis::Client,
    channel: String,
    node_id: String,
    registry: PeerRegistry,
) {
    loop {
        match client.get_async_pubsub().await {
            Ok(mut pubsub) => {
                if let Err(e) = pubsub.subscribe(&channel).await {
                    counters::errors_total();
                    tracing::warn!(event = "bus-subscribe-failed", error = %e);
                } else {
                    tracing::info!(event = "bus-subscribed", channel = %channel);
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        match msg.get_payload::<String>() {
                            Ok(raw) => dispatch(&raw, &node_id, &registry),
                            Err(e) => {
                                counters::errors_total();
                                tracing::debug!(event = "bus-bad-payload", error = %e);
                            }
                        }
                    }
                    tracing::warn!(event = "bus-stream-ended", channel = %channel);
                }
            }
            Err(e) => {
                counters::errors_total();
                tracing::warn!(event = "bus-connect-failed", error = %e);
            }
        }
        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
    }
}

/// Hand one received envelope to the local registry. Signals originated
/// here, or addressed to peers hosted elsewhere, are skipped.
fn dispatch(raw: &str, node_id: &str, registry: &PeerRegistry) {
    let envelope = match BusEnvelope::from_json(raw) {
        Ok(env) => env,
        Err(e) => {
            counters::errors_total();
            tracing::debug!(event = "bus-bad-envelope", error = %e);
            return;
        }
    };

    if envelope.origin == node_id {
        return;
    }

    let Some(dest) = registry.lookup(&envelope.to) else {
        return;
    };

    let relayed = ServerMessage::Signal {
        from: envelope.from.clone(),
        payload: envelope.payload,
    };
    match dest.tx.try_send(Outbound::Deliver(relayed)) {
        Ok(()) => {
            tracing::debug!(
                event = "bus-delivered",
                peer = %envelope.to,
                counterpart = %envelope.from
            );
        }
        Err(e) => {
            counters::errors_total();
            tracing::warn!(event = "bus-deliver-failed", peer = %envelope.to, error = %e);
        }
    }
}
