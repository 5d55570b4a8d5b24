use crate::error::BeamdError;
use beam_common::{PeerCode, ServerMessage};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU8, AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Per-connection outbound queue depth. Saturation drops the newest
/// message rather than blocking the sender.
pub const OUTBOUND_QUEUE: usize = 256;

/// Consecutive missed heartbeat acknowledgements that terminate a
/// connection.
const MAX_MISSED_PINGS: u8 = 2;

/// Instructions delivered to a connection supervisor from other tasks.
#[derive(Debug)]
pub enum Outbound {
    /// Write a message to the client.
    Deliver(ServerMessage),
    /// Write a WebSocket ping frame.
    Ping,
    /// Send a close frame with the given code and reason, then stop.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: &'static str,
    },
    /// Stop without close negotiation (heartbeat eviction).
    Terminate,
}

/// Handle held in the registry, used to reach a connection from other
/// tasks.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    /// Channel sender delivering instructions to the connection's task.
    pub tx: mpsc::Sender<Outbound>,
    /// Peer code assigned to this connection.
    pub code: PeerCode,
    /// Instant the connection was welcomed.
    pub connected_at: Instant,
    alive: Arc<AtomicBool>,
    missed: Arc<AtomicU8>,
}

impl ConnHandle {
    /// Creates a handle in the alive state.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Outbound>, code: PeerCode) -> Self {
        Self {
            tx,
            code,
            connected_at: Instant::now(),
            alive: Arc::new(AtomicBool::new(true)),
            missed: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Marks the connection alive. Called by the supervisor on pong
    /// receipt.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        self.missed.store(0, Ordering::Relaxed);
    }

    /// One heartbeat-sweep step: clears the alive flag and reports
    /// whether the connection has now missed enough consecutive
    /// acknowledgements to be terminated.
    pub fn sweep(&self) -> bool {
        if self.alive.swap(false, Ordering::Relaxed) {
            self.missed.store(0, Ordering::Relaxed);
            false
        } else {
            self.missed.fetch_add(1, Ordering::Relaxed) + 1 >= MAX_MISSED_PINGS
        }
    }
}

/// Concurrent peer-code → connection routing table.
///
/// A connection appears here iff it is open and has been welcomed.
/// Cheap to clone; clones share the underlying table.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<DashMap<PeerCode, ConnHandle>>,
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a connection handle.
    ///
    /// # Errors
    ///
    /// Returns [`BeamdError::DuplicateCode`] if the code is already
    /// present. Codes are unique per process run, so this indicates a
    /// minting bug rather than a routine condition.
    pub fn insert(&self, code: PeerCode, handle: ConnHandle) -> Result<(), BeamdError> {
        match self.inner.entry(code) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                Err(BeamdError::DuplicateCode(entry.key().clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    /// Looks up a connection handle by peer code.
    #[must_use]
    pub fn lookup(&self, code: &str) -> Option<ConnHandle> {
        self.inner.get(code).map(|entry| entry.value().clone())
    }

    /// Returns `true` if the code is registered.
    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.inner.contains_key(code)
    }

    /// Removes a connection. Idempotent.
    pub fn remove(&self, code: &str) {
        self.inner.remove(code);
    }

    /// Number of registered connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of all handles, cloned out so no shard lock is held while
    /// the caller writes to connection queues.
    #[must_use]
    pub fn handles(&self) -> Vec<ConnHandle> {
        self.inner.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_handle(code: &str) -> (ConnHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(1);
        (ConnHandle::new(tx, code.to_string()), rx)
    }

    #[test]
    fn insert_and_lookup_returns_handle() {
        let registry = PeerRegistry::new();
        let (handle, _rx) = make_handle("abc");

        registry.insert("abc".to_string(), handle).unwrap();

        let found = registry.lookup("abc").expect("handle should be present");
        assert_eq!(found.code, "abc");
    }

    #[test]
    fn lookup_missing_code_returns_none() {
        let registry = PeerRegistry::new();
        assert!(registry.lookup("nope").is_none());
    }

    #[test]
    fn insert_duplicate_code_fails() {
        let registry = PeerRegistry::new();
        let (h1, _rx1) = make_handle("abc");
        let (h2, _rx2) = make_handle("abc");

        registry.insert("abc".to_string(), h1).unwrap();
        let err = registry.insert("abc".to_string(), h2).unwrap_err();
        assert!(matches!(err, BeamdError::DuplicateCode(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = PeerRegistry::new();
        let (handle, _rx) = make_handle("abc");
        registry.insert("abc".to_string(), handle).unwrap();

        registry.remove("abc");
        registry.remove("abc");
        assert!(registry.is_empty());
    }

    #[test]
    fn clones_share_the_table() {
        let registry = PeerRegistry::new();
        let clone = registry.clone();
        let (handle, _rx) = make_handle("abc");
        registry.insert("abc".to_string(), handle).unwrap();

        assert!(clone.contains("abc"));
        assert_eq!(clone.len(), 1);
    }

    #[test]
    fn handles_snapshots_every_connection() {
        let registry = PeerRegistry::new();
        let (h1, _rx1) = make_handle("a");
        let (h2, _rx2) = make_handle("b");
        registry.insert("a".to_string(), h1).unwrap();
        registry.insert("b".to_string(), h2).unwrap();

        let mut codes: Vec<_> = registry.handles().into_iter().map(|h| h.code).collect();
        codes.sort();
        assert_eq!(codes, vec!["a", "b"]);
    }

    #[test]
    fn sweep_terminates_after_two_misses() {
        let (handle, _rx) = make_handle("abc");

        // Alive at first sweep: cleared, not terminated.
        assert!(!handle.sweep());
        // Second sweep without an ack: one miss.
        assert!(!handle.sweep());
        // Third sweep without an ack: second consecutive miss.
        assert!(handle.sweep());
    }

    #[test]
    fn pong_resets_the_miss_count() {
        let (handle, _rx) = make_handle("abc");
        assert!(!handle.sweep());
        assert!(!handle.sweep());
        handle.mark_alive();
        assert!(!handle.sweep());
        assert!(!handle.sweep());
        assert!(handle.sweep());
    }
}
