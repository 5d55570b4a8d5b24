use beam_common::{PeerCode, SignalKind};
use std::collections::HashMap;
use std::sync::Mutex;

/// What the relay should do with a gated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Deliver to the destination.
    Forward,
    /// Refuse the offer; synthesize `busy` back to the sender.
    Busy,
    /// Discard silently.
    Drop,
}

/// Pairing status of one peer. Absence from the table means Free.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PeerState {
    /// Sent an offer toward the named peer; awaiting an answer.
    Dialing(PeerCode),
    /// Mutually paired with the named peer.
    Paired(PeerCode),
}

/// The pairing table: per-peer state plus the global invariants that
/// pairings are mutual and exclusive.
///
/// Entries are independent, keyed by code; breaking one side never walks
/// the other's structure. The table may reference codes hosted on another
/// instance; decisions only consult the two entries involved.
#[derive(Debug, Default)]
pub struct PairingTable {
    inner: Mutex<HashMap<PeerCode, PeerState>>,
}

impl PairingTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gates one inbound signal from `from` toward `to`.
    ///
    /// Implements the transition table: offers establish a Dialing state
    /// when both ends are unengaged (or already dialing each other),
    /// answers promote to Paired, candidates flow only within an
    /// established or in-progress pair (or the brief both-Free race
    /// window at session start), byes reset, and inbound `busy` is never
    /// accepted from clients.
    pub fn decide(&self, from: &str, to: &str, kind: SignalKind) -> Verdict {
        if from == to {
            // A peer can never pair with itself.
            return if kind == SignalKind::Offer {
                Verdict::Busy
            } else {
                Verdict::Drop
            };
        }

        let mut table = self.inner.lock().expect("pairing table poisoned");
        match kind {
            SignalKind::Offer => {
                let sender_free = match table.get(from) {
                    None => true,
                    Some(PeerState::Dialing(x)) => x.as_str() == to,
                    Some(PeerState::Paired(_)) => false,
                };
                let target_free = match table.get(to) {
                    None => true,
                    Some(PeerState::Dialing(x)) => x.as_str() == from,
                    Some(PeerState::Paired(_)) => false,
                };
                if sender_free && target_free {
                    table.insert(from.to_string(), PeerState::Dialing(to.to_string()));
                    Verdict::Forward
                } else {
                    Verdict::Busy
                }
            }
            SignalKind::Answer => {
                let sender_ok = match table.get(from) {
                    None => true,
                    Some(PeerState::Dialing(x) | PeerState::Paired(x)) => x.as_str() == to,
                };
                let target_engaged_with_sender = matches!(
                    table.get(to),
                    Some(PeerState::Dialing(x) | PeerState::Paired(x)) if x.as_str() == from
                );
                if sender_ok && target_engaged_with_sender {
                    table.insert(from.to_string(), PeerState::Paired(to.to_string()));
                    table.insert(to.to_string(), PeerState::Paired(from.to_string()));
                    Verdict::Forward
                } else {
                    Verdict::Drop
                }
            }
            SignalKind::Candidate => {
                let mutual = matches!(
                    table.get(from),
                    Some(PeerState::Paired(x)) if x.as_str() == to
                ) && matches!(
                    table.get(to),
                    Some(PeerState::Paired(x)) if x.as_str() == from
                );
                let sender_dialing = matches!(
                    table.get(from),
                    Some(PeerState::Dialing(x)) if x.as_str() == to
                );
                let target_dialing = matches!(
                    table.get(to),
                    Some(PeerState::Dialing(x)) if x.as_str() == from
                );
                // Both-Free candidates cover the race window at session
                // start, before either offer has been observed.
                let both_free = !table.contains_key(from) && !table.contains_key(to);
                if mutual || sender_dialing || target_dialing || both_free {
                    Verdict::Forward
                } else {
                    Verdict::Drop
                }
            }
            SignalKind::Bye => {
                if matches!(
                    table.get(from),
                    Some(PeerState::Dialing(x) | PeerState::Paired(x)) if x.as_str() == to
                ) {
                    table.remove(from);
                }
                if matches!(table.get(to), Some(PeerState::Paired(x)) if x.as_str() == from) {
                    table.remove(to);
                }
                Verdict::Forward
            }
            SignalKind::Busy => Verdict::Drop,
        }
    }

    /// Clears the closing peer's entry and, when its counterpart still
    /// points back, the counterpart's entry too.
    pub fn close(&self, code: &str) {
        let mut table = self.inner.lock().expect("pairing table poisoned");
        if let Some(PeerState::Dialing(other) | PeerState::Paired(other)) = table.remove(code) {
            if matches!(
                table.get(&other),
                Some(PeerState::Dialing(x) | PeerState::Paired(x)) if x.as_str() == code
            ) {
                table.remove(&other);
            }
        }
    }

    /// Counts mutual pairings by scanning the table for unordered pairs
    /// that point at each other.
    #[must_use]
    pub fn mutual_pairs(&self) -> usize {
        let table = self.inner.lock().expect("pairing table poisoned");
        table
            .iter()
            .filter(|(code, state)| match state {
                PeerState::Paired(other) => {
                    *code < other
                        && matches!(
                            table.get(other),
                            Some(PeerState::Paired(x)) if x == *code
                        )
                }
                PeerState::Dialing(_) => false,
            })
            .count()
    }

    #[cfg(test)]
    fn counterpart(&self, code: &str) -> Option<PeerCode> {
        let table = self.inner.lock().unwrap();
        match table.get(code) {
            Some(PeerState::Dialing(x) | PeerState::Paired(x)) => Some(x.clone()),
            None => None,
        }
    }

    #[cfg(test)]
    fn is_free(&self, code: &str) -> bool {
        !self.inner.lock().unwrap().contains_key(code)
    }
}
