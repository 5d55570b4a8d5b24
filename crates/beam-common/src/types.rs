//! Core type definitions and protocol constants for beam.

/// An opaque, relay-minted identifier for one connected endpoint.
///
/// Codes are bearer identifiers used only for routing; clients must not
/// infer structure from them.
pub type PeerCode = String;

/// Maximum size of a whole inbound WebSocket message in bytes (256 KiB).
/// A message of exactly this size is accepted; one byte more is rejected
/// at the frame layer.
pub const MAX_MESSAGE_BYTES: usize = 256 * 1024;

/// Maximum serialized size of a session-description payload in bytes.
pub const MAX_SDP_BYTES: usize = 200_000;

/// Maximum serialized size of a candidate payload in bytes.
pub const MAX_CANDIDATE_BYTES: usize = 50_000;

/// WebSocket close codes emitted by the relay.
pub mod close_code {
    /// Normal closure, used with reason `"idle"` when the idle window lapses.
    pub const NORMAL: u16 = 1000;
    /// Sent to every connection during shutdown.
    pub const GOING_AWAY: u16 = 1001;
    /// Policy violation, used with reason `"rate"` on a token-bucket breach.
    pub const POLICY: u16 = 1008;
}

/// Close reasons paired with the codes in [`close_code`].
pub mod close_reason {
    /// No valid signaling message arrived within the idle window.
    pub const IDLE: &str = "idle";
    /// The connection exceeded its message rate limit.
    pub const RATE: &str = "rate";
    /// The relay is shutting down.
    pub const GOING_AWAY: &str = "going-away";
}
