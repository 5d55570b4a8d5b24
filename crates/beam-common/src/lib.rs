//! Common types and utilities shared across the beam signaling protocol.
//!
//! This crate provides:
//! - JSON signaling envelopes and validation ([`envelope`])
//! - Peer-code minting ([`code`])
//! - Protocol type definitions and constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod code;
pub mod envelope;
pub mod types;

pub use envelope::{
    BusEnvelope, ClientEnvelope, EnvelopeError, Inbound, ServerMessage, Signal, SignalKind,
};
pub use types::PeerCode;
