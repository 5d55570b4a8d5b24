//! JSON signaling envelopes: parsing, validation, and serialization.
//!
//! Every message on the wire is a JSON text frame. Inbound frames carry a
//! destination code and an opaque payload whose only interpreted field is
//! its discriminating `type`; outbound frames are tagged by a top-level
//! `type`. Payload internals are never inspected beyond measuring their
//! serialized size.

use crate::types::{PeerCode, MAX_CANDIDATE_BYTES, MAX_SDP_BYTES};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The payload discriminator of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Session-description offer.
    Offer,
    /// Session-description answer.
    Answer,
    /// Connectivity candidate.
    Candidate,
    /// Session teardown.
    Bye,
    /// Pairing refusal. Synthesized by the relay; never accepted inbound.
    Busy,
}

impl SignalKind {
    /// Wire spelling of the kind, also used as a metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Bye => "bye",
            Self::Busy => "busy",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "offer" => Some(Self::Offer),
            "answer" => Some(Self::Answer),
            "candidate" => Some(Self::Candidate),
            "bye" => Some(Self::Bye),
            "busy" => Some(Self::Busy),
            _ => None,
        }
    }

    /// Whether this kind carries a session description and is bounded by
    /// the SDP size limit.
    #[must_use]
    pub fn is_description(self) -> bool {
        matches!(self, Self::Offer | Self::Answer)
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced while validating a decoded client envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The `to` field is missing or not a string.
    #[error("missing or invalid destination")]
    MissingDestination,
    /// The `payload` field is missing or not an object.
    #[error("missing or invalid payload")]
    MissingPayload,
    /// The payload `type` is absent or not one of the recognized kinds.
    #[error("unrecognized payload type")]
    UnknownKind,
    /// The envelope `type` is present but not `"list"`.
    #[error("unrecognized envelope type: {0}")]
    UnknownRequest(String),
    /// The serialized payload exceeds the limit for its kind.
    #[error("{kind} payload too large: max {max}, got {actual}")]
    PayloadTooLarge {
        /// Kind whose limit was exceeded.
        kind: SignalKind,
        /// Maximum allowed serialized size.
        max: usize,
        /// Actual serialized size.
        actual: usize,
    },
    /// Payload re-serialization failed.
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A decoded but not yet validated inbound client frame.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    /// Destination peer code.
    pub to: Option<Value>,
    /// Optional request discriminator; only `"list"` is recognized.
    #[serde(rename = "type")]
    pub request: Option<String>,
    /// Opaque signaling payload.
    pub payload: Option<Value>,
}

/// A validated signaling message ready for the pairing gate.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Destination peer code.
    pub to: PeerCode,
    /// Payload discriminator.
    pub kind: SignalKind,
    /// Opaque payload, passed through unchanged.
    pub payload: Value,
}

/// The two admissible shapes of an inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A `list` request. Always answered with an empty peer list.
    List,
    /// A signaling message addressed to another peer.
    Signal(Signal),
}

impl ClientEnvelope {
    /// Decodes a raw text frame. A decode failure means the frame was not
    /// JSON at all; validation failures are reported by [`Self::classify`].
    ///
    /// # Errors
    ///
    /// Returns the underlying `serde_json` error for malformed JSON.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Validates the envelope into an [`Inbound`].
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] when the destination is not a string,
    /// the payload is not an object with a recognized `type`, or the
    /// payload exceeds the size limit for its kind.
    pub fn classify(self) -> Result<Inbound, EnvelopeError> {
        if let Some(request) = self.request {
            if request == "list" {
                return Ok(Inbound::List);
            }
            return Err(EnvelopeError::UnknownRequest(request));
        }

        let to = match self.to {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(EnvelopeError::MissingDestination),
        };

        let payload = match self.payload {
            Some(v @ Value::Object(_)) => v,
            _ => return Err(EnvelopeError::MissingPayload),
        };

        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .and_then(SignalKind::parse)
            .ok_or(EnvelopeError::UnknownKind)?;

        let serialized = serde_json::to_string(&payload)?.len();
        let max = if kind.is_description() {
            MAX_SDP_BYTES
        } else if kind == SignalKind::Candidate {
            MAX_CANDIDATE_BYTES
        } else {
            usize::MAX
        };
        if serialized > max {
            return Err(EnvelopeError::PayloadTooLarge {
                kind,
                max,
                actual: serialized,
            });
        }

        Ok(Inbound::Signal(Signal { to, kind, payload }))
    }
}

/// Messages the relay writes to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Sent once, immediately after a successful upgrade.
    Welcome {
        /// The code assigned to this connection.
        id: PeerCode,
    },
    /// Reply to a `list` request. The list is always empty; peer
    /// enumeration is disallowed.
    Peers {
        /// Always empty.
        peers: Vec<PeerCode>,
    },
    /// A relayed signaling payload, including synthetic `busy`.
    Signal {
        /// Originating peer code.
        from: PeerCode,
        /// Opaque payload.
        payload: Value,
    },
}

impl ServerMessage {
    /// Builds the synthetic refusal sent back to an offerer whose target
    /// is engaged.
    #[must_use]
    pub fn busy(from: PeerCode) -> Self {
        Self::Signal {
            from,
            payload: serde_json::json!({ "type": "busy" }),
        }
    }

    /// Serializes to a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error for malformed or unrecognized input.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A signal in transit between relay instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusEnvelope {
    /// Destination peer code.
    pub to: PeerCode,
    /// Originating peer code.
    pub from: PeerCode,
    /// Fixed discriminator, always `"signal"`.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Opaque payload.
    pub payload: Value,
    /// Identity of the publishing instance, used to skip self-delivery.
    pub origin: String,
}

impl BusEnvelope {
    /// Builds an envelope for publication.
    #[must_use]
    pub fn new(to: PeerCode, from: PeerCode, payload: Value, origin: &str) -> Self {
        Self {
            to,
            from,
            msg_type: "signal".to_string(),
            payload,
            origin: origin.to_string(),
        }
    }

    /// Serializes for the shared channel.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses a message received from the shared channel.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error for malformed input.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
