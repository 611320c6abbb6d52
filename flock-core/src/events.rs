//! Structured event records for the external telemetry consumer.
//!
//! Records serialize as flat objects tagged by `event`, with hashes and peer
//! ids as hex strings.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::identity::{ContentHash, PeerId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    ConnectionEstablished {
        #[serde(serialize_with = "as_hex")]
        hash: ContentHash,
        #[serde(serialize_with = "as_hex")]
        peer: PeerId,
    },
    ConnectionClosed {
        #[serde(serialize_with = "as_hex")]
        hash: ContentHash,
        #[serde(serialize_with = "as_hex")]
        peer: PeerId,
        reason: String,
    },
    HandshakeRejected {
        #[serde(serialize_with = "as_hex_opt")]
        hash: Option<ContentHash>,
        #[serde(serialize_with = "as_hex_opt")]
        peer: Option<PeerId>,
        reason: String,
    },
    PieceReceived {
        #[serde(serialize_with = "as_hex")]
        hash: ContentHash,
        #[serde(serialize_with = "as_hex")]
        peer: PeerId,
        index: u32,
    },
    SwarmCompleted {
        #[serde(serialize_with = "as_hex")]
        hash: ContentHash,
    },
    EvictionPerformed {
        #[serde(serialize_with = "as_hex")]
        hash: ContentHash,
        bytes: u64,
    },
    TrashSwept {
        #[serde(serialize_with = "as_hex")]
        hash: ContentHash,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ConnectionEstablished { .. } => "connection_established",
            Event::ConnectionClosed { .. } => "connection_closed",
            Event::HandshakeRejected { .. } => "handshake_rejected",
            Event::PieceReceived { .. } => "piece_received",
            Event::SwarmCompleted { .. } => "swarm_completed",
            Event::EvictionPerformed { .. } => "eviction_performed",
            Event::TrashSwept { .. } => "trash_swept",
        }
    }
}

fn as_hex<T: fmt::Display, S: Serializer>(value: &T, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(value)
}

fn as_hex_opt<T, S>(value: &Option<T>, s: S) -> Result<S::Ok, S::Error>
where
    T: fmt::Display,
    S: Serializer,
{
    match value {
        Some(v) => s.collect_str(v),
        None => s.serialize_none(),
    }
}
