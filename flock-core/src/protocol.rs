//! Flock wire protocol: handshake and post-handshake message types.

use serde::{Deserialize, Serialize};

use crate::identity::{ContentHash, PeerId};

/// Protocol magic sent first in every handshake.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"FLK1";

/// Handshake exchanged once by each side before any other message.
/// Encoded with bincode varint options (see wire module): fixed-width magic,
/// hash and peer ID, then a varint length and the bitfield bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub magic: [u8; 4],
    pub content_hash: ContentHash,
    pub peer_id: PeerId,
    pub bitfield: Vec<u8>,
}

impl Handshake {
    pub fn new(content_hash: ContentHash, peer_id: PeerId, bitfield: &[u8]) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            content_hash,
            peer_id,
            bitfield: bitfield.to_vec(),
        }
    }
}

pub const TAG_BITFIELD: u8 = 0;
pub const TAG_PIECE_REQUEST: u8 = 1;
pub const TAG_PIECE_DATA: u8 = 2;
pub const TAG_CANCEL: u8 = 3;
pub const TAG_KEEPALIVE: u8 = 4;

/// All post-handshake messages, tagged by one byte on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Sender's full bitfield (raw wire bytes; length implied by the content).
    BitfieldUpdate { bitfield: Vec<u8> },
    PieceRequest { index: u32 },
    PieceData { index: u32, payload: Vec<u8> },
    Cancel { index: u32 },
    Keepalive,
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::BitfieldUpdate { .. } => TAG_BITFIELD,
            Message::PieceRequest { .. } => TAG_PIECE_REQUEST,
            Message::PieceData { .. } => TAG_PIECE_DATA,
            Message::Cancel { .. } => TAG_CANCEL,
            Message::Keepalive => TAG_KEEPALIVE,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::BitfieldUpdate { .. } => "bitfield",
            Message::PieceRequest { .. } => "piece_request",
            Message::PieceData { .. } => "piece_data",
            Message::Cancel { .. } => "cancel",
            Message::Keepalive => "keepalive",
        }
    }
}
