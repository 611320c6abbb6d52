//! Piece digests and the per-swarm record of peers that sent corrupt data.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::identity::PeerId;

/// Corrupt pieces a peer may send before the swarm stops asking it for data.
pub const DEFAULT_MAX_INTEGRITY_FAILURES: u32 = 3;

/// SHA-256 of one piece.
pub type PieceSum = [u8; 32];

pub fn piece_sum(payload: &[u8]) -> PieceSum {
    Sha256::digest(payload).into()
}

pub fn piece_matches(payload: &[u8], expected: &PieceSum) -> bool {
    piece_sum(payload) == *expected
}

/// What a corrupt piece means for the peer that sent it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strike {
    /// Still below the limit; `remaining` more corrupt pieces are tolerated.
    Tolerated { remaining: u32 },
    /// The limit is reached. The peer gets no further requests in this swarm.
    Isolated,
}

/// Corrupt-piece counts for the peers of one swarm. Counts are keyed by peer
/// id, so they survive reconnects and last as long as the swarm.
#[derive(Debug)]
pub struct Quarantine {
    limit: u32,
    strikes: HashMap<PeerId, u32>,
}

impl Quarantine {
    /// A limit of zero is treated as one: the first corrupt piece isolates.
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            strikes: HashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn strike(&mut self, peer: PeerId) -> Strike {
        let n = self.strikes.entry(peer).or_insert(0);
        *n = n.saturating_add(1);
        if *n >= self.limit {
            Strike::Isolated
        } else {
            Strike::Tolerated {
                remaining: self.limit - *n,
            }
        }
    }

    pub fn is_isolated(&self, peer: &PeerId) -> bool {
        self.strikes(peer) >= self.limit
    }

    pub fn strikes(&self, peer: &PeerId) -> u32 {
        self.strikes.get(peer).copied().unwrap_or(0)
    }
}
