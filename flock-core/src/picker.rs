//! Piece selection: rarest-first over the peers currently in a swarm.

use crate::bitfield::Bitfield;

/// How many connected peers own each piece.
#[derive(Debug, Clone)]
pub struct Availability {
    counts: Vec<u32>,
}

impl Availability {
    pub fn new(num_pieces: u32) -> Self {
        Self {
            counts: vec![0; num_pieces as usize],
        }
    }

    pub fn add_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_set() {
            self.add_piece(i);
        }
    }

    pub fn remove_bitfield(&mut self, bitfield: &Bitfield) {
        for i in bitfield.iter_set() {
            if let Some(c) = self.counts.get_mut(i as usize) {
                *c = c.saturating_sub(1);
            }
        }
    }

    pub fn add_piece(&mut self, index: u32) {
        if let Some(c) = self.counts.get_mut(index as usize) {
            *c += 1;
        }
    }

    pub fn count(&self, index: u32) -> u32 {
        self.counts.get(index as usize).copied().unwrap_or(0)
    }
}

/// Pick the rarest piece `peer` owns, `local` lacks and `eligible` accepts.
/// Ties go to the lowest index, so the choice is deterministic.
pub fn pick_rarest(
    peer: &Bitfield,
    local: &Bitfield,
    availability: &Availability,
    mut eligible: impl FnMut(u32) -> bool,
) -> Option<u32> {
    peer.iter_set()
        .filter(|&i| !local.has(i) && eligible(i))
        .min_by_key(|&i| (availability.count(i), i))
}
