//! Admission control: process-wide and per-swarm connection caps.
//!
//! One `Admission` is shared by a scheduler and everything that opens
//! connections for it. Both counters are checked and changed under a single
//! lock so the two caps can never disagree.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::identity::ContentHash;

pub const DEFAULT_MAX_GLOBAL_CONNS: usize = 256;
pub const DEFAULT_MAX_CONNS_PER_SWARM: usize = 16;

#[derive(Debug, Default)]
struct Counts {
    global: usize,
    per_swarm: HashMap<ContentHash, usize>,
    rejected: u64,
}

#[derive(Debug)]
pub struct Admission {
    max_global: usize,
    max_per_swarm: usize,
    counts: Mutex<Counts>,
}

impl Admission {
    pub fn new(max_global: usize, max_per_swarm: usize) -> Arc<Self> {
        Arc::new(Self {
            max_global,
            max_per_swarm,
            counts: Mutex::new(Counts::default()),
        })
    }

    /// Reserve a connection slot for `hash`. The slot is released when the permit drops.
    pub fn try_acquire(self: &Arc<Self>, hash: ContentHash) -> Result<Permit, AdmissionError> {
        let mut counts = self.counts.lock();
        if counts.global >= self.max_global {
            counts.rejected += 1;
            return Err(AdmissionError::GlobalLimit(self.max_global));
        }
        let swarm = counts.per_swarm.get(&hash).copied().unwrap_or(0);
        if swarm >= self.max_per_swarm {
            counts.rejected += 1;
            return Err(AdmissionError::SwarmLimit(self.max_per_swarm));
        }
        counts.global += 1;
        counts.per_swarm.insert(hash, swarm + 1);
        Ok(Permit {
            admission: Arc::clone(self),
            hash,
        })
    }

    fn release(&self, hash: &ContentHash) {
        let mut counts = self.counts.lock();
        counts.global = counts.global.saturating_sub(1);
        if let Some(n) = counts.per_swarm.get_mut(hash) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                counts.per_swarm.remove(hash);
            }
        }
    }

    pub fn global_count(&self) -> usize {
        self.counts.lock().global
    }

    pub fn swarm_count(&self, hash: &ContentHash) -> usize {
        self.counts.lock().per_swarm.get(hash).copied().unwrap_or(0)
    }

    /// Total attempts refused since creation.
    pub fn rejected(&self) -> u64 {
        self.counts.lock().rejected
    }
}

/// A held connection slot.
#[derive(Debug)]
pub struct Permit {
    admission: Arc<Admission>,
    hash: ContentHash,
}

impl Permit {
    pub fn hash(&self) -> ContentHash {
        self.hash
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.admission.release(&self.hash);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("global connection limit {0} reached")]
    GlobalLimit(usize),
    #[error("per-swarm connection limit {0} reached")]
    SwarmLimit(usize),
}
