//! Per-content swarm state. Host-driven: no I/O; the host reports connection
//! and piece events and receives the requests, cancels and completion signal
//! it should act on.
//!
//! The host guards each `SwarmState` with its own lock; nothing here is
//! shared across swarms.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::bitfield::{Bitfield, BitfieldError};
use crate::identity::PeerId;
use crate::integrity::{Quarantine, Strike, DEFAULT_MAX_INTEGRITY_FAILURES};
use crate::picker::{self, Availability};
use crate::piece::ContentInfo;

/// Default number of outstanding piece requests per connection.
pub const DEFAULT_PIPELINE_DEPTH: usize = 4;

/// Default age after which an outstanding request may be duplicated to another peer.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct SwarmConfig {
    pub pipeline_depth: usize,
    pub stall_timeout: Duration,
    pub max_integrity_failures: u32,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            max_integrity_failures: DEFAULT_MAX_INTEGRITY_FAILURES,
        }
    }
}

/// Swarm lifecycle. `Idle -> Active -> Draining -> Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwarmPhase {
    /// Created, no connection yet.
    Idle,
    /// Has at least one connection or dial in progress.
    Active,
    /// Canceled: no new requests or peers; in-flight work may finish.
    Draining,
    /// Drained with no connections left.
    Closed,
}

/// What to do with a piece that just arrived (after its digest was checked).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceClaim {
    /// Caller owns the write; report back with `piece_written` or `piece_failed`.
    Write,
    /// Already resident; discard.
    AlreadyHave,
    /// Another connection is writing the same piece; discard.
    InProgress,
}

/// Result of a successful piece write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceDone {
    /// Peers that still have this piece requested and should get `Cancel`.
    pub cancel: Vec<PeerId>,
    /// True exactly once per swarm, when the last missing piece lands.
    pub completed: bool,
}

#[derive(Debug)]
struct PeerEntry {
    bitfield: Bitfield,
    outstanding: HashMap<u32, Instant>,
}

/// Swarm aggregate: local bitfield, connected peers and in-flight requests.
#[derive(Debug)]
pub struct SwarmState {
    info: ContentInfo,
    local: Bitfield,
    phase: SwarmPhase,
    config: SwarmConfig,
    peers: HashMap<PeerId, PeerEntry>,
    availability: Availability,
    /// Piece index -> peers it is requested from, with request time.
    in_flight: HashMap<u32, Vec<(PeerId, Instant)>>,
    writing: HashSet<u32>,
    completion_reported: bool,
    quarantine: Quarantine,
}

impl SwarmState {
    pub fn new(info: ContentInfo, local: Bitfield, config: SwarmConfig) -> Result<Self, SwarmError> {
        if local.len() != info.num_pieces() {
            return Err(SwarmError::BitfieldLength {
                expected: info.num_pieces(),
                got: local.len(),
            });
        }
        let completion_reported = local.is_full();
        let availability = Availability::new(info.num_pieces());
        let quarantine = Quarantine::new(config.max_integrity_failures);
        Ok(Self {
            info,
            local,
            phase: SwarmPhase::Idle,
            config,
            peers: HashMap::new(),
            availability,
            in_flight: HashMap::new(),
            writing: HashSet::new(),
            completion_reported,
            quarantine,
        })
    }

    pub fn info(&self) -> &ContentInfo {
        &self.info
    }

    pub fn local_bitfield(&self) -> &Bitfield {
        &self.local
    }

    pub fn phase(&self) -> SwarmPhase {
        self.phase
    }

    pub fn is_complete(&self) -> bool {
        self.local.is_full()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    /// Pieces `peer` has announced so far.
    pub fn peer_bitfield(&self, peer: &PeerId) -> Option<&Bitfield> {
        self.peers.get(peer).map(|p| &p.bitfield)
    }

    /// Number of requests outstanding to `peer`.
    pub fn outstanding(&self, peer: &PeerId) -> usize {
        self.peers.get(peer).map_or(0, |p| p.outstanding.len())
    }

    /// A dial is in progress; an idle swarm becomes active.
    pub fn mark_dialing(&mut self) {
        if self.phase == SwarmPhase::Idle {
            self.phase = SwarmPhase::Active;
        }
    }

    /// Register a handshaken connection with the peer's initial bitfield.
    pub fn add_peer(&mut self, peer: PeerId, bitfield: Bitfield) -> Result<(), SwarmError> {
        match self.phase {
            SwarmPhase::Draining | SwarmPhase::Closed => return Err(SwarmError::NotAccepting),
            SwarmPhase::Idle | SwarmPhase::Active => {}
        }
        if self.peers.contains_key(&peer) {
            return Err(SwarmError::DuplicatePeer(peer));
        }
        if bitfield.len() != self.info.num_pieces() {
            return Err(SwarmError::BitfieldLength {
                expected: self.info.num_pieces(),
                got: bitfield.len(),
            });
        }
        self.availability.add_bitfield(&bitfield);
        self.peers.insert(
            peer,
            PeerEntry {
                bitfield,
                outstanding: HashMap::new(),
            },
        );
        self.phase = SwarmPhase::Active;
        Ok(())
    }

    /// Drop a connection and release everything it had in flight.
    pub fn remove_peer(&mut self, peer: &PeerId) -> bool {
        let Some(entry) = self.peers.remove(peer) else {
            return false;
        };
        self.availability.remove_bitfield(&entry.bitfield);
        for index in entry.outstanding.keys() {
            self.forget_request(*peer, *index);
        }
        if self.phase == SwarmPhase::Draining && self.peers.is_empty() {
            self.phase = SwarmPhase::Closed;
        }
        true
    }

    /// Merge a bitfield update from a peer. Returns the indices newly announced.
    pub fn update_peer_bitfield(
        &mut self,
        peer: &PeerId,
        bitfield: &Bitfield,
    ) -> Result<Vec<u32>, SwarmError> {
        let entry = self
            .peers
            .get_mut(peer)
            .ok_or(SwarmError::UnknownPeer(*peer))?;
        if bitfield.len() != entry.bitfield.len() {
            return Err(SwarmError::BitfieldLength {
                expected: entry.bitfield.len(),
                got: bitfield.len(),
            });
        }
        let added = entry.bitfield.union_with(bitfield);
        for &i in &added {
            self.availability.add_piece(i);
        }
        Ok(added)
    }

    /// Fill `peer`'s request pipeline. Fresh pieces are chosen rarest-first and
    /// never overlap another peer's request; when none are left, a request
    /// outstanding past the stall timeout may be duplicated once.
    pub fn next_requests(&mut self, peer: &PeerId, now: Instant) -> Vec<u32> {
        if self.phase != SwarmPhase::Active {
            return Vec::new();
        }
        // A reconnecting peer keeps its integrity record.
        if self.quarantine.is_isolated(peer) {
            return Vec::new();
        }
        let Some(entry) = self.peers.get(peer) else {
            return Vec::new();
        };
        let mut slots = self
            .config
            .pipeline_depth
            .saturating_sub(entry.outstanding.len());
        let mut picked = Vec::new();
        while slots > 0 {
            let Some(index) = self.pick_for(peer, now) else {
                break;
            };
            self.in_flight.entry(index).or_default().push((*peer, now));
            if let Some(entry) = self.peers.get_mut(peer) {
                entry.outstanding.insert(index, now);
            }
            picked.push(index);
            slots -= 1;
        }
        picked
    }

    fn pick_for(&self, peer: &PeerId, now: Instant) -> Option<u32> {
        let entry = self.peers.get(peer)?;
        let fresh = picker::pick_rarest(&entry.bitfield, &self.local, &self.availability, |i| {
            !self.in_flight.contains_key(&i) && !self.writing.contains(&i)
        });
        if fresh.is_some() {
            return fresh;
        }
        let stall = self.config.stall_timeout;
        picker::pick_rarest(&entry.bitfield, &self.local, &self.availability, |i| {
            if self.writing.contains(&i) || entry.outstanding.contains_key(&i) {
                return false;
            }
            match self.in_flight.get(&i).map(Vec::as_slice) {
                Some([(_, at)]) => now.saturating_duration_since(*at) >= stall,
                _ => false,
            }
        })
    }

    /// Piece data for `index` arrived from `peer` and passed verification.
    pub fn claim_piece(&mut self, peer: &PeerId, index: u32) -> PieceClaim {
        self.forget_request(*peer, index);
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.outstanding.remove(&index);
        }
        if self.local.has(index) {
            return PieceClaim::AlreadyHave;
        }
        if !self.writing.insert(index) {
            return PieceClaim::InProgress;
        }
        PieceClaim::Write
    }

    /// A claimed piece was persisted.
    pub fn piece_written(&mut self, index: u32) -> PieceDone {
        self.writing.remove(&index);
        self.local.set(index);
        let mut cancel = Vec::new();
        if let Some(requesters) = self.in_flight.remove(&index) {
            for (peer, _) in requesters {
                if let Some(entry) = self.peers.get_mut(&peer) {
                    entry.outstanding.remove(&index);
                    cancel.push(peer);
                }
            }
        }
        let completed = self.local.is_full() && !self.completion_reported;
        if completed {
            self.completion_reported = true;
        }
        PieceDone { cancel, completed }
    }

    /// A claimed piece could not be persisted; it becomes requestable again.
    pub fn piece_failed(&mut self, index: u32) {
        self.writing.remove(&index);
    }

    /// `peer` sent data that failed verification. Returns true if the peer
    /// should now be dropped.
    pub fn record_corrupt(&mut self, peer: &PeerId, index: u32) -> bool {
        self.forget_request(*peer, index);
        if let Some(entry) = self.peers.get_mut(peer) {
            entry.outstanding.remove(&index);
        }
        matches!(self.quarantine.strike(*peer), Strike::Isolated)
    }

    /// Stop taking new work. Closes immediately when no connections remain.
    pub fn drain(&mut self) {
        self.phase = if self.peers.is_empty() {
            SwarmPhase::Closed
        } else {
            SwarmPhase::Draining
        };
    }

    fn forget_request(&mut self, peer: PeerId, index: u32) {
        if let Some(requesters) = self.in_flight.get_mut(&index) {
            requesters.retain(|(p, _)| *p != peer);
            if requesters.is_empty() {
                self.in_flight.remove(&index);
            }
        }
    }

    /// Peers with a request for `index` outstanding.
    pub fn requesters(&self, index: u32) -> Vec<PeerId> {
        self.in_flight
            .get(&index)
            .map(|r| r.iter().map(|(p, _)| *p).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("bitfield has {got} pieces, expected {expected}")]
    BitfieldLength { expected: u32, got: u32 },
    #[error("peer {0} is already connected")]
    DuplicatePeer(PeerId),
    #[error("peer {0} is not connected")]
    UnknownPeer(PeerId),
    #[error("swarm is draining")]
    NotAccepting,
    #[error(transparent)]
    Bitfield(#[from] BitfieldError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pieces: usize) -> ContentInfo {
        let data: Vec<u8> = (0..pieces * 4).map(|i| i as u8).collect();
        ContentInfo::from_blob(&data, 4).unwrap()
    }

    fn bf(len: u32, set: &[u32]) -> Bitfield {
        let mut b = Bitfield::new(len);
        for &i in set {
            b.set(i);
        }
        b
    }

    fn swarm(pieces: usize, depth: usize) -> SwarmState {
        let config = SwarmConfig {
            pipeline_depth: depth,
            stall_timeout: Duration::from_secs(5),
            max_integrity_failures: 2,
        };
        SwarmState::new(info(pieces), Bitfield::new(pieces as u32), config).unwrap()
    }

    #[test]
    fn lifecycle_idle_active_draining_closed() {
        let mut s = swarm(2, 1);
        assert_eq!(s.phase(), SwarmPhase::Idle);
        let p = PeerId::generate();
        s.add_peer(p, bf(2, &[0])).unwrap();
        assert_eq!(s.phase(), SwarmPhase::Active);
        s.drain();
        assert_eq!(s.phase(), SwarmPhase::Draining);
        assert!(matches!(
            s.add_peer(PeerId::generate(), bf(2, &[])),
            Err(SwarmError::NotAccepting)
        ));
        assert!(s.next_requests(&p, Instant::now()).is_empty());
        s.remove_peer(&p);
        assert_eq!(s.phase(), SwarmPhase::Closed);
    }

    #[test]
    fn rejects_duplicate_peer_and_bad_bitfield() {
        let mut s = swarm(3, 1);
        let p = PeerId::generate();
        s.add_peer(p, bf(3, &[])).unwrap();
        assert!(matches!(
            s.add_peer(p, bf(3, &[])),
            Err(SwarmError::DuplicatePeer(_))
        ));
        assert!(matches!(
            s.add_peer(PeerId::generate(), bf(4, &[])),
            Err(SwarmError::BitfieldLength { .. })
        ));
    }

    #[test]
    fn no_piece_requested_from_two_peers_before_stall() {
        let mut s = swarm(3, 3);
        let now = Instant::now();
        let a = PeerId::generate();
        let b = PeerId::generate();
        s.add_peer(a, bf(3, &[0, 1, 2])).unwrap();
        s.add_peer(b, bf(3, &[0, 1, 2])).unwrap();
        let ra = s.next_requests(&a, now);
        assert_eq!(ra, vec![0, 1, 2]);
        assert!(s.next_requests(&b, now).is_empty());
        assert!(s.next_requests(&b, now + Duration::from_secs(4)).is_empty());
    }

    #[test]
    fn stalled_request_duplicated_once() {
        let mut s = swarm(1, 2);
        let now = Instant::now();
        let (a, b, c) = (PeerId::generate(), PeerId::generate(), PeerId::generate());
        for p in [a, b, c] {
            s.add_peer(p, bf(1, &[0])).unwrap();
        }
        assert_eq!(s.next_requests(&a, now), vec![0]);
        let later = now + Duration::from_secs(5);
        assert_eq!(s.next_requests(&b, later), vec![0]);
        assert!(s.next_requests(&c, later + Duration::from_secs(10)).is_empty());
        assert!(s.next_requests(&a, later).is_empty());
        assert_eq!(s.requesters(0).len(), 2);
    }

    #[test]
    fn rarest_piece_requested_first() {
        let mut s = swarm(3, 1);
        let now = Instant::now();
        let a = PeerId::generate();
        let b = PeerId::generate();
        s.add_peer(a, bf(3, &[0, 1, 2])).unwrap();
        s.add_peer(b, bf(3, &[0, 1])).unwrap();
        assert_eq!(s.next_requests(&a, now), vec![2]);
        assert_eq!(s.next_requests(&b, now), vec![0]);
    }

    #[test]
    fn duplicate_arrival_cancels_and_discards() {
        let mut s = swarm(1, 1);
        let now = Instant::now();
        let a = PeerId::generate();
        let b = PeerId::generate();
        s.add_peer(a, bf(1, &[0])).unwrap();
        s.add_peer(b, bf(1, &[0])).unwrap();
        s.next_requests(&a, now);
        s.next_requests(&b, now + Duration::from_secs(6));

        assert_eq!(s.claim_piece(&b, 0), PieceClaim::Write);
        assert_eq!(s.claim_piece(&a, 0), PieceClaim::InProgress);
        let done = s.piece_written(0);
        assert!(done.completed);
        assert!(done.cancel.is_empty());
        assert_eq!(s.claim_piece(&a, 0), PieceClaim::AlreadyHave);
    }

    #[test]
    fn written_piece_cancels_other_requester() {
        let mut s = swarm(1, 1);
        let now = Instant::now();
        let a = PeerId::generate();
        let b = PeerId::generate();
        s.add_peer(a, bf(1, &[0])).unwrap();
        s.add_peer(b, bf(1, &[0])).unwrap();
        s.next_requests(&a, now);
        s.next_requests(&b, now + Duration::from_secs(6));
        assert_eq!(s.claim_piece(&a, 0), PieceClaim::Write);
        let done = s.piece_written(0);
        assert_eq!(done.cancel, vec![b]);
        assert_eq!(s.outstanding(&b), 0);
    }

    #[test]
    fn completion_reported_exactly_once() {
        let mut s = swarm(2, 2);
        let p = PeerId::generate();
        s.add_peer(p, bf(2, &[0, 1])).unwrap();
        s.next_requests(&p, Instant::now());
        assert_eq!(s.claim_piece(&p, 0), PieceClaim::Write);
        assert!(!s.piece_written(0).completed);
        assert_eq!(s.claim_piece(&p, 1), PieceClaim::Write);
        assert!(s.piece_written(1).completed);
        assert!(!s.piece_written(1).completed);
        assert!(s.is_complete());
    }

    #[test]
    fn already_complete_swarm_never_reports() {
        let meta = info(2);
        let mut s = SwarmState::new(meta, Bitfield::full(2), SwarmConfig::default()).unwrap();
        assert!(!s.piece_written(0).completed);
    }

    #[test]
    fn failed_write_is_requested_again() {
        let mut s = swarm(1, 1);
        let p = PeerId::generate();
        s.add_peer(p, bf(1, &[0])).unwrap();
        let now = Instant::now();
        assert_eq!(s.next_requests(&p, now), vec![0]);
        assert_eq!(s.claim_piece(&p, 0), PieceClaim::Write);
        s.piece_failed(0);
        assert_eq!(s.next_requests(&p, now), vec![0]);
    }

    #[test]
    fn removing_peer_releases_requests() {
        let mut s = swarm(2, 2);
        let now = Instant::now();
        let a = PeerId::generate();
        let b = PeerId::generate();
        s.add_peer(a, bf(2, &[0, 1])).unwrap();
        s.add_peer(b, bf(2, &[0, 1])).unwrap();
        assert_eq!(s.next_requests(&a, now).len(), 2);
        s.remove_peer(&a);
        assert_eq!(s.next_requests(&b, now), vec![0, 1]);
    }

    #[test]
    fn corrupt_peer_dropped_after_threshold() {
        let mut s = swarm(1, 1);
        let p = PeerId::generate();
        s.add_peer(p, bf(1, &[0])).unwrap();
        assert!(!s.record_corrupt(&p, 0));
        assert!(s.record_corrupt(&p, 0));

        // Reconnecting does not clear the record.
        s.remove_peer(&p);
        s.add_peer(p, bf(1, &[0])).unwrap();
        assert!(s.next_requests(&p, Instant::now()).is_empty());
    }

    #[test]
    fn bitfield_update_makes_pieces_requestable() {
        let mut s = swarm(2, 2);
        let p = PeerId::generate();
        s.add_peer(p, bf(2, &[])).unwrap();
        assert!(s.next_requests(&p, Instant::now()).is_empty());
        let added = s.update_peer_bitfield(&p, &bf(2, &[1])).unwrap();
        assert_eq!(added, vec![1]);
        assert!(s.peer_bitfield(&p).unwrap().has(1));
        assert_eq!(s.next_requests(&p, Instant::now()), vec![1]);
    }
}
