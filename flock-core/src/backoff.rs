//! Dial retry: capped exponential backoff and a per-swarm candidate set.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default delay after the first failure.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Default cap on the delay between attempts.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);
/// Default number of consecutive failures before a candidate is dropped.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

/// `delay(n) = min(base * 2^(n-1), max)` for the n-th consecutive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub retry_limit: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let shift = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    RetryAt(Instant),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateState {
    /// Eligible for a dial at or after the instant.
    Waiting(Instant),
    /// Dial or connection in progress.
    Busy,
}

#[derive(Debug)]
struct Candidate {
    failures: u32,
    state: CandidateState,
}

/// Dial candidates for one swarm, keyed by address.
#[derive(Debug)]
pub struct CandidateSet<A> {
    policy: BackoffPolicy,
    candidates: HashMap<A, Candidate>,
    given_up: u32,
}

impl<A: Clone + Eq + Hash> CandidateSet<A> {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            candidates: HashMap::new(),
            given_up: 0,
        }
    }

    /// Add a candidate, immediately due. Returns false if already known.
    pub fn insert(&mut self, addr: A, now: Instant) -> bool {
        if self.candidates.contains_key(&addr) {
            return false;
        }
        self.candidates.insert(
            addr,
            Candidate {
                failures: 0,
                state: CandidateState::Waiting(now),
            },
        );
        true
    }

    /// Candidates whose backoff has elapsed, in a stable order for equal deadlines.
    pub fn due(&self, now: Instant) -> Vec<A> {
        let mut due: Vec<(Instant, &A)> = self
            .candidates
            .iter()
            .filter_map(|(a, c)| match c.state {
                CandidateState::Waiting(at) if at <= now => Some((at, a)),
                _ => None,
            })
            .collect();
        due.sort_by_key(|(at, _)| *at);
        due.into_iter().map(|(_, a)| a.clone()).collect()
    }

    /// Earliest instant any waiting candidate becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.candidates
            .values()
            .filter_map(|c| match c.state {
                CandidateState::Waiting(at) => Some(at),
                CandidateState::Busy => None,
            })
            .min()
    }

    /// Mark a candidate as being dialed or connected.
    pub fn mark_busy(&mut self, addr: &A) {
        if let Some(c) = self.candidates.get_mut(addr) {
            c.state = CandidateState::Busy;
        }
    }

    /// Put a busy candidate back in the queue without counting a failure
    /// (e.g. admission was refused).
    pub fn requeue(&mut self, addr: &A, at: Instant) {
        if let Some(c) = self.candidates.get_mut(addr) {
            c.state = CandidateState::Waiting(at);
        }
    }

    /// A handshake succeeded; the failure count resets.
    pub fn record_success(&mut self, addr: &A) {
        if let Some(c) = self.candidates.get_mut(addr) {
            c.failures = 0;
            c.state = CandidateState::Busy;
        }
    }

    /// A connection that was established has ended; redial after the base delay.
    pub fn record_disconnect(&mut self, addr: &A, now: Instant) {
        if let Some(c) = self.candidates.get_mut(addr) {
            c.state = CandidateState::Waiting(now + self.policy.base);
        }
    }

    /// A dial or handshake failed. Candidates past the retry limit are removed.
    pub fn record_failure(&mut self, addr: &A, now: Instant) -> RetryVerdict {
        let Some(c) = self.candidates.get_mut(addr) else {
            return RetryVerdict::GiveUp;
        };
        c.failures += 1;
        if c.failures >= self.policy.retry_limit {
            self.candidates.remove(addr);
            self.given_up += 1;
            return RetryVerdict::GiveUp;
        }
        let at = now + self.policy.delay(c.failures);
        c.state = CandidateState::Waiting(at);
        RetryVerdict::RetryAt(at)
    }

    pub fn remove(&mut self, addr: &A) {
        self.candidates.remove(addr);
    }

    pub fn contains(&self, addr: &A) -> bool {
        self.candidates.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Number of candidates dropped after exhausting their retries.
    pub fn given_up(&self) -> u32 {
        self.given_up
    }
}
