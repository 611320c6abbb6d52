//! Swarm scheduler.
//!
//! Every content item being downloaded or seeded gets a `Swarm`: the core
//! `SwarmState` plus dial candidates, guarded by one lock that is never held
//! across an await. A driver task per swarm dials due candidates and watches
//! for exhaustion, cancellation and teardown; each connection runs in its own
//! task (see `peer`). Lock order is swarm map, then swarm.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flock_core::{
    Admission, BackoffPolicy, Bitfield, CandidateSet, ContentHash, ContentInfo, Event, Message,
    PeerId, Permit, RetryVerdict, SwarmConfig, SwarmError, SwarmPhase, SwarmState,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::conn::{ConnConfig, Connection};
use crate::events::EventProducer;
use crate::handshake::{HandshakeError, Handshaker, Role};
use crate::peer::{self, Command};
use crate::store::{StoreError, StoreManager};
use crate::stream::BoxTransport;

/// Address a dialer understands (`host:port` for TCP).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr(String);

impl PeerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerAddr {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// Opens raw transports to candidate peers.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &PeerAddr) -> io::Result<BoxTransport>;
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Bound on opening the transport; the handshake has its own deadline.
    pub dial_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub swarm: SwarmConfig,
    /// Driver and connection housekeeping period.
    pub tick_interval: Duration,
    /// How long a cancelled swarm waits for in-flight pieces.
    pub drain_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
            swarm: SwarmConfig::default(),
            tick_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("no peer could serve {hash}: {given_up} candidates ran out of retries")]
    PeersExhausted { hash: ContentHash, given_up: u32 },
    #[error("download of {0} was cancelled")]
    Cancelled(ContentHash),
    #[error("storage failed for {hash}: {reason}")]
    StorageFailed { hash: ContentHash, reason: String },
    #[error("scheduler is shut down")]
    ShutDown,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
}

#[derive(Debug, thiserror::Error)]
enum DialError {
    #[error("dial timed out")]
    Timeout,
    #[error("dial: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

/// Terminal result reported to download handles.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Completed(PathBuf),
    Exhausted { given_up: u32 },
    Failed(String),
    Cancelled,
}

pub(crate) struct Shared {
    pub(crate) state: SwarmState,
    candidates: CandidateSet<PeerAddr>,
    /// Dials in flight plus inbound connections not yet attached.
    pending: usize,
    pub(crate) links: HashMap<PeerId, mpsc::UnboundedSender<Command>>,
}

pub(crate) struct Swarm {
    pub(crate) info: ContentInfo,
    pub(crate) shared: Mutex<Shared>,
    wake: Notify,
    outcome: watch::Sender<Option<Outcome>>,
    cancel: watch::Sender<bool>,
}

impl Swarm {
    fn new(state: SwarmState, backoff: BackoffPolicy) -> Arc<Self> {
        Arc::new(Self {
            info: state.info().clone(),
            shared: Mutex::new(Shared {
                state,
                candidates: CandidateSet::new(backoff),
                pending: 0,
                links: HashMap::new(),
            }),
            wake: Notify::new(),
            outcome: watch::channel(None).0,
            cancel: watch::channel(false).0,
        })
    }

    pub(crate) fn hash(&self) -> ContentHash {
        self.info.hash()
    }

    /// Nudge the driver.
    pub(crate) fn wake(&self) {
        self.wake.notify_one();
    }

    fn outcome(&self) -> Option<Outcome> {
        self.outcome.borrow().clone()
    }

    fn set_outcome(&self, outcome: Outcome) {
        self.outcome.send_replace(Some(outcome));
    }

    pub(crate) fn cancel(&self) {
        self.cancel.send_replace(true);
        self.wake();
    }

    /// Queue `msg` on every live connection.
    pub(crate) fn broadcast(&self, msg: &Message) {
        let shared = self.shared.lock();
        for tx in shared.links.values() {
            let _ = tx.send(Command::Send(msg.clone()));
        }
    }

    fn add_candidates(&self, peers: impl IntoIterator<Item = PeerAddr>) {
        let now = Instant::now().into_std();
        let added = {
            let mut shared = self.shared.lock();
            peers
                .into_iter()
                .filter(|p| shared.candidates.insert(p.clone(), now))
                .count()
        };
        if added > 0 {
            // New candidates revive an exhausted download.
            self.outcome
                .send_if_modified(|o| match o {
                    Some(Outcome::Exhausted { .. }) => {
                        *o = None;
                        true
                    }
                    _ => false,
                });
            self.wake();
        }
    }
}

enum Step {
    Wait(Instant),
    Done,
}

pub(crate) struct Inner {
    config: SchedulerConfig,
    pub(crate) handshaker: Handshaker,
    pub(crate) store: Arc<StoreManager>,
    admission: Arc<Admission>,
    dialer: Arc<dyn Dialer>,
    pub(crate) events: EventProducer,
    swarms: Mutex<HashMap<ContentHash, Arc<Swarm>>>,
    swarm_count: watch::Sender<usize>,
    shutdown: watch::Sender<bool>,
}

/// Cheap to clone; all clones drive the same swarms.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        conn: ConnConfig,
        local_peer: PeerId,
        store: Arc<StoreManager>,
        admission: Arc<Admission>,
        dialer: Arc<dyn Dialer>,
        events: EventProducer,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handshaker: Handshaker::new(conn, local_peer, events.clone()),
                store,
                admission,
                dialer,
                events,
                swarms: Mutex::new(HashMap::new()),
                swarm_count: watch::channel(0).0,
                shutdown: watch::channel(false).0,
            }),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.handshaker.local_peer()
    }

    pub fn store(&self) -> &Arc<StoreManager> {
        &self.inner.store
    }

    /// Content hashes with a live swarm.
    pub fn swarms(&self) -> Vec<ContentHash> {
        self.inner.swarms.lock().keys().copied().collect()
    }

    /// Connections currently attached to the swarm for `hash`.
    pub fn peer_count(&self, hash: &ContentHash) -> usize {
        self.inner
            .swarms
            .lock()
            .get(hash)
            .map_or(0, |s| s.shared.lock().state.peer_count())
    }

    /// Fetch `info` from `peers`. Resident content resolves at once; a swarm
    /// already working on the same hash is joined and given the new peers.
    pub async fn download(
        &self,
        info: ContentInfo,
        peers: Vec<PeerAddr>,
    ) -> Result<DownloadHandle, SchedulerError> {
        let inner = &self.inner;
        if *inner.shutdown.borrow() {
            return Err(SchedulerError::ShutDown);
        }
        let hash = info.hash();
        if inner.store.resident_info(&hash).is_some() {
            inner.store.blocking(move |s| s.promote(&hash)).await?;
            return Ok(DownloadHandle::ready(hash, inner.store.link_path(&hash)));
        }
        if let Some(swarm) = inner.active_swarm(&hash)? {
            swarm.add_candidates(peers);
            return Ok(DownloadHandle::attach(swarm));
        }
        let upload = info.clone();
        inner.store.blocking(move |s| s.begin_upload(&upload)).await?;
        let state = SwarmState::new(
            info.clone(),
            Bitfield::new(info.num_pieces()),
            inner.config.swarm,
        )?;
        info!(%hash, pieces = info.num_pieces(), peers = peers.len(), "download started");
        let fresh = Swarm::new(state, inner.config.backoff);
        let swarm = {
            let mut swarms = inner.swarms.lock();
            match swarms.get(&hash) {
                Some(existing) => Arc::clone(existing),
                None => {
                    fresh.add_candidates(peers.iter().cloned());
                    inner.insert_swarm(&mut swarms, fresh)
                }
            }
        };
        swarm.add_candidates(peers);
        Ok(DownloadHandle::attach(swarm))
    }

    /// Run the responder side for one inbound transport until the connection ends.
    pub async fn accept(&self, stream: BoxTransport) {
        let inner = &self.inner;
        if *inner.shutdown.borrow() {
            return;
        }
        let conn = match inner
            .handshaker
            .accept(stream, |hash| inner.lookup(hash))
            .await
        {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "inbound handshake failed");
                return;
            }
        };
        Arc::clone(inner).attach_inbound(conn).await;
    }

    /// Cancel every swarm and wait for them to drain.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown.send_replace(true);
        let swarms: Vec<Arc<Swarm>> = inner.swarms.lock().values().cloned().collect();
        for swarm in &swarms {
            swarm.wake();
        }
        let deadline = Instant::now() + inner.config.drain_timeout + inner.config.tick_interval;
        let mut count = inner.swarm_count.subscribe();
        if time::timeout_at(deadline, count.wait_for(|n| *n == 0))
            .await
            .is_err()
        {
            warn!(remaining = inner.swarms.lock().len(), "swarms still draining at shutdown");
        }
    }
}

impl Inner {
    pub(crate) fn tick_interval(&self) -> Duration {
        self.config.tick_interval
    }

    fn active_swarm(&self, hash: &ContentHash) -> Result<Option<Arc<Swarm>>, SwarmError> {
        let swarms = self.swarms.lock();
        let Some(swarm) = swarms.get(hash) else {
            return Ok(None);
        };
        let phase = swarm.shared.lock().state.phase();
        match phase {
            SwarmPhase::Draining | SwarmPhase::Closed => Err(SwarmError::NotAccepting),
            SwarmPhase::Idle | SwarmPhase::Active => Ok(Some(Arc::clone(swarm))),
        }
    }

    fn insert_swarm(
        self: &Arc<Self>,
        swarms: &mut HashMap<ContentHash, Arc<Swarm>>,
        swarm: Arc<Swarm>,
    ) -> Arc<Swarm> {
        swarms.insert(swarm.hash(), Arc::clone(&swarm));
        self.swarm_count.send_replace(swarms.len());
        tokio::spawn(Arc::clone(self).drive(Arc::clone(&swarm)));
        swarm
    }

    fn remove_swarm(&self, swarms: &mut HashMap<ContentHash, Arc<Swarm>>, swarm: &Arc<Swarm>) {
        let hash = swarm.hash();
        if swarms.get(&hash).is_some_and(|s| Arc::ptr_eq(s, swarm)) {
            swarms.remove(&hash);
            self.swarm_count.send_replace(swarms.len());
        }
    }

    /// Content a responder agrees to talk about: an accepting swarm or
    /// resident content.
    fn lookup(&self, hash: &ContentHash) -> Option<(ContentInfo, Bitfield)> {
        let swarms = self.swarms.lock();
        if let Some(swarm) = swarms.get(hash) {
            let shared = swarm.shared.lock();
            if matches!(shared.state.phase(), SwarmPhase::Idle | SwarmPhase::Active) {
                return Some((swarm.info.clone(), shared.state.local_bitfield().clone()));
            }
            return None;
        }
        drop(swarms);
        let info = self.store.resident_info(hash)?;
        let full = Bitfield::full(info.num_pieces());
        Some((info, full))
    }

    /// Swarm an inbound connection joins, creating a seeding swarm for
    /// resident content. The caller owes a `pending` decrement.
    fn inbound_swarm(self: &Arc<Self>, info: &ContentInfo) -> Option<Arc<Swarm>> {
        let hash = info.hash();
        let mut swarms = self.swarms.lock();
        if let Some(swarm) = swarms.get(&hash) {
            let mut shared = swarm.shared.lock();
            if !matches!(shared.state.phase(), SwarmPhase::Idle | SwarmPhase::Active) {
                return None;
            }
            shared.pending += 1;
            return Some(Arc::clone(swarm));
        }
        let info = self.store.resident_info(&hash)?;
        let full = Bitfield::full(info.num_pieces());
        let state = SwarmState::new(info, full, self.config.swarm).ok()?;
        let swarm = self.insert_swarm(&mut swarms, Swarm::new(state, self.config.backoff));
        swarm.shared.lock().pending += 1;
        debug!(%hash, "seeding swarm created");
        Some(swarm)
    }

    async fn attach_inbound(self: Arc<Self>, mut conn: Connection<BoxTransport>) {
        let hash = conn.hash();
        let Some(swarm) = self.inbound_swarm(conn.info()) else {
            debug!(%hash, peer = %conn.peer_id(), "no accepting swarm for inbound connection");
            conn.close().await;
            return;
        };
        let permit = match self.admission.try_acquire(hash) {
            Ok(permit) => permit,
            Err(e) => {
                {
                    let mut shared = swarm.shared.lock();
                    shared.pending = shared.pending.saturating_sub(1);
                }
                warn!(%hash, peer = %conn.peer_id(), error = %e, "inbound connection refused");
                conn.close().await;
                swarm.wake();
                return;
            }
        };
        self.attach(swarm, conn, None, permit).await;
    }

    /// Register a handshaken connection with its swarm and run it to the end.
    async fn attach(
        self: Arc<Self>,
        swarm: Arc<Swarm>,
        mut conn: Connection<BoxTransport>,
        addr: Option<PeerAddr>,
        permit: Permit,
    ) {
        let hash = swarm.hash();
        let peer = conn.peer_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let added = {
            let mut shared = swarm.shared.lock();
            shared.pending = shared.pending.saturating_sub(1);
            match shared.state.add_peer(peer, conn.remote_bitfield().clone()) {
                Ok(()) => {
                    shared.links.insert(peer, tx);
                    if let Some(addr) = &addr {
                        shared.candidates.record_success(addr);
                    }
                    // Pieces may have landed since our handshake snapshot.
                    Ok(shared.state.local_bitfield() != conn.local_bitfield())
                }
                Err(e) => {
                    if let Some(addr) = &addr {
                        shared
                            .candidates
                            .record_disconnect(addr, Instant::now().into_std());
                    }
                    Err(e)
                }
            }
        };
        let stale = match added {
            Ok(stale) => stale,
            Err(e) => {
                debug!(%hash, %peer, error = %e, "connection not attached");
                conn.close().await;
                swarm.wake();
                return;
            }
        };
        info!(%hash, %peer, inbound = addr.is_none(), "connection established");
        self.events
            .emit(Event::ConnectionEstablished { hash, peer });

        let exit = peer::run(&self, &swarm, &mut conn, rx, stale).await;

        {
            let mut shared = swarm.shared.lock();
            shared.state.remove_peer(&peer);
            shared.links.remove(&peer);
            if let Some(addr) = &addr {
                let now = Instant::now().into_std();
                if shared.state.is_complete() {
                    shared.candidates.remove(addr);
                } else if exit.failed {
                    if shared.candidates.record_failure(addr, now) == RetryVerdict::GiveUp {
                        warn!(%hash, %peer, %addr, "peer dropped after repeated failures");
                    }
                } else {
                    shared.candidates.record_disconnect(addr, now);
                }
            }
        }
        conn.close().await;
        drop(permit);
        info!(%hash, %peer, reason = %exit.reason, "connection closed");
        self.events.emit(Event::ConnectionClosed {
            hash,
            peer,
            reason: exit.reason,
        });
        swarm.wake();
    }

    async fn drive(self: Arc<Self>, swarm: Arc<Swarm>) {
        let hash = swarm.hash();
        let mut cancel = swarm.cancel.subscribe();
        let mut shutdown = self.shutdown.subscribe();
        loop {
            if *cancel.borrow() || *shutdown.borrow() {
                self.drain(&swarm).await;
                break;
            }
            let next = match self.step(&swarm) {
                Step::Wait(at) => at,
                Step::Done => break,
            };
            tokio::select! {
                _ = swarm.wake.notified() => {}
                _ = time::sleep_until(next) => {}
                _ = cancel.changed() => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!(%hash, "swarm driver finished");
    }

    /// One driver pass: retire a finished seeding swarm, dial due candidates,
    /// report exhaustion. Returns when to look again.
    fn step(self: &Arc<Self>, swarm: &Arc<Swarm>) -> Step {
        let hash = swarm.hash();
        let now = Instant::now();
        let mut swarms = self.swarms.lock();
        let mut shared = swarm.shared.lock();
        let idle = shared.state.peer_count() == 0 && shared.pending == 0;
        if shared.state.is_complete() {
            if idle {
                self.remove_swarm(&mut swarms, swarm);
                debug!(%hash, "complete swarm has no peers left");
                return Step::Done;
            }
            return Step::Wait(now + self.config.tick_interval);
        }
        drop(swarms);

        for addr in shared.candidates.due(now.into_std()) {
            match self.admission.try_acquire(hash) {
                Ok(permit) => {
                    shared.candidates.mark_busy(&addr);
                    shared.pending += 1;
                    shared.state.mark_dialing();
                    tokio::spawn(Arc::clone(self).dial(Arc::clone(swarm), addr, permit));
                }
                Err(e) => {
                    debug!(%hash, %addr, error = %e, "dial deferred");
                    shared
                        .candidates
                        .requeue(&addr, (now + self.config.tick_interval).into_std());
                }
            }
        }

        let idle = shared.state.peer_count() == 0 && shared.pending == 0;
        if idle && shared.candidates.is_empty() && swarm.outcome().is_none() {
            let given_up = shared.candidates.given_up();
            warn!(%hash, given_up, "all peers exhausted");
            swarm.set_outcome(Outcome::Exhausted { given_up });
        }

        let mut next = now + self.config.tick_interval;
        if let Some(at) = shared.candidates.next_due() {
            next = next.min(Instant::from_std(at));
        }
        Step::Wait(next)
    }

    async fn dial(self: Arc<Self>, swarm: Arc<Swarm>, addr: PeerAddr, permit: Permit) {
        let hash = swarm.hash();
        match self.connect(&swarm, &addr).await {
            Ok(conn) => self.attach(swarm, conn, Some(addr), permit).await,
            Err(e) => {
                drop(permit);
                let verdict = {
                    let mut shared = swarm.shared.lock();
                    shared.pending = shared.pending.saturating_sub(1);
                    shared
                        .candidates
                        .record_failure(&addr, Instant::now().into_std())
                };
                match verdict {
                    RetryVerdict::RetryAt(_) => debug!(%hash, %addr, error = %e, "dial failed"),
                    RetryVerdict::GiveUp => warn!(%hash, %addr, error = %e, "giving up on peer"),
                }
                swarm.wake();
            }
        }
    }

    async fn connect(
        &self,
        swarm: &Swarm,
        addr: &PeerAddr,
    ) -> Result<Connection<BoxTransport>, DialError> {
        let stream = time::timeout(self.config.dial_timeout, self.dialer.dial(addr))
            .await
            .map_err(|_| DialError::Timeout)??;
        let local = swarm.shared.lock().state.local_bitfield().clone();
        let conn = self
            .handshaker
            .handshake(stream, &swarm.info, &local, Role::Initiator)
            .await?;
        Ok(conn)
    }

    /// Stop new work, let connections finish what they have in flight, then
    /// close whatever is left after the drain timeout.
    async fn drain(&self, swarm: &Arc<Swarm>) {
        let hash = swarm.hash();
        {
            let mut shared = swarm.shared.lock();
            shared.state.drain();
            for tx in shared.links.values() {
                let _ = tx.send(Command::Drain);
            }
        }
        info!(%hash, "draining swarm");
        let deadline = Instant::now() + self.config.drain_timeout;
        let mut forced = false;
        loop {
            {
                let shared = swarm.shared.lock();
                if shared.links.is_empty() && shared.pending == 0 {
                    break;
                }
                if !forced && Instant::now() >= deadline {
                    for tx in shared.links.values() {
                        let _ = tx.send(Command::Close);
                    }
                    forced = true;
                }
            }
            let now = Instant::now();
            let next = if forced {
                now + self.config.tick_interval
            } else {
                (now + self.config.tick_interval).min(deadline)
            };
            tokio::select! {
                _ = swarm.wake.notified() => {}
                _ = time::sleep_until(next) => {}
            }
        }
        // The swarm stays mapped (and Draining) until the upload area is gone,
        // so a new download for the hash cannot begin over it.
        let complete = swarm.shared.lock().state.is_complete();
        if !complete {
            if let Err(e) = self.store.blocking(move |s| s.abort_upload(&hash)).await {
                warn!(%hash, error = %e, "could not drop unfinished upload");
            }
        }
        self.remove_swarm(&mut self.swarms.lock(), swarm);
        if !matches!(swarm.outcome(), Some(Outcome::Completed(_)) | Some(Outcome::Failed(_))) {
            swarm.set_outcome(Outcome::Cancelled);
        }
        info!(%hash, "swarm closed");
    }

    /// All pieces are written: move the content into the cache and tell peers.
    pub(crate) async fn complete(&self, swarm: &Arc<Swarm>) {
        let hash = swarm.hash();
        let res = self
            .store
            .blocking(move |s| {
                s.complete_upload(&hash)?;
                s.promote(&hash)
            })
            .await;
        match res {
            Ok(_) => {
                info!(%hash, "swarm completed");
                self.events.emit(Event::SwarmCompleted { hash });
                swarm.set_outcome(Outcome::Completed(self.store.link_path(&hash)));
                let bitfield = swarm
                    .shared
                    .lock()
                    .state
                    .local_bitfield()
                    .as_bytes()
                    .to_vec();
                swarm.broadcast(&Message::BitfieldUpdate { bitfield });
            }
            Err(e) => self.fail(swarm, &e),
        }
    }

    /// Steady-state storage failure: the download ends with an error.
    pub(crate) fn fail(&self, swarm: &Swarm, e: &StoreError) {
        warn!(hash = %swarm.hash(), error = %e, "storage failure, abandoning swarm");
        swarm.set_outcome(Outcome::Failed(e.to_string()));
        swarm.cancel();
    }
}

/// Caller's view of one download.
pub struct DownloadHandle {
    hash: ContentHash,
    swarm: Option<Arc<Swarm>>,
    outcome: Option<watch::Receiver<Option<Outcome>>>,
    ready: Option<PathBuf>,
}

impl DownloadHandle {
    fn ready(hash: ContentHash, path: PathBuf) -> Self {
        Self {
            hash,
            swarm: None,
            outcome: None,
            ready: Some(path),
        }
    }

    fn attach(swarm: Arc<Swarm>) -> Self {
        Self {
            hash: swarm.hash(),
            outcome: Some(swarm.outcome.subscribe()),
            swarm: Some(swarm),
            ready: None,
        }
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    /// Resolve with the canonical path of the cached content, or with the
    /// single error that ended the download.
    pub async fn wait(&mut self) -> Result<PathBuf, SchedulerError> {
        let hash = self.hash;
        if let Some(path) = &self.ready {
            return Ok(path.clone());
        }
        let Some(rx) = self.outcome.as_mut() else {
            return Err(SchedulerError::Cancelled(hash));
        };
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        match outcome {
            Some(Outcome::Completed(path)) => Ok(path),
            Some(Outcome::Exhausted { given_up }) => {
                Err(SchedulerError::PeersExhausted { hash, given_up })
            }
            Some(Outcome::Failed(reason)) => Err(SchedulerError::StorageFailed { hash, reason }),
            Some(Outcome::Cancelled) | None => Err(SchedulerError::Cancelled(hash)),
        }
    }

    /// Drain and close the swarm. Other handles on the same content see
    /// `Cancelled` too.
    pub fn cancel(&self) {
        if let Some(swarm) = &self.swarm {
            swarm.cancel();
        }
    }

    /// More candidates for a running download; revives an exhausted one.
    pub fn add_peers(&self, peers: impl IntoIterator<Item = PeerAddr>) {
        if let Some(swarm) = &self.swarm {
            swarm.add_candidates(peers);
        }
    }
}
