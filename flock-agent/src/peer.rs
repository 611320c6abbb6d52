//! Per-connection task: exchanges pieces with one peer for one swarm.

use std::sync::Arc;

use flock_core::{Bitfield, BitfieldError, Event, Message, PieceClaim, SwarmError};
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::conn::{ConnError, Connection};
use crate::scheduler::{Inner, Swarm};
use crate::store::StoreError;
use crate::stream::BoxTransport;

/// Instructions from the scheduler to a connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Message),
    /// Stop requesting; close once nothing is outstanding.
    Drain,
    Close,
}

#[derive(Debug, thiserror::Error)]
enum PeerError {
    #[error(transparent)]
    Conn(#[from] ConnError),
    #[error("bad bitfield update: {0}")]
    Bitfield(#[from] BitfieldError),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error("too many corrupt pieces")]
    Untrusted,
    #[error("no traffic for {0:?}")]
    Idle(Duration),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
}

/// Why a connection task ended.
pub(crate) struct Exit {
    pub(crate) reason: String,
    /// Ended by an error rather than by us.
    pub(crate) failed: bool,
}

pub(crate) async fn run(
    inner: &Arc<Inner>,
    swarm: &Arc<Swarm>,
    conn: &mut Connection<BoxTransport>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    stale: bool,
) -> Exit {
    match exchange(inner, swarm, conn, &mut rx, stale).await {
        Ok(reason) => Exit {
            reason: reason.to_owned(),
            failed: false,
        },
        Err(e) => Exit {
            reason: e.to_string(),
            failed: true,
        },
    }
}

async fn exchange(
    inner: &Arc<Inner>,
    swarm: &Arc<Swarm>,
    conn: &mut Connection<BoxTransport>,
    rx: &mut mpsc::UnboundedReceiver<Command>,
    stale: bool,
) -> Result<&'static str, PeerError> {
    let config = *conn.config();
    if stale {
        let bitfield = local_bitfield_bytes(swarm);
        conn.send(&Message::BitfieldUpdate { bitfield }).await?;
    }
    request_more(swarm, conn).await?;

    let mut draining = false;
    let mut ticker = time::interval(inner.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        if let Some(reason) = finished(swarm, conn, draining) {
            return Ok(reason);
        }
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Send(msg)) => conn.send(&msg).await?,
                Some(Command::Drain) => draining = true,
                Some(Command::Close) | None => return Ok("closed by scheduler"),
            },
            msg = conn.receive() => {
                let msg = msg?;
                trace!(peer = %conn.peer_id(), kind = msg.kind(), "received");
                handle(inner, swarm, conn, msg).await?;
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                if now.duration_since(conn.last_received()) >= config.idle_timeout {
                    return Err(PeerError::Idle(config.idle_timeout));
                }
                if now.duration_since(conn.last_sent()) >= config.keepalive_interval {
                    conn.send(&Message::Keepalive).await?;
                }
                // Picks up stalled pieces once they pass the stall timeout.
                request_more(swarm, conn).await?;
            }
        }
    }
}

/// A clean reason to stop, if there is one.
fn finished(swarm: &Swarm, conn: &Connection<BoxTransport>, draining: bool) -> Option<&'static str> {
    let peer = conn.peer_id();
    let shared = swarm.shared.lock();
    if draining && shared.state.outstanding(&peer) == 0 {
        return Some("drained");
    }
    let remote_full = shared
        .state
        .peer_bitfield(&peer)
        .is_some_and(Bitfield::is_full);
    if shared.state.is_complete() && remote_full {
        return Some("both sides complete");
    }
    None
}

async fn handle(
    inner: &Arc<Inner>,
    swarm: &Arc<Swarm>,
    conn: &mut Connection<BoxTransport>,
    msg: Message,
) -> Result<(), PeerError> {
    let peer = conn.peer_id();
    let hash = swarm.hash();
    match msg {
        // Requests are answered as they arrive, so there is nothing to cancel.
        Message::Keepalive | Message::Cancel { .. } => Ok(()),
        Message::BitfieldUpdate { bitfield } => {
            let bitfield = Bitfield::from_bytes(&bitfield, swarm.info.num_pieces())?;
            let added = swarm
                .shared
                .lock()
                .state
                .update_peer_bitfield(&peer, &bitfield)?;
            if !added.is_empty() {
                debug!(%hash, %peer, new = added.len(), "peer announced pieces");
                request_more(swarm, conn).await?;
            }
            Ok(())
        }
        Message::PieceRequest { index } => {
            let have = swarm.shared.lock().state.local_bitfield().has(index);
            if !have {
                debug!(%hash, %peer, piece = index, "request for a piece we lack");
                return Ok(());
            }
            let payload = inner
                .store
                .blocking(move |s| s.read_piece(&hash, index))
                .await?;
            conn.send(&Message::PieceData { index, payload }).await?;
            Ok(())
        }
        Message::PieceData { index, payload } => {
            receive_piece(inner, swarm, conn, index, payload).await?;
            request_more(swarm, conn).await
        }
    }
}

async fn receive_piece(
    inner: &Arc<Inner>,
    swarm: &Arc<Swarm>,
    conn: &mut Connection<BoxTransport>,
    index: u32,
    payload: Vec<u8>,
) -> Result<(), PeerError> {
    let peer = conn.peer_id();
    let hash = swarm.hash();
    if !swarm.info.verify_piece(index, &payload) {
        warn!(%hash, %peer, piece = index, "piece failed verification");
        let untrusted = swarm.shared.lock().state.record_corrupt(&peer, index);
        if untrusted {
            return Err(PeerError::Untrusted);
        }
        return Ok(());
    }
    let claim = swarm.shared.lock().state.claim_piece(&peer, index);
    if claim != PieceClaim::Write {
        debug!(%hash, %peer, piece = index, ?claim, "discarding duplicate piece");
        return Ok(());
    }
    let written = inner
        .store
        .blocking(move |s| s.write_piece(&hash, index, &payload))
        .await;
    if let Err(e) = written {
        swarm.shared.lock().state.piece_failed(index);
        inner.fail(swarm, &e);
        return Err(e.into());
    }
    let done = {
        let mut shared = swarm.shared.lock();
        let done = shared.state.piece_written(index);
        for other in done.cancel.iter().filter(|p| **p != peer) {
            if let Some(tx) = shared.links.get(other) {
                let _ = tx.send(Command::Send(Message::Cancel { index }));
            }
        }
        done
    };
    trace!(%hash, %peer, piece = index, "piece written");
    inner.events.emit(Event::PieceReceived { hash, peer, index });
    if done.completed {
        inner.complete(swarm).await;
    }
    Ok(())
}

async fn request_more(swarm: &Swarm, conn: &mut Connection<BoxTransport>) -> Result<(), PeerError> {
    let picks = swarm
        .shared
        .lock()
        .state
        .next_requests(&conn.peer_id(), Instant::now().into_std());
    for index in picks {
        conn.send(&Message::PieceRequest { index }).await?;
    }
    Ok(())
}

fn local_bitfield_bytes(swarm: &Swarm) -> Vec<u8> {
    swarm.shared.lock().state.local_bitfield().as_bytes().to_vec()
}
