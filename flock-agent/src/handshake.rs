//! Handshaker: establishes a validated connection over a raw transport.
//!
//! The initiator speaks first and the responder only replies after it has
//! validated the initiator's hello, so both roles work over pipes without
//! independent read/write buffering. The whole exchange shares one deadline.

use flock_core::wire::{self, LEN_SIZE, MAX_HANDSHAKE_LEN};
use flock_core::{Bitfield, ContentHash, ContentInfo, Event, Handshake, PeerId, PROTOCOL_MAGIC};
use tokio::time::Instant;

use crate::conn::{ConnConfig, Connection};
use crate::events::EventProducer;
use crate::stream::{DeadlineStream, StreamError, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("bad protocol magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("content mismatch: expected {expected}, got {got}")]
    ContentMismatch { expected: ContentHash, got: ContentHash },
    #[error("unknown content {0}")]
    UnknownContent(ContentHash),
    #[error("connected to self")]
    SelfConnection,
    #[error("malformed handshake: {0}")]
    Malformed(String),
    #[error("handshake deadline exceeded")]
    DeadlineExceeded,
    #[error("stream: {0}")]
    Stream(StreamError),
}

impl From<StreamError> for HandshakeError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::DeadlineExceeded => HandshakeError::DeadlineExceeded,
            other => HandshakeError::Stream(other),
        }
    }
}

/// What the remote side told us, for rejection records.
#[derive(Default)]
struct Seen {
    hash: Option<ContentHash>,
    peer: Option<PeerId>,
}

impl Seen {
    fn record(&mut self, hello: &Handshake) {
        self.hash = Some(hello.content_hash);
        self.peer = Some(hello.peer_id);
    }
}

struct Agreed {
    info: ContentInfo,
    local: Bitfield,
    peer: PeerId,
    remote: Bitfield,
}

#[derive(Clone)]
pub struct Handshaker {
    config: ConnConfig,
    local_peer: PeerId,
    events: EventProducer,
}

impl Handshaker {
    pub fn new(config: ConnConfig, local_peer: PeerId, events: EventProducer) -> Self {
        Self {
            config,
            local_peer,
            events,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Handshake for a known content item. A responder rejects any other hash
    /// with `ContentMismatch`.
    pub async fn handshake<T: Transport>(
        &self,
        stream: T,
        info: &ContentInfo,
        local_bitfield: &Bitfield,
        role: Role,
    ) -> Result<Connection<T>, HandshakeError> {
        let mut stream = DeadlineStream::new(stream);
        let mut seen = Seen::default();
        let res = match stream.set_deadline(Some(self.deadline())) {
            Ok(()) => match role {
                Role::Initiator => self.initiate(&mut stream, info, local_bitfield, &mut seen).await,
                Role::Responder => {
                    let expected = info.hash();
                    let resolve = |got: &ContentHash| {
                        if *got == expected {
                            Ok((info.clone(), local_bitfield.clone()))
                        } else {
                            Err(HandshakeError::ContentMismatch {
                                expected,
                                got: *got,
                            })
                        }
                    };
                    self.respond(&mut stream, resolve, &mut seen).await
                }
            },
            Err(e) => Err(e.into()),
        };
        self.finish(stream, res, seen).await
    }

    /// Responder side for a listener: the content is chosen by the
    /// initiator's hash. `lookup` returns the content and local bitfield when
    /// this node serves or wants that hash.
    pub async fn accept<T, F>(&self, stream: T, lookup: F) -> Result<Connection<T>, HandshakeError>
    where
        T: Transport,
        F: FnOnce(&ContentHash) -> Option<(ContentInfo, Bitfield)>,
    {
        let mut stream = DeadlineStream::new(stream);
        let mut seen = Seen::default();
        let resolve = |hash: &ContentHash| lookup(hash).ok_or(HandshakeError::UnknownContent(*hash));
        let res = match stream.set_deadline(Some(self.deadline())) {
            Ok(()) => self.respond(&mut stream, resolve, &mut seen).await,
            Err(e) => Err(e.into()),
        };
        self.finish(stream, res, seen).await
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.handshake_timeout
    }

    async fn initiate<T: Transport>(
        &self,
        stream: &mut DeadlineStream<T>,
        info: &ContentInfo,
        local: &Bitfield,
        seen: &mut Seen,
    ) -> Result<Agreed, HandshakeError> {
        self.send_hello(stream, info.hash(), local).await?;
        let hello = read_hello(stream).await?;
        seen.record(&hello);
        check_magic(&hello)?;
        if hello.content_hash != info.hash() {
            return Err(HandshakeError::ContentMismatch {
                expected: info.hash(),
                got: hello.content_hash,
            });
        }
        let peer = self.check_peer(&hello)?;
        let remote = remote_bitfield(&hello, info)?;
        Ok(Agreed {
            info: info.clone(),
            local: local.clone(),
            peer,
            remote,
        })
    }

    async fn respond<T, F>(
        &self,
        stream: &mut DeadlineStream<T>,
        resolve: F,
        seen: &mut Seen,
    ) -> Result<Agreed, HandshakeError>
    where
        T: Transport,
        F: FnOnce(&ContentHash) -> Result<(ContentInfo, Bitfield), HandshakeError>,
    {
        let hello = read_hello(stream).await?;
        seen.record(&hello);
        check_magic(&hello)?;
        let (info, local) = resolve(&hello.content_hash)?;
        let peer = self.check_peer(&hello)?;
        let remote = remote_bitfield(&hello, &info)?;
        self.send_hello(stream, info.hash(), &local).await?;
        Ok(Agreed {
            info,
            local,
            peer,
            remote,
        })
    }

    async fn send_hello<T: Transport>(
        &self,
        stream: &mut DeadlineStream<T>,
        hash: ContentHash,
        local: &Bitfield,
    ) -> Result<(), HandshakeError> {
        let hello = Handshake::new(hash, self.local_peer, local.as_bytes());
        let frame = wire::encode_handshake(&hello)
            .map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        stream.write_all(&frame).await?;
        Ok(())
    }

    fn check_peer(&self, hello: &Handshake) -> Result<PeerId, HandshakeError> {
        if hello.peer_id == self.local_peer {
            return Err(HandshakeError::SelfConnection);
        }
        Ok(hello.peer_id)
    }

    async fn finish<T: Transport>(
        &self,
        mut stream: DeadlineStream<T>,
        res: Result<Agreed, HandshakeError>,
        seen: Seen,
    ) -> Result<Connection<T>, HandshakeError> {
        let agreed = match res.and_then(|a| {
            stream.set_deadline(None)?;
            Ok(a)
        }) {
            Ok(a) => a,
            Err(e) => {
                stream.shutdown().await;
                tracing::debug!(peer = ?seen.peer, hash = ?seen.hash, error = %e, "handshake rejected");
                self.events.emit(Event::HandshakeRejected {
                    hash: seen.hash,
                    peer: seen.peer,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        Ok(Connection::new(
            stream,
            agreed.peer,
            agreed.info,
            agreed.local,
            agreed.remote,
            self.config,
        ))
    }
}

async fn read_hello<T: Transport>(stream: &mut DeadlineStream<T>) -> Result<Handshake, HandshakeError> {
    let mut buf = vec![0u8; LEN_SIZE];
    stream.read_exact(&mut buf).await?;
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_HANDSHAKE_LEN {
        return Err(HandshakeError::Malformed(format!("handshake of {len} bytes")));
    }
    buf.resize(LEN_SIZE + len as usize, 0);
    stream.read_exact(&mut buf[LEN_SIZE..]).await?;
    let (hello, _) =
        wire::decode_handshake(&buf).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
    Ok(hello)
}

fn check_magic(hello: &Handshake) -> Result<(), HandshakeError> {
    if hello.magic != PROTOCOL_MAGIC {
        return Err(HandshakeError::BadMagic(hello.magic));
    }
    Ok(())
}

fn remote_bitfield(hello: &Handshake, info: &ContentInfo) -> Result<Bitfield, HandshakeError> {
    Bitfield::from_bytes(&hello.bitfield, info.num_pieces())
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
}
