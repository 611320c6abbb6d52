//! Connection: framed, bidirectional message channel bound to one peer and
//! one content item.

use std::time::Duration;

use flock_core::wire::{self, MAX_FRAME_LEN};
use flock_core::{Bitfield, ContentHash, ContentInfo, FrameDecodeError, FrameEncodeError, Message, PeerId};
use tokio::time::Instant;

use crate::stream::{DeadlineStream, StreamError, Transport};

const READ_CHUNK: usize = 64 * 1024;

/// Timeouts and limits for handshakes and established connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnConfig {
    /// Bound on the whole handshake exchange.
    pub handshake_timeout: Duration,
    /// Bound on waiting for one complete message.
    pub read_timeout: Duration,
    /// Bound on writing one message.
    pub write_timeout: Duration,
    /// Send a keepalive after this long without outbound traffic.
    pub keepalive_interval: Duration,
    /// Close after this long without inbound traffic.
    pub idle_timeout: Duration,
    pub max_frame_len: u32,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_frame_len: MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// An operation failed; only `close` remains useful.
    Closing,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("transport reset: {0}")]
    Reset(#[source] std::io::Error),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("protocol violation: {0}")]
    Protocol(#[from] FrameDecodeError),
    #[error("cannot encode message: {0}")]
    Encode(#[from] FrameEncodeError),
    #[error("connection is closed")]
    Closed,
}

impl From<StreamError> for ConnError {
    fn from(e: StreamError) -> Self {
        match e {
            StreamError::DeadlineExceeded => ConnError::DeadlineExceeded,
            StreamError::Unusable => ConnError::Closed,
            StreamError::Io(e) => ConnError::Reset(e),
        }
    }
}

pub struct Connection<T> {
    stream: Option<DeadlineStream<T>>,
    peer_id: PeerId,
    info: ContentInfo,
    local_bitfield: Bitfield,
    remote_bitfield: Bitfield,
    state: ConnState,
    config: ConnConfig,
    read_buf: Vec<u8>,
    scratch: Box<[u8]>,
    last_received: Instant,
    last_sent: Instant,
}

impl<T: Transport> Connection<T> {
    /// Built by the handshaker once both sides agreed on the content.
    pub(crate) fn new(
        stream: DeadlineStream<T>,
        peer_id: PeerId,
        info: ContentInfo,
        local_bitfield: Bitfield,
        remote_bitfield: Bitfield,
        config: ConnConfig,
    ) -> Self {
        let now = Instant::now();
        Self {
            stream: Some(stream),
            peer_id,
            info,
            local_bitfield,
            remote_bitfield,
            state: ConnState::Open,
            config,
            read_buf: Vec::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            last_received: now,
            last_sent: now,
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn info(&self) -> &ContentInfo {
        &self.info
    }

    pub fn hash(&self) -> ContentHash {
        self.info.hash()
    }

    /// Local bitfield as sent during the handshake.
    pub fn local_bitfield(&self) -> &Bitfield {
        &self.local_bitfield
    }

    /// Remote bitfield as received during the handshake.
    pub fn remote_bitfield(&self) -> &Bitfield {
        &self.remote_bitfield
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn last_sent(&self) -> Instant {
        self.last_sent
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Send one message within the write timeout.
    pub async fn send(&mut self, msg: &Message) -> Result<(), ConnError> {
        let frame = wire::encode_frame(msg)?;
        let res = self.write_frame(&frame).await;
        self.settle(res)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), ConnError> {
        let write_timeout = self.config.write_timeout;
        let stream = self.open_stream()?;
        stream.set_write_deadline(Some(Instant::now() + write_timeout))?;
        stream.write_all(frame).await?;
        Ok(())
    }

    /// Receive the next message, waiting at most the read timeout.
    /// Cancel-safe: partial frames stay buffered for the next call.
    pub async fn receive(&mut self) -> Result<Message, ConnError> {
        let res = self.read_message().await;
        let msg = self.settle(res)?;
        self.last_received = Instant::now();
        Ok(msg)
    }

    async fn read_message(&mut self) -> Result<Message, ConnError> {
        let deadline = Instant::now() + self.config.read_timeout;
        let max_frame_len = self.config.max_frame_len;
        loop {
            match wire::decode_frame(&self.read_buf, max_frame_len) {
                Ok((msg, n)) => {
                    self.read_buf.drain(..n);
                    return Ok(msg);
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(e) => return Err(e.into()),
            }
            if self.state != ConnState::Open {
                return Err(ConnError::Closed);
            }
            let stream = self.stream.as_mut().ok_or(ConnError::Closed)?;
            stream.set_read_deadline(Some(deadline))?;
            let n = stream.read(&mut self.scratch).await?;
            if n == 0 {
                return Err(ConnError::PeerClosed);
            }
            self.read_buf.extend_from_slice(&self.scratch[..n]);
        }
    }

    fn open_stream(&mut self) -> Result<&mut DeadlineStream<T>, ConnError> {
        if self.state != ConnState::Open {
            return Err(ConnError::Closed);
        }
        self.stream.as_mut().ok_or(ConnError::Closed)
    }

    /// Any failure moves an open connection to `Closing`; it is never retried here.
    fn settle<R>(&mut self, res: Result<R, ConnError>) -> Result<R, ConnError> {
        if res.is_err() && self.state == ConnState::Open {
            self.state = ConnState::Closing;
        }
        res
    }

    /// Release the stream. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.set_write_deadline(Some(Instant::now() + self.config.write_timeout));
            stream.shutdown().await;
        }
        self.state = ConnState::Closed;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::events::EventProducer;
    use crate::handshake::{Handshaker, Role};
    use tokio::io::DuplexStream;

    pub(crate) fn sample_info() -> ContentInfo {
        let data: Vec<u8> = (0..40u8).collect();
        ContentInfo::from_blob(&data, 16).unwrap()
    }

    /// Both ends of a live connection over an in-memory pipe.
    pub(crate) async fn pipe_pair(
        config: ConnConfig,
        info: &ContentInfo,
    ) -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = tokio::io::duplex(1 << 20);
        let local = Handshaker::new(config, PeerId::generate(), EventProducer::noop());
        let remote = Handshaker::new(config, PeerId::generate(), EventProducer::noop());
        let empty = Bitfield::new(info.num_pieces());
        let (l, r) = tokio::join!(
            local.handshake(a, info, &empty, Role::Initiator),
            remote.handshake(b, info, &empty, Role::Responder),
        );
        (l.unwrap(), r.unwrap())
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let info = sample_info();
        let (mut a, mut b) = pipe_pair(ConnConfig::default(), &info).await;
        a.send(&Message::PieceRequest { index: 1 }).await.unwrap();
        a.send(&Message::Keepalive).await.unwrap();
        a.send(&Message::PieceData {
            index: 1,
            payload: vec![3; 16],
        })
        .await
        .unwrap();
        assert_eq!(b.receive().await.unwrap(), Message::PieceRequest { index: 1 });
        assert_eq!(b.receive().await.unwrap(), Message::Keepalive);
        assert_eq!(
            b.receive().await.unwrap(),
            Message::PieceData {
                index: 1,
                payload: vec![3; 16]
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn receive_deadline_marks_closing() {
        let info = sample_info();
        let config = ConnConfig {
            read_timeout: Duration::from_millis(300),
            ..ConnConfig::default()
        };
        let (mut a, _b) = pipe_pair(config, &info).await;
        assert!(matches!(a.receive().await, Err(ConnError::DeadlineExceeded)));
        assert_eq!(a.state(), ConnState::Closing);
        assert!(matches!(
            a.send(&Message::Keepalive).await,
            Err(ConnError::Closed)
        ));
        a.close().await;
        assert_eq!(a.state(), ConnState::Closed);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_peer_sees_eof() {
        let info = sample_info();
        let (mut a, mut b) = pipe_pair(ConnConfig::default(), &info).await;
        a.close().await;
        a.close().await;
        assert_eq!(a.state(), ConnState::Closed);
        assert!(matches!(a.receive().await, Err(ConnError::Closed)));
        assert!(matches!(b.receive().await, Err(ConnError::PeerClosed)));
        assert_eq!(b.state(), ConnState::Closing);
    }

    #[tokio::test]
    async fn framing_violation_is_protocol_error() {
        use tokio::io::AsyncWriteExt;
        let (mut raw, other) = tokio::io::duplex(1024);
        let info = sample_info();
        let mut conn = Connection::new(
            DeadlineStream::new(other),
            PeerId::generate(),
            info.clone(),
            Bitfield::new(info.num_pieces()),
            Bitfield::new(info.num_pieces()),
            ConnConfig::default(),
        );
        raw.write_all(&[1, 0, 0, 0, 0xee]).await.unwrap();
        assert!(matches!(
            conn.receive().await,
            Err(ConnError::Protocol(FrameDecodeError::UnknownTag(0xee)))
        ));
        assert_eq!(conn.state(), ConnState::Closing);
    }
}
