//! Deadline-adapting stream.
//!
//! Every transport is wrapped in a `DeadlineStream` that always accepts read
//! and write deadlines. Transports that enforce deadlines themselves get them
//! passed through; for the rest (TCP under tokio, in-memory pipes) each read
//! and write is raced against a timer. Either way an expired deadline yields
//! `DeadlineExceeded` and the stream refuses all further operations.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// A byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    /// True if the transport enforces deadlines itself.
    fn supports_deadlines(&self) -> bool {
        false
    }

    fn set_read_deadline(&mut self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }

    fn set_write_deadline(&mut self, _deadline: Option<Instant>) -> io::Result<()> {
        Ok(())
    }
}

pub type BoxTransport = Box<dyn Transport>;

impl Transport for TcpStream {}

impl Transport for DuplexStream {}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn supports_deadlines(&self) -> bool {
        (**self).supports_deadlines()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        (**self).set_read_deadline(deadline)
    }

    fn set_write_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        (**self).set_write_deadline(deadline)
    }
}

/// How deadlines are enforced, fixed when the stream is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineMode {
    Native,
    Emulated,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("stream is no longer usable")]
    Unusable,
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    fn from_io(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::TimedOut {
            StreamError::DeadlineExceeded
        } else {
            StreamError::Io(e)
        }
    }
}

pub struct DeadlineStream<T> {
    inner: T,
    mode: DeadlineMode,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    usable: bool,
}

impl<T: Transport> DeadlineStream<T> {
    pub fn new(inner: T) -> Self {
        let mode = if inner.supports_deadlines() {
            DeadlineMode::Native
        } else {
            DeadlineMode::Emulated
        };
        Self {
            inner,
            mode,
            read_deadline: None,
            write_deadline: None,
            usable: true,
        }
    }

    pub fn mode(&self) -> DeadlineMode {
        self.mode
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) -> Result<(), StreamError> {
        self.set_read_deadline(deadline)?;
        self.set_write_deadline(deadline)
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) -> Result<(), StreamError> {
        self.read_deadline = deadline;
        if self.mode == DeadlineMode::Native {
            self.inner.set_read_deadline(deadline)?;
        }
        Ok(())
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) -> Result<(), StreamError> {
        self.write_deadline = deadline;
        if self.mode == DeadlineMode::Native {
            self.inner.set_write_deadline(deadline)?;
        }
        Ok(())
    }

    /// Read some bytes. Cancel-safe: dropping the future loses no data.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.check()?;
        let res = bounded(self.mode, self.read_deadline, self.inner.read(buf)).await;
        self.poison_on(res)
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), StreamError> {
        self.check()?;
        let res = bounded(self.mode, self.read_deadline, self.inner.read_exact(buf)).await;
        self.poison_on(res.map(|_| ()))
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), StreamError> {
        self.check()?;
        let mode = self.mode;
        let deadline = self.write_deadline;
        let inner = &mut self.inner;
        let res = bounded(mode, deadline, async move {
            inner.write_all(buf).await?;
            inner.flush().await
        })
        .await;
        self.poison_on(res)
    }

    /// Shut the write side down and refuse further use. Bounded by the write
    /// deadline when one is set; errors are ignored.
    pub async fn shutdown(&mut self) {
        if self.usable {
            let _ = bounded(self.mode, self.write_deadline, self.inner.shutdown()).await;
        }
        self.usable = false;
    }

    fn check(&self) -> Result<(), StreamError> {
        if self.usable {
            Ok(())
        } else {
            Err(StreamError::Unusable)
        }
    }

    fn poison_on<R>(&mut self, res: Result<R, StreamError>) -> Result<R, StreamError> {
        if res.is_err() {
            self.usable = false;
        }
        res
    }
}

async fn bounded<R>(
    mode: DeadlineMode,
    deadline: Option<Instant>,
    fut: impl Future<Output = io::Result<R>>,
) -> Result<R, StreamError> {
    match (mode, deadline) {
        (DeadlineMode::Emulated, Some(deadline)) => {
            match tokio::time::timeout_at(deadline, fut).await {
                Ok(res) => res.map_err(StreamError::from_io),
                Err(_) => Err(StreamError::DeadlineExceeded),
            }
        }
        _ => fut.await.map_err(StreamError::from_io),
    }
}
