//! Transports: TCP for real peers, an in-process network of duplex pipes
//! for tests and same-process nodes.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::scheduler::{Dialer, PeerAddr, Scheduler};
use crate::stream::BoxTransport;

/// Buffer size of each direction of an in-memory pipe.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Dials `host:port` over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &PeerAddr) -> io::Result<BoxTransport> {
        let stream = TcpStream::connect(addr.as_str()).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Accept TCP connections and hand each to the scheduler in its own task.
pub async fn run_listener(listener: TcpListener, scheduler: Scheduler) -> io::Result<()> {
    info!(addr = %listener.local_addr()?, "listening for peers");
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(%remote, error = %e, "set_nodelay failed");
                }
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    scheduler.accept(Box::new(stream)).await;
                });
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

/// In-process network: named listeners reachable by `PeerAddr`.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    nodes: Arc<Mutex<HashMap<PeerAddr, mpsc::UnboundedSender<DuplexStream>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `addr`. A later `listen` on the same address replaces it.
    pub fn listen(&self, addr: impl Into<PeerAddr>) -> MemoryListener {
        let (tx, rx) = mpsc::unbounded_channel();
        self.nodes.lock().insert(addr.into(), tx);
        MemoryListener { rx }
    }

    pub fn unlisten(&self, addr: &PeerAddr) {
        self.nodes.lock().remove(addr);
    }
}

#[async_trait]
impl Dialer for MemoryNetwork {
    async fn dial(&self, addr: &PeerAddr) -> io::Result<BoxTransport> {
        let refused = || io::Error::new(io::ErrorKind::ConnectionRefused, format!("{addr} is not listening"));
        let tx = self.nodes.lock().get(addr).cloned().ok_or_else(refused)?;
        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        tx.send(remote).map_err(|_| refused())?;
        Ok(Box::new(local))
    }
}

pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<DuplexStream>,
}

impl MemoryListener {
    /// Next inbound pipe; `None` once the address is unregistered.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

/// Memory counterpart of `run_listener`.
pub async fn run_memory_listener(mut listener: MemoryListener, scheduler: Scheduler) {
    while let Some(stream) = listener.accept().await {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            scheduler.accept(Box::new(stream)).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_dial_reaches_listener() {
        let net = MemoryNetwork::new();
        let mut listener = net.listen("node-a");
        let mut out = net.dial(&"node-a".into()).await.unwrap();
        let mut inbound = listener.accept().await.unwrap();
        out.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn memory_dial_to_unknown_is_refused() {
        let net = MemoryNetwork::new();
        let err = net.dial(&"ghost".into()).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);

        let listener = net.listen("gone");
        drop(listener);
        let err = net.dial(&"gone".into()).await.err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn tcp_dialer_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = PeerAddr::from(listener.local_addr().unwrap());
        let (dialed, accepted) = tokio::join!(TcpDialer.dial(&addr), listener.accept());
        let mut dialed = dialed.unwrap();
        let (mut accepted, _) = accepted.unwrap();
        dialed.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }
}
