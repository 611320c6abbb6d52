//! Flock node agent: owns sockets, files and timers around `flock-core`.

pub mod config;
pub mod conn;
pub mod events;
pub mod handshake;
pub mod logging;
mod peer;
pub mod scheduler;
pub mod store;
pub mod stream;
pub mod transport;

pub use config::Config;
pub use conn::{ConnConfig, ConnError, Connection};
pub use events::EventProducer;
pub use handshake::{HandshakeError, Handshaker, Role};
pub use scheduler::{Dialer, DownloadHandle, PeerAddr, Scheduler, SchedulerConfig, SchedulerError};
pub use store::{Stage, StoreError, StoreLayout, StoreManager};
pub use stream::{BoxTransport, DeadlineStream, StreamError, Transport};
