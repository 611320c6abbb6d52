//! Flock protocol core.
//! Host-driven: no I/O; the host passes connection and piece events and
//! receives the requests, cancels and completion signals to act on.

pub mod admission;
pub mod backoff;
pub mod bitfield;
pub mod events;
pub mod identity;
pub mod integrity;
pub mod picker;
pub mod piece;
pub mod protocol;
pub mod swarm;
pub mod wire;

pub use admission::{Admission, AdmissionError, Permit};
pub use backoff::{BackoffPolicy, CandidateSet, RetryVerdict};
pub use bitfield::{Bitfield, BitfieldError};
pub use events::Event;
pub use identity::{ContentHash, PeerId};
pub use piece::{ContentInfo, InfoError};
pub use protocol::{Handshake, Message, PROTOCOL_MAGIC};
pub use swarm::{PieceClaim, PieceDone, SwarmConfig, SwarmError, SwarmPhase, SwarmState};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
