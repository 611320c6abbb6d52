//! Identities: per-node peer IDs and content hashes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of a peer ID in bytes.
pub const PEER_ID_LEN: usize = 20;

/// Length of a content hash in bytes (SHA-256).
pub const CONTENT_HASH_LEN: usize = 32;

/// Opaque node identifier. Generated once per node instance and compared by
/// exact byte equality. Serializes as a fixed-width byte tuple.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Generate a new random peer ID.
    pub fn generate() -> Self {
        PeerId(rand::random())
    }

    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

/// Identity of a content item: SHA-256 of its bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; CONTENT_HASH_LEN]);

impl ContentHash {
    /// Hash a complete blob.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentHash(hasher.finalize().into())
    }

    pub fn from_bytes(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        ContentHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.0
    }

    /// Lowercase hex form, used as the on-disk name.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self)
    }
}

impl FromStr for ContentHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ParseHashError::NotHex)?;
        let arr: [u8; CONTENT_HASH_LEN] = bytes
            .try_into()
            .map_err(|_| ParseHashError::BadLength)?;
        Ok(ContentHash(arr))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseHashError {
    #[error("content hash is not valid hex")]
    NotHex,
    #[error("content hash must be {} bytes", CONTENT_HASH_LEN)]
    BadLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_peer_ids_differ() {
        let a = PeerId::generate();
        let b = PeerId::generate();
        assert_ne!(a, b);
        assert_eq!(a, PeerId::from_bytes(*a.as_bytes()));
    }

    #[test]
    fn content_hash_hex_roundtrip() {
        let h = ContentHash::of(b"layer bytes");
        let parsed: ContentHash = h.to_hex().parse().unwrap();
        assert_eq!(parsed, h);
        assert_eq!(h.to_hex().len(), CONTENT_HASH_LEN * 2);
    }

    #[test]
    fn content_hash_rejects_bad_input() {
        assert!(matches!(
            "zz".parse::<ContentHash>(),
            Err(ParseHashError::NotHex)
        ));
        assert!(matches!(
            "abcd".parse::<ContentHash>(),
            Err(ParseHashError::BadLength)
        ));
    }
}
