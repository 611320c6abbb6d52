//! Content metadata: split a blob into fixed-size pieces and describe it.

use serde::{Deserialize, Serialize};

use crate::identity::ContentHash;
use crate::integrity::{self, PieceSum};

/// Default piece length in bytes.
pub const DEFAULT_PIECE_LENGTH: u64 = 4 * 1024 * 1024; // 4 MiB

/// Immutable description of a shareable item.
/// Piece count is always `ceil(length / piece_length)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentInfo {
    hash: ContentHash,
    length: u64,
    piece_length: u64,
    piece_sums: Vec<PieceSum>,
}

impl ContentInfo {
    /// Build from parts produced by a metadata parser.
    pub fn new(
        hash: ContentHash,
        length: u64,
        piece_length: u64,
        piece_sums: Vec<PieceSum>,
    ) -> Result<Self, InfoError> {
        if piece_length == 0 {
            return Err(InfoError::ZeroPieceLength);
        }
        let expected = piece_count(length, piece_length);
        if expected > u64::from(u32::MAX) {
            return Err(InfoError::TooManyPieces);
        }
        if piece_sums.len() as u64 != expected {
            return Err(InfoError::PieceSumMismatch {
                expected,
                got: piece_sums.len(),
            });
        }
        Ok(Self {
            hash,
            length,
            piece_length,
            piece_sums,
        })
    }

    /// Describe a complete in-memory blob. A zero `piece_length` uses the default.
    pub fn from_blob(data: &[u8], piece_length: u64) -> Result<Self, InfoError> {
        let piece_length = if piece_length == 0 {
            DEFAULT_PIECE_LENGTH
        } else {
            piece_length
        };
        let sums = data
            .chunks(piece_length as usize)
            .map(integrity::piece_sum)
            .collect();
        Self::new(ContentHash::of(data), data.len() as u64, piece_length, sums)
    }

    pub fn hash(&self) -> ContentHash {
        self.hash
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn num_pieces(&self) -> u32 {
        self.piece_sums.len() as u32
    }

    /// Byte range `[start, end)` of a piece, or None if out of range.
    pub fn piece_range(&self, index: u32) -> Option<(u64, u64)> {
        if index >= self.num_pieces() {
            return None;
        }
        let start = u64::from(index) * self.piece_length;
        let end = (start + self.piece_length).min(self.length);
        Some((start, end))
    }

    /// Length of a given piece; the last piece may be short.
    pub fn piece_len(&self, index: u32) -> Option<u64> {
        self.piece_range(index).map(|(s, e)| e - s)
    }

    /// Check a received payload against its recorded digest and length.
    pub fn verify_piece(&self, index: u32, payload: &[u8]) -> bool {
        match (self.piece_len(index), self.piece_sums.get(index as usize)) {
            (Some(len), Some(sum)) => {
                payload.len() as u64 == len && integrity::piece_matches(payload, sum)
            }
            _ => false,
        }
    }
}

/// `ceil(length / piece_length)`.
pub fn piece_count(length: u64, piece_length: u64) -> u64 {
    if piece_length == 0 {
        return 0;
    }
    length.div_ceil(piece_length)
}

#[derive(Debug, thiserror::Error)]
pub enum InfoError {
    #[error("piece length must be non-zero")]
    ZeroPieceLength,
    #[error("content has more pieces than fit in a u32 index")]
    TooManyPieces,
    #[error("expected {expected} piece sums, got {got}")]
    PieceSumMismatch { expected: u64, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn piece_count_rounds_up() {
        assert_eq!(piece_count(100, 30), 4);
        assert_eq!(piece_count(90, 30), 3);
        assert_eq!(piece_count(10, 100), 1);
        assert_eq!(piece_count(0, 30), 0);
    }

    #[test]
    fn ranges_cover_blob() {
        let data: Vec<u8> = (0..100u8).collect();
        let info = ContentInfo::from_blob(&data, 30).unwrap();
        assert_eq!(info.num_pieces(), 4);
        assert_eq!(info.piece_range(0), Some((0, 30)));
        assert_eq!(info.piece_range(3), Some((90, 100)));
        assert_eq!(info.piece_len(3), Some(10));
        assert_eq!(info.piece_range(4), None);
    }

    #[test]
    fn zero_piece_length_uses_default() {
        let data = vec![7u8; 10];
        let info = ContentInfo::from_blob(&data, 0).unwrap();
        assert_eq!(info.piece_length(), DEFAULT_PIECE_LENGTH);
        assert_eq!(info.num_pieces(), 1);
    }

    #[test]
    fn verify_checks_digest_and_length() {
        let data: Vec<u8> = (0..64u8).collect();
        let info = ContentInfo::from_blob(&data, 16).unwrap();
        assert!(info.verify_piece(1, &data[16..32]));
        assert!(!info.verify_piece(1, &data[0..16]));
        assert!(!info.verify_piece(1, &data[16..31]));
        assert!(!info.verify_piece(9, &data[16..32]));
    }

    #[test]
    fn new_rejects_wrong_sum_count() {
        let h = ContentHash::of(b"x");
        assert!(matches!(
            ContentInfo::new(h, 100, 30, vec![[0u8; 32]; 3]),
            Err(InfoError::PieceSumMismatch { expected: 4, got: 3 })
        ));
        assert!(matches!(
            ContentInfo::new(h, 100, 0, vec![]),
            Err(InfoError::ZeroPieceLength)
        ));
    }
}
