//! Piece ownership set with a fixed length. Bits are only ever set.

/// Ordered set of owned piece indices. Length is fixed at creation; the wire
/// form is MSB-first bytes with spare trailing bits zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: u32,
    count: u32,
}

impl Bitfield {
    /// Empty bitfield for `len` pieces.
    pub fn new(len: u32) -> Self {
        Self {
            bits: vec![0u8; byte_len(len)],
            len,
            count: 0,
        }
    }

    /// Bitfield with every piece set.
    pub fn full(len: u32) -> Self {
        let mut b = Self::new(len);
        for i in 0..len {
            b.set(i);
        }
        b
    }

    /// Parse the wire form. Byte length must match `len` and spare bits must be zero.
    pub fn from_bytes(bytes: &[u8], len: u32) -> Result<Self, BitfieldError> {
        if bytes.len() != byte_len(len) {
            return Err(BitfieldError::Length {
                expected: byte_len(len),
                got: bytes.len(),
            });
        }
        let spare = (byte_len(len) * 8) as u32 - len;
        if spare > 0 {
            let mask = (1u8 << spare) - 1;
            if bytes[bytes.len() - 1] & mask != 0 {
                return Err(BitfieldError::SpareBits);
            }
        }
        let count = bytes.iter().map(|b| b.count_ones()).sum();
        Ok(Self {
            bits: bytes.to_vec(),
            len,
            count,
        })
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of set bits.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_full(&self) -> bool {
        self.count == self.len
    }

    pub fn has(&self, index: u32) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }

    /// Set a bit. Returns true if it was newly set; out-of-range indices are ignored.
    pub fn set(&mut self, index: u32) -> bool {
        if index >= self.len || self.has(index) {
            return false;
        }
        self.bits[(index / 8) as usize] |= 0x80 >> (index % 8);
        self.count += 1;
        true
    }

    /// Set every bit present in `other`. Returns the indices newly set.
    pub fn union_with(&mut self, other: &Bitfield) -> Vec<u32> {
        other.iter_set().filter(|&i| self.set(i)).collect()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    pub fn iter_set(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| self.has(i))
    }

    pub fn iter_missing(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.len).filter(move |&i| !self.has(i))
    }
}

fn byte_len(len: u32) -> usize {
    (len as usize).div_ceil(8)
}

#[derive(Debug, thiserror::Error)]
pub enum BitfieldError {
    #[error("bitfield has {got} bytes, expected {expected}")]
    Length { expected: usize, got: usize },
    #[error("bitfield has spare bits set")]
    SpareBits,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_monotonic() {
        let mut b = Bitfield::new(10);
        assert!(b.is_empty());
        assert!(b.set(3));
        assert!(!b.set(3));
        assert!(!b.set(10));
        assert!(b.has(3));
        assert_eq!(b.count(), 1);
        assert_eq!(b.len(), 10);
    }

    #[test]
    fn wire_form_is_msb_first() {
        let mut b = Bitfield::new(10);
        b.set(0);
        b.set(9);
        assert_eq!(b.as_bytes(), &[0x80, 0x40]);
        let parsed = Bitfield::from_bytes(b.as_bytes(), 10).unwrap();
        assert_eq!(parsed, b);
    }

    #[test]
    fn from_bytes_validates() {
        assert!(matches!(
            Bitfield::from_bytes(&[0, 0, 0], 10),
            Err(BitfieldError::Length { .. })
        ));
        assert!(matches!(
            Bitfield::from_bytes(&[0, 0x01], 10),
            Err(BitfieldError::SpareBits)
        ));
    }

    #[test]
    fn full_and_union() {
        let full = Bitfield::full(3);
        assert!(full.is_full());
        let mut b = Bitfield::new(3);
        b.set(1);
        assert_eq!(b.union_with(&full), vec![0, 2]);
        assert!(b.is_full());
        assert_eq!(b.iter_missing().count(), 0);
    }

    #[test]
    fn zero_length_is_full() {
        let b = Bitfield::new(0);
        assert!(b.is_full());
        assert!(b.as_bytes().is_empty());
    }
}
