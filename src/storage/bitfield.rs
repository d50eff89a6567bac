//! Piece bitfield
//!
//! MSB-first bit set as carried by the `bitfield` wire message.

use anyhow::Result;

use crate::error::TorrentError;

/// Fixed-length set of piece indices
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    /// Empty bitfield covering `len` pieces
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Bitfield with every piece set
    pub fn full(len: usize) -> Self {
        let mut field = Self::new(len);
        for i in 0..len {
            field.set(i);
        }
        field
    }

    /// Decode a wire bitfield. Spare trailing bits must be zero.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Result<Self> {
        if bytes.len() != len.div_ceil(8) {
            return Err(TorrentError::protocol_error(format!(
                "Bitfield is {} bytes, expected {} for {} pieces",
                bytes.len(),
                len.div_ceil(8),
                len
            ))
            .into());
        }
        let field = Self {
            bits: bytes.to_vec(),
            len,
        };
        if (len..field.bits.len() * 8).any(|i| field.bit(i)) {
            return Err(TorrentError::protocol_error("Bitfield has spare bits set").into());
        }
        Ok(field)
    }

    fn bit(&self, index: usize) -> bool {
        self.bits[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn get(&self, index: usize) -> bool {
        index < self.len && self.bit(index)
    }

    /// Set a bit; returns false when the index is out of range
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.bits[index / 8] |= 0x80 >> (index % 8);
        true
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] &= !(0x80 >> (index % 8));
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn is_full(&self) -> bool {
        self.count() == self.len
    }

    pub fn none_set(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    /// Indices of set bits in ascending order
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).filter(move |&i| self.bit(i))
    }

    /// Bits set here but not in `other`
    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        let mut out = self.clone();
        for (byte, theirs) in out.bits.iter_mut().zip(other.bits.iter()) {
            *byte &= !theirs;
        }
        out
    }

    /// Bits set in both
    pub fn intersection(&self, other: &Bitfield) -> Bitfield {
        let mut out = self.clone();
        for (i, byte) in out.bits.iter_mut().enumerate() {
            *byte &= other.bits.get(i).copied().unwrap_or(0);
        }
        out
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_msb_first() {
        let mut field = Bitfield::new(10);
        assert!(field.set(0));
        assert!(field.set(9));
        assert!(!field.set(10));
        assert_eq!(field.as_bytes(), &[0x80, 0x40]);
        assert!(field.get(0) && field.get(9) && !field.get(1));
        assert_eq!(field.count(), 2);
        assert_eq!(field.ones().collect::<Vec<_>>(), vec![0, 9]);
    }

    #[test]
    fn test_from_bytes_rejects_spare_bits() {
        assert!(Bitfield::from_bytes(&[0xff, 0xc0], 10).is_ok());
        assert!(Bitfield::from_bytes(&[0xff, 0xe0], 10).is_err());
        assert!(Bitfield::from_bytes(&[0xff], 10).is_err());
    }

    #[test]
    fn test_difference_and_full() {
        let full = Bitfield::full(5);
        assert!(full.is_full());
        let mut have = Bitfield::new(5);
        have.set(1);
        have.set(3);
        let missing = full.difference(&have);
        assert_eq!(missing.ones().collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(full.intersection(&have), have);
        have.clear(1);
        assert_eq!(have.count(), 1);
    }
}
