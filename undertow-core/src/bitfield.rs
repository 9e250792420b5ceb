//! Packed bit vector tracking piece possession.

use crate::torrent::PieceIndex;

/// Fixed-length bit vector over piece indices.
///
/// Bit `i` is set iff piece `i` is locally complete and verified. Backed by
/// packed u64 words so scans over thousands of pieces stay cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    words: Vec<u64>,
    len: u32,
}

impl Bitfield {
    /// Creates an all-zero bitfield over `len` pieces.
    pub fn new(len: u32) -> Self {
        Self {
            words: vec![0u64; len.div_ceil(64) as usize],
            len,
        }
    }

    /// Creates an all-one bitfield over `len` pieces.
    pub fn full(len: u32) -> Self {
        let mut bf = Self::new(len);
        for word in &mut bf.words {
            *word = u64::MAX;
        }
        bf.mask_tail();
        bf
    }

    /// Number of pieces tracked.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True if the bitfield tracks zero pieces.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets bit `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: PieceIndex) {
        let i = index.as_u32();
        if i < self.len {
            self.words[(i / 64) as usize] |= 1u64 << (i % 64);
        }
    }

    /// Returns bit `index`; out-of-range indices read as unset.
    pub fn get(&self, index: PieceIndex) -> bool {
        let i = index.as_u32();
        i < self.len && self.words[(i / 64) as usize] >> (i % 64) & 1 == 1
    }

    /// Number of set bits.
    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    /// True when every piece is held.
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.len
    }

    /// Indices of pieces not yet held.
    pub fn missing_pieces(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.len)
            .map(PieceIndex::new)
            .filter(move |i| !self.get(*i))
    }

    /// Pieces the remote holds that we lack: `remote & !self`.
    pub fn difference<'a>(&'a self, remote: &'a Bitfield) -> impl Iterator<Item = PieceIndex> + 'a {
        (0..self.len)
            .map(PieceIndex::new)
            .filter(move |i| remote.get(*i) && !self.get(*i))
    }

    /// Serialises to wire bytes, one bit per piece, little-endian words.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len.div_ceil(8) as usize);
        for word in &self.words {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.truncate(self.len.div_ceil(8) as usize);
        bytes
    }

    /// Deserialises from wire bytes for a torrent of `len` pieces.
    ///
    /// Returns `None` if the byte count does not match `len` or a padding
    /// bit beyond `len` is set.
    pub fn from_bytes(bytes: &[u8], len: u32) -> Option<Self> {
        if bytes.len() != len.div_ceil(8) as usize {
            return None;
        }
        let mut bf = Self::new(len);
        for (i, byte) in bytes.iter().enumerate() {
            bf.words[i / 8] |= (*byte as u64) << (8 * (i % 8));
        }
        let padded = bf.clone();
        bf.mask_tail();
        if padded != bf {
            return None;
        }
        Some(bf)
    }

    /// Clears any bits beyond `len` in the final word.
    fn mask_tail(&mut self) {
        let tail = self.len % 64;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << tail) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_roundtrip() {
        let mut bf = Bitfield::new(10);
        assert!(!bf.get(PieceIndex::new(3)));
        bf.set(PieceIndex::new(3));
        assert!(bf.get(PieceIndex::new(3)));
        assert_eq!(bf.count_set(), 1);
    }

    #[test]
    fn test_out_of_range_is_inert() {
        let mut bf = Bitfield::new(4);
        bf.set(PieceIndex::new(100));
        assert_eq!(bf.count_set(), 0);
        assert!(!bf.get(PieceIndex::new(100)));
    }

    #[test]
    fn test_completion_at_word_boundary() {
        for len in [63, 64, 65, 128] {
            let mut bf = Bitfield::new(len);
            for i in 0..len {
                assert!(!bf.is_complete());
                bf.set(PieceIndex::new(i));
            }
            assert!(bf.is_complete(), "len={len}");
            assert_eq!(bf.count_set(), len);
        }
    }

    #[test]
    fn test_full_masks_tail_bits() {
        let bf = Bitfield::full(65);
        assert!(bf.is_complete());
        assert_eq!(bf.count_set(), 65);
    }

    #[test]
    fn test_missing_and_difference() {
        let mut local = Bitfield::new(8);
        local.set(PieceIndex::new(0));
        local.set(PieceIndex::new(5));

        let mut remote = Bitfield::new(8);
        remote.set(PieceIndex::new(0));
        remote.set(PieceIndex::new(1));
        remote.set(PieceIndex::new(7));

        let missing: Vec<u32> = local.missing_pieces().map(PieceIndex::as_u32).collect();
        assert_eq!(missing, vec![1, 2, 3, 4, 6, 7]);

        let wanted: Vec<u32> = local.difference(&remote).map(PieceIndex::as_u32).collect();
        assert_eq!(wanted, vec![1, 7]);
    }

    #[test]
    fn test_wire_roundtrip() {
        for len in [1, 7, 8, 9, 64, 65, 200] {
            let mut bf = Bitfield::new(len);
            for i in (0..len).step_by(3) {
                bf.set(PieceIndex::new(i));
            }
            let bytes = bf.to_bytes();
            assert_eq!(bytes.len(), (len as usize).div_ceil(8));
            assert_eq!(Bitfield::from_bytes(&bytes, len).unwrap(), bf);
        }
    }

    #[test]
    fn test_from_bytes_rejects_bad_padding() {
        // 3 pieces fit in one byte; bit 4 is padding and must be zero.
        assert!(Bitfield::from_bytes(&[0b0001_0000], 3).is_none());
        assert!(Bitfield::from_bytes(&[0b0000_0101], 3).is_some());
    }

    #[test]
    fn test_from_bytes_rejects_wrong_length() {
        assert!(Bitfield::from_bytes(&[0, 0], 3).is_none());
    }
}
