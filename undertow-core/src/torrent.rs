//! Identity types and immutable torrent metainfo.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::SchedulerError;

/// Opaque 20-byte peer identity, unique per running scheduler.
///
/// Ordering is total and used for the deterministic simultaneous-dial
/// tie-break: the side with the numerically smaller id keeps its outgoing
/// connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId([u8; 20]);

impl PeerId {
    /// Creates a peer id from raw bytes.
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Generates a random peer id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Returns the underlying 20 bytes.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// 20-byte content digest identifying a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates an info hash from raw digest bytes.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Computes the info hash of a content blob.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(content);
        Self(hasher.finalize().into())
    }

    /// Returns the underlying 20-byte digest.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for InfoHash {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 || !s.is_ascii() {
            return Err(SchedulerError::protocol("info hash must be 40 hex chars"));
        }
        let mut bytes = [0u8; 20];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16)
                .map_err(|_| SchedulerError::protocol("info hash is not valid hex"))?;
        }
        Ok(Self(bytes))
    }
}

/// Zero-based index of a piece within a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates a piece index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the underlying index as usize.
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contact information for a peer returned by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerHandle {
    /// The peer's identity.
    pub peer_id: PeerId,
    /// Where the peer accepts connections.
    pub addr: SocketAddr,
}

/// Immutable descriptor of a torrent.
///
/// Carries everything needed to verify pieces: total size, piece geometry
/// and the expected digest of every piece. Obtained from the metainfo
/// collaborator and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    info_hash: InfoHash,
    total_size: u64,
    piece_length: u32,
    piece_digests: Vec<[u8; 20]>,
}

impl Metainfo {
    /// Builds a metainfo descriptor from explicit fields.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Protocol`] if the digest count does not
    /// match the piece geometry or the piece length is zero.
    pub fn new(
        info_hash: InfoHash,
        total_size: u64,
        piece_length: u32,
        piece_digests: Vec<[u8; 20]>,
    ) -> crate::Result<Self> {
        if piece_length == 0 {
            return Err(SchedulerError::protocol("piece length must be non-zero"));
        }
        let expected = total_size.div_ceil(piece_length as u64) as usize;
        if piece_digests.len() != expected {
            return Err(SchedulerError::protocol(format!(
                "expected {expected} piece digests, got {}",
                piece_digests.len()
            )));
        }
        Ok(Self {
            info_hash,
            total_size,
            piece_length,
            piece_digests,
        })
    }

    /// Builds a metainfo descriptor by hashing real content.
    pub fn from_content(content: &[u8], piece_length: u32) -> Self {
        let piece_digests = content
            .chunks(piece_length.max(1) as usize)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finalize().into()
            })
            .collect();
        Self {
            info_hash: InfoHash::of(content),
            total_size: content.len() as u64,
            piece_length,
            piece_digests,
        }
    }

    /// Returns the torrent's content digest.
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// Returns the total content size in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Returns the nominal piece length in bytes.
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    /// Returns the number of pieces.
    pub fn piece_count(&self) -> u32 {
        self.piece_digests.len() as u32
    }

    /// Returns the actual size of piece `index`; the last piece may be
    /// shorter than the nominal piece length.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let start = index.as_u32() as u64 * self.piece_length as u64;
        let remaining = self.total_size.saturating_sub(start);
        remaining.min(self.piece_length as u64) as u32
    }

    /// Checks a piece payload against the expected digest.
    pub fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        let Some(expected) = self.piece_digests.get(index.as_usize()) else {
            return false;
        };
        if data.len() != self.piece_size(index) as usize {
            return false;
        }
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest: [u8; 20] = hasher.finalize().into();
        digest == *expected
    }
}
