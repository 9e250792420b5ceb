//! Torrent archive collaborator.
//!
//! The scheduler treats durable piece storage as an external capability.
//! Writes to a single torrent's pieces are serialised by the event loop,
//! so implementations do not need per-piece locking.

use async_trait::async_trait;

use crate::bitfield::Bitfield;
use crate::torrent::{InfoHash, Metainfo, PieceIndex};

/// Archive failure kinds.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    /// The torrent (or piece) is not in the archive and could not be
    /// created.
    #[error("torrent {info_hash} not found in archive")]
    NotFound {
        /// Digest of the missing torrent.
        info_hash: InfoHash,
    },

    /// A conflicting entry already exists.
    #[error("archive conflict: {reason}")]
    Conflict {
        /// What clashed.
        reason: String,
    },

    /// Underlying storage fault.
    #[error("archive i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot of a torrent's archive entry.
#[derive(Debug, Clone)]
pub struct ArchiveTorrent {
    /// Immutable torrent descriptor.
    pub metainfo: Metainfo,
    /// Pieces already present and verified on disk.
    pub bitfield: Bitfield,
}

/// Durable piece store capability.
///
/// `create_torrent` resolves metainfo (through the metainfo collaborator,
/// which the archive caches) and returns the pieces already held, so a
/// restarted or pre-populated node starts seeding without re-download.
#[async_trait]
pub trait TorrentArchive: Send + Sync + 'static {
    /// Opens or creates the archive entry for `info_hash`, resolving its
    /// metainfo under `namespace`.
    ///
    /// # Errors
    /// - [`ArchiveError::NotFound`] - metainfo could not be resolved
    /// - [`ArchiveError::Io`] - storage fault
    async fn create_torrent(
        &self,
        namespace: &str,
        info_hash: InfoHash,
    ) -> Result<ArchiveTorrent, ArchiveError>;

    /// Persists a verified piece payload.
    ///
    /// # Errors
    /// - [`ArchiveError::NotFound`] - torrent entry missing
    /// - [`ArchiveError::Io`] - storage fault
    async fn write_piece(
        &self,
        info_hash: InfoHash,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), ArchiveError>;

    /// Reads a piece payload back for serving.
    ///
    /// # Errors
    /// - [`ArchiveError::NotFound`] - torrent or piece missing
    /// - [`ArchiveError::Io`] - storage fault
    async fn read_piece(
        &self,
        info_hash: InfoHash,
        index: PieceIndex,
    ) -> Result<Vec<u8>, ArchiveError>;

    /// Returns the archive entry without creating it.
    ///
    /// # Errors
    /// - [`ArchiveError::NotFound`] - no entry for `info_hash`
    async fn stat(&self, info_hash: InfoHash) -> Result<ArchiveTorrent, ArchiveError>;

    /// Deletes the archive entry and its pieces.
    ///
    /// # Errors
    /// - [`ArchiveError::Io`] - storage fault
    async fn delete(&self, info_hash: InfoHash) -> Result<(), ArchiveError>;
}
