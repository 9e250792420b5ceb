//! Undertow core - peer scheduler for content-addressed blob distribution
//!
//! Every node in the distribution mesh runs one scheduler per seeded
//! namespace. The scheduler downloads and seeds fixed-piece blobs
//! ("torrents") by exchanging pieces with peers discovered through a
//! tracker. All mutable scheduler state is owned by a single event loop;
//! network and timer work happens in background tasks that communicate
//! with the loop exclusively through typed events.

#![warn(missing_docs)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::too_many_lines)]

pub mod bandwidth;
pub mod bitfield;
pub mod clock;
pub mod config;
pub mod metainfo;
pub mod netevent;
pub mod network;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use bitfield::Bitfield;
pub use clock::{Clock, SystemClock};
pub use config::SchedulerConfig;
pub use scheduler::{
    AddTorrentWatch, EventKind, EventObserver, SchedulerDeps, SchedulerHandle, SchedulerStats,
    TorrentStat, TorrentStatus, spawn_scheduler,
};
pub use storage::ArchiveError;
pub use torrent::{InfoHash, Metainfo, PeerHandle, PeerId, PieceIndex};

/// Errors surfaced by the scheduler to its callers.
///
/// Promises returned from the control surface only ever carry the terminal
/// kinds (`TorrentTimeout`, `TorrentRemoved`, `ShuttingDown`,
/// `TorrentNotFound`). Piece-level failures never reach callers; the
/// scheduler re-requests from other peers.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Torrent is not in the archive and its metainfo could not be fetched.
    #[error("torrent {info_hash} not found")]
    TorrentNotFound {
        /// Digest of the missing torrent.
        info_hash: InfoHash,
    },

    /// The download did not finish before the leecher idle deadline.
    #[error("torrent timed out before completion")]
    TorrentTimeout,

    /// The torrent was explicitly removed while downloading.
    #[error("torrent removed")]
    TorrentRemoved,

    /// The scheduler is stopping and no longer accepts work.
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// A peer sent malformed or semantically invalid data.
    #[error("protocol violation: {reason}")]
    Protocol {
        /// What the peer did wrong.
        reason: String,
    },

    /// Tracker or peer transport fault.
    #[error("network error: {reason}")]
    Network {
        /// Human-readable description of the fault.
        reason: String,
    },

    /// Torrent archive fault.
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    /// Filesystem or socket fault.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SchedulerError {
    /// Shorthand for a protocol violation error.
    pub fn protocol(reason: impl Into<String>) -> Self {
        SchedulerError::Protocol {
            reason: reason.into(),
        }
    }

    /// Shorthand for a network fault error.
    pub fn network(reason: impl Into<String>) -> Self {
        SchedulerError::Network {
            reason: reason.into(),
        }
    }
}

/// Convenience result alias using [`SchedulerError`].
pub type Result<T> = std::result::Result<T, SchedulerError>;
