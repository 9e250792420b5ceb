//! The peer scheduler.
//!
//! A single cooperative event loop owns every torrent, connection and
//! blacklist entry. Background tasks (dials, connection readers and
//! writers, announce calls, timers) never touch that state; they post
//! typed events into the loop's queue and the loop mutates state in
//! response. [`spawn_scheduler`] wires everything up and returns a
//! cloneable [`SchedulerHandle`].

pub mod actor;
pub mod announce;
pub mod conn;
pub mod core;
pub mod events;
pub mod handle;
pub mod registry;
pub mod state;

use std::sync::Arc;

pub use actor::spawn_scheduler;
pub use conn::{CloseReason, ConnId};
pub use events::{EventKind, EventObserver, SchedulerEvent};
pub use handle::{AddTorrentWatch, SchedulerHandle};
pub use registry::BlacklistEntry;
pub use state::TorrentStatus;

use crate::clock::Clock;
use crate::netevent::NetworkEventSink;
use crate::network::PeerNetwork;
use crate::storage::TorrentArchive;
use crate::tracker::TrackerClient;

/// External collaborators the scheduler is wired to.
///
/// Each field is a capability trait so production and in-memory test
/// implementations are interchangeable.
#[derive(Clone)]
pub struct SchedulerDeps {
    /// Durable piece store.
    pub archive: Arc<dyn TorrentArchive>,
    /// Peer discovery.
    pub tracker: Arc<dyn TrackerClient>,
    /// Peer transport.
    pub network: Arc<dyn PeerNetwork>,
    /// Audit event sink.
    pub sink: Arc<dyn NetworkEventSink>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// Point-in-time view of a single torrent, returned by
/// [`SchedulerHandle::stat`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TorrentStat {
    /// Current lifecycle status.
    pub status: TorrentStatus,
    /// Fraction of pieces held, in `[0, 1]`.
    pub progress: f64,
    /// Non-closed connections scoped to this torrent.
    pub num_conns: usize,
}

/// Aggregate scheduler counters, logged on the stats tick and returned by
/// [`SchedulerHandle::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Torrents currently downloading.
    pub torrents_downloading: usize,
    /// Torrents currently seeding.
    pub torrents_seeding: usize,
    /// Connections in pending state.
    pub conns_pending: usize,
    /// Connections in active state.
    pub conns_active: usize,
    /// Live blacklist entries.
    pub blacklist_len: usize,
    /// Piece payload bytes received over all time.
    pub bytes_in: u64,
    /// Piece payload bytes served over all time.
    pub bytes_out: u64,
    /// Events discarded by the queue overflow policy.
    pub events_dropped: u64,
}
