//! Network event audit sink.
//!
//! Append-only log of scheduler lifecycle events, used for mesh-wide
//! debugging and replay. The event loop appends synchronously, so sink
//! order is exactly the order in which state transitions happened.

use std::time::Instant;

use crate::torrent::{InfoHash, PeerId, PieceIndex};

/// Kind of audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEventKind {
    /// Torrent entered the scheduler.
    AddTorrent,
    /// Local bitfield became complete.
    TorrentComplete,
    /// Connection admitted in pending state.
    AddPendingConn,
    /// Connection promoted to active.
    AddActiveConn,
    /// Active connection torn down.
    DropActiveConn,
    /// (peer, torrent) pair blacklisted.
    BlacklistConn,
    /// Verified piece landed locally.
    ReceivePiece,
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    /// What happened.
    pub kind: NetworkEventKind,
    /// Torrent concerned.
    pub info_hash: InfoHash,
    /// The peer emitting the record.
    pub local_peer: PeerId,
    /// Remote peer, for connection-scoped records.
    pub remote_peer: Option<PeerId>,
    /// Piece, for `ReceivePiece`.
    pub piece: Option<PieceIndex>,
    /// Scheduler clock time of the transition.
    pub timestamp: Instant,
}

impl NetworkEvent {
    /// Builds a torrent-scoped record.
    pub fn torrent(
        kind: NetworkEventKind,
        info_hash: InfoHash,
        local_peer: PeerId,
        timestamp: Instant,
    ) -> Self {
        Self {
            kind,
            info_hash,
            local_peer,
            remote_peer: None,
            piece: None,
            timestamp,
        }
    }

    /// Builds a connection-scoped record.
    pub fn conn(
        kind: NetworkEventKind,
        info_hash: InfoHash,
        local_peer: PeerId,
        remote_peer: PeerId,
        timestamp: Instant,
    ) -> Self {
        Self {
            kind,
            info_hash,
            local_peer,
            remote_peer: Some(remote_peer),
            piece: None,
            timestamp,
        }
    }

    /// Builds a piece-receipt record.
    pub fn piece(
        info_hash: InfoHash,
        local_peer: PeerId,
        remote_peer: PeerId,
        piece: PieceIndex,
        timestamp: Instant,
    ) -> Self {
        Self {
            kind: NetworkEventKind::ReceivePiece,
            info_hash,
            local_peer,
            remote_peer: Some(remote_peer),
            piece: Some(piece),
            timestamp,
        }
    }
}

/// Audit sink capability. Implementations must be cheap: the call happens
/// inside the event loop.
pub trait NetworkEventSink: Send + Sync + 'static {
    /// Appends one record. Records arrive in transition order.
    fn append(&self, event: NetworkEvent);
}

/// Sink that discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl NetworkEventSink for NoopSink {
    fn append(&self, _event: NetworkEvent) {}
}
