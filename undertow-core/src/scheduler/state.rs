//! Per-torrent scheduler state and piece selection.

use std::collections::HashMap;
use std::time::Instant;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use sha1::{Digest, Sha1};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::conn::ConnId;
use crate::bitfield::Bitfield;
use crate::torrent::{InfoHash, Metainfo, PeerId, PieceIndex};
use crate::{Result, SchedulerError};

/// Lifecycle status of a torrent inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TorrentStatus {
    /// Local bitfield is incomplete; the dispatcher is requesting pieces.
    Downloading,
    /// Local copy is complete; pieces are served to remotes.
    Seeding,
    /// Evicted or explicitly removed; the arena entry is gone.
    Removed,
}

/// Terminal outcome delivered to every waiter of a torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaiterOutcome {
    /// Download finished.
    Complete,
    /// Leecher TTI elapsed before completion.
    Timeout,
    /// Torrent was explicitly removed.
    Removed,
    /// The scheduler is stopping.
    ShuttingDown,
}

impl WaiterOutcome {
    fn into_result(self) -> Result<()> {
        match self {
            WaiterOutcome::Complete => Ok(()),
            WaiterOutcome::Timeout => Err(SchedulerError::TorrentTimeout),
            WaiterOutcome::Removed => Err(SchedulerError::TorrentRemoved),
            WaiterOutcome::ShuttingDown => Err(SchedulerError::ShuttingDown),
        }
    }
}

/// Everything the loop tracks for one torrent.
pub struct TorrentState {
    /// Namespace the torrent was added under.
    pub namespace: String,
    /// Immutable descriptor.
    pub metainfo: Metainfo,
    /// Local piece possession.
    pub bitfield: Bitfield,
    /// Downloading or Seeding; Removed entries leave the arena.
    pub status: TorrentStatus,
    /// Completion promises; all resolve with the same outcome.
    pub waiters: Vec<oneshot::Sender<Result<()>>>,
    /// When the torrent entered the scheduler.
    pub created_at: Instant,
    /// Last piece transferred in either direction.
    pub last_activity: Instant,
    /// Pieces requested and not yet received, with the connections each is
    /// in flight on.
    pub inflight: HashMap<PieceIndex, Vec<ConnId>>,
    /// Consecutive announce failures, drives backoff.
    pub announce_failures: u32,
    /// Timer for the next announce round.
    pub announce_timer: Option<JoinHandle<()>>,
    /// Dispatch round counter; seeds the tie-break RNG.
    pub dispatch_tick: u64,
}

impl TorrentState {
    /// Creates a torrent entry from its archive snapshot.
    pub fn new(namespace: String, metainfo: Metainfo, bitfield: Bitfield, now: Instant) -> Self {
        let status = if bitfield.is_complete() {
            TorrentStatus::Seeding
        } else {
            TorrentStatus::Downloading
        };
        Self {
            namespace,
            metainfo,
            bitfield,
            status,
            waiters: Vec::new(),
            created_at: now,
            last_activity: now,
            inflight: HashMap::new(),
            announce_failures: 0,
            announce_timer: None,
            dispatch_tick: 0,
        }
    }

    /// Fraction of pieces held, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.bitfield.len() == 0 {
            return 1.0;
        }
        f64::from(self.bitfield.count_set()) / f64::from(self.bitfield.len())
    }

    /// Pieces still missing locally.
    pub fn missing_count(&self) -> u32 {
        self.bitfield.len() - self.bitfield.count_set()
    }

    /// Resolves every waiter with the same outcome and aborts the announce
    /// timer when the torrent is leaving the scheduler.
    pub fn resolve_waiters(&mut self, outcome: WaiterOutcome) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.into_result());
        }
    }

    /// Drops the connection from every in-flight entry it appears in.
    pub fn forget_conn(&mut self, conn_id: ConnId) {
        self.inflight.retain(|_, holders| {
            holders.retain(|id| *id != conn_id);
            !holders.is_empty()
        });
    }
}

impl Drop for TorrentState {
    fn drop(&mut self) {
        if let Some(timer) = self.announce_timer.take() {
            timer.abort();
        }
    }
}

/// Builds the deterministic tie-break RNG for one dispatch round.
///
/// Seeded from the torrent, the local peer and the round counter, so a
/// given scenario replays identically while different peers still pick
/// different pieces among ties.
pub fn dispatch_rng(info_hash: InfoHash, local_peer: PeerId, tick: u64) -> ChaCha8Rng {
    let mut hasher = Sha1::new();
    hasher.update(info_hash.as_bytes());
    hasher.update(local_peer.as_bytes());
    hasher.update(tick.to_le_bytes());
    let digest = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&digest[..8]);
    ChaCha8Rng::seed_from_u64(u64::from_le_bytes(seed))
}

/// Orders candidate pieces rarest first, shuffling ties with `rng`.
///
/// `candidates` pairs each piece with the number of connected remotes
/// holding it; pieces nobody holds must be filtered out beforehand.
pub fn rarest_first_order(
    mut candidates: Vec<(PieceIndex, u32)>,
    rng: &mut ChaCha8Rng,
) -> Vec<PieceIndex> {
    candidates.sort_unstable_by_key(|(piece, availability)| (*availability, *piece));

    let mut ordered = Vec::with_capacity(candidates.len());
    let mut group_start = 0;
    while group_start < candidates.len() {
        let availability = candidates[group_start].1;
        let group_end = candidates[group_start..]
            .iter()
            .position(|(_, a)| *a != availability)
            .map_or(candidates.len(), |offset| group_start + offset);
        let mut group: Vec<PieceIndex> = candidates[group_start..group_end]
            .iter()
            .map(|(piece, _)| *piece)
            .collect();
        group.shuffle(rng);
        ordered.extend(group);
        group_start = group_end;
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pieces(indices: &[(u32, u32)]) -> Vec<(PieceIndex, u32)> {
        indices
            .iter()
            .map(|(piece, avail)| (PieceIndex::new(*piece), *avail))
            .collect()
    }

    #[test]
    fn test_rarest_first_groups_by_availability() {
        let mut rng = dispatch_rng(InfoHash::new([1; 20]), PeerId::new([2; 20]), 0);
        let order = rarest_first_order(pieces(&[(0, 3), (1, 1), (2, 2), (3, 1)]), &mut rng);

        let rarity: Vec<u32> = order
            .iter()
            .map(|piece| match piece.as_u32() {
                1 | 3 => 1,
                2 => 2,
                _ => 3,
            })
            .collect();
        let mut sorted = rarity.clone();
        sorted.sort_unstable();
        assert_eq!(rarity, sorted, "rarer pieces must come first: {order:?}");
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_tie_break_is_deterministic_per_seed() {
        let candidates = pieces(&[(0, 1), (1, 1), (2, 1), (3, 1), (4, 1), (5, 1)]);
        let hash = InfoHash::new([7; 20]);
        let peer = PeerId::new([9; 20]);

        let mut rng_a = dispatch_rng(hash, peer, 4);
        let mut rng_b = dispatch_rng(hash, peer, 4);
        assert_eq!(
            rarest_first_order(candidates.clone(), &mut rng_a),
            rarest_first_order(candidates.clone(), &mut rng_b)
        );

        // Different peers seed different shuffles over the same ties.
        let mut orders = std::collections::HashSet::new();
        for byte in 0..32u8 {
            let mut rng = dispatch_rng(hash, PeerId::new([byte; 20]), 4);
            orders.insert(rarest_first_order(candidates.clone(), &mut rng));
        }
        assert!(orders.len() > 1, "all peers picked the same tie order");
    }

    #[test]
    fn test_waiters_all_get_same_outcome() {
        let meta = Metainfo::from_content(&[0u8; 512], 256);
        let bitfield = Bitfield::new(meta.piece_count());
        let mut state = TorrentState::new("ns".into(), meta, bitfield, Instant::now());

        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            receivers.push(rx);
        }
        state.resolve_waiters(WaiterOutcome::Timeout);
        for rx in receivers {
            let result = rx.blocking_recv().unwrap();
            assert!(matches!(result, Err(SchedulerError::TorrentTimeout)));
        }
        // Idempotent: no waiters remain.
        state.resolve_waiters(WaiterOutcome::Removed);
    }

    #[test]
    fn test_forget_conn_prunes_inflight() {
        let meta = Metainfo::from_content(&[0u8; 512], 256);
        let bitfield = Bitfield::new(meta.piece_count());
        let mut state = TorrentState::new("ns".into(), meta, bitfield, Instant::now());

        state
            .inflight
            .insert(PieceIndex::new(0), vec![ConnId(1), ConnId(2)]);
        state.inflight.insert(PieceIndex::new(1), vec![ConnId(1)]);

        state.forget_conn(ConnId(1));
        assert_eq!(
            state.inflight.get(&PieceIndex::new(0)),
            Some(&vec![ConnId(2)])
        );
        assert!(!state.inflight.contains_key(&PieceIndex::new(1)));
    }
}
