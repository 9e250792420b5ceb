//! In-memory tracker.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use undertow_core::tracker::TrackerClient;
use undertow_core::{InfoHash, PeerHandle, PeerId, SchedulerError};

/// Shared tracker registry for a simulated swarm.
///
/// Announcing registers the peer and returns every other peer known for
/// the torrent. A failure switch lets tests exercise announce backoff.
#[derive(Default)]
pub struct SimulatedTracker {
    swarms: Mutex<HashMap<InfoHash, HashMap<PeerId, PeerHandle>>>,
    fail_announces: AtomicBool,
    announce_count: AtomicU64,
}

impl SimulatedTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent announce fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.fail_announces.store(failing, Ordering::Release);
    }

    /// Total announces observed, including failed ones.
    pub fn announce_count(&self) -> u64 {
        self.announce_count.load(Ordering::Relaxed)
    }

    /// Registers a peer without going through a scheduler, mirroring a
    /// peer that is known to the tracker but holds no scheduler state.
    pub fn register(&self, info_hash: InfoHash, peer: PeerHandle) {
        self.swarms
            .lock()
            .expect("tracker lock poisoned")
            .entry(info_hash)
            .or_default()
            .insert(peer.peer_id, peer);
    }
}

#[async_trait]
impl TrackerClient for SimulatedTracker {
    async fn announce(
        &self,
        info_hash: InfoHash,
        peer: PeerHandle,
        _complete: bool,
    ) -> undertow_core::Result<Vec<PeerHandle>> {
        self.announce_count.fetch_add(1, Ordering::Relaxed);
        if self.fail_announces.load(Ordering::Acquire) {
            tracing::debug!(torrent = %info_hash, peer = %peer.peer_id, "simulated tracker outage");
            return Err(SchedulerError::network("simulated tracker outage"));
        }
        let mut swarms = self.swarms.lock().expect("tracker lock poisoned");
        let swarm = swarms.entry(info_hash).or_default();
        swarm.insert(peer.peer_id, peer);
        Ok(swarm
            .values()
            .filter(|other| other.peer_id != peer.peer_id)
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(n: u8) -> PeerHandle {
        PeerHandle {
            peer_id: PeerId::new([n; 20]),
            addr: format!("10.0.0.{n}:6881").parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_announce_returns_other_peers_only() {
        let tracker = SimulatedTracker::new();
        let hash = InfoHash::new([1; 20]);

        let first = tracker.announce(hash, handle(1), false).await.unwrap();
        assert!(first.is_empty());

        let second = tracker.announce(hash, handle(2), true).await.unwrap();
        assert_eq!(second, vec![handle(1)]);
        assert_eq!(tracker.announce_count(), 2);
    }

    #[tokio::test]
    async fn test_failure_switch() {
        let tracker = SimulatedTracker::new();
        let hash = InfoHash::new([1; 20]);
        tracker.set_failing(true);
        assert!(tracker.announce(hash, handle(1), false).await.is_err());
        tracker.set_failing(false);
        assert!(tracker.announce(hash, handle(1), false).await.is_ok());
    }
}
