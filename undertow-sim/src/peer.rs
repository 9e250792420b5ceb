//! Fully wired scheduler fixtures.

use std::sync::Arc;
use std::time::Duration;

use undertow_core::scheduler::{EventKind, EventObserver, SchedulerDeps};
use undertow_core::{
    Clock, InfoHash, PeerId, SchedulerConfig, SchedulerError, SchedulerHandle, SystemClock,
    spawn_scheduler,
};

use crate::archive::MemoryArchive;
use crate::fixtures::TorrentFixture;
use crate::metainfo::SimulatedMetainfoClient;
use crate::network::SimulatedNetwork;
use crate::sink::MemorySink;
use crate::tracker::SimulatedTracker;

/// Namespace used by every simulated peer.
pub const NAMESPACE: &str = "default";

/// Shared collaborators for a swarm of simulated peers.
///
/// Tracker, metainfo origin, transport fabric and clock are shared;
/// archive and event sink are private per peer, matching the production
/// wiring where only the mesh-facing services are common.
pub struct SimulatedSwarm {
    network: Arc<SimulatedNetwork>,
    tracker: Arc<SimulatedTracker>,
    metainfo: Arc<SimulatedMetainfoClient>,
    clock: Arc<dyn Clock>,
}

impl SimulatedSwarm {
    /// Swarm on the system clock, for scenarios without time control.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Swarm on an explicit clock, usually a
    /// [`SimulatedClock`](crate::SimulatedClock).
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            network: SimulatedNetwork::new(),
            tracker: Arc::new(SimulatedTracker::new()),
            metainfo: Arc::new(SimulatedMetainfoClient::new()),
            clock,
        }
    }

    /// The shared tracker.
    pub fn tracker(&self) -> &Arc<SimulatedTracker> {
        &self.tracker
    }

    /// The shared metainfo origin.
    pub fn metainfo(&self) -> &Arc<SimulatedMetainfoClient> {
        &self.metainfo
    }

    /// Makes a fixture downloadable by every peer in the swarm.
    pub fn register(&self, fixture: &TorrentFixture) {
        self.metainfo.register(fixture.metainfo.clone());
    }

    /// Spawns a new peer with its own scheduler, archive and sink.
    pub fn add_peer(&self, config: SchedulerConfig) -> SimPeer {
        let peer_id = PeerId::generate();
        let archive = Arc::new(MemoryArchive::new(self.metainfo.clone()));
        let sink = Arc::new(MemorySink::new());
        let observer = Arc::new(EventObserver::new());
        let endpoint = self.network.endpoint();
        let addr = undertow_core::network::PeerNetwork::local_addr(&endpoint);
        let deps = SchedulerDeps {
            archive: archive.clone(),
            tracker: self.tracker.clone(),
            network: Arc::new(endpoint),
            sink: sink.clone(),
            clock: self.clock.clone(),
        };
        let handle = spawn_scheduler(config, peer_id, deps, Some(observer.clone()));
        tracing::debug!(peer = %peer_id, %addr, "simulated peer spawned");
        SimPeer {
            peer_id,
            addr,
            handle,
            archive,
            sink,
            observer,
        }
    }
}

impl Default for SimulatedSwarm {
    fn default() -> Self {
        Self::new()
    }
}

/// One simulated peer: a live scheduler plus its private collaborators.
pub struct SimPeer {
    /// The peer's identity.
    pub peer_id: PeerId,
    /// The peer's address on the simulated fabric.
    pub addr: std::net::SocketAddr,
    /// Control surface of the peer's scheduler.
    pub handle: SchedulerHandle,
    /// The peer's private archive.
    pub archive: Arc<MemoryArchive>,
    /// The peer's audit event log.
    pub sink: Arc<MemorySink>,
    /// Processed-event observer for deterministic waits.
    pub observer: Arc<EventObserver>,
}

impl SimPeer {
    /// Installs a complete copy of the fixture in this peer's archive.
    pub fn seed(&self, fixture: &TorrentFixture) {
        self.archive.seed(fixture);
    }

    /// Asserts the peer's archived content is byte-equal to the fixture.
    ///
    /// # Panics
    /// Panics when pieces are missing or content differs.
    pub fn check_torrent(&self, fixture: &TorrentFixture) {
        let content = self
            .archive
            .content(fixture.info_hash())
            .expect("torrent content incomplete");
        assert_eq!(content, fixture.content, "archive content mismatch");
    }

    /// Waits until the loop has processed the next event of `kind`.
    pub async fn wait_for(&self, kind: EventKind) {
        self.observer.wait_for(kind).await;
    }

    /// Polls until the torrent is gone from the scheduler.
    ///
    /// # Panics
    /// Panics if the torrent is still present after five seconds of wall
    /// time.
    pub async fn wait_removed(&self, info_hash: InfoHash) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            match self.handle.stat(info_hash).await {
                Err(SchedulerError::TorrentNotFound { .. }) => return,
                Err(SchedulerError::ShuttingDown) => return,
                _ => {}
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "torrent {info_hash} still present"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// True if the scheduler still tracks any conn for the torrent.
    pub async fn has_conns(&self, info_hash: InfoHash) -> bool {
        match self.handle.stat(info_hash).await {
            Ok(stat) => stat.num_conns > 0,
            Err(_) => false,
        }
    }
}
