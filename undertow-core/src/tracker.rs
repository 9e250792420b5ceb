//! Tracker client collaborator.

use async_trait::async_trait;

use crate::torrent::{InfoHash, PeerHandle};

/// Peer discovery capability.
///
/// The transport and wire format of the tracker protocol are deliberately
/// out of scope; only this announce contract matters to the scheduler.
#[async_trait]
pub trait TrackerClient: Send + Sync + 'static {
    /// Registers `peer` for `info_hash` and returns the current peer set.
    ///
    /// `complete` tells the tracker whether this peer already seeds the
    /// whole torrent. The returned list may include the announcing peer;
    /// callers filter it out.
    ///
    /// # Errors
    /// Returns [`crate::SchedulerError::Network`] on tracker faults; the
    /// announce driver retries with exponential backoff.
    async fn announce(
        &self,
        info_hash: InfoHash,
        peer: PeerHandle,
        complete: bool,
    ) -> crate::Result<Vec<PeerHandle>>;
}
