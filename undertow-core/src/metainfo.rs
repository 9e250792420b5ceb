//! Metainfo client collaborator.

use async_trait::async_trait;

use crate::torrent::{InfoHash, Metainfo};

/// Resolves torrent descriptors from the origin.
///
/// Archive implementations call this at most once per torrent and cache
/// the result; the scheduler never talks to it directly.
#[async_trait]
pub trait MetainfoClient: Send + Sync + 'static {
    /// Downloads the metainfo for `info_hash` under `namespace`.
    ///
    /// # Errors
    /// Returns [`crate::SchedulerError::TorrentNotFound`] when the origin
    /// has no such torrent, or a network kind for transient faults.
    async fn download(&self, namespace: &str, info_hash: InfoHash) -> crate::Result<Metainfo>;
}
