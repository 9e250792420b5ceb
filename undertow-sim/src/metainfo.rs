//! In-memory metainfo client.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use undertow_core::metainfo::MetainfoClient;
use undertow_core::{InfoHash, Metainfo, SchedulerError};

/// Serves registered metainfo descriptors and counts downloads.
///
/// Download counting backs the idempotence assertions: an archive that
/// caches correctly fetches each torrent's metainfo at most once per
/// peer no matter how many concurrent add calls race.
#[derive(Default)]
pub struct SimulatedMetainfoClient {
    torrents: Mutex<HashMap<InfoHash, Metainfo>>,
    downloads: Mutex<HashMap<InfoHash, u64>>,
}

impl SimulatedMetainfoClient {
    /// Creates an empty client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a torrent descriptor for download.
    pub fn register(&self, metainfo: Metainfo) {
        self.torrents
            .lock()
            .expect("metainfo lock poisoned")
            .insert(metainfo.info_hash(), metainfo);
    }

    /// How many times `info_hash` has been downloaded.
    pub fn download_count(&self, info_hash: InfoHash) -> u64 {
        self.downloads
            .lock()
            .expect("metainfo lock poisoned")
            .get(&info_hash)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MetainfoClient for SimulatedMetainfoClient {
    async fn download(
        &self,
        _namespace: &str,
        info_hash: InfoHash,
    ) -> undertow_core::Result<Metainfo> {
        *self
            .downloads
            .lock()
            .expect("metainfo lock poisoned")
            .entry(info_hash)
            .or_insert(0) += 1;
        self.torrents
            .lock()
            .expect("metainfo lock poisoned")
            .get(&info_hash)
            .cloned()
            .ok_or(SchedulerError::TorrentNotFound { info_hash })
    }
}
