//! In-memory torrent archive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use undertow_core::metainfo::MetainfoClient;
use undertow_core::storage::{ArchiveError, ArchiveTorrent, TorrentArchive};
use undertow_core::{Bitfield, InfoHash, Metainfo, PieceIndex};

use crate::fixtures::TorrentFixture;

/// In-memory [`TorrentArchive`] backed by the metainfo collaborator.
///
/// Metainfo is fetched once per torrent and cached with the entry, so
/// concurrent `create_torrent` races collapse to a single download.
pub struct MemoryArchive {
    metainfo_client: Arc<dyn MetainfoClient>,
    entries: Mutex<HashMap<InfoHash, Entry>>,
}

struct Entry {
    metainfo: Metainfo,
    pieces: Vec<Option<Vec<u8>>>,
}

impl Entry {
    fn new(metainfo: Metainfo) -> Self {
        let pieces = vec![None; metainfo.piece_count() as usize];
        Self { metainfo, pieces }
    }

    fn snapshot(&self) -> ArchiveTorrent {
        let mut bitfield = Bitfield::new(self.metainfo.piece_count());
        for (i, piece) in self.pieces.iter().enumerate() {
            if piece.is_some() {
                bitfield.set(PieceIndex::new(i as u32));
            }
        }
        ArchiveTorrent {
            metainfo: self.metainfo.clone(),
            bitfield,
        }
    }
}

impl MemoryArchive {
    /// Creates an archive resolving metainfo through `metainfo_client`.
    pub fn new(metainfo_client: Arc<dyn MetainfoClient>) -> Self {
        Self {
            metainfo_client,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Installs a complete local copy of a fixture, the way an origin or
    /// previously finished peer would hold it.
    pub fn seed(&self, fixture: &TorrentFixture) {
        let mut entry = Entry::new(fixture.metainfo.clone());
        let piece_length = fixture.metainfo.piece_length() as usize;
        for (i, chunk) in fixture.content.chunks(piece_length.max(1)).enumerate() {
            entry.pieces[i] = Some(chunk.to_vec());
        }
        self.entries
            .lock()
            .expect("archive lock poisoned")
            .insert(fixture.info_hash(), entry);
    }

    /// Installs an entry holding only piece `index` of the fixture.
    pub fn seed_piece(&self, fixture: &TorrentFixture, index: u32) {
        let mut entry = Entry::new(fixture.metainfo.clone());
        entry.pieces[index as usize] = Some(fixture.piece(index));
        self.entries
            .lock()
            .expect("archive lock poisoned")
            .insert(fixture.info_hash(), entry);
    }

    /// Returns the assembled content when every piece is present.
    pub fn content(&self, info_hash: InfoHash) -> Option<Vec<u8>> {
        let entries = self.entries.lock().expect("archive lock poisoned");
        let entry = entries.get(&info_hash)?;
        let mut content = Vec::with_capacity(entry.metainfo.total_size() as usize);
        for piece in &entry.pieces {
            content.extend_from_slice(piece.as_deref()?);
        }
        Some(content)
    }
}

#[async_trait]
impl TorrentArchive for MemoryArchive {
    async fn create_torrent(
        &self,
        namespace: &str,
        info_hash: InfoHash,
    ) -> Result<ArchiveTorrent, ArchiveError> {
        {
            let entries = self.entries.lock().expect("archive lock poisoned");
            if let Some(entry) = entries.get(&info_hash) {
                return Ok(entry.snapshot());
            }
        }
        let metainfo = self
            .metainfo_client
            .download(namespace, info_hash)
            .await
            .map_err(|_| ArchiveError::NotFound { info_hash })?;
        let mut entries = self.entries.lock().expect("archive lock poisoned");
        let entry = entries
            .entry(info_hash)
            .or_insert_with(|| Entry::new(metainfo));
        Ok(entry.snapshot())
    }

    async fn write_piece(
        &self,
        info_hash: InfoHash,
        index: PieceIndex,
        data: &[u8],
    ) -> Result<(), ArchiveError> {
        let mut entries = self.entries.lock().expect("archive lock poisoned");
        let entry = entries
            .get_mut(&info_hash)
            .ok_or(ArchiveError::NotFound { info_hash })?;
        let slot = entry
            .pieces
            .get_mut(index.as_usize())
            .ok_or(ArchiveError::NotFound { info_hash })?;
        *slot = Some(data.to_vec());
        Ok(())
    }

    async fn read_piece(
        &self,
        info_hash: InfoHash,
        index: PieceIndex,
    ) -> Result<Vec<u8>, ArchiveError> {
        let entries = self.entries.lock().expect("archive lock poisoned");
        entries
            .get(&info_hash)
            .and_then(|entry| entry.pieces.get(index.as_usize()))
            .and_then(|piece| piece.clone())
            .ok_or(ArchiveError::NotFound { info_hash })
    }

    async fn stat(&self, info_hash: InfoHash) -> Result<ArchiveTorrent, ArchiveError> {
        let entries = self.entries.lock().expect("archive lock poisoned");
        entries
            .get(&info_hash)
            .map(Entry::snapshot)
            .ok_or(ArchiveError::NotFound { info_hash })
    }

    async fn delete(&self, info_hash: InfoHash) -> Result<(), ArchiveError> {
        self.entries
            .lock()
            .expect("archive lock poisoned")
            .remove(&info_hash);
        Ok(())
    }
}
