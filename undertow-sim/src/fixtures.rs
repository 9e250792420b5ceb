//! Torrent content fixtures.

use rand::RngCore;
use undertow_core::{InfoHash, Metainfo};

/// A torrent with real content and matching piece digests.
#[derive(Debug, Clone)]
pub struct TorrentFixture {
    /// The full content blob.
    pub content: Vec<u8>,
    /// Descriptor with per-piece digests of `content`.
    pub metainfo: Metainfo,
}

impl TorrentFixture {
    /// Generates random content with the given geometry.
    pub fn generate(size: usize, piece_length: u32) -> Self {
        let mut content = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut content);
        let metainfo = Metainfo::from_content(&content, piece_length);
        Self { content, metainfo }
    }

    /// Default fixture: four 256-byte pieces.
    pub fn small() -> Self {
        Self::generate(1024, 256)
    }

    /// The torrent's digest.
    pub fn info_hash(&self) -> InfoHash {
        self.metainfo.info_hash()
    }

    /// Content bytes of piece `index`.
    pub fn piece(&self, index: u32) -> Vec<u8> {
        let piece_length = self.metainfo.piece_length() as usize;
        let start = index as usize * piece_length;
        let end = (start + piece_length).min(self.content.len());
        self.content[start..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use undertow_core::PieceIndex;

    use super::*;

    #[test]
    fn test_fixture_pieces_verify() {
        let fixture = TorrentFixture::generate(1000, 256);
        assert_eq!(fixture.metainfo.piece_count(), 4);
        for i in 0..4 {
            assert!(
                fixture
                    .metainfo
                    .verify_piece(PieceIndex::new(i), &fixture.piece(i))
            );
        }
        // The tail piece is short.
        assert_eq!(fixture.piece(3).len(), 232);
    }
}
