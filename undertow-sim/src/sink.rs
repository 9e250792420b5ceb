//! Collecting network-event sink.

use std::sync::Mutex;

use undertow_core::netevent::{NetworkEvent, NetworkEventKind, NetworkEventSink};
use undertow_core::{InfoHash, PeerId};

/// Sink that records every event in arrival order for assertions.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<NetworkEvent>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded events in append order.
    pub fn events(&self) -> Vec<NetworkEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }

    /// Kinds of recorded events scoped to one (torrent, remote) pair, in
    /// append order. Torrent-scoped events (no remote) are included.
    pub fn kinds_for(&self, info_hash: InfoHash, remote: Option<PeerId>) -> Vec<NetworkEventKind> {
        self.events
            .lock()
            .expect("sink lock poisoned")
            .iter()
            .filter(|event| {
                event.info_hash == info_hash
                    && (event.remote_peer.is_none() || remote.is_none()
                        || event.remote_peer == remote)
            })
            .map(|event| event.kind)
            .collect()
    }
}

impl NetworkEventSink for MemorySink {
    fn append(&self, event: NetworkEvent) {
        self.events.lock().expect("sink lock poisoned").push(event);
    }
}
