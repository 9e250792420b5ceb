//! Connection registry and blacklist.
//!
//! Indexes non-closed connections by `(remote peer, torrent)` and by
//! torrent, and enforces the admission policy: blacklist, duplicate
//! suppression, per-torrent cap, global cap. The registry holds ids only;
//! connection records live in the loop's arena.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use super::conn::ConnId;
use super::events::{EventQueue, SchedulerEvent};
use crate::clock::Clock;
use crate::config::ConnStateConfig;
use crate::torrent::{InfoHash, PeerId};

/// Why a connection was refused admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDenied {
    /// The (peer, torrent) pair is blacklisted.
    Blacklisted,
    /// A non-closed connection for the pair already exists.
    Duplicate,
    /// The per-torrent connection cap is reached.
    TorrentCapReached,
    /// The global connection cap is reached.
    GlobalCapReached,
}

impl fmt::Display for AdmissionDenied {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            AdmissionDenied::Blacklisted => "peer is blacklisted",
            AdmissionDenied::Duplicate => "duplicate connection",
            AdmissionDenied::TorrentCapReached => "per-torrent connection cap reached",
            AdmissionDenied::GlobalCapReached => "global connection cap reached",
        };
        f.write_str(reason)
    }
}

/// One live blacklist entry.
#[derive(Debug)]
pub struct BlacklistEntry {
    /// Banned remote peer.
    pub remote_peer: PeerId,
    /// Torrent the ban is scoped to.
    pub info_hash: InfoHash,
    /// When the ban lifts.
    pub expires_at: Instant,
}

/// Index of non-closed connections plus the blacklist.
#[derive(Default)]
pub struct ConnRegistry {
    by_key: HashMap<(PeerId, InfoHash), ConnId>,
    by_torrent: HashMap<InfoHash, HashSet<ConnId>>,
    blacklist: HashMap<(PeerId, InfoHash), BlacklistedPair>,
}

struct BlacklistedPair {
    expires_at: Instant,
    expiry_timer: JoinHandle<()>,
}

impl ConnRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks the admission policy for a new connection to
    /// `(remote_peer, info_hash)`.
    ///
    /// # Errors
    /// Returns the first [`AdmissionDenied`] rule the candidate violates,
    /// in policy order.
    pub fn admit(
        &self,
        config: &ConnStateConfig,
        remote_peer: PeerId,
        info_hash: InfoHash,
        now: Instant,
    ) -> Result<(), AdmissionDenied> {
        if self.is_blacklisted(remote_peer, info_hash, now) {
            return Err(AdmissionDenied::Blacklisted);
        }
        if self.by_key.contains_key(&(remote_peer, info_hash)) {
            return Err(AdmissionDenied::Duplicate);
        }
        if self.torrent_count(info_hash) >= config.max_open_connections_per_torrent {
            return Err(AdmissionDenied::TorrentCapReached);
        }
        if self.global_count() >= config.max_global_connections {
            return Err(AdmissionDenied::GlobalCapReached);
        }
        Ok(())
    }

    /// Records an admitted connection.
    pub fn insert(&mut self, conn_id: ConnId, remote_peer: PeerId, info_hash: InfoHash) {
        self.by_key.insert((remote_peer, info_hash), conn_id);
        self.by_torrent.entry(info_hash).or_default().insert(conn_id);
    }

    /// Removes a connection. Inert if the id is not the registered one
    /// (a successor connection may have claimed the key).
    pub fn remove(&mut self, conn_id: ConnId, remote_peer: PeerId, info_hash: InfoHash) {
        if self.by_key.get(&(remote_peer, info_hash)) == Some(&conn_id) {
            self.by_key.remove(&(remote_peer, info_hash));
        }
        if let Some(set) = self.by_torrent.get_mut(&info_hash) {
            set.remove(&conn_id);
            if set.is_empty() {
                self.by_torrent.remove(&info_hash);
            }
        }
    }

    /// Looks up the non-closed connection for a pair.
    pub fn conn_for(&self, remote_peer: PeerId, info_hash: InfoHash) -> Option<ConnId> {
        self.by_key.get(&(remote_peer, info_hash)).copied()
    }

    /// Connection ids scoped to `info_hash`, in deterministic (admission)
    /// order.
    pub fn conns_for_torrent(&self, info_hash: InfoHash) -> Vec<ConnId> {
        let mut ids: Vec<ConnId> = self
            .by_torrent
            .get(&info_hash)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    /// Non-closed connection count for one torrent.
    pub fn torrent_count(&self, info_hash: InfoHash) -> usize {
        self.by_torrent.get(&info_hash).map_or(0, HashSet::len)
    }

    /// Non-closed connection count across all torrents.
    pub fn global_count(&self) -> usize {
        self.by_key.len()
    }

    /// Bans a pair until `expires_at`, replacing any earlier ban. The
    /// caller provides the timer task that will post the expiry event.
    pub fn blacklist(
        &mut self,
        remote_peer: PeerId,
        info_hash: InfoHash,
        expires_at: Instant,
        expiry_timer: JoinHandle<()>,
    ) {
        if let Some(old) = self.blacklist.insert(
            (remote_peer, info_hash),
            BlacklistedPair {
                expires_at,
                expiry_timer,
            },
        ) {
            old.expiry_timer.abort();
        }
    }

    /// Whether a pair is currently banned.
    pub fn is_blacklisted(&self, remote_peer: PeerId, info_hash: InfoHash, now: Instant) -> bool {
        self.blacklist
            .get(&(remote_peer, info_hash))
            .is_some_and(|pair| pair.expires_at > now)
    }

    /// Drops a ban whose deadline has passed.
    pub fn expire_blacklist(&mut self, remote_peer: PeerId, info_hash: InfoHash, now: Instant) {
        let expired = self
            .blacklist
            .get(&(remote_peer, info_hash))
            .is_some_and(|pair| pair.expires_at <= now);
        if expired {
            if let Some(pair) = self.blacklist.remove(&(remote_peer, info_hash)) {
                pair.expiry_timer.abort();
            }
        }
    }

    /// Live bans, for the control surface.
    pub fn blacklist_snapshot(&self, now: Instant) -> Vec<BlacklistEntry> {
        let mut entries: Vec<BlacklistEntry> = self
            .blacklist
            .iter()
            .filter(|(_, pair)| pair.expires_at > now)
            .map(|((remote_peer, info_hash), pair)| BlacklistEntry {
                remote_peer: *remote_peer,
                info_hash: *info_hash,
                expires_at: pair.expires_at,
            })
            .collect();
        entries.sort_by_key(|e| (e.remote_peer, e.info_hash));
        entries
    }

    /// Number of live bans.
    pub fn blacklist_len(&self, now: Instant) -> usize {
        self.blacklist
            .values()
            .filter(|pair| pair.expires_at > now)
            .count()
    }

    /// Aborts every blacklist expiry timer; used on shutdown.
    pub fn clear_blacklist(&mut self) {
        for (_, pair) in self.blacklist.drain() {
            pair.expiry_timer.abort();
        }
    }
}

/// Arms the timer that prunes a blacklist entry once its ban lifts.
pub(crate) fn spawn_blacklist_expiry(
    clock: Arc<dyn Clock>,
    duration: Duration,
    remote_peer: PeerId,
    info_hash: InfoHash,
    queue: EventQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        clock.sleep(duration).await;
        let _ = queue
            .post(SchedulerEvent::BlacklistExpire {
                remote_peer,
                info_hash,
            })
            .await;
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn noop_timer() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    fn config() -> ConnStateConfig {
        ConnStateConfig {
            max_open_connections_per_torrent: 2,
            max_global_connections: 3,
            blacklist_duration: Duration::from_secs(30),
        }
    }

    fn peer(n: u8) -> PeerId {
        PeerId::new([n; 20])
    }

    fn hash(n: u8) -> InfoHash {
        InfoHash::new([n; 20])
    }

    #[tokio::test]
    async fn test_duplicate_is_rejected() {
        let mut reg = ConnRegistry::new();
        let now = Instant::now();
        assert!(reg.admit(&config(), peer(1), hash(1), now).is_ok());
        reg.insert(ConnId(1), peer(1), hash(1));
        assert_eq!(
            reg.admit(&config(), peer(1), hash(1), now),
            Err(AdmissionDenied::Duplicate)
        );
        // Same peer on a different torrent is a separate association.
        assert!(reg.admit(&config(), peer(1), hash(2), now).is_ok());
    }

    #[tokio::test]
    async fn test_per_torrent_cap() {
        let mut reg = ConnRegistry::new();
        let now = Instant::now();
        reg.insert(ConnId(1), peer(1), hash(1));
        reg.insert(ConnId(2), peer(2), hash(1));
        assert_eq!(
            reg.admit(&config(), peer(3), hash(1), now),
            Err(AdmissionDenied::TorrentCapReached)
        );
    }

    #[tokio::test]
    async fn test_global_cap() {
        let mut reg = ConnRegistry::new();
        let now = Instant::now();
        reg.insert(ConnId(1), peer(1), hash(1));
        reg.insert(ConnId(2), peer(2), hash(1));
        reg.insert(ConnId(3), peer(1), hash(2));
        assert_eq!(
            reg.admit(&config(), peer(2), hash(2), now),
            Err(AdmissionDenied::GlobalCapReached)
        );
    }

    #[tokio::test]
    async fn test_blacklist_expiry() {
        let mut reg = ConnRegistry::new();
        let now = Instant::now();
        let until = now + Duration::from_secs(30);
        reg.blacklist(peer(1), hash(1), until, noop_timer());

        assert_eq!(
            reg.admit(&config(), peer(1), hash(1), now),
            Err(AdmissionDenied::Blacklisted)
        );
        assert_eq!(reg.blacklist_snapshot(now).len(), 1);

        reg.expire_blacklist(peer(1), hash(1), until);
        assert!(reg.admit(&config(), peer(1), hash(1), until).is_ok());
        assert!(reg.blacklist_snapshot(until).is_empty());
    }

    #[tokio::test]
    async fn test_expire_before_deadline_is_inert() {
        let mut reg = ConnRegistry::new();
        let now = Instant::now();
        reg.blacklist(peer(1), hash(1), now + Duration::from_secs(30), noop_timer());
        reg.expire_blacklist(peer(1), hash(1), now);
        assert!(reg.is_blacklisted(peer(1), hash(1), now));
    }

    #[tokio::test]
    async fn test_remove_ignores_stale_id() {
        let mut reg = ConnRegistry::new();
        reg.insert(ConnId(1), peer(1), hash(1));
        // A successor claimed the key; removing the predecessor must not
        // evict it.
        reg.insert(ConnId(2), peer(1), hash(1));
        reg.remove(ConnId(1), peer(1), hash(1));
        assert_eq!(reg.conn_for(peer(1), hash(1)), Some(ConnId(2)));
    }
}
