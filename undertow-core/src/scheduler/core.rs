//! The event loop's state and handlers.
//!
//! [`SchedulerCore`] exclusively owns every torrent, connection and
//! blacklist entry. One handler runs per dequeued event, to completion,
//! and never waits on peer or tracker I/O; those run in background tasks
//! that report back through the queue.

#![allow(clippy::too_many_lines)]

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::time::Instant;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::announce::{next_announce_delay, spawn_announce, spawn_announce_timer};
use super::conn::{
    CloseReason, Conn, ConnId, ConnOrigin, ConnStatus, DialOutcome, spawn_dial,
    spawn_request_timer,
};
use super::events::{EventQueue, SchedulerEvent};
use super::registry::{ConnRegistry, spawn_blacklist_expiry};
use super::state::{TorrentState, TorrentStatus, WaiterOutcome, dispatch_rng, rarest_first_order};
use super::{SchedulerDeps, SchedulerStats, TorrentStat};
use crate::bandwidth::BandwidthGate;
use crate::bitfield::Bitfield;
use crate::config::SchedulerConfig;
use crate::netevent::{NetworkEvent, NetworkEventKind};
use crate::network::PeerStream;
use crate::protocol::{Frame, PROTOCOL_VERSION};
use crate::storage::ArchiveError;
use crate::torrent::{InfoHash, PeerHandle, PeerId, PieceIndex};
use crate::{Result, SchedulerError};

pub(crate) struct SchedulerCore {
    config: SchedulerConfig,
    peer_id: PeerId,
    deps: SchedulerDeps,
    queue: EventQueue,
    torrents: HashMap<InfoHash, TorrentState>,
    conns: HashMap<ConnId, Conn>,
    registry: ConnRegistry,
    gate: BandwidthGate,
    next_conn_id: u64,
    preemption_timer: Option<JoinHandle<()>>,
    stats_timer: Option<JoinHandle<()>>,
    closed_bytes_in: u64,
    closed_bytes_out: u64,
}

impl SchedulerCore {
    pub(crate) fn new(
        config: SchedulerConfig,
        peer_id: PeerId,
        deps: SchedulerDeps,
        queue: EventQueue,
    ) -> Self {
        let now = deps.clock.now();
        let gate = BandwidthGate::new(&config.conn, now);
        Self {
            config,
            peer_id,
            deps,
            queue,
            torrents: HashMap::new(),
            conns: HashMap::new(),
            registry: ConnRegistry::new(),
            gate,
            next_conn_id: 0,
            preemption_timer: None,
            stats_timer: None,
            closed_bytes_in: 0,
            closed_bytes_out: 0,
        }
    }

    /// Arms the periodic sweep timers. Called once before the loop starts.
    pub(crate) fn start(&mut self) {
        self.arm_preemption_timer();
        self.arm_stats_timer();
    }

    /// Handles one event to completion. `Break` stops the loop.
    pub(crate) async fn handle_event(&mut self, event: SchedulerEvent) -> ControlFlow<()> {
        match event {
            SchedulerEvent::AddTorrent {
                namespace,
                info_hash,
                responder,
            } => self.on_add_torrent(namespace, info_hash, responder).await,
            SchedulerEvent::RemoveTorrent {
                info_hash,
                responder,
            } => self.on_remove_torrent(info_hash, responder).await,
            SchedulerEvent::AnnounceTick { info_hash } => self.on_announce_tick(info_hash),
            SchedulerEvent::AnnounceResponse { info_hash, result } => {
                self.on_announce_response(info_hash, result);
            }
            SchedulerEvent::IncomingConn {
                remote_peer,
                info_hash,
                stream,
                remote_bitfield,
            } => {
                self.on_incoming_conn(remote_peer, info_hash, stream, remote_bitfield)
                    .await;
            }
            SchedulerEvent::OutgoingConnResult { conn_id, result } => {
                self.on_outgoing_conn_result(conn_id, result);
            }
            SchedulerEvent::ConnClosed { conn_id, reason } => self.close_conn(conn_id, reason),
            SchedulerEvent::PieceReceived {
                conn_id,
                index,
                payload,
            } => self.on_piece_received(conn_id, index, payload).await,
            SchedulerEvent::PieceRequestTimeout { conn_id, index } => {
                self.on_piece_request_timeout(conn_id, index);
            }
            SchedulerEvent::BitfieldUpdate { conn_id, bits } => {
                self.on_bitfield_update(conn_id, bits);
            }
            SchedulerEvent::HaveReceived { conn_id, index } => {
                self.on_have_received(conn_id, index);
            }
            SchedulerEvent::InboundRequest { conn_id, index } => {
                self.on_inbound_request(conn_id, index).await;
            }
            SchedulerEvent::InboundCancel { conn_id, index } => {
                debug!(conn = %conn_id, piece = %index, "cancel for already-served request");
            }
            SchedulerEvent::PreemptionTick => self.on_preemption_tick(),
            SchedulerEvent::EmitStatsTick => self.on_emit_stats_tick(),
            SchedulerEvent::BlacklistExpire {
                remote_peer,
                info_hash,
            } => {
                let now = self.deps.clock.now();
                self.registry.expire_blacklist(remote_peer, info_hash, now);
            }
            SchedulerEvent::Probe { responder } => {
                let _ = responder.send(());
            }
            SchedulerEvent::Stat {
                info_hash,
                responder,
            } => {
                let _ = responder.send(self.torrent_stat(info_hash));
            }
            SchedulerEvent::Stats { responder } => {
                let _ = responder.send(self.stats_snapshot());
            }
            SchedulerEvent::BlacklistSnapshot { responder } => {
                let now = self.deps.clock.now();
                let _ = responder.send(self.registry.blacklist_snapshot(now));
            }
            SchedulerEvent::Reload { config, responder } => {
                self.on_reload(*config);
                let _ = responder.send(());
            }
            SchedulerEvent::Stop { responder } => {
                self.on_stop();
                let _ = responder.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // Torrent lifecycle

    async fn on_add_torrent(
        &mut self,
        namespace: String,
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<()>>,
    ) {
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            if torrent.status == TorrentStatus::Seeding {
                let _ = responder.send(Ok(()));
            } else {
                torrent.waiters.push(responder);
            }
            return;
        }

        let entry = match self.deps.archive.create_torrent(&namespace, info_hash).await {
            Ok(entry) => entry,
            Err(ArchiveError::NotFound { .. }) => {
                let _ = responder.send(Err(SchedulerError::TorrentNotFound { info_hash }));
                return;
            }
            Err(e) => {
                let _ = responder.send(Err(e.into()));
                return;
            }
        };

        let now = self.deps.clock.now();
        let mut torrent = TorrentState::new(namespace, entry.metainfo, entry.bitfield, now);
        self.deps.sink.append(NetworkEvent::torrent(
            NetworkEventKind::AddTorrent,
            info_hash,
            self.peer_id,
            now,
        ));

        let complete = torrent.status == TorrentStatus::Seeding;
        if complete {
            self.deps.sink.append(NetworkEvent::torrent(
                NetworkEventKind::TorrentComplete,
                info_hash,
                self.peer_id,
                now,
            ));
            let _ = responder.send(Ok(()));
        } else {
            torrent.waiters.push(responder);
        }
        self.torrents.insert(info_hash, torrent);
        info!(torrent = %info_hash, seeding = complete, "torrent added");

        spawn_announce(
            self.deps.tracker.clone(),
            info_hash,
            self.local_handle(),
            complete,
            self.queue.clone(),
        );
    }

    async fn on_remove_torrent(
        &mut self,
        info_hash: InfoHash,
        responder: oneshot::Sender<Result<()>>,
    ) {
        self.remove_torrent_entry(info_hash, Some(WaiterOutcome::Removed));
        if let Err(e) = self.deps.archive.delete(info_hash).await {
            warn!(torrent = %info_hash, error = %e, "failed to delete archive entry");
        }
        let _ = responder.send(Ok(()));
    }

    /// Evicts a torrent from the scheduler: resolves waiters, drops its
    /// conns. Archive retention is the caller's concern.
    fn remove_torrent_entry(&mut self, info_hash: InfoHash, outcome: Option<WaiterOutcome>) {
        let Some(mut torrent) = self.torrents.remove(&info_hash) else {
            return;
        };
        if let Some(outcome) = outcome {
            torrent.resolve_waiters(outcome);
        }
        for conn_id in self.registry.conns_for_torrent(info_hash) {
            self.close_conn(conn_id, CloseReason::TorrentRemoved);
        }
        info!(torrent = %info_hash, "torrent removed from scheduler");
    }

    // Announce handling

    fn on_announce_tick(&mut self, info_hash: InfoHash) {
        let complete = match self.torrents.get_mut(&info_hash) {
            Some(torrent) => {
                torrent.announce_timer = None;
                torrent.status == TorrentStatus::Seeding
            }
            None => return,
        };
        spawn_announce(
            self.deps.tracker.clone(),
            info_hash,
            self.local_handle(),
            complete,
            self.queue.clone(),
        );
    }

    fn on_announce_response(&mut self, info_hash: InfoHash, result: Result<Vec<PeerHandle>>) {
        let now = self.deps.clock.now();
        let peers = {
            let Some(torrent) = self.torrents.get_mut(&info_hash) else {
                return;
            };
            match result {
                Ok(peers) => {
                    torrent.announce_failures = 0;
                    peers
                }
                Err(e) => {
                    torrent.announce_failures += 1;
                    debug!(
                        torrent = %info_hash,
                        failures = torrent.announce_failures,
                        error = %e,
                        "announce failed, backing off"
                    );
                    Vec::new()
                }
            }
        };

        for peer in peers {
            self.maybe_dial(info_hash, peer, now);
        }

        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        let delay = next_announce_delay(
            &self.config.announce,
            torrent.announce_failures,
            &mut rand::thread_rng(),
        );
        let next = spawn_announce_timer(self.deps.clock.clone(), delay, info_hash, self.queue.clone());
        if let Some(old) = torrent.announce_timer.replace(next) {
            old.abort();
        }
    }

    // Connection admission

    fn maybe_dial(&mut self, info_hash: InfoHash, peer: PeerHandle, now: Instant) {
        if peer.peer_id == self.peer_id {
            return;
        }
        if let Err(denied) =
            self.registry
                .admit(&self.config.conn_state, peer.peer_id, info_hash, now)
        {
            debug!(remote = %peer.peer_id, torrent = %info_hash, %denied, "not dialing");
            return;
        }
        let (piece_count, local_bitfield) = match self.torrents.get(&info_hash) {
            Some(torrent) => (torrent.metainfo.piece_count(), torrent.bitfield.clone()),
            None => return,
        };

        let conn_id = self.alloc_conn_id();
        let mut conn =
            Conn::pending_outgoing(conn_id, peer.peer_id, info_hash, piece_count, now);
        conn.track_task(spawn_dial(
            conn_id,
            peer,
            info_hash,
            self.peer_id,
            local_bitfield,
            self.deps.network.clone(),
            self.deps.clock.clone(),
            self.config.conn.handshake_timeout,
            self.queue.clone(),
        ));
        self.registry.insert(conn_id, peer.peer_id, info_hash);
        self.conns.insert(conn_id, conn);
        self.sink_conn(NetworkEventKind::AddPendingConn, info_hash, peer.peer_id, now);
        debug!(conn = %conn_id, remote = %peer.peer_id, torrent = %info_hash, "dialing");
    }

    async fn on_incoming_conn(
        &mut self,
        remote_peer: PeerId,
        info_hash: InfoHash,
        stream: PeerStream,
        remote_bitfield: Bitfield,
    ) {
        let now = self.deps.clock.now();
        if !self.torrents.contains_key(&info_hash) {
            // A remote wants a torrent the scheduler forgot but the
            // archive still holds; revive it and start seeding.
            match self.deps.archive.stat(info_hash).await {
                Ok(entry) => {
                    let torrent =
                        TorrentState::new(String::new(), entry.metainfo, entry.bitfield, now);
                    let complete = torrent.status == TorrentStatus::Seeding;
                    self.deps.sink.append(NetworkEvent::torrent(
                        NetworkEventKind::AddTorrent,
                        info_hash,
                        self.peer_id,
                        now,
                    ));
                    if complete {
                        self.deps.sink.append(NetworkEvent::torrent(
                            NetworkEventKind::TorrentComplete,
                            info_hash,
                            self.peer_id,
                            now,
                        ));
                    }
                    self.torrents.insert(info_hash, torrent);
                    info!(torrent = %info_hash, "revived inactive torrent from archive");
                    spawn_announce(
                        self.deps.tracker.clone(),
                        info_hash,
                        self.local_handle(),
                        complete,
                        self.queue.clone(),
                    );
                }
                Err(_) => {
                    debug!(torrent = %info_hash, "refusing conn for unknown torrent");
                    return;
                }
            }
        }
        let (piece_count, local_bitfield) = match self.torrents.get(&info_hash) {
            Some(torrent) => (torrent.metainfo.piece_count(), torrent.bitfield.clone()),
            None => return,
        };
        if remote_bitfield.len() != piece_count {
            debug!(remote = %remote_peer, "refusing conn with mismatched bitfield");
            return;
        }

        // Simultaneous dial: the side with the smaller peer id keeps its
        // outgoing connection.
        if let Some(existing) = self.registry.conn_for(remote_peer, info_hash) {
            let ours_wins = self
                .conns
                .get(&existing)
                .map_or(true, |conn| {
                    conn.status != ConnStatus::Pending
                        || conn.origin != ConnOrigin::Outgoing
                        || self.peer_id < remote_peer
                });
            if ours_wins {
                debug!(remote = %remote_peer, "rejecting duplicate incoming conn");
                return;
            }
            self.drop_pending(existing);
        }

        if let Err(denied) =
            self.registry
                .admit(&self.config.conn_state, remote_peer, info_hash, now)
        {
            debug!(remote = %remote_peer, torrent = %info_hash, %denied, "refusing incoming conn");
            return;
        }

        let greeting = Frame::Handshake {
            version: PROTOCOL_VERSION,
            peer_id: self.peer_id,
            info_hash,
            bitfield: local_bitfield,
        };
        let conn_id = self.alloc_conn_id();
        let mut conn =
            Conn::pending_incoming(conn_id, remote_peer, info_hash, remote_bitfield, now);
        self.sink_conn(NetworkEventKind::AddPendingConn, info_hash, remote_peer, now);
        conn.activate(stream, vec![greeting], self.queue.clone());
        self.sink_conn(NetworkEventKind::AddActiveConn, info_hash, remote_peer, now);
        self.registry.insert(conn_id, remote_peer, info_hash);
        self.conns.insert(conn_id, conn);
        debug!(conn = %conn_id, remote = %remote_peer, torrent = %info_hash, "accepted conn");
        self.dispatch_requests(info_hash);
    }

    fn on_outgoing_conn_result(&mut self, conn_id: ConnId, result: Result<DialOutcome>) {
        let now = self.deps.clock.now();
        let Some(conn) = self.conns.get(&conn_id) else {
            // The pending conn lost a tie-break or its torrent; the
            // stream (if any) is dropped with the result.
            return;
        };
        let info_hash = conn.info_hash;
        let remote_peer = conn.remote_peer;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(conn = %conn_id, remote = %remote_peer, error = %e, "dial failed");
                self.close_conn(conn_id, CloseReason::HandshakeFailed);
                return;
            }
        };

        let piece_count = match self.torrents.get(&info_hash) {
            Some(torrent) => torrent.metainfo.piece_count(),
            None => {
                self.close_conn(conn_id, CloseReason::TorrentRemoved);
                return;
            }
        };
        if outcome.remote_bitfield.len() != piece_count {
            self.close_conn(conn_id, CloseReason::ProtocolError);
            return;
        }

        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.remote_bitfield = outcome.remote_bitfield;
            conn.activate(outcome.stream, Vec::new(), self.queue.clone());
        }
        self.sink_conn(NetworkEventKind::AddActiveConn, info_hash, remote_peer, now);
        debug!(conn = %conn_id, remote = %remote_peer, torrent = %info_hash, "conn active");
        self.dispatch_requests(info_hash);
    }

    /// Tears down a connection and reconciles every structure that
    /// referenced it. Safe to call with stale ids.
    fn close_conn(&mut self, conn_id: ConnId, reason: CloseReason) {
        let Some(mut conn) = self.conns.remove(&conn_id) else {
            return;
        };
        let now = self.deps.clock.now();
        self.registry.remove(conn_id, conn.remote_peer, conn.info_hash);
        conn.shutdown();
        self.closed_bytes_in += conn.bytes_in;
        self.closed_bytes_out += conn.bytes_out;

        if conn.status == ConnStatus::Active {
            self.sink_conn(
                NetworkEventKind::DropActiveConn,
                conn.info_hash,
                conn.remote_peer,
                now,
            );
        }
        debug!(conn = %conn_id, remote = %conn.remote_peer, ?reason, "conn closed");

        if reason.blacklists() {
            self.blacklist_pair(conn.remote_peer, conn.info_hash, now);
        }

        let mut redispatch = false;
        if let Some(torrent) = self.torrents.get_mut(&conn.info_hash) {
            torrent.forget_conn(conn_id);
            redispatch = torrent.status == TorrentStatus::Downloading;
        }
        if redispatch && reason != CloseReason::Shutdown {
            self.dispatch_requests(conn.info_hash);
        }
    }

    /// Drops a pending conn that lost a dial tie-break, without penalty.
    fn drop_pending(&mut self, conn_id: ConnId) {
        if let Some(mut conn) = self.conns.remove(&conn_id) {
            self.registry.remove(conn_id, conn.remote_peer, conn.info_hash);
            conn.shutdown();
            debug!(conn = %conn_id, remote = %conn.remote_peer, "dropped pending conn (tie-break)");
        }
    }

    fn blacklist_pair(&mut self, remote_peer: PeerId, info_hash: InfoHash, now: Instant) {
        let duration = self.config.conn_state.blacklist_duration;
        let timer = spawn_blacklist_expiry(
            self.deps.clock.clone(),
            duration,
            remote_peer,
            info_hash,
            self.queue.clone(),
        );
        self.registry
            .blacklist(remote_peer, info_hash, now + duration, timer);
        self.sink_conn(NetworkEventKind::BlacklistConn, info_hash, remote_peer, now);
    }

    // Piece exchange

    async fn on_piece_received(&mut self, conn_id: ConnId, index: PieceIndex, payload: Vec<u8>) {
        let now = self.deps.clock.now();
        let (info_hash, remote_peer) = {
            let Some(conn) = self.conns.get_mut(&conn_id) else {
                return;
            };
            if conn.status != ConnStatus::Active {
                return;
            }
            if let Some(timer) = conn.inflight.remove(&index) {
                timer.abort();
            }
            conn.bytes_in += payload.len() as u64;
            conn.last_piece_at = now;
            conn.strikes = 0;
            (conn.info_hash, conn.remote_peer)
        };

        enum Disposition {
            AlreadyHeld,
            Corrupt,
            Fresh,
        }
        let disposition = {
            let Some(torrent) = self.torrents.get_mut(&info_hash) else {
                return;
            };
            if let Some(holders) = torrent.inflight.get_mut(&index) {
                holders.retain(|id| *id != conn_id);
                if holders.is_empty() {
                    torrent.inflight.remove(&index);
                }
            }
            if torrent.bitfield.get(index) {
                Disposition::AlreadyHeld
            } else if !torrent.metainfo.verify_piece(index, &payload) {
                Disposition::Corrupt
            } else {
                Disposition::Fresh
            }
        };

        match disposition {
            Disposition::AlreadyHeld => return,
            Disposition::Corrupt => {
                warn!(conn = %conn_id, remote = %remote_peer, piece = %index, "piece digest mismatch");
                self.close_conn(conn_id, CloseReason::ProtocolError);
                return;
            }
            Disposition::Fresh => {}
        }

        if let Err(e) = self.deps.archive.write_piece(info_hash, index, &payload).await {
            warn!(torrent = %info_hash, piece = %index, error = %e, "failed to persist piece");
            self.dispatch_requests(info_hash);
            return;
        }

        let (duplicates, completed) = {
            let Some(torrent) = self.torrents.get_mut(&info_hash) else {
                return;
            };
            torrent.bitfield.set(index);
            torrent.last_activity = now;
            let duplicates = torrent.inflight.remove(&index).unwrap_or_default();
            let completed = torrent.bitfield.is_complete();
            if completed {
                torrent.status = TorrentStatus::Seeding;
                torrent.resolve_waiters(WaiterOutcome::Complete);
            }
            (duplicates, completed)
        };

        self.deps.sink.append(NetworkEvent::piece(
            info_hash,
            self.peer_id,
            remote_peer,
            index,
            now,
        ));

        // End-game: first verified receipt withdraws the duplicates.
        for duplicate in duplicates {
            if duplicate == conn_id {
                continue;
            }
            if let Some(other) = self.conns.get_mut(&duplicate) {
                if let Some(timer) = other.inflight.remove(&index) {
                    timer.abort();
                }
                other.send(Frame::Cancel { index });
            }
        }

        for id in self.registry.conns_for_torrent(info_hash) {
            if let Some(conn) = self.conns.get(&id) {
                if conn.status == ConnStatus::Active {
                    conn.send(Frame::Have { index });
                }
            }
        }

        if completed {
            self.deps.sink.append(NetworkEvent::torrent(
                NetworkEventKind::TorrentComplete,
                info_hash,
                self.peer_id,
                now,
            ));
            info!(torrent = %info_hash, "download complete, now seeding");
        } else {
            self.dispatch_requests(info_hash);
        }
    }

    fn on_piece_request_timeout(&mut self, conn_id: ConnId, index: PieceIndex) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if conn.inflight.remove(&index).is_none() {
            return;
        }
        conn.strikes += 1;
        let info_hash = conn.info_hash;
        let strikes = conn.strikes;
        debug!(conn = %conn_id, piece = %index, strikes, "piece request timed out");

        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            if let Some(holders) = torrent.inflight.get_mut(&index) {
                holders.retain(|id| *id != conn_id);
                if holders.is_empty() {
                    torrent.inflight.remove(&index);
                }
            }
        }

        if strikes >= self.config.conn.request_strike_limit {
            self.close_conn(conn_id, CloseReason::RequestTimeout);
        } else {
            self.dispatch_requests(info_hash);
        }
    }

    fn on_bitfield_update(&mut self, conn_id: ConnId, bits: Vec<u8>) {
        let Some(conn) = self.conns.get(&conn_id) else {
            return;
        };
        let info_hash = conn.info_hash;
        let piece_count = match self.torrents.get(&info_hash) {
            Some(torrent) => torrent.metainfo.piece_count(),
            None => return,
        };
        let Some(bitfield) = Bitfield::from_bytes(&bits, piece_count) else {
            self.close_conn(conn_id, CloseReason::ProtocolError);
            return;
        };
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.remote_bitfield = bitfield;
        }
        self.dispatch_requests(info_hash);
    }

    fn on_have_received(&mut self, conn_id: ConnId, index: PieceIndex) {
        let Some(conn) = self.conns.get_mut(&conn_id) else {
            return;
        };
        if index.as_u32() >= conn.remote_bitfield.len() {
            self.close_conn(conn_id, CloseReason::ProtocolError);
            return;
        }
        conn.remote_bitfield.set(index);
        let info_hash = conn.info_hash;
        self.dispatch_requests(info_hash);
    }

    async fn on_inbound_request(&mut self, conn_id: ConnId, index: PieceIndex) {
        let now = self.deps.clock.now();
        let info_hash = match self.conns.get(&conn_id) {
            Some(conn) if conn.status == ConnStatus::Active => conn.info_hash,
            _ => return,
        };
        // Serving policy: anything we cannot satisfy right now is
        // silently dropped; the remote's request timeout recovers.
        let piece_size = match self.torrents.get(&info_hash) {
            Some(torrent) if torrent.bitfield.get(index) => {
                u64::from(torrent.metainfo.piece_size(index))
            }
            _ => return,
        };
        if !self.gate.try_reserve_egress(piece_size, now) {
            debug!(conn = %conn_id, piece = %index, "egress budget exhausted, dropping request");
            return;
        }
        let data = match self.deps.archive.read_piece(info_hash, index).await {
            Ok(data) => data,
            Err(e) => {
                debug!(torrent = %info_hash, piece = %index, error = %e, "dropping unservable request");
                return;
            }
        };
        if let Some(torrent) = self.torrents.get_mut(&info_hash) {
            torrent.last_activity = now;
        }
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.bytes_out += data.len() as u64;
            conn.send(Frame::Piece { index, data });
        }
    }

    /// Requests missing pieces across the torrent's active conns:
    /// rarest-first order, bounded pipelines, at most one conn per piece
    /// outside end-game, all subject to the ingress gate.
    fn dispatch_requests(&mut self, info_hash: InfoHash) {
        let now = self.deps.clock.now();
        let pipeline_depth = self.config.conn.pipeline_depth as usize;
        let request_timeout = self.config.conn.piece_request_timeout;
        let endgame_threshold = self.config.endgame_threshold;

        let conn_ids = self.registry.conns_for_torrent(info_hash);
        let Some(torrent) = self.torrents.get_mut(&info_hash) else {
            return;
        };
        if torrent.status != TorrentStatus::Downloading {
            return;
        }
        torrent.dispatch_tick += 1;
        let endgame = torrent.missing_count() <= endgame_threshold;

        let missing: Vec<PieceIndex> = torrent.bitfield.missing_pieces().collect();
        let mut candidates: Vec<(PieceIndex, u32)> = Vec::new();
        for piece in missing {
            let inflight_on = torrent.inflight.get(&piece).map_or(0, Vec::len);
            if inflight_on > 0 && !endgame {
                continue;
            }
            let mut availability = 0u32;
            for id in &conn_ids {
                if let Some(conn) = self.conns.get(id) {
                    if conn.status == ConnStatus::Active && conn.remote_bitfield.get(piece) {
                        availability += 1;
                    }
                }
            }
            if availability > 0 {
                candidates.push((piece, availability));
            }
        }

        let mut rng = dispatch_rng(info_hash, self.peer_id, torrent.dispatch_tick);
        for piece in rarest_first_order(candidates, &mut rng) {
            let mut chosen: Option<ConnId> = None;
            let mut best_load = usize::MAX;
            for id in &conn_ids {
                let Some(conn) = self.conns.get(id) else {
                    continue;
                };
                if conn.status != ConnStatus::Active
                    || !conn.remote_bitfield.get(piece)
                    || conn.inflight.len() >= pipeline_depth
                    || conn.inflight.contains_key(&piece)
                {
                    continue;
                }
                if conn.inflight.len() < best_load {
                    best_load = conn.inflight.len();
                    chosen = Some(*id);
                }
            }
            let Some(chosen) = chosen else {
                continue;
            };
            let piece_bytes = u64::from(torrent.metainfo.piece_size(piece));
            if !self.gate.try_reserve_ingress(piece_bytes, now) {
                // Budget exhausted; the preemption tick retries.
                break;
            }
            let timer = spawn_request_timer(
                chosen,
                piece,
                self.deps.clock.clone(),
                request_timeout,
                self.queue.clone(),
            );
            if let Some(conn) = self.conns.get_mut(&chosen) {
                conn.send(Frame::Request { index: piece });
                conn.inflight.insert(piece, timer);
            }
            torrent.inflight.entry(piece).or_default().push(chosen);
        }
    }

    // Sweeps and ticks

    fn on_preemption_tick(&mut self) {
        let now = self.deps.clock.now();

        let mut to_close: Vec<(ConnId, CloseReason)> = Vec::new();
        for (id, conn) in &self.conns {
            if conn.status != ConnStatus::Active {
                continue;
            }
            if now.duration_since(conn.opened_at) >= self.config.conn_ttl {
                to_close.push((*id, CloseReason::Preempted));
            } else if now.duration_since(conn.last_piece_at) >= self.config.conn_tti {
                to_close.push((*id, CloseReason::Idle));
            }
        }
        to_close.sort_unstable_by_key(|(id, _)| *id);
        for (id, reason) in to_close {
            self.close_conn(id, reason);
        }

        let mut expired: Vec<(InfoHash, Option<WaiterOutcome>)> = Vec::new();
        for (hash, torrent) in &self.torrents {
            match torrent.status {
                TorrentStatus::Seeding
                    if now.duration_since(torrent.last_activity) >= self.config.seeder_tti =>
                {
                    expired.push((*hash, None));
                }
                TorrentStatus::Downloading
                    if now.duration_since(torrent.created_at) >= self.config.leecher_tti =>
                {
                    expired.push((*hash, Some(WaiterOutcome::Timeout)));
                }
                _ => {}
            }
        }
        for (hash, outcome) in expired {
            self.remove_torrent_entry(hash, outcome);
        }

        let hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for hash in hashes {
            self.dispatch_requests(hash);
        }
        self.arm_preemption_timer();
    }

    fn on_emit_stats_tick(&mut self) {
        let stats = self.stats_snapshot();
        info!(
            downloading = stats.torrents_downloading,
            seeding = stats.torrents_seeding,
            conns_active = stats.conns_active,
            conns_pending = stats.conns_pending,
            blacklisted = stats.blacklist_len,
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            events_dropped = stats.events_dropped,
            "scheduler stats"
        );
        self.arm_stats_timer();
    }

    fn on_reload(&mut self, config: SchedulerConfig) {
        let now = self.deps.clock.now();
        // Live state, including in-flight requests, is untouched; timers
        // pick the new durations up when they next re-arm.
        self.gate = BandwidthGate::new(&config.conn, now);
        self.config = config;
        info!("scheduler configuration reloaded");
    }

    fn on_stop(&mut self) {
        // Close the queue first: producers fail fast from here on, and
        // the actor drains (and drops) anything already queued so no
        // responder is left hanging.
        self.queue.close();
        let hashes: Vec<InfoHash> = self.torrents.keys().copied().collect();
        for hash in hashes {
            if let Some(mut torrent) = self.torrents.remove(&hash) {
                torrent.resolve_waiters(WaiterOutcome::ShuttingDown);
            }
        }
        let mut ids: Vec<ConnId> = self.conns.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            self.close_conn(id, CloseReason::Shutdown);
        }
        self.registry.clear_blacklist();
        if let Some(timer) = self.preemption_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.stats_timer.take() {
            timer.abort();
        }
        info!("scheduler stopped");
    }

    // Views

    fn torrent_stat(&self, info_hash: InfoHash) -> Result<TorrentStat> {
        let torrent = self
            .torrents
            .get(&info_hash)
            .ok_or(SchedulerError::TorrentNotFound { info_hash })?;
        Ok(TorrentStat {
            status: torrent.status,
            progress: torrent.progress(),
            num_conns: self.registry.torrent_count(info_hash),
        })
    }

    fn stats_snapshot(&self) -> SchedulerStats {
        let now = self.deps.clock.now();
        let mut stats = SchedulerStats {
            events_dropped: self.queue.dropped(),
            blacklist_len: self.registry.blacklist_len(now),
            bytes_in: self.closed_bytes_in,
            bytes_out: self.closed_bytes_out,
            ..SchedulerStats::default()
        };
        for torrent in self.torrents.values() {
            match torrent.status {
                TorrentStatus::Downloading => stats.torrents_downloading += 1,
                TorrentStatus::Seeding => stats.torrents_seeding += 1,
                TorrentStatus::Removed => {}
            }
        }
        for conn in self.conns.values() {
            match conn.status {
                ConnStatus::Pending => stats.conns_pending += 1,
                ConnStatus::Active => stats.conns_active += 1,
            }
            stats.bytes_in += conn.bytes_in;
            stats.bytes_out += conn.bytes_out;
        }
        stats
    }

    // Plumbing

    fn alloc_conn_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }

    fn local_handle(&self) -> PeerHandle {
        PeerHandle {
            peer_id: self.peer_id,
            addr: self.deps.network.local_addr(),
        }
    }

    fn sink_conn(
        &self,
        kind: NetworkEventKind,
        info_hash: InfoHash,
        remote_peer: PeerId,
        now: Instant,
    ) {
        self.deps
            .sink
            .append(NetworkEvent::conn(kind, info_hash, self.peer_id, remote_peer, now));
    }

    fn arm_preemption_timer(&mut self) {
        let queue = self.queue.clone();
        let clock = self.deps.clock.clone();
        let interval = self.config.preemption_interval;
        self.preemption_timer = Some(tokio::spawn(async move {
            clock.sleep(interval).await;
            let _ = queue.post(SchedulerEvent::PreemptionTick).await;
        }));
    }

    fn arm_stats_timer(&mut self) {
        let queue = self.queue.clone();
        let clock = self.deps.clock.clone();
        let interval = self.config.emit_stats_interval;
        self.stats_timer = Some(tokio::spawn(async move {
            clock.sleep(interval).await;
            let _ = queue.post(SchedulerEvent::EmitStatsTick).await;
        }));
    }
}
