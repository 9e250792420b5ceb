//! End-to-end scheduler scenarios over the simulation harness.
//!
//! Fast paths (piece exchange, admission, completion) run on the system
//! clock; every lifecycle scenario (TTI eviction, preemption, blacklist
//! expiry, stats ticks) runs on the simulated clock in discrete ticks.

use std::sync::Arc;
use std::time::Duration;

use undertow_core::netevent::NetworkEventKind;
use undertow_core::scheduler::EventKind;
use undertow_core::storage::{ArchiveError, TorrentArchive};
use undertow_core::{SchedulerConfig, SchedulerError, TorrentStatus};
use undertow_sim::{SimulatedClock, SimulatedSwarm, TorrentFixture};

const LONG_WAIT: Duration = Duration::from_secs(30);

fn init_logging() {
    let _ = tracing_subscriber::fmt::try_init();
}

fn test_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::for_testing();
    config.conn.disable_throttling = true;
    config
}

async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(LONG_WAIT, fut)
        .await
        .expect("scenario timed out")
}

#[tokio::test]
async fn test_download_with_seeder_and_leecher() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let seeder = swarm.add_peer(test_config());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let leecher = swarm.add_peer(test_config());
    let watch = leecher
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();
    leecher.check_torrent(&fixture);

    let stat = leecher.handle.stat(fixture.info_hash()).await.unwrap();
    assert_eq!(stat.status, TorrentStatus::Seeding);
    assert!((stat.progress - 1.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_add_torrent_after_seeding_is_immediate() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let seeder = swarm.add_peer(test_config());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    // Already seeding: resolves without any further metainfo traffic.
    let before = swarm.metainfo().download_count(fixture.info_hash());
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();
    assert_eq!(swarm.metainfo().download_count(fixture.info_hash()), before);
}

#[tokio::test]
async fn test_download_many_torrents_with_seeder_and_leecher() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let seeder = swarm.add_peer(test_config());
    let leecher = swarm.add_peer(test_config());

    let mut watches = Vec::new();
    let mut fixtures = Vec::new();
    for _ in 0..5 {
        let fixture = TorrentFixture::small();
        swarm.register(&fixture);
        seeder.seed(&fixture);

        let seeder_watch = seeder
            .handle
            .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
            .await
            .unwrap();
        within(seeder_watch.wait()).await.unwrap();

        let watch = leecher
            .handle
            .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
            .await
            .unwrap();
        watches.push(watch);
        fixtures.push(fixture);
    }

    for watch in watches {
        within(watch.wait()).await.unwrap();
    }
    for fixture in &fixtures {
        leecher.check_torrent(fixture);
    }
}

#[tokio::test]
async fn test_download_when_peers_all_have_different_pieces() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let piece_length = 256u32;
    let peer_count = 10usize;
    let fixture = TorrentFixture::generate(peer_count * piece_length as usize, piece_length);
    swarm.register(&fixture);

    let mut peers = Vec::new();
    for i in 0..peer_count {
        let peer = swarm.add_peer(test_config());
        peer.archive.seed_piece(&fixture, i as u32);
        peers.push(peer);
    }

    let mut watches = Vec::new();
    for peer in &peers {
        let watch = peer
            .handle
            .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
            .await
            .unwrap();
        watches.push(watch);
    }
    for watch in watches {
        within(watch.wait()).await.unwrap();
    }
    for peer in &peers {
        peer.check_torrent(&fixture);
    }
}

#[tokio::test]
async fn test_multiple_add_torrents_share_one_outcome() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let seeder = swarm.add_peer(test_config());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let leecher = swarm.add_peer(test_config());
    let mut watches = Vec::new();
    for _ in 0..10 {
        watches.push(
            leecher
                .handle
                .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
                .await
                .unwrap(),
        );
    }
    for watch in watches {
        within(watch.wait()).await.unwrap();
    }
    leecher.check_torrent(&fixture);

    // The seeder never downloads metainfo (pre-seeded archive) and the
    // leecher's archive caches, so ten waiters cost one fetch in total.
    assert_eq!(swarm.metainfo().download_count(fixture.info_hash()), 1);
}

#[tokio::test]
async fn test_leecher_tti_times_out_the_download() {
    init_logging();
    let clock = Arc::new(SimulatedClock::new());
    let swarm = SimulatedSwarm::with_clock(clock.clone());
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let config = test_config();
    let leecher_tti = config.leecher_tti;
    let peer = swarm.add_peer(config);

    let watch = peer
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    // Barrier: the probe resolves only after the add was handled.
    peer.handle.probe().await.unwrap();

    let ticks = peer.observer.processed_count(EventKind::PreemptionTick);
    clock.advance(leecher_tti + Duration::from_secs(1)).await;
    within(
        peer.observer
            .wait_for_count(EventKind::PreemptionTick, ticks + 1),
    )
    .await;

    let result = within(watch.wait()).await;
    assert!(matches!(result, Err(SchedulerError::TorrentTimeout)));
    peer.wait_removed(fixture.info_hash()).await;
}

#[tokio::test]
async fn test_seeder_tti_evicts_conns_then_torrents() {
    init_logging();
    let clock = Arc::new(SimulatedClock::new());
    let swarm = SimulatedSwarm::with_clock(clock.clone());
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let config = test_config();
    let conn_tti = config.conn_tti;
    let seeder_tti = config.seeder_tti;
    let preemption = config.preemption_interval;

    let seeder = swarm.add_peer(config.clone());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let leecher = swarm.add_peer(config);
    let watch = leecher
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();
    leecher.check_torrent(&fixture);

    // Conns expire first.
    let leecher_ticks = leecher.observer.processed_count(EventKind::PreemptionTick);
    let seeder_ticks = seeder.observer.processed_count(EventKind::PreemptionTick);
    clock.advance(conn_tti + preemption).await;
    within(
        leecher
            .observer
            .wait_for_count(EventKind::PreemptionTick, leecher_ticks + 1),
    )
    .await;
    within(
        seeder
            .observer
            .wait_for_count(EventKind::PreemptionTick, seeder_ticks + 1),
    )
    .await;
    assert!(!seeder.has_conns(fixture.info_hash()).await);
    assert!(!leecher.has_conns(fixture.info_hash()).await);

    // Then the seeding torrents expire on both sides.
    clock.advance(seeder_tti + preemption).await;
    seeder.wait_removed(fixture.info_hash()).await;
    leecher.wait_removed(fixture.info_hash()).await;
    assert!(!seeder.has_conns(fixture.info_hash()).await);
    assert!(!leecher.has_conns(fixture.info_hash()).await);
}

#[tokio::test]
async fn test_remove_torrent_mid_download() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let peer = swarm.add_peer(test_config());
    let watch = peer
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    peer.handle.probe().await.unwrap();

    peer.handle.remove_torrent(fixture.info_hash()).await.unwrap();

    let result = within(watch.wait()).await;
    assert!(matches!(result, Err(SchedulerError::TorrentRemoved)));
    assert!(matches!(
        peer.archive.stat(fixture.info_hash()).await,
        Err(ArchiveError::NotFound { .. })
    ));
    peer.wait_removed(fixture.info_hash()).await;
}

#[tokio::test]
async fn test_emit_stats_tick_fires_on_interval() {
    init_logging();
    let clock = Arc::new(SimulatedClock::new());
    let swarm = SimulatedSwarm::with_clock(clock.clone());

    let config = test_config();
    let stats_interval = config.emit_stats_interval;
    let peer = swarm.add_peer(config);
    peer.handle.probe().await.unwrap();

    let before = peer.observer.processed_count(EventKind::EmitStatsTick);
    clock.advance(stats_interval + Duration::from_secs(1)).await;
    within(
        peer.observer
            .wait_for_count(EventKind::EmitStatsTick, before + 1),
    )
    .await;
}

#[tokio::test]
async fn test_announce_backoff_recovers_after_tracker_outage() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let seeder = swarm.add_peer(test_config());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    // The leecher's first announces fail; backoff retries recover once
    // the tracker is healthy again.
    swarm.tracker().set_failing(true);
    let leecher = swarm.add_peer(test_config());
    let watch = leecher
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    swarm.tracker().set_failing(false);

    within(watch.wait()).await.unwrap();
    leecher.check_torrent(&fixture);
}

#[tokio::test]
async fn test_network_event_ordering() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let seeder = swarm.add_peer(test_config());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let leecher = swarm.add_peer(test_config());
    let watch = leecher
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let kinds = leecher
        .sink
        .kinds_for(fixture.info_hash(), Some(seeder.peer_id));

    let pos = |kind: NetworkEventKind| kinds.iter().position(|k| *k == kind);
    assert_eq!(kinds.first(), Some(&NetworkEventKind::AddTorrent));
    let pending = pos(NetworkEventKind::AddPendingConn).expect("pending conn recorded");
    let active = pos(NetworkEventKind::AddActiveConn).expect("active conn recorded");
    let piece = pos(NetworkEventKind::ReceivePiece).expect("piece receipt recorded");
    let complete = pos(NetworkEventKind::TorrentComplete).expect("completion recorded");
    assert!(pending < active, "pending must precede active: {kinds:?}");
    assert!(active < piece, "activation must precede pieces: {kinds:?}");
    assert!(piece < complete, "pieces must precede completion: {kinds:?}");
    if let Some(drop) = pos(NetworkEventKind::DropActiveConn) {
        assert!(active < drop, "activation must precede drop: {kinds:?}");
    }

    // Seeder side: torrent added and complete before any conn traffic.
    let seeder_kinds = seeder.sink.kinds_for(fixture.info_hash(), None);
    assert_eq!(
        &seeder_kinds[..2],
        &[NetworkEventKind::AddTorrent, NetworkEventKind::TorrentComplete]
    );
}

#[tokio::test]
async fn test_blacklist_after_idle_close_and_expiry() {
    init_logging();
    let clock = Arc::new(SimulatedClock::new());
    let swarm = SimulatedSwarm::with_clock(clock.clone());
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let config = test_config();
    let conn_tti = config.conn_tti;
    let preemption = config.preemption_interval;
    let blacklist_duration = config.conn_state.blacklist_duration;

    let seeder = swarm.add_peer(config.clone());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let leecher = swarm.add_peer(config);
    let watch = leecher
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let ticks = leecher.observer.processed_count(EventKind::PreemptionTick);
    clock.advance(conn_tti + preemption).await;
    within(
        leecher
            .observer
            .wait_for_count(EventKind::PreemptionTick, ticks + 1),
    )
    .await;

    let snapshot = leecher.handle.blacklist_snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].remote_peer, seeder.peer_id);
    assert_eq!(snapshot[0].info_hash, fixture.info_hash());

    let expiries = leecher.observer.processed_count(EventKind::BlacklistExpire);
    clock.advance(blacklist_duration).await;
    within(
        leecher
            .observer
            .wait_for_count(EventKind::BlacklistExpire, expiries + 1),
    )
    .await;
    assert!(leecher.handle.blacklist_snapshot().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reload_preserves_live_torrents() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let seeder = swarm.add_peer(test_config());
    let leecher = swarm.add_peer(test_config());

    let download = |fixture: TorrentFixture| {
        let seeder = &seeder;
        let leecher = &leecher;
        async move {
            seeder.seed(&fixture);
            let watch = seeder
                .handle
                .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
                .await
                .unwrap();
            within(watch.wait()).await.unwrap();
            let watch = leecher
                .handle
                .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
                .await
                .unwrap();
            within(watch.wait()).await.unwrap();
            leecher.check_torrent(&fixture);
        }
    };

    let first = TorrentFixture::small();
    swarm.register(&first);
    download(first.clone()).await;

    let mut reloaded = test_config();
    reloaded.conn_ttl = Duration::from_secs(45 * 60);
    leecher.handle.reload(reloaded).await.unwrap();

    // The first torrent is still seeding and a fresh download works.
    let stat = leecher.handle.stat(first.info_hash()).await.unwrap();
    assert_eq!(stat.status, TorrentStatus::Seeding);

    let second = TorrentFixture::small();
    swarm.register(&second);
    download(second).await;
}

#[tokio::test]
async fn test_stop_resolves_waiters_and_refuses_work() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    let peer = swarm.add_peer(test_config());
    let watch = peer
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    peer.handle.probe().await.unwrap();

    peer.handle.stop().await.unwrap();

    let result = within(watch.wait()).await;
    assert!(matches!(result, Err(SchedulerError::ShuttingDown)));
    assert!(matches!(
        peer.handle
            .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
            .await,
        Err(SchedulerError::ShuttingDown)
    ));
    assert!(peer.handle.probe().await.is_err());
}

#[tokio::test]
async fn test_single_piece_torrent() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::generate(64, 256);
    assert_eq!(fixture.metainfo.piece_count(), 1);
    swarm.register(&fixture);

    let seeder = swarm.add_peer(test_config());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let leecher = swarm.add_peer(test_config());
    let watch = leecher
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();
    leecher.check_torrent(&fixture);
}

#[tokio::test]
async fn test_bitfield_word_boundary_torrent() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    // Exactly 64 pieces: completion flips on a packed word boundary.
    let fixture = TorrentFixture::generate(64 * 32, 32);
    assert_eq!(fixture.metainfo.piece_count(), 64);
    swarm.register(&fixture);

    let seeder = swarm.add_peer(test_config());
    seeder.seed(&fixture);
    let watch = seeder
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();

    let leecher = swarm.add_peer(test_config());
    let watch = leecher
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();
    leecher.check_torrent(&fixture);
}

#[tokio::test]
async fn test_pull_inactive_torrent() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let fixture = TorrentFixture::small();
    swarm.register(&fixture);

    // The seeder holds the torrent on disk and is registered with the
    // tracker, but its scheduler has never been told about it.
    let seeder = swarm.add_peer(test_config());
    seeder.seed(&fixture);
    swarm.tracker().register(
        fixture.info_hash(),
        undertow_core::PeerHandle {
            peer_id: seeder.peer_id,
            addr: seeder.addr,
        },
    );

    let leecher = swarm.add_peer(test_config());
    let watch = leecher
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    within(watch.wait()).await.unwrap();
    leecher.check_torrent(&fixture);

    // The incoming conn revived the torrent on the seeder side.
    let stat = seeder.handle.stat(fixture.info_hash()).await.unwrap();
    assert_eq!(stat.status, TorrentStatus::Seeding);
}

#[tokio::test]
async fn test_unknown_torrent_fails_fast() {
    init_logging();
    let swarm = SimulatedSwarm::new();
    let peer = swarm.add_peer(test_config());
    let fixture = TorrentFixture::small();
    // Never registered with the metainfo origin.

    let watch = peer
        .handle
        .add_torrent(undertow_sim::peer::NAMESPACE, fixture.info_hash())
        .await
        .unwrap();
    let result = within(watch.wait()).await;
    assert!(matches!(
        result,
        Err(SchedulerError::TorrentNotFound { .. })
    ));
}
