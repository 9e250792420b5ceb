//! Scheduler actor wiring.
//!
//! [`spawn_scheduler`] builds the event queue, arms the sweep timers,
//! starts the accept loop and runs the event loop as a background task.
//! The returned handle is the only way to reach the scheduler.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::conn::spawn_incoming_handshake;
use super::core::SchedulerCore;
use super::events::{EventObserver, EventQueue};
use super::handle::SchedulerHandle;
use super::SchedulerDeps;
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::network::PeerNetwork;
use crate::torrent::PeerId;

/// Spawns the scheduler and returns its handle.
///
/// The loop processes events sequentially, so all torrent and connection
/// state is single-owner and lock-free. Pass an [`EventObserver`] to make
/// tests wait deterministically for specific events to be handled.
pub fn spawn_scheduler(
    config: SchedulerConfig,
    peer_id: PeerId,
    deps: SchedulerDeps,
    observer: Option<Arc<EventObserver>>,
) -> SchedulerHandle {
    let queue = EventQueue::new();
    if let Some(observer) = observer {
        queue.set_observer(observer);
    }

    let accept_loop = tokio::spawn(run_accept_loop(
        deps.network.clone(),
        deps.clock.clone(),
        config.conn.handshake_timeout,
        queue.clone(),
    ));

    let handle = SchedulerHandle::new(queue.clone(), config.stop_timeout);
    let mut core = SchedulerCore::new(config, peer_id, deps, queue.clone());

    tokio::spawn(async move {
        debug!(peer = %peer_id, "scheduler actor started");
        core.start();
        while let Some(sequenced) = queue.recv().await {
            let kind = sequenced.event.kind();
            let flow = core.handle_event(sequenced.event).await;
            queue.mark_processed(kind, sequenced.seq);
            if flow.is_break() {
                break;
            }
        }
        queue.close();
        // Dropping leftover events resolves their responders with
        // channel-closed, which callers surface as shutting down.
        while queue.recv().await.is_some() {}
        accept_loop.abort();
        debug!(peer = %peer_id, "scheduler actor stopped");
    });

    handle
}

/// Accepts inbound streams and hands each to a handshake task. The
/// handshake result, if valid, reaches the loop as an `IncomingConn`
/// event.
async fn run_accept_loop(
    network: Arc<dyn PeerNetwork>,
    clock: Arc<dyn Clock>,
    handshake_timeout: Duration,
    queue: EventQueue,
) {
    loop {
        match network.accept().await {
            Ok(stream) => {
                spawn_incoming_handshake(
                    stream,
                    clock.clone(),
                    handshake_timeout,
                    queue.clone(),
                );
            }
            Err(e) => {
                if !queue.is_closed() {
                    warn!(error = %e, "accept loop terminated");
                }
                return;
            }
        }
        if queue.is_closed() {
            return;
        }
    }
}
