//! Typed event queue feeding the scheduler loop.
//!
//! Single consumer, many producers. Control-plane posts block when the
//! queue is full; high-frequency piece traffic is shed oldest-first once
//! the queue crosses its high-water mark, with a counter so the loss is
//! visible. Every event carries a monotonically increasing sequence
//! number, and an optional observer lets tests wait until an event of a
//! given kind has been fully handled by the loop.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, oneshot};
use tracing::warn;

use super::conn::{CloseReason, ConnId, DialOutcome};
use super::registry::BlacklistEntry;
use super::{SchedulerStats, TorrentStat};
use crate::bitfield::Bitfield;
use crate::config::SchedulerConfig;
use crate::network::PeerStream;
use crate::torrent::{InfoHash, PeerHandle, PeerId, PieceIndex};
use crate::Result;

/// Queue capacity; control producers block once it is reached.
const QUEUE_CAPACITY: usize = 4096;

/// Above this depth, data-plane posts evict the oldest sheddable event.
const QUEUE_HIGH_WATER: usize = 3072;

/// Everything the scheduler loop reacts to.
pub enum SchedulerEvent {
    /// Caller wants a torrent downloaded (or is joining an existing
    /// download).
    AddTorrent {
        /// Namespace to resolve metainfo under.
        namespace: String,
        /// Torrent to download or seed.
        info_hash: InfoHash,
        /// Completion promise.
        responder: oneshot::Sender<Result<()>>,
    },
    /// Caller wants a torrent evicted.
    RemoveTorrent {
        /// Torrent to evict.
        info_hash: InfoHash,
        /// Acknowledgement promise.
        responder: oneshot::Sender<Result<()>>,
    },
    /// Announce timer fired; time to talk to the tracker again.
    AnnounceTick {
        /// Torrent due for an announce.
        info_hash: InfoHash,
    },
    /// A tracker announce finished.
    AnnounceResponse {
        /// Torrent announced.
        info_hash: InfoHash,
        /// Peer set, or the announce failure.
        result: Result<Vec<PeerHandle>>,
    },
    /// A remote completed its opening handshake on an accepted stream.
    IncomingConn {
        /// Remote identity from the handshake.
        remote_peer: PeerId,
        /// Torrent the remote wants.
        info_hash: InfoHash,
        /// The open stream; our reply handshake is still owed.
        stream: PeerStream,
        /// Remote piece possession from the handshake.
        remote_bitfield: Bitfield,
    },
    /// An outgoing dial finished its handshake exchange.
    OutgoingConnResult {
        /// The pending connection that dialed.
        conn_id: ConnId,
        /// Stream and remote bitfield, or the failure.
        result: Result<DialOutcome>,
    },
    /// A connection's reader observed teardown.
    ConnClosed {
        /// Connection concerned.
        conn_id: ConnId,
        /// Why it closed.
        reason: CloseReason,
    },
    /// A piece payload arrived.
    PieceReceived {
        /// Connection it arrived on.
        conn_id: ConnId,
        /// Piece index.
        index: PieceIndex,
        /// Raw payload, unverified.
        payload: Vec<u8>,
    },
    /// An outstanding request hit its deadline.
    PieceRequestTimeout {
        /// Connection the request was sent on.
        conn_id: ConnId,
        /// Piece that never arrived.
        index: PieceIndex,
    },
    /// Remote refreshed its full bitfield.
    BitfieldUpdate {
        /// Connection concerned.
        conn_id: ConnId,
        /// Packed possession bits.
        bits: Vec<u8>,
    },
    /// Remote announced one newly held piece.
    HaveReceived {
        /// Connection concerned.
        conn_id: ConnId,
        /// Piece the remote now holds.
        index: PieceIndex,
    },
    /// Remote asked for a piece.
    InboundRequest {
        /// Connection concerned.
        conn_id: ConnId,
        /// Piece wanted.
        index: PieceIndex,
    },
    /// Remote withdrew an earlier request.
    InboundCancel {
        /// Connection concerned.
        conn_id: ConnId,
        /// Piece no longer wanted.
        index: PieceIndex,
    },
    /// Eviction sweep timer fired.
    PreemptionTick,
    /// Stats reporting timer fired.
    EmitStatsTick,
    /// A blacklist entry reached its deadline.
    BlacklistExpire {
        /// Banned peer.
        remote_peer: PeerId,
        /// Torrent the ban was scoped to.
        info_hash: InfoHash,
    },
    /// Liveness check.
    Probe {
        /// Answered as soon as the loop dequeues the event.
        responder: oneshot::Sender<()>,
    },
    /// Point-in-time view of one torrent.
    Stat {
        /// Torrent queried.
        info_hash: InfoHash,
        /// Response promise.
        responder: oneshot::Sender<Result<TorrentStat>>,
    },
    /// Aggregate counters.
    Stats {
        /// Response promise.
        responder: oneshot::Sender<SchedulerStats>,
    },
    /// Live blacklist entries.
    BlacklistSnapshot {
        /// Response promise.
        responder: oneshot::Sender<Vec<BlacklistEntry>>,
    },
    /// Swap the configuration without disturbing live state.
    Reload {
        /// Configuration to adopt.
        config: Box<SchedulerConfig>,
        /// Acknowledgement promise.
        responder: oneshot::Sender<()>,
    },
    /// Drain and stop the loop.
    Stop {
        /// Acknowledgement promise, answered before the loop exits.
        responder: oneshot::Sender<()>,
    },
}

/// Discriminant of [`SchedulerEvent`], used for observer bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum EventKind {
    AddTorrent,
    RemoveTorrent,
    AnnounceTick,
    AnnounceResponse,
    IncomingConn,
    OutgoingConnResult,
    ConnClosed,
    PieceReceived,
    PieceRequestTimeout,
    BitfieldUpdate,
    HaveReceived,
    InboundRequest,
    InboundCancel,
    PreemptionTick,
    EmitStatsTick,
    BlacklistExpire,
    Probe,
    Stat,
    Stats,
    BlacklistSnapshot,
    Reload,
    Stop,
}

impl SchedulerEvent {
    /// Returns the event's discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            SchedulerEvent::AddTorrent { .. } => EventKind::AddTorrent,
            SchedulerEvent::RemoveTorrent { .. } => EventKind::RemoveTorrent,
            SchedulerEvent::AnnounceTick { .. } => EventKind::AnnounceTick,
            SchedulerEvent::AnnounceResponse { .. } => EventKind::AnnounceResponse,
            SchedulerEvent::IncomingConn { .. } => EventKind::IncomingConn,
            SchedulerEvent::OutgoingConnResult { .. } => EventKind::OutgoingConnResult,
            SchedulerEvent::ConnClosed { .. } => EventKind::ConnClosed,
            SchedulerEvent::PieceReceived { .. } => EventKind::PieceReceived,
            SchedulerEvent::PieceRequestTimeout { .. } => EventKind::PieceRequestTimeout,
            SchedulerEvent::BitfieldUpdate { .. } => EventKind::BitfieldUpdate,
            SchedulerEvent::HaveReceived { .. } => EventKind::HaveReceived,
            SchedulerEvent::InboundRequest { .. } => EventKind::InboundRequest,
            SchedulerEvent::InboundCancel { .. } => EventKind::InboundCancel,
            SchedulerEvent::PreemptionTick => EventKind::PreemptionTick,
            SchedulerEvent::EmitStatsTick => EventKind::EmitStatsTick,
            SchedulerEvent::BlacklistExpire { .. } => EventKind::BlacklistExpire,
            SchedulerEvent::Probe { .. } => EventKind::Probe,
            SchedulerEvent::Stat { .. } => EventKind::Stat,
            SchedulerEvent::Stats { .. } => EventKind::Stats,
            SchedulerEvent::BlacklistSnapshot { .. } => EventKind::BlacklistSnapshot,
            SchedulerEvent::Reload { .. } => EventKind::Reload,
            SchedulerEvent::Stop { .. } => EventKind::Stop,
        }
    }
}

impl EventKind {
    /// Sheddable kinds may be discarded under queue pressure; everything
    /// else is control-plane or lifecycle-bearing and must be delivered.
    fn is_sheddable(self) -> bool {
        matches!(
            self,
            EventKind::PieceReceived
                | EventKind::BitfieldUpdate
                | EventKind::HaveReceived
                | EventKind::InboundRequest
                | EventKind::InboundCancel
        )
    }
}

/// An event plus its queue sequence number.
pub struct SequencedEvent {
    /// Position in the global post order.
    pub seq: u64,
    /// The event itself.
    pub event: SchedulerEvent,
}

/// Error returned when posting to a queue whose loop has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// Bounded multi-producer single-consumer event queue.
#[derive(Clone)]
pub struct EventQueue {
    shared: Arc<QueueShared>,
}

struct QueueShared {
    deque: Mutex<VecDeque<SequencedEvent>>,
    ready: Notify,
    space: Notify,
    next_seq: AtomicU64,
    dropped: AtomicU64,
    closed: AtomicBool,
    observer: Mutex<Option<Arc<EventObserver>>>,
}

impl EventQueue {
    /// Creates an empty queue with the default bounds.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(QueueShared {
                deque: Mutex::new(VecDeque::new()),
                ready: Notify::new(),
                space: Notify::new(),
                next_seq: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                observer: Mutex::new(None),
            }),
        }
    }

    /// Installs the processed-event observer. When none is installed the
    /// per-event bookkeeping is a single branch.
    pub fn set_observer(&self, observer: Arc<EventObserver>) {
        *self.shared.observer.lock().expect("observer lock poisoned") = Some(observer);
    }

    /// Posts an event.
    ///
    /// Control-plane events wait for space when the queue is full;
    /// sheddable events evict the oldest sheddable entry past the high
    /// water mark and are themselves shed if the queue is at capacity.
    ///
    /// # Errors
    /// Returns [`QueueClosed`] once the loop has stopped.
    pub async fn post(&self, event: SchedulerEvent) -> std::result::Result<(), QueueClosed> {
        if event.kind().is_sheddable() {
            self.post_sheddable(event)
        } else {
            self.post_blocking(event).await
        }
    }

    async fn post_blocking(
        &self,
        event: SchedulerEvent,
    ) -> std::result::Result<(), QueueClosed> {
        let mut event = Some(event);
        loop {
            if self.shared.closed.load(Ordering::Acquire) {
                return Err(QueueClosed);
            }
            let waiter = self.shared.space.notified();
            {
                let mut deque = self.shared.deque.lock().expect("queue lock poisoned");
                if deque.len() < QUEUE_CAPACITY {
                    let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
                    deque.push_back(SequencedEvent {
                        seq,
                        event: event.take().expect("event consumed twice"),
                    });
                    drop(deque);
                    self.shared.ready.notify_one();
                    return Ok(());
                }
            }
            waiter.await;
        }
    }

    fn post_sheddable(&self, event: SchedulerEvent) -> std::result::Result<(), QueueClosed> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(QueueClosed);
        }
        let mut deque = self.shared.deque.lock().expect("queue lock poisoned");
        if deque.len() >= QUEUE_HIGH_WATER {
            if let Some(pos) = deque
                .iter()
                .position(|queued| queued.event.kind().is_sheddable())
            {
                deque.remove(pos);
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "event queue past high water, shedding oldest piece event");
            }
        }
        if deque.len() >= QUEUE_CAPACITY {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        deque.push_back(SequencedEvent { seq, event });
        drop(deque);
        self.shared.ready.notify_one();
        Ok(())
    }

    /// Dequeues the next event; `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<SequencedEvent> {
        loop {
            let waiter = self.shared.ready.notified();
            {
                let mut deque = self.shared.deque.lock().expect("queue lock poisoned");
                if let Some(event) = deque.pop_front() {
                    drop(deque);
                    self.shared.space.notify_one();
                    return Some(event);
                }
                if self.shared.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            waiter.await;
        }
    }

    /// Marks the queue closed; subsequent posts fail and `recv` drains to
    /// `None`.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.ready.notify_waiters();
        self.shared.space.notify_waiters();
    }

    /// Whether the loop has stopped accepting events.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Events discarded by the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Records that the loop fully handled an event. No-op without an
    /// observer.
    pub fn mark_processed(&self, kind: EventKind, seq: u64) {
        let observer = self
            .shared
            .observer
            .lock()
            .expect("observer lock poisoned")
            .clone();
        if let Some(observer) = observer {
            observer.record(kind, seq);
        }
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Records processed events and releases test waiters.
///
/// `wait_for` returns only after the loop has finished handling an event
/// of the requested kind that was processed *after* the call began, which
/// makes it a deterministic synchronisation point under a simulated clock.
#[derive(Default)]
pub struct EventObserver {
    processed: Mutex<HashMap<EventKind, u64>>,
    notify: Notify,
}

impl EventObserver {
    /// Creates an observer.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, kind: EventKind, _seq: u64) {
        let mut processed = self.processed.lock().expect("observer lock poisoned");
        *processed.entry(kind).or_insert(0) += 1;
        drop(processed);
        self.notify.notify_waiters();
    }

    fn count(&self, kind: EventKind) -> u64 {
        self.processed
            .lock()
            .expect("observer lock poisoned")
            .get(&kind)
            .copied()
            .unwrap_or(0)
    }

    /// Waits until the loop processes the next event of `kind`.
    pub async fn wait_for(&self, kind: EventKind) {
        let target = self.count(kind) + 1;
        self.wait_for_count(kind, target).await;
    }

    /// Waits until the loop has processed at least `min_total` events of
    /// `kind` over its lifetime. Returns immediately when it already has,
    /// which makes the call race-free around externally triggered ticks.
    pub async fn wait_for_count(&self, kind: EventKind, min_total: u64) {
        loop {
            let waiter = self.notify.notified();
            if self.count(kind) >= min_total {
                return;
            }
            waiter.await;
        }
    }

    /// How many events of `kind` the loop has processed.
    pub fn processed_count(&self, kind: EventKind) -> u64 {
        self.count(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order_and_sequence_numbers() {
        let queue = EventQueue::new();
        queue.post(SchedulerEvent::PreemptionTick).await.unwrap();
        queue.post(SchedulerEvent::EmitStatsTick).await.unwrap();

        let first = queue.recv().await.unwrap();
        let second = queue.recv().await.unwrap();
        assert_eq!(first.event.kind(), EventKind::PreemptionTick);
        assert_eq!(second.event.kind(), EventKind::EmitStatsTick);
        assert!(first.seq < second.seq);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_posts() {
        let queue = EventQueue::new();
        queue.close();
        assert_eq!(
            queue.post(SchedulerEvent::PreemptionTick).await,
            Err(QueueClosed)
        );
        assert!(queue.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sheddable_events_dropped_past_high_water() {
        let queue = EventQueue::new();
        for _ in 0..QUEUE_HIGH_WATER + 10 {
            queue
                .post(SchedulerEvent::HaveReceived {
                    conn_id: ConnId(1),
                    index: PieceIndex::new(0),
                })
                .await
                .unwrap();
        }
        assert_eq!(queue.dropped(), 10);

        // Control events are still admitted ahead of capacity.
        queue.post(SchedulerEvent::PreemptionTick).await.unwrap();
    }

    #[tokio::test]
    async fn test_shedding_skips_control_events() {
        let queue = EventQueue::new();
        // A control event at the head must survive shedding.
        queue.post(SchedulerEvent::PreemptionTick).await.unwrap();
        for _ in 0..QUEUE_HIGH_WATER {
            queue
                .post(SchedulerEvent::HaveReceived {
                    conn_id: ConnId(1),
                    index: PieceIndex::new(0),
                })
                .await
                .unwrap();
        }
        assert!(queue.dropped() > 0);
        let head = queue.recv().await.unwrap();
        assert_eq!(head.event.kind(), EventKind::PreemptionTick);
    }

    #[tokio::test]
    async fn test_observer_wait_for_releases_after_processing() {
        let queue = EventQueue::new();
        let observer = Arc::new(EventObserver::new());
        queue.set_observer(observer.clone());

        let waiter = {
            let observer = observer.clone();
            tokio::spawn(async move { observer.wait_for(EventKind::PreemptionTick).await })
        };
        tokio::task::yield_now().await;

        queue.post(SchedulerEvent::PreemptionTick).await.unwrap();
        let event = queue.recv().await.unwrap();
        queue.mark_processed(event.event.kind(), event.seq);

        waiter.await.unwrap();
        assert_eq!(observer.processed_count(EventKind::PreemptionTick), 1);
    }
}
