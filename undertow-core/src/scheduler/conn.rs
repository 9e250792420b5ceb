//! Connection state machine.
//!
//! Each admitted connection is a pair of background tasks (reader, writer)
//! around a framed stream, plus a loop-owned [`Conn`] record. The tasks
//! never touch scheduler state: the reader turns frames into events, the
//! writer drains an outbound frame channel. The loop is the only place a
//! connection is created, promoted or torn down.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::events::{EventQueue, SchedulerEvent};
use crate::bitfield::Bitfield;
use crate::clock::Clock;
use crate::network::{PeerNetwork, PeerStream};
use crate::protocol::{self, Frame, PROTOCOL_VERSION};
use crate::torrent::{InfoHash, PeerHandle, PeerId, PieceIndex};
use crate::{Result, SchedulerError};

/// Depth of the per-connection outbound frame channel. A peer that cannot
/// drain this many frames loses broadcasts rather than stalling the loop.
const OUTBOUND_DEPTH: usize = 64;

/// Loop-internal identity of one connection instance.
///
/// Ids are never reused, so late events from a torn-down connection fail
/// their arena lookup instead of corrupting a successor connection to the
/// same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn{}", self.0)
    }
}

/// Why a connection reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Dial or handshake exchange failed or timed out.
    HandshakeFailed,
    /// Remote closed the stream or vanished.
    PeerDisconnected,
    /// No piece traffic within the connection TTI.
    Idle,
    /// Too many piece requests timed out.
    RequestTimeout,
    /// Connection exceeded its TTL and is being recycled for peer
    /// diversity.
    Preempted,
    /// The torrent the connection served was removed.
    TorrentRemoved,
    /// The scheduler is stopping.
    Shutdown,
    /// Remote sent malformed or semantically invalid data.
    ProtocolError,
}

impl CloseReason {
    /// Whether this close penalises the (peer, torrent) pair with a
    /// blacklist entry. Only misbehaviour and idleness are penalised;
    /// handshake races (simultaneous dials) must stay retryable.
    pub fn blacklists(self) -> bool {
        matches!(
            self,
            CloseReason::Idle | CloseReason::RequestTimeout | CloseReason::ProtocolError
        )
    }
}

/// Lifecycle position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// Admitted; dial and handshake still in flight.
    Pending,
    /// Handshaked; may send and receive pieces.
    Active,
}

/// Which side initiated the connection; drives the simultaneous-dial
/// tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnOrigin {
    /// We dialed.
    Outgoing,
    /// Remote dialed us.
    Incoming,
}

/// Successful dial + handshake result carried by `OutgoingConnResult`.
pub struct DialOutcome {
    /// The open stream, handshakes already exchanged.
    pub stream: PeerStream,
    /// Remote's piece possession from its handshake.
    pub remote_bitfield: Bitfield,
}

/// Loop-owned record of one connection.
pub struct Conn {
    /// Arena identity.
    pub id: ConnId,
    /// Remote peer identity.
    pub remote_peer: PeerId,
    /// Torrent the connection is scoped to.
    pub info_hash: InfoHash,
    /// Lifecycle position.
    pub status: ConnStatus,
    /// Which side dialed.
    pub origin: ConnOrigin,
    /// When the connection was admitted.
    pub opened_at: Instant,
    /// When the last piece payload arrived on this connection.
    pub last_piece_at: Instant,
    /// Remote piece possession, kept in sync via handshake, bitfield and
    /// have frames.
    pub remote_bitfield: Bitfield,
    /// Outstanding piece requests with their timeout timers.
    pub inflight: HashMap<PieceIndex, JoinHandle<()>>,
    /// Consecutive request timeouts since the last successful piece.
    pub strikes: u32,
    /// Piece payload bytes received.
    pub bytes_in: u64,
    /// Piece payload bytes sent.
    pub bytes_out: u64,
    outbound: Option<mpsc::Sender<Frame>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Conn {
    /// Creates a pending record for an outgoing dial.
    pub fn pending_outgoing(
        id: ConnId,
        remote_peer: PeerId,
        info_hash: InfoHash,
        piece_count: u32,
        now: Instant,
    ) -> Self {
        Self {
            id,
            remote_peer,
            info_hash,
            status: ConnStatus::Pending,
            origin: ConnOrigin::Outgoing,
            opened_at: now,
            last_piece_at: now,
            remote_bitfield: Bitfield::new(piece_count),
            inflight: HashMap::new(),
            strikes: 0,
            bytes_in: 0,
            bytes_out: 0,
            outbound: None,
            tasks: Vec::new(),
        }
    }

    /// Creates a pending record for an accepted stream.
    pub fn pending_incoming(
        id: ConnId,
        remote_peer: PeerId,
        info_hash: InfoHash,
        remote_bitfield: Bitfield,
        now: Instant,
    ) -> Self {
        Self {
            remote_bitfield,
            origin: ConnOrigin::Incoming,
            ..Self::pending_outgoing(id, remote_peer, info_hash, 0, now)
        }
    }

    /// Attaches a background task whose lifetime is bound to this
    /// connection.
    pub fn track_task(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Promotes the connection to active, wiring reader and writer tasks
    /// onto the stream. `greeting` frames (the reply handshake on the
    /// accepting side) are queued before anything else.
    pub fn activate(&mut self, stream: PeerStream, greeting: Vec<Frame>, queue: EventQueue) {
        let (reader, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(OUTBOUND_DEPTH);
        for frame in greeting {
            let _ = tx.try_send(frame);
        }
        self.outbound = Some(tx);
        self.tasks.push(tokio::spawn(run_writer(writer, rx)));
        self.tasks.push(tokio::spawn(run_reader(self.id, reader, queue)));
        self.status = ConnStatus::Active;
    }

    /// Queues a frame for the remote. Frames to a stalled peer are shed.
    pub fn send(&self, frame: Frame) {
        if let Some(tx) = &self.outbound {
            if tx.try_send(frame).is_err() {
                debug!(conn = %self.id, "outbound channel full, shedding frame");
            }
        }
    }

    /// Tears the connection down: queues a close frame, stops the writer
    /// by dropping its channel, aborts the reader and any request timers.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.try_send(Frame::Close);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        for (_, timer) in self.inflight.drain() {
            timer.abort();
        }
    }
}

/// Dials a peer, exchanges handshakes and reports the outcome to the loop.
pub(crate) fn spawn_dial(
    conn_id: ConnId,
    peer: PeerHandle,
    info_hash: InfoHash,
    local_peer: PeerId,
    local_bitfield: Bitfield,
    network: Arc<dyn PeerNetwork>,
    clock: Arc<dyn Clock>,
    handshake_timeout: Duration,
    queue: EventQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let attempt = dial_and_handshake(peer, info_hash, local_peer, local_bitfield, network);
        let result = tokio::select! {
            result = attempt => result,
            _ = clock.sleep(handshake_timeout) => {
                Err(SchedulerError::network("handshake timed out"))
            }
        };
        let _ = queue
            .post(SchedulerEvent::OutgoingConnResult { conn_id, result })
            .await;
    })
}

async fn dial_and_handshake(
    peer: PeerHandle,
    info_hash: InfoHash,
    local_peer: PeerId,
    local_bitfield: Bitfield,
    network: Arc<dyn PeerNetwork>,
) -> Result<DialOutcome> {
    let mut stream = network.dial(peer.addr).await?;
    let hello = Frame::Handshake {
        version: PROTOCOL_VERSION,
        peer_id: local_peer,
        info_hash,
        bitfield: local_bitfield,
    };
    protocol::write_frame(&mut stream, &hello).await?;

    match protocol::read_frame(&mut stream).await? {
        Some(Frame::Handshake {
            version,
            peer_id,
            info_hash: remote_hash,
            bitfield,
        }) => {
            if version != PROTOCOL_VERSION {
                return Err(SchedulerError::protocol(format!(
                    "unsupported protocol version {version}"
                )));
            }
            if remote_hash != info_hash {
                return Err(SchedulerError::protocol("handshake for wrong torrent"));
            }
            if peer_id != peer.peer_id {
                return Err(SchedulerError::protocol("handshake from unexpected peer"));
            }
            Ok(DialOutcome {
                stream,
                remote_bitfield: bitfield,
            })
        }
        Some(_) => Err(SchedulerError::protocol("expected handshake frame")),
        None => Err(SchedulerError::network("peer closed during handshake")),
    }
}

/// Reads the opening handshake of an accepted stream and forwards the
/// admission decision to the loop. The reply handshake is sent by the loop
/// once the connection is admitted.
pub(crate) fn spawn_incoming_handshake(
    mut stream: PeerStream,
    clock: Arc<dyn Clock>,
    handshake_timeout: Duration,
    queue: EventQueue,
) {
    tokio::spawn(async move {
        let first = tokio::select! {
            frame = protocol::read_frame(&mut stream) => frame,
            _ = clock.sleep(handshake_timeout) => {
                debug!("inbound handshake timed out");
                return;
            }
        };
        match first {
            Ok(Some(Frame::Handshake {
                version: PROTOCOL_VERSION,
                peer_id,
                info_hash,
                bitfield,
            })) => {
                let _ = queue
                    .post(SchedulerEvent::IncomingConn {
                        remote_peer: peer_id,
                        info_hash,
                        stream,
                        remote_bitfield: bitfield,
                    })
                    .await;
            }
            _ => {
                debug!("rejecting inbound stream without valid handshake");
            }
        }
    });
}

async fn run_reader(conn_id: ConnId, mut reader: ReadHalf<PeerStream>, queue: EventQueue) {
    loop {
        let event = match protocol::read_frame(&mut reader).await {
            Ok(Some(Frame::Piece { index, data })) => SchedulerEvent::PieceReceived {
                conn_id,
                index,
                payload: data,
            },
            Ok(Some(Frame::Bitfield { bits })) => {
                SchedulerEvent::BitfieldUpdate { conn_id, bits }
            }
            Ok(Some(Frame::Have { index })) => SchedulerEvent::HaveReceived { conn_id, index },
            Ok(Some(Frame::Request { index })) => {
                SchedulerEvent::InboundRequest { conn_id, index }
            }
            Ok(Some(Frame::Cancel { index })) => SchedulerEvent::InboundCancel { conn_id, index },
            Ok(Some(Frame::Close)) | Ok(None) => {
                let _ = queue
                    .post(SchedulerEvent::ConnClosed {
                        conn_id,
                        reason: CloseReason::PeerDisconnected,
                    })
                    .await;
                return;
            }
            Ok(Some(Frame::Handshake { .. })) => {
                let _ = queue
                    .post(SchedulerEvent::ConnClosed {
                        conn_id,
                        reason: CloseReason::ProtocolError,
                    })
                    .await;
                return;
            }
            Err(SchedulerError::Protocol { reason }) => {
                debug!(conn = %conn_id, %reason, "protocol violation on read");
                let _ = queue
                    .post(SchedulerEvent::ConnClosed {
                        conn_id,
                        reason: CloseReason::ProtocolError,
                    })
                    .await;
                return;
            }
            Err(_) => {
                let _ = queue
                    .post(SchedulerEvent::ConnClosed {
                        conn_id,
                        reason: CloseReason::PeerDisconnected,
                    })
                    .await;
                return;
            }
        };
        if queue.post(event).await.is_err() {
            return;
        }
    }
}

async fn run_writer(mut writer: WriteHalf<PeerStream>, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, Frame::Close);
        if protocol::write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Arms the timeout timer for one outstanding piece request.
pub(crate) fn spawn_request_timer(
    conn_id: ConnId,
    index: PieceIndex,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    queue: EventQueue,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        clock.sleep(timeout).await;
        let _ = queue
            .post(SchedulerEvent::PieceRequestTimeout { conn_id, index })
            .await;
    })
}
