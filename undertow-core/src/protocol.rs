//! Peer wire protocol.
//!
//! Length-prefixed little-endian frames. Every frame is a u32 payload
//! length followed by a one-byte tag and the tag's body. The handshake
//! frame carries the protocol version, both identity fields and the
//! sender's initial bitfield; it must be the first frame in each direction.

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::SchedulerError;
use crate::bitfield::Bitfield;
use crate::torrent::{InfoHash, PeerId, PieceIndex};

/// Wire protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Upper bound on a single frame payload; larger frames are a protocol
/// violation. Bounds peer-controlled allocations.
pub const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;

const TAG_HANDSHAKE: u8 = 0;
const TAG_BITFIELD: u8 = 1;
const TAG_HAVE: u8 = 2;
const TAG_REQUEST: u8 = 3;
const TAG_PIECE: u8 = 4;
const TAG_CANCEL: u8 = 5;
const TAG_CLOSE: u8 = 6;

/// A single peer wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opening exchange: version, identities and initial piece possession.
    Handshake {
        /// Sender's protocol version.
        version: u16,
        /// Sender's peer id.
        peer_id: PeerId,
        /// Torrent the connection is scoped to.
        info_hash: InfoHash,
        /// Sender's piece possession at connection time.
        bitfield: Bitfield,
    },
    /// Full refresh of the sender's piece possession.
    Bitfield {
        /// Packed possession bits; length interpreted by the receiver's
        /// metainfo.
        bits: Vec<u8>,
    },
    /// The sender now holds piece `index`.
    Have {
        /// Newly completed piece.
        index: PieceIndex,
    },
    /// Ask the remote to send piece `index`.
    Request {
        /// Wanted piece.
        index: PieceIndex,
    },
    /// Piece payload.
    Piece {
        /// Piece being delivered.
        index: PieceIndex,
        /// Verified-on-receipt payload bytes.
        data: Vec<u8>,
    },
    /// Withdraw an earlier request for piece `index`.
    Cancel {
        /// Piece no longer wanted.
        index: PieceIndex,
    },
    /// Graceful connection teardown.
    Close,
}

impl Frame {
    /// Serialises the frame, including its length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Frame::Handshake {
                version,
                peer_id,
                info_hash,
                bitfield,
            } => {
                let bits = bitfield.to_bytes();
                buf.put_u32_le(1 + 2 + 20 + 20 + 4 + 4 + bits.len() as u32);
                buf.put_u8(TAG_HANDSHAKE);
                buf.put_u16_le(*version);
                buf.extend_from_slice(peer_id.as_bytes());
                buf.extend_from_slice(info_hash.as_bytes());
                buf.put_u32_le(bitfield.len());
                buf.put_u32_le(bits.len() as u32);
                buf.extend_from_slice(&bits);
            }
            Frame::Bitfield { bits } => {
                buf.put_u32_le(1 + bits.len() as u32);
                buf.put_u8(TAG_BITFIELD);
                buf.extend_from_slice(bits);
            }
            Frame::Have { index } => {
                buf.put_u32_le(5);
                buf.put_u8(TAG_HAVE);
                buf.put_u32_le(index.as_u32());
            }
            Frame::Request { index } => {
                buf.put_u32_le(5);
                buf.put_u8(TAG_REQUEST);
                buf.put_u32_le(index.as_u32());
            }
            Frame::Piece { index, data } => {
                buf.put_u32_le(5 + data.len() as u32);
                buf.put_u8(TAG_PIECE);
                buf.put_u32_le(index.as_u32());
                buf.extend_from_slice(data);
            }
            Frame::Cancel { index } => {
                buf.put_u32_le(5);
                buf.put_u8(TAG_CANCEL);
                buf.put_u32_le(index.as_u32());
            }
            Frame::Close => {
                buf.put_u32_le(1);
                buf.put_u8(TAG_CLOSE);
            }
        }
        buf
    }

    /// Parses a frame payload (the bytes after the length prefix).
    ///
    /// # Errors
    /// Returns [`SchedulerError::Protocol`] on unknown tags, short bodies or
    /// inconsistent handshake bitfield geometry.
    pub fn decode(payload: &[u8]) -> crate::Result<Frame> {
        let mut buf = payload;
        if buf.is_empty() {
            return Err(SchedulerError::protocol("empty frame"));
        }
        let tag = buf.get_u8();
        match tag {
            TAG_HANDSHAKE => {
                if buf.remaining() < 2 + 20 + 20 + 4 + 4 {
                    return Err(SchedulerError::protocol("handshake frame too short"));
                }
                let version = buf.get_u16_le();
                let mut peer_id = [0u8; 20];
                buf.copy_to_slice(&mut peer_id);
                let mut info_hash = [0u8; 20];
                buf.copy_to_slice(&mut info_hash);
                let piece_count = buf.get_u32_le();
                let bits_len = buf.get_u32_le() as usize;
                if buf.remaining() != bits_len {
                    return Err(SchedulerError::protocol("handshake bitfield length mismatch"));
                }
                let bitfield = Bitfield::from_bytes(buf.chunk(), piece_count)
                    .ok_or_else(|| SchedulerError::protocol("malformed handshake bitfield"))?;
                Ok(Frame::Handshake {
                    version,
                    peer_id: PeerId::new(peer_id),
                    info_hash: InfoHash::new(info_hash),
                    bitfield,
                })
            }
            TAG_BITFIELD => Ok(Frame::Bitfield {
                bits: buf.chunk().to_vec(),
            }),
            TAG_HAVE | TAG_REQUEST | TAG_CANCEL => {
                if buf.remaining() != 4 {
                    return Err(SchedulerError::protocol("bad fixed-size frame length"));
                }
                let index = PieceIndex::new(buf.get_u32_le());
                Ok(match tag {
                    TAG_HAVE => Frame::Have { index },
                    TAG_REQUEST => Frame::Request { index },
                    _ => Frame::Cancel { index },
                })
            }
            TAG_PIECE => {
                if buf.remaining() < 4 {
                    return Err(SchedulerError::protocol("piece frame too short"));
                }
                let index = PieceIndex::new(buf.get_u32_le());
                Ok(Frame::Piece {
                    index,
                    data: buf.chunk().to_vec(),
                })
            }
            TAG_CLOSE => {
                if buf.has_remaining() {
                    return Err(SchedulerError::protocol("close frame carries a body"));
                }
                Ok(Frame::Close)
            }
            other => Err(SchedulerError::protocol(format!("unknown frame tag {other}"))),
        }
    }
}

/// Reads one frame from the transport.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary.
///
/// # Errors
/// Returns [`SchedulerError::Protocol`] for oversized or malformed frames
/// and [`SchedulerError::Io`] for transport faults.
pub async fn read_frame<R>(reader: &mut R) -> crate::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32_le().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len == 0 || len > MAX_FRAME_SIZE {
        return Err(SchedulerError::protocol(format!("bad frame length {len}")));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Frame::decode(&payload).map(Some)
}

/// Writes one frame to the transport and flushes it.
///
/// # Errors
/// Returns [`SchedulerError::Io`] for transport faults.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> crate::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}
