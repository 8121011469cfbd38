//! treesync wire format: framing and packet types.
//!
//! Every packet is a fixed 12-byte header followed by `length` payload bytes.
//! The header is a zerocopy struct with explicit little-endian integers, so
//! both peers read the same layout regardless of host byte order.
//!
//! Payloads by kind:
//!   STAT     JSON-encoded `Stat`, or empty (flag clear) for end-of-metadata
//!   REQUEST  empty, `id` names the file
//!   DATA     raw content bytes for `id`; empty marks end-of-content
//!   FINISH   empty
//!   ERROR    human-readable UTF-8 text

use bytes::{Buf, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

use crate::stat::Stat;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current wire format version.
pub const WIRE_VERSION: u8 = 0x01;

/// Size of `PacketHeader` on the wire.
pub const HEADER_LEN: usize = 12;

/// Maximum payload size in bytes. Content larger than this is split by the
/// sender; metadata records never come close.
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Header flag: a STAT packet carries a record. Clear means end-of-metadata.
pub const FLAG_STAT_PRESENT: u8 = 0x01;

// ── Packet Header ─────────────────────────────────────────────────────────────

/// Frame header preceding every payload.
///
/// Wire size: 12 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    /// One of the `PacketKind` discriminants.
    pub kind: u8,

    /// Bit 0: `FLAG_STAT_PRESENT`. Bits 1-7 reserved, must be zero.
    pub flags: u8,

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub reserved: u8,

    /// File identifier for REQUEST and DATA, zero otherwise.
    pub id: U32<LittleEndian>,

    /// Payload length in bytes, not including this header.
    pub length: U32<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(PacketHeader, [u8; HEADER_LEN]);

/// Packet discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Stat = 0,
    Request = 1,
    Data = 2,
    Finish = 3,
    Error = 4,
}

impl TryFrom<u8> for PacketKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        match value {
            0 => Ok(PacketKind::Stat),
            1 => Ok(PacketKind::Request),
            2 => Ok(PacketKind::Data),
            3 => Ok(PacketKind::Finish),
            4 => Ok(PacketKind::Error),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketKind::Stat => "STAT",
            PacketKind::Request => "REQUEST",
            PacketKind::Data => "DATA",
            PacketKind::Finish => "FINISH",
            PacketKind::Error => "ERROR",
        };
        f.write_str(name)
    }
}

// ── Packet ────────────────────────────────────────────────────────────────────

/// A decoded protocol message. Valid for one receive/dispatch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// One metadata record, or `None` for end-of-metadata.
    Stat(Option<Stat>),
    /// Ask the sender to stream the content of `id`.
    Request { id: u32 },
    /// A content chunk for `id`. Empty `data` ends the content.
    Data { id: u32, data: Bytes },
    /// Transfer complete.
    Finish,
    /// Abort with a human-readable reason.
    Error(String),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::Stat(_) => PacketKind::Stat,
            Packet::Request { .. } => PacketKind::Request,
            Packet::Data { .. } => PacketKind::Data,
            Packet::Finish => PacketKind::Finish,
            Packet::Error(_) => PacketKind::Error,
        }
    }

    /// Produce the header and payload for this packet.
    pub fn encode(&self) -> Result<(PacketHeader, Bytes), WireError> {
        let (id, flags, payload) = match self {
            Packet::Stat(Some(stat)) => (0, FLAG_STAT_PRESENT, Bytes::from(serde_json::to_vec(stat)?)),
            Packet::Stat(None) => (0, 0, Bytes::new()),
            Packet::Request { id } => (*id, 0, Bytes::new()),
            Packet::Data { id, data } => (*id, 0, data.clone()),
            Packet::Finish => (0, 0, Bytes::new()),
            Packet::Error(msg) => (0, 0, Bytes::from(msg.clone().into_bytes())),
        };
        if payload.len() > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        let header = PacketHeader {
            kind: self.kind() as u8,
            flags,
            version: WIRE_VERSION,
            reserved: 0,
            id: U32::new(id),
            length: U32::new(payload.len() as u32),
        };
        Ok((header, payload))
    }

    /// Interpret a header and its complete payload.
    pub fn decode(header: &PacketHeader, payload: Bytes) -> Result<Packet, WireError> {
        if header.version != WIRE_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        let kind = PacketKind::try_from(header.kind)?;
        let allowed = if kind == PacketKind::Stat { FLAG_STAT_PRESENT } else { 0 };
        if header.flags & !allowed != 0 {
            return Err(WireError::ReservedFlagsSet(header.flags));
        }
        if header.reserved != 0 {
            return Err(WireError::ReservedFlagsSet(header.reserved));
        }
        let id = header.id.get();
        let packet = match kind {
            PacketKind::Stat if header.flags & FLAG_STAT_PRESENT != 0 => {
                Packet::Stat(Some(serde_json::from_slice(&payload)?))
            }
            PacketKind::Stat => Packet::Stat(None),
            PacketKind::Request => Packet::Request { id },
            PacketKind::Data => Packet::Data { id, data: payload },
            PacketKind::Finish => Packet::Finish,
            PacketKind::Error => Packet::Error(String::from_utf8_lossy(&payload).into_owned()),
        };
        Ok(packet)
    }
}

// ── Framed I/O ────────────────────────────────────────────────────────────────

/// Reads packets from a byte stream.
pub struct PacketReader<R> {
    inner: R,
    buf: BytesMut,
    bytes_read: u64,
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            bytes_read: 0,
        }
    }

    /// Receive the next packet. `Ok(None)` means the peer closed the stream
    /// on a frame boundary.
    ///
    /// Cancel safe: partially read frames stay buffered for the next call.
    pub async fn recv(&mut self) -> Result<Option<Packet>, WireError> {
        loop {
            if let Some(packet) = self.try_decode()? {
                return Ok(Some(packet));
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(WireError::Truncated(self.buf.len()));
            }
        }
    }

    /// Total frame bytes consumed so far.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn try_decode(&mut self) -> Result<Option<Packet>, WireError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = PacketHeader::read_from(&self.buf[..HEADER_LEN])
            .ok_or(WireError::Truncated(self.buf.len()))?;
        let length = header.length.get() as usize;
        if length > MAX_PAYLOAD {
            return Err(WireError::PayloadTooLarge(length));
        }
        let frame_len = HEADER_LEN + length;
        if self.buf.len() < frame_len {
            self.buf.reserve(frame_len - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(length).freeze();
        self.bytes_read += frame_len as u64;
        Packet::decode(&header, payload).map(Some)
    }
}

/// Writes packets to a byte stream.
pub struct PacketWriter<W> {
    inner: W,
    bytes_written: u64,
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, bytes_written: 0 }
    }

    /// Write one complete frame and flush it.
    ///
    /// Not cancel safe: dropping the future mid-write leaves a partial frame.
    pub async fn send(&mut self, packet: &Packet) -> Result<(), WireError> {
        let (header, payload) = packet.encode()?;
        self.inner.write_all(header.as_bytes()).await?;
        if !payload.is_empty() {
            self.inner.write_all(&payload).await?;
        }
        self.inner.flush().await?;
        self.bytes_written += (HEADER_LEN + payload.len()) as u64;
        Ok(())
    }

    /// Close the write direction so the peer observes end-of-stream.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Total frame bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when framing or interpreting wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown packet kind: {0}")]
    UnknownKind(u8),

    #[error("unknown wire version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD)]
    PayloadTooLarge(usize),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("stream ended inside a frame ({0} bytes buffered)")]
    Truncated(usize),

    #[error("malformed metadata record: {0}")]
    MalformedStat(#[from] serde_json::Error),

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
