//! Fixed-layout framed-message codec.
//!
//! Every frame starts with a 113-byte little-endian header:
//!
//! ```text
//! magic     u32   version    u32   kind      u32   priority  u8
//! sequence  u32   timestamp  u64   payload   u32   checksum  u32
//! sender    [u8; 32]  receiver  [u8; 32]  flags  u32  reserved  [u32; 3]
//! ```
//!
//! The checksum is the sum of the payload bytes modulo 2^32 — a framing
//! sanity check, not an integrity guarantee. Invalid frames are dropped by
//! callers without tearing the transport down.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// `b"EDGE"` interpreted little-endian.
pub const MAGIC: u32 = u32::from_le_bytes(*b"EDGE");
pub const PROTOCOL_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 113;
const ID_LEN: usize = 32;

/// Frame classification carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    #[default]
    Unknown,
    Request,
    Response,
    Notification,
    Heartbeat,
    Error,
    DataTransfer,
    Control,
}

impl FrameKind {
    pub fn from_u32(v: u32) -> FrameKind {
        match v {
            1 => FrameKind::Request,
            2 => FrameKind::Response,
            3 => FrameKind::Notification,
            4 => FrameKind::Heartbeat,
            5 => FrameKind::Error,
            6 => FrameKind::DataTransfer,
            7 => FrameKind::Control,
            _ => FrameKind::Unknown,
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            FrameKind::Unknown => 0,
            FrameKind::Request => 1,
            FrameKind::Response => 2,
            FrameKind::Notification => 3,
            FrameKind::Heartbeat => 4,
            FrameKind::Error => 5,
            FrameKind::DataTransfer => 6,
            FrameKind::Control => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Unknown => "unknown",
            FrameKind::Request => "request",
            FrameKind::Response => "response",
            FrameKind::Notification => "notification",
            FrameKind::Heartbeat => "heartbeat",
            FrameKind::Error => "error",
            FrameKind::DataTransfer => "data_transfer",
            FrameKind::Control => "control",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode failure.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes yet; read more and retry.
    Incomplete,
    BadMagic(u32),
    UnsupportedVersion(u32),
    PayloadTooLarge { len: u32, max: u32 },
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Incomplete => f.write_str("incomplete frame"),
            FrameError::BadMagic(m) => write!(f, "bad magic {m:#010x}"),
            FrameError::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            FrameError::PayloadTooLarge { len, max } => {
                write!(f, "payload of {len} bytes exceeds limit {max}")
            }
            FrameError::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: header {expected:#010x}, payload {actual:#010x}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Sum of the payload bytes modulo 2^32.
pub fn checksum(payload: &[u8]) -> u32 {
    payload.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// Parsed header. Sender/receiver are zero-padded 32-byte ASCII ids on the
/// wire; longer strings are truncated on encode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub priority: u8,
    pub sequence: u32,
    pub timestamp_ms: u64,
    pub sender: String,
    pub receiver: String,
    pub flags: u32,
}

impl FrameHeader {
    pub fn new(kind: FrameKind, sender: impl Into<String>, receiver: impl Into<String>) -> Self {
        FrameHeader {
            kind,
            priority: 1,
            sequence: 0,
            timestamp_ms: now_ms(),
            sender: sender.into(),
            receiver: receiver.into(),
            flags: 0,
        }
    }
}

/// A decoded frame: header plus owned payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: impl Into<Bytes>) -> Frame {
        Frame {
            header,
            payload: payload.into(),
        }
    }

    /// Serialize the frame, computing payload length and checksum.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u32_le(MAGIC);
        dst.put_u32_le(PROTOCOL_VERSION);
        dst.put_u32_le(self.header.kind.as_u32());
        dst.put_u8(self.header.priority);
        dst.put_u32_le(self.header.sequence);
        dst.put_u64_le(self.header.timestamp_ms);
        dst.put_u32_le(self.payload.len() as u32);
        dst.put_u32_le(checksum(&self.payload));
        put_id(dst, &self.header.sender);
        put_id(dst, &self.header.receiver);
        dst.put_u32_le(self.header.flags);
        for _ in 0..3 {
            dst.put_u32_le(0); // reserved
        }
        dst.put_slice(&self.payload);
    }

    /// Try to decode one frame from the front of `src`. On success returns
    /// the frame and the number of bytes consumed. `Incomplete` simply
    /// means more bytes are needed; the other errors mean the frame must
    /// be discarded.
    pub fn decode(src: &[u8], max_payload: u32) -> Result<(Frame, usize), FrameError> {
        if src.len() < HEADER_LEN {
            return Err(FrameError::Incomplete);
        }
        let mut buf = src;

        let magic = buf.get_u32_le();
        if magic != MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        let version = buf.get_u32_le();
        if version < 1 {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let kind = FrameKind::from_u32(buf.get_u32_le());
        let priority = buf.get_u8();
        let sequence = buf.get_u32_le();
        let timestamp_ms = buf.get_u64_le();
        let payload_len = buf.get_u32_le();
        if payload_len > max_payload {
            return Err(FrameError::PayloadTooLarge {
                len: payload_len,
                max: max_payload,
            });
        }
        let expected = buf.get_u32_le();
        let sender = get_id(&mut buf);
        let receiver = get_id(&mut buf);
        let flags = buf.get_u32_le();
        buf.advance(12); // reserved

        let total = HEADER_LEN + payload_len as usize;
        if src.len() < total {
            return Err(FrameError::Incomplete);
        }
        let payload = &src[HEADER_LEN..total];
        let actual = checksum(payload);
        if actual != expected {
            return Err(FrameError::ChecksumMismatch { expected, actual });
        }

        Ok((
            Frame {
                header: FrameHeader {
                    kind,
                    priority,
                    sequence,
                    timestamp_ms,
                    sender,
                    receiver,
                    flags,
                },
                payload: Bytes::copy_from_slice(payload),
            },
            total,
        ))
    }

    /// Declared frame length (header + payload) without validating the
    /// payload, for skipping corrupt-but-sized frames. `None` when the
    /// header itself is incomplete.
    pub fn declared_len(src: &[u8]) -> Option<usize> {
        if src.len() < HEADER_LEN {
            return None;
        }
        let payload_len = u32::from_le_bytes([src[25], src[26], src[27], src[28]]) as usize;
        Some(HEADER_LEN + payload_len)
    }
}

fn put_id(dst: &mut BytesMut, id: &str) {
    let bytes = id.as_bytes();
    let n = bytes.len().min(ID_LEN);
    dst.put_slice(&bytes[..n]);
    dst.put_bytes(0, ID_LEN - n);
}

fn get_id(buf: &mut &[u8]) -> String {
    let mut raw = [0u8; ID_LEN];
    buf.copy_to_slice(&mut raw);
    let end = raw.iter().position(|&b| b == 0).unwrap_or(ID_LEN);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
