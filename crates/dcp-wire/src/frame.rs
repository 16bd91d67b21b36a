//! Frame parsing for the fixed 24-byte-header binary protocol.
//!
//! Layout: `magic(1) | opcode(1) | key_len(2) | extras_len(1) | data_type(1)
//! | vbucket(2) | total_body_len(4) | opaque(4) | cas(8)`, followed by
//! `extras || key || value`. On response frames the vbucket field carries the
//! status code instead.
//!
//! A parsed [`DcpFrame`] is a view over one `Bytes` buffer; accessors slice
//! into it without copying.

use crate::WireError;
use crate::types::{FailoverLogEntry, ObservedSeqno, SnapshotMarker};
use bytes::Bytes;

/// Size of the fixed header preceding every frame body.
pub const HEADER_SIZE: usize = 24;

// ---------------------------------------------------------------------------
// Opcodes and status codes
// ---------------------------------------------------------------------------

/// Protocol opcodes consumed or produced by the client.
pub mod opcode {
    pub const SASL_LIST_MECHS: u8 = 0x20;
    pub const SASL_AUTH: u8 = 0x21;
    pub const DCP_OPEN: u8 = 0x50;
    pub const DCP_STREAM_REQ: u8 = 0x53;
    pub const DCP_FAILOVER_LOG: u8 = 0x54;
    pub const DCP_STREAM_END: u8 = 0x55;
    pub const DCP_SNAPSHOT_MARKER: u8 = 0x56;
    pub const DCP_MUTATION: u8 = 0x57;
    pub const DCP_DELETION: u8 = 0x58;
    pub const DCP_EXPIRATION: u8 = 0x59;
    pub const DCP_FLUSH: u8 = 0x5A;
    pub const DCP_BUFFER_ACK: u8 = 0x5C;
    pub const DCP_CONTROL: u8 = 0x5F;
    pub const OBSERVE_SEQNO: u8 = 0x91;
}

/// First byte of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Request,
    Response,
}

impl Magic {
    pub const REQUEST: u8 = 0x80;
    pub const RESPONSE: u8 = 0x81;

    fn from_byte(byte: u8) -> Result<Magic, WireError> {
        match byte {
            Magic::REQUEST => Ok(Magic::Request),
            Magic::RESPONSE => Ok(Magic::Response),
            _ => Err(WireError::MalformedFrame("unknown magic")),
        }
    }
}

/// Response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status(pub u16);

impl Status {
    pub const SUCCESS: Status = Status(0x00);
    pub const NOT_MY_VBUCKET: Status = Status(0x07);
    pub const AUTH_ERROR: Status = Status(0x20);
    pub const ROLLBACK: Status = Status(0x23);

    pub fn is_success(self) -> bool {
        self == Status::SUCCESS
    }

    pub fn is_rollback(self) -> bool {
        self == Status::ROLLBACK
    }

    pub fn is_not_my_vbucket(self) -> bool {
        self == Status::NOT_MY_VBUCKET
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Status::SUCCESS => write!(f, "success"),
            Status::NOT_MY_VBUCKET => write!(f, "not-my-vbucket"),
            Status::AUTH_ERROR => write!(f, "auth-error"),
            Status::ROLLBACK => write!(f, "rollback"),
            Status(code) => write!(f, "status 0x{code:02x}"),
        }
    }
}

// ---------------------------------------------------------------------------
// DcpFrame
// ---------------------------------------------------------------------------

/// A parsed request or response frame.
#[derive(Debug, Clone)]
pub struct DcpFrame {
    magic: Magic,
    buf: Bytes,
}

impl DcpFrame {
    /// Parse one complete frame out of `buf`.
    ///
    /// Fails with [`WireError::MalformedFrame`] when the magic is unknown,
    /// the buffer is shorter than a header, the declared body length
    /// disagrees with the buffer length, or the extras/key lengths overrun
    /// the body.
    pub fn parse(buf: Bytes) -> Result<DcpFrame, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::MalformedFrame("short header"));
        }
        let magic = Magic::from_byte(buf[0])?;
        let frame = DcpFrame { magic, buf };
        if HEADER_SIZE + frame.total_body_len() != frame.buf.len() {
            return Err(WireError::MalformedFrame("body length mismatch"));
        }
        if frame.extras_len() + frame.key_len() > frame.total_body_len() {
            return Err(WireError::MalformedFrame("extras/key overrun body"));
        }
        Ok(frame)
    }

    pub fn magic(&self) -> Magic {
        self.magic
    }

    pub fn opcode(&self) -> u8 {
        self.buf[1]
    }

    fn key_len(&self) -> usize {
        u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize
    }

    fn extras_len(&self) -> usize {
        self.buf[4] as usize
    }

    pub fn data_type(&self) -> u8 {
        self.buf[5]
    }

    /// Partition id, valid on request frames.
    pub fn vbucket(&self) -> u16 {
        u16::from_be_bytes([self.buf[6], self.buf[7]])
    }

    /// Status code; the same header field as [`Self::vbucket`], read on
    /// response frames.
    pub fn status(&self) -> Status {
        Status(u16::from_be_bytes([self.buf[6], self.buf[7]]))
    }

    pub fn total_body_len(&self) -> usize {
        u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]) as usize
    }

    pub fn opaque(&self) -> u32 {
        u32::from_be_bytes([self.buf[12], self.buf[13], self.buf[14], self.buf[15]])
    }

    pub fn cas(&self) -> u64 {
        be_u64(&self.buf[16..24])
    }

    /// Total frame size on the wire, header included. This is the byte count
    /// that feeds flow control.
    pub fn frame_len(&self) -> usize {
        self.buf.len()
    }

    pub fn extras(&self) -> Bytes {
        self.buf.slice(HEADER_SIZE..HEADER_SIZE + self.extras_len())
    }

    pub fn key(&self) -> Bytes {
        let start = HEADER_SIZE + self.extras_len();
        self.buf.slice(start..start + self.key_len())
    }

    pub fn value(&self) -> Bytes {
        let start = HEADER_SIZE + self.extras_len() + self.key_len();
        self.buf.slice(start..)
    }

    // -----------------------------------------------------------------------
    // Typed accessors for known opcodes
    // -----------------------------------------------------------------------

    /// By-sequence-number of a mutation/deletion/expiration (extras 0..8).
    pub fn by_seqno(&self) -> Result<u64, WireError> {
        self.extras_u64(0, "missing by_seqno extras")
    }

    /// Revision seqno of a mutation/deletion/expiration (extras 8..16).
    pub fn rev_seqno(&self) -> Result<u64, WireError> {
        self.extras_u64(8, "missing rev_seqno extras")
    }

    /// `(start, end, flags)` of a snapshot marker.
    pub fn snapshot_marker(&self) -> Result<SnapshotMarker, WireError> {
        let extras = self.extras();
        if extras.len() < 20 {
            return Err(WireError::MalformedFrame("short snapshot marker extras"));
        }
        let start_seqno = be_u64(&extras[0..8]);
        let end_seqno = be_u64(&extras[8..16]);
        if start_seqno > end_seqno {
            return Err(WireError::MalformedFrame("snapshot start above end"));
        }
        let flags = u32::from_be_bytes([extras[16], extras[17], extras[18], extras[19]]);
        Ok(SnapshotMarker::new(start_seqno, end_seqno, flags))
    }

    /// The `(uuid, seqno)` entries of a failover-log response value.
    pub fn failover_log(&self) -> Result<Vec<FailoverLogEntry>, WireError> {
        let value = self.value();
        if value.len() % 16 != 0 {
            return Err(WireError::MalformedFrame("failover log not 16-byte entries"));
        }
        let entries = value
            .chunks_exact(16)
            .map(|entry| FailoverLogEntry {
                uuid: be_u64(&entry[0..8]),
                seqno: be_u64(&entry[8..16]),
            })
            .collect();
        Ok(entries)
    }

    /// The seqno to roll back to, from a rollback response value.
    pub fn rollback_seqno(&self) -> Result<u64, WireError> {
        let value = self.value();
        if value.len() < 8 {
            return Err(WireError::MalformedFrame("short rollback value"));
        }
        Ok(be_u64(&value[0..8]))
    }

    /// Seqno state from an observe-seqno response value:
    /// `format(1) | vbucket(2) | vbuuid(8) | persisted(8) | current(8)`.
    pub fn observed_seqno(&self) -> Result<ObservedSeqno, WireError> {
        let value = self.value();
        if value.len() < 27 {
            return Err(WireError::MalformedFrame("short observe-seqno value"));
        }
        Ok(ObservedSeqno {
            vbuuid: be_u64(&value[3..11]),
            persisted_seqno: be_u64(&value[11..19]),
            current_seqno: be_u64(&value[19..27]),
        })
    }

    /// The reason code of a stream-end request (extras 0..4).
    pub fn stream_end_reason(&self) -> Result<u32, WireError> {
        let extras = self.extras();
        if extras.len() < 4 {
            return Err(WireError::MalformedFrame("short stream-end extras"));
        }
        Ok(u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]))
    }

    fn extras_u64(&self, at: usize, context: &'static str) -> Result<u64, WireError> {
        let extras = self.extras();
        if extras.len() < at + 8 {
            return Err(WireError::MalformedFrame(context));
        }
        Ok(be_u64(&extras[at..at + 8]))
    }
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(raw)
}
