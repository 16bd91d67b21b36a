//! Wire-level types for the database change protocol (DCP).
//!
//! This crate contains no I/O: it frames and parses the fixed-header binary
//! protocol, exposes typed accessors for the opcodes the streaming client
//! consumes, and builds outbound request frames. All multi-byte integers on
//! the wire are big-endian.

pub mod frame;
pub mod request;
pub mod types;

pub use frame::{DcpFrame, HEADER_SIZE, Magic, Status, opcode};
pub use request::RequestBuilder;
pub use types::{FailoverLogEntry, ObservedSeqno, SnapshotMarker, StreamOffset};

/// Errors produced while parsing or building frames.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Header/body mismatch, unknown magic, or a typed accessor applied to a
    /// frame whose body is too short for it.
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    /// A request builder was asked to build a second frame.
    #[error("request builder already consumed")]
    IllegalReuse,
}
