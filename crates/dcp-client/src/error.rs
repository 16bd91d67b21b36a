//! Error taxonomy of the streaming client.
//!
//! I/O failures never escape the connection tasks: they fold into
//! [`DcpError`] for request futures, into lifecycle transitions, or into
//! `StreamFailure` events on the event channel.

use dcp_wire::frame::Status;
use dcp_wire::{DcpFrame, WireError};

#[derive(Debug, thiserror::Error)]
pub enum DcpError {
    #[error(transparent)]
    Wire(#[from] WireError),
    /// The server answered a request with a non-success status. The frame is
    /// retained so bodies (e.g. a rollback seqno) stay inspectable.
    #[error("bad response status: {status}")]
    BadResponseStatus { status: Status, frame: DcpFrame },
    /// The connection carrying the request went away before a response.
    #[error("connection closed")]
    ConnectionClosed,
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("operation timed out")]
    Timeout,
    /// The client was asked to stop; no further attempts are made.
    #[error("client stopped")]
    Stopped,
    #[error("partition {0} has no owner in the current configuration")]
    NoOwner(u16),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config endpoint: {0}")]
    Http(String),
    #[error("config parse: {0}")]
    Parse(String),
    #[error("all seed hosts exhausted")]
    NoSeedsLeft,
    #[error("configuration declares {0} partitions, maximum is 1024")]
    TooManyPartitions(usize),
}
