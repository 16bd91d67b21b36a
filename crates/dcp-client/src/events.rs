//! The typed change-event taxonomy delivered to listeners.
//!
//! Events are cheap to clone (payloads are `Bytes` slices and shared
//! handles), so delivery is a broadcast channel. Listener code never sees
//! raw frames; keys and values are immutable views that stay valid after the
//! frame itself is released.

use crate::conductor::ConductorMsg;
use crate::flow::FlowControlReceipt;
use bytes::Bytes;
use dcp_wire::types::{FailoverLogEntry, SnapshotMarker, StreamOffset};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

/// Why the server ended a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEndReason {
    /// All requested seqnos were sent.
    Ok,
    Closed,
    StateChanged,
    Disconnected,
    TooSlow,
    Unknown(u32),
}

impl StreamEndReason {
    pub fn from_code(code: u32) -> StreamEndReason {
        match code {
            0 => StreamEndReason::Ok,
            1 => StreamEndReason::Closed,
            2 => StreamEndReason::StateChanged,
            3 => StreamEndReason::Disconnected,
            4 => StreamEndReason::TooSlow,
            other => StreamEndReason::Unknown(other),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DcpEvent {
    Mutation {
        vbucket: u16,
        offset: StreamOffset,
        key: Bytes,
        value: Bytes,
        cas: u64,
        rev_seqno: u64,
        receipt: FlowControlReceipt,
    },
    /// Deletions and expirations share a shape; `is_expiration` tells them
    /// apart.
    Deletion {
        vbucket: u16,
        offset: StreamOffset,
        key: Bytes,
        cas: u64,
        rev_seqno: u64,
        is_expiration: bool,
        receipt: FlowControlReceipt,
    },
    SnapshotDetails {
        vbucket: u16,
        marker: SnapshotMarker,
    },
    /// The server refused to resume at the requested seqno. The listener
    /// decides the new offset through the [`RollbackAction`]; an action that
    /// is dropped unhandled surfaces a `StreamFailure` for the partition.
    Rollback {
        vbucket: u16,
        seqno: u64,
        action: RollbackAction,
    },
    FailoverLog {
        vbucket: u16,
        entries: Arc<[FailoverLogEntry]>,
    },
    StreamEnd {
        vbucket: u16,
        reason: StreamEndReason,
    },
    /// `vbucket` is `-1` when the failing partition is unknown.
    StreamFailure {
        vbucket: i32,
        detail: String,
    },
}

// ---------------------------------------------------------------------------
// RollbackAction
// ---------------------------------------------------------------------------

/// The listener's handle on a rollback decision.
///
/// Exactly one of `resume_at`, `resume`, or `dismiss` should be called; when
/// every clone drops without any of them, the default handler reports a
/// stream failure for the partition.
#[derive(Debug, Clone)]
pub struct RollbackAction {
    inner: Arc<RollbackInner>,
}

#[derive(Debug)]
struct RollbackInner {
    vbucket: u16,
    seqno: u64,
    handled: AtomicBool,
    conductor: mpsc::UnboundedSender<ConductorMsg>,
}

impl RollbackAction {
    pub(crate) fn new(
        vbucket: u16,
        seqno: u64,
        conductor: mpsc::UnboundedSender<ConductorMsg>,
    ) -> RollbackAction {
        RollbackAction {
            inner: Arc::new(RollbackInner {
                vbucket,
                seqno,
                handled: AtomicBool::new(false),
                conductor,
            }),
        }
    }

    pub fn vbucket(&self) -> u16 {
        self.inner.vbucket
    }

    pub fn seqno(&self) -> u64 {
        self.inner.seqno
    }

    /// Re-open the stream at a listener-chosen offset.
    pub fn resume_at(&self, offset: StreamOffset) {
        if !self.inner.handled.swap(true, Ordering::AcqRel) {
            let _ = self.inner.conductor.send(ConductorMsg::StartStream {
                vbucket: self.inner.vbucket,
                offset,
            });
        }
    }

    /// Re-open the stream at the server's rollback point.
    pub fn resume(&self) {
        if !self.inner.handled.swap(true, Ordering::AcqRel) {
            let _ = self.inner.conductor.send(ConductorMsg::ResumeRollback {
                vbucket: self.inner.vbucket,
                seqno: self.inner.seqno,
            });
        }
    }

    /// Accept the rollback without re-opening; suppresses the default
    /// failure report.
    pub fn dismiss(&self) {
        if !self.inner.handled.swap(true, Ordering::AcqRel) {
            let _ = self.inner.conductor.send(ConductorMsg::RollbackDismissed {
                vbucket: self.inner.vbucket,
            });
        }
    }
}

impl Drop for RollbackInner {
    fn drop(&mut self) {
        if !*self.handled.get_mut() {
            let _ = self.conductor.send(ConductorMsg::RollbackUnhandled {
                vbucket: self.vbucket,
            });
        }
    }
}
