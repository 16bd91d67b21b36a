//! Request/response correlation.
//!
//! Outbound requests get a fresh opaque from a per-connection counter and a
//! one-shot completion slot; inbound responses claim their slot by opaque.
//! Frames with no slot belong to the unsolicited path (control and data
//! events) and are handed back to the caller.

use crate::error::DcpError;
use bytes::Bytes;
use dcp_wire::{DcpFrame, RequestBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, mpsc, oneshot};

struct PendingSlot {
    opcode: u8,
    vbucket: u16,
    tx: oneshot::Sender<Result<DcpFrame, DcpError>>,
}

/// Outcome of routing an inbound response frame.
pub(crate) enum Completion {
    /// A pending request was completed. The originating request's opcode and
    /// partition are echoed so the reader can apply connection-local state
    /// updates before anything else observes the response.
    Delivered {
        opcode: u8,
        vbucket: u16,
        frame: DcpFrame,
    },
    /// No pending request claimed the frame.
    Unclaimed(DcpFrame),
}

pub(crate) struct Dispatcher {
    opaque: AtomicU32,
    pending: Mutex<HashMap<u32, PendingSlot>>,
    out: mpsc::UnboundedSender<Bytes>,
}

impl Dispatcher {
    pub fn new(out: mpsc::UnboundedSender<Bytes>) -> Dispatcher {
        Dispatcher {
            opaque: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            out,
        }
    }

    /// Send one request and await its response.
    ///
    /// Non-success statuses complete with
    /// [`DcpError::BadResponseStatus`]; a torn-down connection completes
    /// every outstanding request with [`DcpError::ConnectionClosed`].
    pub async fn send_request(&self, mut builder: RequestBuilder) -> Result<DcpFrame, DcpError> {
        let opaque = self.opaque.fetch_add(1, Ordering::Relaxed);
        let frame = builder.build(opaque)?;
        let parsed = DcpFrame::parse(frame.clone())?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            opaque,
            PendingSlot {
                opcode: parsed.opcode(),
                vbucket: parsed.vbucket(),
                tx,
            },
        );
        if self.out.send(frame).is_err() {
            self.pending.lock().await.remove(&opaque);
            return Err(DcpError::ConnectionClosed);
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(DcpError::ConnectionClosed),
        }
    }

    /// Route one inbound response frame to its slot, if any.
    pub async fn complete(&self, frame: DcpFrame) -> Completion {
        let slot = self.pending.lock().await.remove(&frame.opaque());
        match slot {
            None => Completion::Unclaimed(frame),
            Some(slot) => {
                let status = frame.status();
                let echo = Completion::Delivered {
                    opcode: slot.opcode,
                    vbucket: slot.vbucket,
                    frame: frame.clone(),
                };
                let result = if status.is_success() {
                    Ok(frame)
                } else {
                    Err(DcpError::BadResponseStatus { status, frame })
                };
                let _ = slot.tx.send(result);
                echo
            }
        }
    }

    /// Complete every outstanding request with `ConnectionClosed`.
    pub async fn fail_all(&self) {
        let mut pending = self.pending.lock().await;
        for (_, slot) in pending.drain() {
            let _ = slot.tx.send(Err(DcpError::ConnectionClosed));
        }
    }
}
