//! Server-driven flow control.
//!
//! Every data frame and snapshot marker counts against the connection's
//! buffer size `B`. Acknowledged bytes accumulate; once they reach the
//! threshold fraction `T` of `B`, one `DCP_BUFFER_ACK` reporting the
//! accumulated count goes out and the accumulator resets. A receipt is
//! acknowledged at most once; duplicate calls are no-ops.

use bytes::Bytes;
use dcp_wire::RequestBuilder;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::mpsc;
use tracing::trace;

/// Who acknowledges data events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControlMode {
    /// The dispatcher acknowledges on dispatch entry.
    Automatic,
    /// The listener must call [`FlowControlReceipt::ack`] exactly once.
    Manual,
}

/// Per-connection acknowledgement accumulator.
#[derive(Debug)]
pub struct AckTracker {
    threshold_bytes: u32,
    acked: AtomicU32,
    out: mpsc::UnboundedSender<Bytes>,
}

impl AckTracker {
    pub fn new(buffer_size: u32, threshold: f64, out: mpsc::UnboundedSender<Bytes>) -> AckTracker {
        let threshold_bytes = (f64::from(buffer_size) * threshold) as u32;
        AckTracker {
            threshold_bytes: threshold_bytes.max(1),
            acked: AtomicU32::new(0),
            out,
        }
    }

    pub(crate) fn record(&self, size: u32) {
        let total = self.acked.fetch_add(size, Ordering::AcqRel) + size;
        if total < self.threshold_bytes {
            return;
        }
        let flushed = self.acked.swap(0, Ordering::AcqRel);
        if flushed == 0 {
            // A concurrent record already flushed.
            return;
        }
        trace!(bytes = flushed, "sending buffer acknowledgement");
        if let Ok(frame) = RequestBuilder::buffer_ack(flushed).build(0) {
            let _ = self.out.send(frame);
        }
    }
}

/// At-most-once acknowledgement handle carried by every data event.
#[derive(Debug, Clone)]
pub struct FlowControlReceipt {
    inner: Arc<ReceiptInner>,
}

#[derive(Debug)]
struct ReceiptInner {
    size: u32,
    acknowledged: AtomicBool,
    tracker: Arc<AckTracker>,
}

impl FlowControlReceipt {
    pub(crate) fn new(size: u32, tracker: Arc<AckTracker>) -> FlowControlReceipt {
        FlowControlReceipt {
            inner: Arc::new(ReceiptInner {
                size,
                acknowledged: AtomicBool::new(false),
                tracker,
            }),
        }
    }

    /// Report this event's bytes as consumed. Idempotent.
    pub fn ack(&self) {
        if !self.inner.acknowledged.swap(true, Ordering::AcqRel) {
            self.inner.tracker.record(self.inner.size);
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.inner.acknowledged.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u32 {
        self.inner.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dcp_wire::frame::{DcpFrame, opcode};

    fn tracker(buffer: u32, threshold: f64) -> (Arc<AckTracker>, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(AckTracker::new(buffer, threshold, tx)), rx)
    }

    fn ack_count(frame: Bytes) -> u32 {
        let frame = DcpFrame::parse(frame).expect("valid frame");
        assert_eq!(frame.opcode(), opcode::DCP_BUFFER_ACK);
        u32::from_be_bytes(frame.extras()[..4].try_into().expect("4-byte extras"))
    }

    #[test]
    fn threshold_crossing_flushes_accumulated_bytes_once() {
        let (tracker, mut rx) = tracker(1024, 0.5);
        let receipt = FlowControlReceipt::new(600, tracker);
        receipt.ack();

        let frame = rx.try_recv().expect("one ack frame");
        assert_eq!(ack_count(frame), 600);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn below_threshold_bytes_accumulate_silently() {
        let (tracker, mut rx) = tracker(1024, 0.5);
        FlowControlReceipt::new(200, tracker.clone()).ack();
        FlowControlReceipt::new(200, tracker.clone()).ack();
        assert!(rx.try_recv().is_err());

        // Third receipt tips the accumulator over 512.
        FlowControlReceipt::new(200, tracker).ack();
        let frame = rx.try_recv().expect("ack after crossing threshold");
        assert_eq!(ack_count(frame), 600);
    }

    #[test]
    fn duplicate_ack_is_a_no_op() {
        let (tracker, mut rx) = tracker(1024, 0.5);
        let receipt = FlowControlReceipt::new(600, tracker);
        receipt.ack();
        receipt.ack();
        receipt.clone().ack();

        let frame = rx.try_recv().expect("single ack frame");
        assert_eq!(ack_count(frame), 600);
        assert!(rx.try_recv().is_err());
        assert!(receipt.is_acknowledged());
    }

    #[test]
    fn accumulator_resets_after_flush() {
        let (tracker, mut rx) = tracker(1024, 0.5);
        FlowControlReceipt::new(600, tracker.clone()).ack();
        assert_eq!(ack_count(rx.try_recv().expect("first flush")), 600);

        FlowControlReceipt::new(100, tracker.clone()).ack();
        assert!(rx.try_recv().is_err());
        FlowControlReceipt::new(500, tracker).ack();
        assert_eq!(ack_count(rx.try_recv().expect("second flush")), 600);
    }
}
