//! Frame demultiplexer: raw frames in, typed events out.
//!
//! Runs on the owning connection's dispatch task, one frame at a time.
//! Updates to the partition tables happen here, before the corresponding
//! event is emitted, so every event that reads them observes the update.
//! Frames never escape: listeners get `Bytes` views of key and value, the
//! frame itself is released when handling returns, on every path.

use crate::events::{DcpEvent, StreamEndReason};
use crate::flow::{AckTracker, FlowControlMode, FlowControlReceipt};
use crate::partitions::{MAX_PARTITIONS, PartitionStateTable, StreamState};
use dcp_wire::frame::{Magic, opcode};
use dcp_wire::types::FailoverLogEntry;
use dcp_wire::{DcpFrame, WireError};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub(crate) struct Demux {
    table: Arc<PartitionStateTable>,
    events: broadcast::Sender<DcpEvent>,
    ack: Arc<AckTracker>,
    mode: FlowControlMode,
}

impl Demux {
    pub fn new(
        table: Arc<PartitionStateTable>,
        events: broadcast::Sender<DcpEvent>,
        ack: Arc<AckTracker>,
        mode: FlowControlMode,
    ) -> Demux {
        Demux {
            table,
            events,
            ack,
            mode,
        }
    }

    /// Handle one unsolicited frame. Errors fold into a `StreamFailure` on
    /// the best-known partition; they never propagate to the reader.
    pub fn handle(&self, frame: DcpFrame) {
        let vbucket = match frame.magic() {
            Magic::Request => i32::from(frame.vbucket()),
            Magic::Response => -1,
        };
        if let Err(error) = self.dispatch(&frame) {
            warn!(vbucket, %error, "failed to dispatch inbound frame");
            self.failure(vbucket, &error.to_string());
        }
    }

    fn dispatch(&self, frame: &DcpFrame) -> Result<(), WireError> {
        match frame.magic() {
            Magic::Request => match frame.opcode() {
                opcode::DCP_SNAPSHOT_MARKER => self.snapshot_marker(frame),
                opcode::DCP_MUTATION | opcode::DCP_DELETION | opcode::DCP_EXPIRATION => {
                    self.data_event(frame)
                }
                opcode::DCP_STREAM_END => self.stream_end(frame),
                opcode::DCP_FLUSH => {
                    // Flow-controllable but carries nothing we surface.
                    debug!(opcode = frame.opcode(), "unhandled data opcode");
                    FlowControlReceipt::new(frame.frame_len() as u32, self.ack.clone()).ack();
                    Ok(())
                }
                other => {
                    debug!(opcode = other, "dropping unknown control opcode");
                    Ok(())
                }
            },
            Magic::Response => {
                // Responses reach the demultiplexer only when no request
                // claimed them; without the originating request there is no
                // partition to attribute them to.
                debug!(
                    opcode = frame.opcode(),
                    opaque = frame.opaque(),
                    "dropping unclaimed response"
                );
                Ok(())
            }
        }
    }

    fn snapshot_marker(&self, frame: &DcpFrame) -> Result<(), WireError> {
        let vbucket = checked_vbucket(frame)?;
        let marker = frame.snapshot_marker()?;
        self.table.set_snapshot(vbucket, marker);
        // Snapshot markers count against the flow-control buffer and are
        // always acknowledged here.
        self.ack.record(frame.frame_len() as u32);
        self.emit(DcpEvent::SnapshotDetails { vbucket, marker });
        Ok(())
    }

    fn data_event(&self, frame: &DcpFrame) -> Result<(), WireError> {
        let vbucket = checked_vbucket(frame)?;
        let seqno = frame.by_seqno()?;
        let rev_seqno = frame.rev_seqno()?;
        self.table.record_seqno(vbucket, seqno);
        let offset = self.table.offset_at(vbucket, seqno);

        let receipt = FlowControlReceipt::new(frame.frame_len() as u32, self.ack.clone());
        if self.mode == FlowControlMode::Automatic {
            receipt.ack();
        }
        let event = if frame.opcode() == opcode::DCP_MUTATION {
            DcpEvent::Mutation {
                vbucket,
                offset,
                key: frame.key(),
                value: frame.value(),
                cas: frame.cas(),
                rev_seqno,
                receipt: receipt.clone(),
            }
        } else {
            DcpEvent::Deletion {
                vbucket,
                offset,
                key: frame.key(),
                cas: frame.cas(),
                rev_seqno,
                is_expiration: frame.opcode() == opcode::DCP_EXPIRATION,
                receipt: receipt.clone(),
            }
        };
        if self.events.send(event).is_err() {
            // Nobody listening: consume the bytes so the server keeps going.
            receipt.ack();
        }
        Ok(())
    }

    fn stream_end(&self, frame: &DcpFrame) -> Result<(), WireError> {
        let vbucket = checked_vbucket(frame)?;
        let reason = StreamEndReason::from_code(frame.stream_end_reason()?);
        self.table.set_state(vbucket, StreamState::Ended);
        self.emit(DcpEvent::StreamEnd { vbucket, reason });
        Ok(())
    }

    /// Record the head of a failover log and surface the full list. Called
    /// inline on the dispatch task for both explicit failover-log responses
    /// and the log embedded in a successful stream-open response.
    pub fn apply_failover_log(&self, vbucket: u16, entries: &[FailoverLogEntry]) {
        if let Some(head) = entries.first() {
            self.table.set_uuid(vbucket, head.uuid);
        }
        self.emit(DcpEvent::FailoverLog {
            vbucket,
            entries: entries.into(),
        });
    }

    /// Mark a partition as streaming after a successful stream-open
    /// response, before any of its data frames are dispatched.
    pub fn stream_opened(&self, vbucket: u16) {
        if !self
            .table
            .transition(vbucket, StreamState::Opening, StreamState::Streaming)
        {
            debug!(vbucket, "stream opened outside the opening state");
            self.table.set_state(vbucket, StreamState::Streaming);
        }
    }

    /// Emit a `StreamFailure`. Failures raised while emitting are logged and
    /// swallowed; there is nowhere left to report them.
    pub fn failure(&self, vbucket: i32, detail: &str) {
        let dropped = self
            .events
            .send(DcpEvent::StreamFailure {
                vbucket,
                detail: detail.to_owned(),
            })
            .is_err();
        if dropped {
            debug!(vbucket, detail, "stream failure had no listeners");
        }
    }

    fn emit(&self, event: DcpEvent) {
        let _ = self.events.send(event);
    }
}

fn checked_vbucket(frame: &DcpFrame) -> Result<u16, WireError> {
    let vbucket = frame.vbucket();
    if usize::from(vbucket) >= MAX_PARTITIONS {
        return Err(WireError::MalformedFrame("partition id out of range"));
    }
    Ok(vbucket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use dcp_wire::frame::HEADER_SIZE;
    use dcp_wire::types::SnapshotMarker;
    use tokio::sync::mpsc;

    fn request_frame(op: u8, vbucket: u16, extras: &[u8], key: &[u8], value: &[u8]) -> DcpFrame {
        let body_len = extras.len() + key.len() + value.len();
        let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
        buf.push(Magic::REQUEST);
        buf.push(op);
        buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        buf.push(extras.len() as u8);
        buf.push(0);
        buf.extend_from_slice(&vbucket.to_be_bytes());
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&42u64.to_be_bytes());
        buf.extend_from_slice(extras);
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        DcpFrame::parse(Bytes::from(buf)).expect("valid frame")
    }

    fn snapshot_frame(vbucket: u16, start: u64, end: u64) -> DcpFrame {
        let mut extras = Vec::new();
        extras.extend_from_slice(&start.to_be_bytes());
        extras.extend_from_slice(&end.to_be_bytes());
        extras.extend_from_slice(&0u32.to_be_bytes());
        request_frame(opcode::DCP_SNAPSHOT_MARKER, vbucket, &extras, b"", b"")
    }

    fn mutation_frame(vbucket: u16, seqno: u64, key: &[u8], value: &[u8]) -> DcpFrame {
        let mut extras = Vec::new();
        extras.extend_from_slice(&seqno.to_be_bytes());
        extras.extend_from_slice(&1u64.to_be_bytes());
        extras.extend_from_slice(&[0u8; 15]);
        request_frame(opcode::DCP_MUTATION, vbucket, &extras, key, value)
    }

    struct Fixture {
        demux: Demux,
        table: Arc<PartitionStateTable>,
        events: broadcast::Receiver<DcpEvent>,
        out: mpsc::UnboundedReceiver<Bytes>,
    }

    fn fixture(mode: FlowControlMode) -> Fixture {
        let table = Arc::new(PartitionStateTable::new());
        let (event_tx, events) = broadcast::channel(64);
        let (out_tx, out) = mpsc::unbounded_channel();
        let ack = Arc::new(AckTracker::new(1024, 0.5, out_tx));
        let demux = Demux::new(table.clone(), event_tx, ack, mode);
        Fixture {
            demux,
            table,
            events,
            out,
        }
    }

    #[tokio::test]
    async fn snapshot_then_mutation_is_delivered_in_order_with_stamped_offset() {
        let mut fx = fixture(FlowControlMode::Automatic);
        fx.demux.apply_failover_log(
            7,
            &[FailoverLogEntry {
                uuid: 0xFEED,
                seqno: 0,
            }],
        );
        fx.demux.handle(snapshot_frame(7, 100, 200));
        fx.demux.handle(mutation_frame(7, 150, b"a", b"v"));

        match fx.events.recv().await.expect("failover log event") {
            DcpEvent::FailoverLog { vbucket, entries } => {
                assert_eq!(vbucket, 7);
                assert_eq!(entries[0].uuid, 0xFEED);
            }
            other => panic!("expected FailoverLog, got: {other:?}"),
        }
        match fx.events.recv().await.expect("snapshot event") {
            DcpEvent::SnapshotDetails { vbucket, marker } => {
                assert_eq!(vbucket, 7);
                assert_eq!(marker, SnapshotMarker::new(100, 200, 0));
            }
            other => panic!("expected SnapshotDetails, got: {other:?}"),
        }
        match fx.events.recv().await.expect("mutation event") {
            DcpEvent::Mutation {
                vbucket,
                offset,
                key,
                value,
                ..
            } => {
                assert_eq!(vbucket, 7);
                assert_eq!(offset.vbuuid, 0xFEED);
                assert_eq!(offset.seqno, 150);
                assert_eq!(offset.snapshot, SnapshotMarker::new(100, 200, 0));
                assert_eq!(&key[..], b"a");
                assert_eq!(&value[..], b"v");
            }
            other => panic!("expected Mutation, got: {other:?}"),
        }
        assert_eq!(fx.table.last_seqno(7), 150);
    }

    #[tokio::test]
    async fn manual_mode_leaves_acknowledgement_to_the_listener() {
        let mut fx = fixture(FlowControlMode::Manual);
        fx.demux.handle(mutation_frame(1, 5, b"k", b"wwwwwwwwwwwwwwwww"));

        let receipt = match fx.events.recv().await.expect("mutation") {
            DcpEvent::Mutation { receipt, .. } => receipt,
            other => panic!("expected Mutation, got: {other:?}"),
        };
        assert!(!receipt.is_acknowledged());
        // Frame is small; push the accumulator over the threshold ourselves.
        receipt.ack();
        fx.demux.handle(mutation_frame(1, 6, b"k", &[0u8; 600]));
        match fx.events.recv().await.expect("second mutation") {
            DcpEvent::Mutation { receipt, .. } => receipt.ack(),
            other => panic!("expected Mutation, got: {other:?}"),
        }
        assert!(fx.out.try_recv().is_ok(), "buffer ack should have flushed");
    }

    #[tokio::test]
    async fn expiration_maps_to_deletion_with_flag() {
        let mut fx = fixture(FlowControlMode::Automatic);
        let mut extras = Vec::new();
        extras.extend_from_slice(&9u64.to_be_bytes());
        extras.extend_from_slice(&2u64.to_be_bytes());
        fx.demux
            .handle(request_frame(opcode::DCP_EXPIRATION, 3, &extras, b"k", b""));

        match fx.events.recv().await.expect("deletion") {
            DcpEvent::Deletion {
                vbucket,
                is_expiration,
                ..
            } => {
                assert_eq!(vbucket, 3);
                assert!(is_expiration);
            }
            other => panic!("expected Deletion, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stream_end_updates_state_and_reports_reason() {
        let mut fx = fixture(FlowControlMode::Automatic);
        fx.table.set_state(2, StreamState::Streaming);
        fx.demux.handle(request_frame(
            opcode::DCP_STREAM_END,
            2,
            &2u32.to_be_bytes(),
            b"",
            b"",
        ));

        assert_eq!(fx.table.state(2), StreamState::Ended);
        match fx.events.recv().await.expect("stream end") {
            DcpEvent::StreamEnd { vbucket, reason } => {
                assert_eq!(vbucket, 2);
                assert_eq!(reason, StreamEndReason::StateChanged);
            }
            other => panic!("expected StreamEnd, got: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_control_opcode_is_dropped_without_events() {
        let mut fx = fixture(FlowControlMode::Automatic);
        fx.demux.handle(request_frame(0x70, 1, &[], b"", b""));
        assert!(fx.events.try_recv().is_err());
        assert!(fx.out.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_data_frame_surfaces_stream_failure_for_its_partition() {
        let mut fx = fixture(FlowControlMode::Automatic);
        // Mutation with truncated extras: by_seqno is unreadable.
        fx.demux
            .handle(request_frame(opcode::DCP_MUTATION, 9, &[0u8; 4], b"", b""));

        match fx.events.recv().await.expect("failure") {
            DcpEvent::StreamFailure { vbucket, .. } => assert_eq!(vbucket, 9),
            other => panic!("expected StreamFailure, got: {other:?}"),
        }
    }
}
