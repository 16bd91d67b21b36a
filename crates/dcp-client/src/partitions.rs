//! Per-partition state table.
//!
//! Two fixed-size arrays of 1024 slots hold the current failover uuid and
//! snapshot window per partition, alongside the last observed seqno and the
//! stream lifecycle state. One writer (the owning connection's dispatch
//! task), many readers; the uuid and seqno slots are plain atomics, the
//! snapshot slot is an atomic pointer swap so readers never lock.

use arc_swap::ArcSwapOption;
use dcp_wire::types::{SnapshotMarker, StreamOffset};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

/// Hard cap on the partition space.
pub const MAX_PARTITIONS: usize = 1024;

/// Lifecycle of one partition stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Opening,
    Streaming,
    Ended,
    Failed,
}

impl StreamState {
    fn as_u8(self) -> u8 {
        match self {
            StreamState::Idle => 0,
            StreamState::Opening => 1,
            StreamState::Streaming => 2,
            StreamState::Ended => 3,
            StreamState::Failed => 4,
        }
    }

    fn from_u8(raw: u8) -> StreamState {
        match raw {
            1 => StreamState::Opening,
            2 => StreamState::Streaming,
            3 => StreamState::Ended,
            4 => StreamState::Failed,
            _ => StreamState::Idle,
        }
    }
}

pub struct PartitionStateTable {
    uuids: Box<[AtomicU64]>,
    last_seqnos: Box<[AtomicU64]>,
    snapshots: Box<[ArcSwapOption<SnapshotMarker>]>,
    states: Box<[AtomicU8]>,
}

impl PartitionStateTable {
    pub fn new() -> PartitionStateTable {
        PartitionStateTable {
            uuids: (0..MAX_PARTITIONS).map(|_| AtomicU64::new(0)).collect(),
            last_seqnos: (0..MAX_PARTITIONS).map(|_| AtomicU64::new(0)).collect(),
            snapshots: (0..MAX_PARTITIONS)
                .map(|_| ArcSwapOption::const_empty())
                .collect(),
            states: (0..MAX_PARTITIONS).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    fn slot(vbucket: u16) -> Option<usize> {
        let index = usize::from(vbucket);
        (index < MAX_PARTITIONS).then_some(index)
    }

    pub fn uuid(&self, vbucket: u16) -> u64 {
        Self::slot(vbucket).map_or(0, |i| self.uuids[i].load(Ordering::Acquire))
    }

    pub fn set_uuid(&self, vbucket: u16, uuid: u64) {
        if let Some(i) = Self::slot(vbucket) {
            self.uuids[i].store(uuid, Ordering::Release);
        }
    }

    pub fn snapshot(&self, vbucket: u16) -> Option<SnapshotMarker> {
        let i = Self::slot(vbucket)?;
        self.snapshots[i].load_full().map(|marker| *marker)
    }

    pub fn set_snapshot(&self, vbucket: u16, marker: SnapshotMarker) {
        if let Some(i) = Self::slot(vbucket) {
            self.snapshots[i].store(Some(Arc::new(marker)));
        }
    }

    pub fn last_seqno(&self, vbucket: u16) -> u64 {
        Self::slot(vbucket).map_or(0, |i| self.last_seqnos[i].load(Ordering::Acquire))
    }

    pub fn record_seqno(&self, vbucket: u16, seqno: u64) {
        if let Some(i) = Self::slot(vbucket) {
            self.last_seqnos[i].store(seqno, Ordering::Release);
        }
    }

    /// The current resumable position of a partition.
    pub fn offset(&self, vbucket: u16) -> StreamOffset {
        self.offset_at(vbucket, self.last_seqno(vbucket))
    }

    /// The offset a specific event seqno is stamped with: current uuid and
    /// snapshot, the event's own seqno.
    pub fn offset_at(&self, vbucket: u16, seqno: u64) -> StreamOffset {
        StreamOffset::new(
            self.uuid(vbucket),
            seqno,
            self.snapshot(vbucket).unwrap_or_default(),
        )
    }

    pub fn state(&self, vbucket: u16) -> StreamState {
        Self::slot(vbucket)
            .map_or(StreamState::Idle, |i| {
                StreamState::from_u8(self.states[i].load(Ordering::Acquire))
            })
    }

    pub fn set_state(&self, vbucket: u16, state: StreamState) {
        if let Some(i) = Self::slot(vbucket) {
            self.states[i].store(state.as_u8(), Ordering::Release);
        }
    }

    /// Atomically move `vbucket` from `from` to `to`; `false` when the slot
    /// was not in `from`.
    pub fn transition(&self, vbucket: u16, from: StreamState, to: StreamState) -> bool {
        let Some(i) = Self::slot(vbucket) else {
            return false;
        };
        self.states[i]
            .compare_exchange(
                from.as_u8(),
                to.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Partitions currently in `state`, bounded by `num_partitions`.
    pub fn partitions_in(&self, state: StreamState, num_partitions: usize) -> Vec<u16> {
        (0..num_partitions.min(MAX_PARTITIONS))
            .filter(|&i| StreamState::from_u8(self.states[i].load(Ordering::Acquire)) == state)
            .map(|i| i as u16)
            .collect()
    }
}

impl Default for PartitionStateTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_and_uuid_updates_are_visible_to_offset_reads() {
        let table = PartitionStateTable::new();
        table.set_uuid(7, 0xAB);
        table.set_snapshot(7, SnapshotMarker::new(100, 200, 0));
        table.record_seqno(7, 150);

        let offset = table.offset(7);
        assert_eq!(offset.vbuuid, 0xAB);
        assert_eq!(offset.seqno, 150);
        assert_eq!(offset.snapshot, SnapshotMarker::new(100, 200, 0));
    }

    #[test]
    fn offset_defaults_to_zero_before_any_update() {
        let table = PartitionStateTable::new();
        assert_eq!(table.offset(3), StreamOffset::ZERO);
    }

    #[test]
    fn transition_requires_the_expected_from_state() {
        let table = PartitionStateTable::new();
        assert!(table.transition(1, StreamState::Idle, StreamState::Opening));
        assert!(!table.transition(1, StreamState::Idle, StreamState::Opening));
        assert!(table.transition(1, StreamState::Opening, StreamState::Streaming));
        assert_eq!(table.state(1), StreamState::Streaming);
    }

    #[test]
    fn out_of_range_partitions_read_as_idle_defaults() {
        let table = PartitionStateTable::new();
        table.set_uuid(2000, 5);
        assert_eq!(table.uuid(2000), 0);
        assert_eq!(table.state(2000), StreamState::Idle);
        assert!(!table.transition(2000, StreamState::Idle, StreamState::Opening));
    }

    #[test]
    fn partitions_in_filters_by_state_and_bound() {
        let table = PartitionStateTable::new();
        table.set_state(0, StreamState::Streaming);
        table.set_state(2, StreamState::Streaming);
        table.set_state(5, StreamState::Streaming);
        assert_eq!(table.partitions_in(StreamState::Streaming, 4), vec![0, 2]);
    }
}
