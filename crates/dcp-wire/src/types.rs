//! Value types shared between the codec and the streaming client.

use std::fmt;

/// One entry of a partition's failover log.
///
/// Entry 0 of a log is the most recent branch; uuids within one log are
/// distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverLogEntry {
    pub uuid: u64,
    pub seqno: u64,
}

/// The inclusive by-seqno window of mutations the server will emit next for
/// a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotMarker {
    pub start_seqno: u64,
    pub end_seqno: u64,
    pub flags: u32,
}

impl SnapshotMarker {
    pub fn new(start_seqno: u64, end_seqno: u64, flags: u32) -> SnapshotMarker {
        SnapshotMarker {
            start_seqno,
            end_seqno,
            flags,
        }
    }

    /// Whether `seqno` falls inside this window.
    pub fn contains(&self, seqno: u64) -> bool {
        self.start_seqno <= seqno && seqno <= self.end_seqno
    }
}

impl fmt::Display for SnapshotMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start_seqno, self.end_seqno)
    }
}

/// Persistence progress of a partition, as answered by an observe-seqno
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservedSeqno {
    pub vbuuid: u64,
    pub persisted_seqno: u64,
    pub current_seqno: u64,
}

/// The resumable position of a partition stream.
///
/// Between snapshot markers, `snapshot.start_seqno <= seqno <=
/// snapshot.end_seqno` holds for every offset observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamOffset {
    pub vbuuid: u64,
    pub seqno: u64,
    pub snapshot: SnapshotMarker,
}

impl StreamOffset {
    /// The beginning of history: zero uuid, zero seqno, empty snapshot.
    pub const ZERO: StreamOffset = StreamOffset {
        vbuuid: 0,
        seqno: 0,
        snapshot: SnapshotMarker {
            start_seqno: 0,
            end_seqno: 0,
            flags: 0,
        },
    };

    pub fn new(vbuuid: u64, seqno: u64, snapshot: SnapshotMarker) -> StreamOffset {
        StreamOffset {
            vbuuid,
            seqno,
            snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_contains_is_inclusive_on_both_ends() {
        let marker = SnapshotMarker::new(100, 200, 0);
        assert!(marker.contains(100));
        assert!(marker.contains(150));
        assert!(marker.contains(200));
        assert!(!marker.contains(99));
        assert!(!marker.contains(201));
    }

    #[test]
    fn zero_offset_sits_inside_its_own_snapshot() {
        let offset = StreamOffset::ZERO;
        assert!(offset.snapshot.contains(offset.seqno));
    }
}
