//! Shared metalog apply machinery.
//!
//! Every metalog subscriber — producer, storage, backup sequencer, and the
//! primary itself — must apply entries in dense `metalog_seqnum` order even
//! though the network may deliver them out of order. [`LogSpaceState`]
//! buffers early arrivals, applies entries strictly in order, and tracks the
//! two positions that define a phylog's progress: `metalog_position` (number
//! of applied entries) and `seqnum_position` (sum of applied shard deltas).
//!
//! A subscriber registers the shards it is interested in; applying an entry
//! yields one [`ShardRange`] per interested shard, with the shard's seqnum
//! range offset by the deltas of the shards preceding it in the entry.

use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::debug;

use phylog_core::messages::MetaLogEntry;
use phylog_core::types::{self, local_id};

use crate::error::{LogError, Result};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of a phylog's state within one view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSpaceStatus {
    Normal,
    Frozen,
    Finalized,
}

// ---------------------------------------------------------------------------
// Applied cuts
// ---------------------------------------------------------------------------

/// Seqnum/localid range assigned to one shard by one applied metalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRange {
    pub shard_id: u16,
    /// Full 64-bit seqnum of the first record in the range.
    pub start_seqnum: u64,
    /// Local id of the first record in the range.
    pub start_localid: u64,
    pub delta: u32,
}

/// One applied metalog entry, reduced to the subscriber's interested shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCut {
    pub metalog_seqnum: u32,
    pub ranges: Vec<ShardRange>,
    pub entry: MetaLogEntry,
}

// ---------------------------------------------------------------------------
// LogSpaceState
// ---------------------------------------------------------------------------

/// Ordered metalog application for one phylog.
#[derive(Debug)]
pub struct LogSpaceState {
    logspace_id: u32,
    status: LogSpaceStatus,
    metalog_position: u32,
    seqnum_lowhalf: u32,
    /// Shards whose ranges this subscriber wants; empty means none (the
    /// subscriber only tracks positions).
    interested_shards: HashSet<u16>,
    pending_entries: BTreeMap<u32, MetaLogEntry>,
    applied_tail: VecDeque<MetaLogEntry>,
    tail_cap: usize,
}

impl LogSpaceState {
    #[must_use]
    pub fn new(logspace_id: u32, tail_cap: usize) -> Self {
        Self {
            logspace_id,
            status: LogSpaceStatus::Normal,
            metalog_position: 0,
            seqnum_lowhalf: 0,
            interested_shards: HashSet::new(),
            pending_entries: BTreeMap::new(),
            applied_tail: VecDeque::new(),
            tail_cap,
        }
    }

    pub fn add_interested_shard(&mut self, shard_id: u16) {
        self.interested_shards.insert(shard_id);
    }

    /// Starts this subscriber at a known metalog position (used by
    /// producers created mid-view).
    pub fn set_metalog_position(&mut self, metalog_position: u32, seqnum_lowhalf: u32) {
        self.metalog_position = metalog_position;
        self.seqnum_lowhalf = seqnum_lowhalf;
    }

    #[must_use]
    pub fn logspace_id(&self) -> u32 {
        self.logspace_id
    }

    #[must_use]
    pub fn status(&self) -> LogSpaceStatus {
        self.status
    }

    #[must_use]
    pub fn metalog_position(&self) -> u32 {
        self.metalog_position
    }

    /// Full 64-bit seqnum the next assigned record will receive.
    #[must_use]
    pub fn seqnum_position(&self) -> u64 {
        types::seqnum(self.logspace_id, self.seqnum_lowhalf)
    }

    /// Low half of the seqnum position.
    #[must_use]
    pub fn seqnum_lowhalf(&self) -> u32 {
        self.seqnum_lowhalf
    }

    /// Applied entries retained for catch-up, oldest first.
    #[must_use]
    pub fn applied_tail(&self) -> &VecDeque<MetaLogEntry> {
        &self.applied_tail
    }

    /// Offers one metalog entry. Entries at or below the current position
    /// are ignored; future entries are buffered. Returns the cuts applied
    /// by this call, in order.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if an entry addresses the wrong logspace, or its
    /// `start_seqnum` disagrees with the locally tracked position.
    pub fn provide_metalog(&mut self, entry: MetaLogEntry) -> Result<Vec<AppliedCut>> {
        if self.status == LogSpaceStatus::Finalized {
            return Ok(Vec::new());
        }
        if entry.logspace_id != self.logspace_id {
            return Err(LogError::ProtocolViolation(format!(
                "metalog entry for logspace {:#x} offered to logspace {:#x}",
                entry.logspace_id, self.logspace_id
            )));
        }
        if entry.metalog_seqnum < self.metalog_position {
            return Ok(Vec::new());
        }
        self.pending_entries.insert(entry.metalog_seqnum, entry);

        let mut cuts = Vec::new();
        while let Some(entry) = self.pending_entries.remove(&self.metalog_position) {
            cuts.push(self.apply_entry(entry)?);
        }
        Ok(cuts)
    }

    fn apply_entry(&mut self, entry: MetaLogEntry) -> Result<AppliedCut> {
        if entry.start_seqnum != self.seqnum_lowhalf {
            return Err(LogError::ProtocolViolation(format!(
                "metalog entry {} starts at seqnum {:#x}, local position is {:#x}",
                entry.metalog_seqnum, entry.start_seqnum, self.seqnum_lowhalf
            )));
        }
        let mut ranges = Vec::new();
        let mut offset = 0u32;
        for shard in &entry.shards {
            if self.interested_shards.contains(&shard.shard_id) {
                ranges.push(ShardRange {
                    shard_id: shard.shard_id,
                    start_seqnum: types::seqnum(
                        self.logspace_id,
                        entry.start_seqnum + offset,
                    ),
                    start_localid: local_id::pack(
                        shard.shard_id,
                        u64::from(shard.shard_start),
                    ),
                    delta: shard.delta,
                });
            }
            offset += shard.delta;
        }
        self.seqnum_lowhalf += offset;
        self.metalog_position += 1;
        debug!(
            logspace = format_args!("{:#x}", self.logspace_id),
            metalog_seqnum = entry.metalog_seqnum,
            seqnum_position = self.seqnum_lowhalf,
            "apply metalog entry"
        );

        self.applied_tail.push_back(entry.clone());
        while self.applied_tail.len() > self.tail_cap {
            self.applied_tail.pop_front();
        }
        Ok(AppliedCut {
            metalog_seqnum: entry.metalog_seqnum,
            ranges,
            entry,
        })
    }

    /// Stops accepting new work on this logspace.
    pub fn freeze(&mut self) {
        if self.status == LogSpaceStatus::Normal {
            self.status = LogSpaceStatus::Frozen;
        }
    }

    /// Applies any buffered prefix up to `final_position`, drops the rest,
    /// and marks the state finalized. Returns the cuts applied during the
    /// drain.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if a drained entry disagrees with local positions.
    pub fn finalize(&mut self, final_position: u32) -> Result<Vec<AppliedCut>> {
        let mut cuts = Vec::new();
        while self.metalog_position < final_position {
            let Some(entry) = self.pending_entries.remove(&self.metalog_position) else {
                break;
            };
            cuts.push(self.apply_entry(entry)?);
        }
        self.pending_entries.clear();
        self.status = LogSpaceStatus::Finalized;
        Ok(cuts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use phylog_core::messages::{MetaLogType, ShardDelta};

    const LOGSPACE: u32 = 0x0001_0002;

    fn entry(metalog_seqnum: u32, start_seqnum: u32, shards: Vec<(u16, u32, u32)>) -> MetaLogEntry {
        MetaLogEntry {
            logspace_id: LOGSPACE,
            metalog_seqnum,
            entry_type: MetaLogType::NewLogs,
            start_seqnum,
            shards: shards
                .into_iter()
                .map(|(shard_id, shard_start, delta)| ShardDelta {
                    shard_id,
                    shard_start,
                    delta,
                })
                .collect(),
        }
    }

    #[test]
    fn applies_in_order_and_tracks_positions() {
        let mut state = LogSpaceState::new(LOGSPACE, 32);
        state.add_interested_shard(1);

        let cuts = state
            .provide_metalog(entry(0, 0, vec![(1, 0, 5)]))
            .unwrap();
        assert_eq!(cuts.len(), 1);
        assert_eq!(state.metalog_position(), 1);
        assert_eq!(state.seqnum_lowhalf(), 5);

        let range = cuts[0].ranges[0];
        assert_eq!(range.shard_id, 1);
        assert_eq!(range.start_seqnum, types::seqnum(LOGSPACE, 0));
        assert_eq!(range.start_localid, local_id::pack(1, 0));
        assert_eq!(range.delta, 5);
    }

    #[test]
    fn buffers_out_of_order_entries() {
        let mut state = LogSpaceState::new(LOGSPACE, 32);
        state.add_interested_shard(1);

        // Entry 1 arrives before entry 0: nothing applies yet.
        let cuts = state
            .provide_metalog(entry(1, 5, vec![(1, 5, 3)]))
            .unwrap();
        assert!(cuts.is_empty());
        assert_eq!(state.metalog_position(), 0);

        // Entry 0 arrives: both apply, in order.
        let cuts = state
            .provide_metalog(entry(0, 0, vec![(1, 0, 5)]))
            .unwrap();
        assert_eq!(cuts.len(), 2);
        assert_eq!(cuts[0].metalog_seqnum, 0);
        assert_eq!(cuts[1].metalog_seqnum, 1);
        assert_eq!(state.seqnum_lowhalf(), 8);
    }

    #[test]
    fn offsets_shards_by_preceding_deltas() {
        let mut state = LogSpaceState::new(LOGSPACE, 32);
        state.add_interested_shard(1);
        state.add_interested_shard(2);

        let cuts = state
            .provide_metalog(entry(0, 0, vec![(1, 0, 100), (2, 0, 100)]))
            .unwrap();
        let ranges = &cuts[0].ranges;
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start_seqnum, types::seqnum(LOGSPACE, 0));
        assert_eq!(ranges[1].start_seqnum, types::seqnum(LOGSPACE, 100));
        // seqnum_position equals the sum of all applied deltas.
        assert_eq!(state.seqnum_lowhalf(), 200);
    }

    #[test]
    fn uninterested_shards_are_skipped_but_still_advance_position() {
        let mut state = LogSpaceState::new(LOGSPACE, 32);
        state.add_interested_shard(2);

        let cuts = state
            .provide_metalog(entry(0, 0, vec![(1, 0, 10), (2, 0, 4)]))
            .unwrap();
        assert_eq!(cuts[0].ranges.len(), 1);
        assert_eq!(cuts[0].ranges[0].shard_id, 2);
        assert_eq!(
            cuts[0].ranges[0].start_seqnum,
            types::seqnum(LOGSPACE, 10)
        );
        assert_eq!(state.seqnum_lowhalf(), 14);
    }

    #[test]
    fn duplicate_and_stale_entries_ignored() {
        let mut state = LogSpaceState::new(LOGSPACE, 32);
        state.provide_metalog(entry(0, 0, vec![(1, 0, 5)])).unwrap();
        let cuts = state
            .provide_metalog(entry(0, 0, vec![(1, 0, 5)]))
            .unwrap();
        assert!(cuts.is_empty());
        assert_eq!(state.metalog_position(), 1);
    }

    #[test]
    fn wrong_logspace_is_protocol_violation() {
        let mut state = LogSpaceState::new(LOGSPACE, 32);
        let mut bad = entry(0, 0, vec![(1, 0, 5)]);
        bad.logspace_id = 0xdead;
        assert!(matches!(
            state.provide_metalog(bad),
            Err(LogError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn start_seqnum_mismatch_is_protocol_violation() {
        let mut state = LogSpaceState::new(LOGSPACE, 32);
        assert!(matches!(
            state.provide_metalog(entry(0, 7, vec![(1, 0, 5)])),
            Err(LogError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn finalize_applies_buffered_prefix_then_drops() {
        let mut state = LogSpaceState::new(LOGSPACE, 32);
        state.add_interested_shard(1);
        state.provide_metalog(entry(1, 5, vec![(1, 5, 3)])).unwrap();
        state.provide_metalog(entry(3, 9, vec![(1, 9, 1)])).unwrap();
        state.provide_metalog(entry(0, 0, vec![(1, 0, 5)])).unwrap();
        // Position is now 2 with entry 3 still buffered (gap at 2).

        let cuts = state.finalize(3).unwrap();
        assert!(cuts.is_empty());
        assert_eq!(state.status(), LogSpaceStatus::Finalized);

        // Finalized state ignores further entries.
        let cuts = state
            .provide_metalog(entry(2, 8, vec![(1, 8, 1)]))
            .unwrap();
        assert!(cuts.is_empty());
    }

    #[test]
    fn applied_tail_is_bounded() {
        let mut state = LogSpaceState::new(LOGSPACE, 2);
        let mut start = 0u32;
        for i in 0..5u32 {
            state
                .provide_metalog(entry(i, start, vec![(1, start, 1)]))
                .unwrap();
            start += 1;
        }
        assert_eq!(state.applied_tail().len(), 2);
        assert_eq!(state.applied_tail()[0].metalog_seqnum, 3);
    }
}
