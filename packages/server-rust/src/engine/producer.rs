//! Engine-side append bookkeeping for one phylog.
//!
//! The producer assigns tentative local ids to appends before they have a
//! seqnum, parks the issuing operation, and resolves it once the covering
//! metalog entry is applied here — which is the write's linearization point
//! from the worker's perspective.

use std::collections::HashMap;

use phylog_core::messages::MetaLogEntry;
use phylog_core::types::{self, local_id, INVALID_SEQNUM};

use crate::error::{LogError, Result};
use crate::logspace::LogSpaceState;

// ---------------------------------------------------------------------------
// AppendResult
// ---------------------------------------------------------------------------

/// Resolution of one pending append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendResult {
    /// Assigned seqnum, or [`INVALID_SEQNUM`] if the view finalized first.
    pub seqnum: u64,
    pub localid: u64,
    /// Progress token covering the metalog entry that sequenced this
    /// append; zero on failure.
    pub metalog_progress: u64,
    /// The engine-local operation this append belongs to.
    pub op_id: u64,
}

// ---------------------------------------------------------------------------
// LogProducer
// ---------------------------------------------------------------------------

/// Append producer for one `(phylog, storage shard)` pair.
pub struct LogProducer {
    state: LogSpaceState,
    next_localid: u64,
    pending_appends: HashMap<u64, u64>,
    pending_results: Vec<AppendResult>,
}

impl LogProducer {
    /// `metalog_position`/`seqnum_lowhalf` seed producers created mid-view;
    /// `next_start_id` continues the shard's local id sequence.
    #[must_use]
    pub fn new(
        storage_shard_id: u16,
        logspace_id: u32,
        metalog_position: u32,
        seqnum_lowhalf: u32,
        next_start_id: u64,
        tail_cap: usize,
    ) -> Self {
        let mut state = LogSpaceState::new(logspace_id, tail_cap);
        state.add_interested_shard(storage_shard_id);
        state.set_metalog_position(metalog_position, seqnum_lowhalf);
        Self {
            state,
            next_localid: local_id::pack(storage_shard_id, next_start_id),
            pending_appends: HashMap::new(),
            pending_results: Vec::new(),
        }
    }

    #[must_use]
    pub fn logspace_id(&self) -> u32 {
        self.state.logspace_id()
    }

    #[must_use]
    pub fn metalog_position(&self) -> u32 {
        self.state.metalog_position()
    }

    /// Number of appends awaiting a metalog entry.
    #[must_use]
    pub fn pending_append_count(&self) -> usize {
        self.pending_appends.len()
    }

    /// Registers an append and returns its local id plus the phylog's
    /// current seqnum position (the engine's lower bound for the eventual
    /// seqnum). Never blocks.
    pub fn local_append(&mut self, op_id: u64) -> (u64, u64) {
        let localid = self.next_localid;
        self.next_localid += 1;
        debug_assert!(!self.pending_appends.contains_key(&localid));
        self.pending_appends.insert(localid, op_id);
        (localid, self.state.seqnum_position())
    }

    /// Applies a metalog entry; pending appends covered by it become
    /// results ready for [`Self::poll_append_results`].
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if a covered local id has no pending append (the
    /// metalog claims an append this engine never issued).
    pub fn provide_metalog(&mut self, entry: MetaLogEntry) -> Result<()> {
        let cuts = self.state.provide_metalog(entry)?;
        for cut in cuts {
            let progress =
                types::metalog_progress(self.state.logspace_id(), cut.metalog_seqnum);
            for range in cut.ranges {
                for i in 0..u64::from(range.delta) {
                    let localid = range.start_localid + i;
                    let seqnum = range.start_seqnum + i;
                    let Some(op_id) = self.pending_appends.remove(&localid) else {
                        return Err(LogError::ProtocolViolation(format!(
                            "no pending append for localid {localid:#x}"
                        )));
                    };
                    self.pending_results.push(AppendResult {
                        seqnum,
                        localid,
                        metalog_progress: progress,
                        op_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Drains the resolved appends accumulated since the last poll.
    pub fn poll_append_results(&mut self) -> Vec<AppendResult> {
        std::mem::take(&mut self.pending_results)
    }

    /// Fails every still-pending append with [`INVALID_SEQNUM`]; the client
    /// retries under the next view.
    pub fn on_finalized(&mut self, final_position: u32) -> Result<()> {
        let cuts = self.state.finalize(final_position)?;
        for cut in cuts {
            let progress =
                types::metalog_progress(self.state.logspace_id(), cut.metalog_seqnum);
            for range in cut.ranges {
                for i in 0..u64::from(range.delta) {
                    let localid = range.start_localid + i;
                    if let Some(op_id) = self.pending_appends.remove(&localid) {
                        self.pending_results.push(AppendResult {
                            seqnum: range.start_seqnum + i,
                            localid,
                            metalog_progress: progress,
                            op_id,
                        });
                    }
                }
            }
        }
        for (localid, op_id) in self.pending_appends.drain() {
            self.pending_results.push(AppendResult {
                seqnum: INVALID_SEQNUM,
                localid,
                metalog_progress: 0,
                op_id,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use phylog_core::messages::{MetaLogType, ShardDelta};

    const LOGSPACE: u32 = 0x0001_000a;
    const SHARD: u16 = 3;

    fn producer() -> LogProducer {
        LogProducer::new(SHARD, LOGSPACE, 0, 0, 0, 32)
    }

    fn new_logs(metalog_seqnum: u32, start_seqnum: u32, shard_start: u32, delta: u32) -> MetaLogEntry {
        MetaLogEntry {
            logspace_id: LOGSPACE,
            metalog_seqnum,
            entry_type: MetaLogType::NewLogs,
            start_seqnum,
            shards: vec![ShardDelta {
                shard_id: SHARD,
                shard_start,
                delta,
            }],
        }
    }

    #[test]
    fn local_append_assigns_monotone_localids() {
        let mut p = producer();
        let (id0, bound0) = p.local_append(100);
        let (id1, _) = p.local_append(101);
        assert_eq!(local_id::shard_of(id0), SHARD);
        assert_eq!(local_id::sequence_of(id0), 0);
        assert_eq!(id1, id0 + 1);
        assert_eq!(bound0, types::seqnum(LOGSPACE, 0));
        assert_eq!(p.pending_append_count(), 2);
    }

    #[test]
    fn metalog_apply_resolves_pending_appends() {
        let mut p = producer();
        let (_, _) = p.local_append(100);
        let (_, _) = p.local_append(101);

        p.provide_metalog(new_logs(0, 0, 0, 2)).unwrap();
        let results = p.poll_append_results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].seqnum, types::seqnum(LOGSPACE, 0));
        assert_eq!(results[0].op_id, 100);
        assert_eq!(results[1].seqnum, types::seqnum(LOGSPACE, 1));
        assert_eq!(results[1].op_id, 101);
        // metalog_progress covers entry 0, i.e. one applied entry.
        assert_eq!(
            results[0].metalog_progress,
            types::metalog_progress(LOGSPACE, 0)
        );
        assert_eq!(p.pending_append_count(), 0);
        assert!(p.poll_append_results().is_empty());
    }

    #[test]
    fn unknown_localid_in_metalog_is_fatal() {
        let mut p = producer();
        // The metalog claims 2 appends; only 1 was issued here.
        p.local_append(100);
        assert!(matches!(
            p.provide_metalog(new_logs(0, 0, 0, 2)),
            Err(LogError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn finalization_fails_all_pending() {
        let mut p = producer();
        for op_id in 0..5u64 {
            p.local_append(op_id);
        }
        p.on_finalized(0).unwrap();
        let results = p.poll_append_results();
        // Exactly N failures for N pending appends.
        assert_eq!(results.len(), 5);
        for result in &results {
            assert_eq!(result.seqnum, INVALID_SEQNUM);
            assert_eq!(result.metalog_progress, 0);
        }
    }

    #[test]
    fn finalization_applies_buffered_prefix_first() {
        let mut p = producer();
        p.local_append(1);
        p.local_append(2);
        // Covering entry arrives, then the view finalizes at position 1:
        // the first append resolves, the second fails.
        p.provide_metalog(new_logs(0, 0, 0, 1)).unwrap();
        p.on_finalized(1).unwrap();
        let results = p.poll_append_results();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].seqnum, types::seqnum(LOGSPACE, 0));
        assert_eq!(results[1].seqnum, INVALID_SEQNUM);
    }

    #[test]
    fn mid_view_producer_continues_positions() {
        let mut p = LogProducer::new(SHARD, LOGSPACE, 4, 40, 10, 32);
        let (localid, bound) = p.local_append(7);
        assert_eq!(local_id::sequence_of(localid), 10);
        assert_eq!(bound, types::seqnum(LOGSPACE, 40));
        p.provide_metalog(new_logs(4, 40, 10, 1)).unwrap();
        let results = p.poll_append_results();
        assert_eq!(results[0].seqnum, types::seqnum(LOGSPACE, 40));
    }
}
