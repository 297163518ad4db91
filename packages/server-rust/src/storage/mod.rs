//! Log storage for one phylog on one storage node.
//!
//! Replicated records arrive from engines pre-sequencing and sit in the
//! pending map keyed by local id; the contiguous prefix per shard is the
//! *shard progress* reported to the sequencer. Applying a metalog entry
//! moves covered records into the live set, stamps their seqnums, feeds the
//! index accumulator, and answers parked point reads. Live records are
//! evictable once persisted to the KV backend.

pub mod backend;
pub mod node;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use indexmap::IndexSet;
use tracing::{debug, warn};

use phylog_core::messages::{IndexDataPackage, MetaLogEntry, SharedLogMessage};
use phylog_core::types::{self, local_id};
use phylog_core::{LogEntry, LogMetaData};

use crate::error::{LogError, Result};
use crate::logspace::{AppliedCut, LogSpaceState};
use crate::view::View;

pub use backend::{LogBackend, MemoryBackend};
pub use node::StorageNode;

// ---------------------------------------------------------------------------
// Read results
// ---------------------------------------------------------------------------

/// Outcome of a `ReadAt` against this storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Record found in the live set.
    Ok,
    /// Record already evicted; the caller must consult the KV backend.
    LookupDb,
    /// Record cannot be located here.
    Failed,
}

/// A resolved `ReadAt`, paired with its original request for routing the
/// response.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub status: ReadStatus,
    pub entry: Option<Arc<LogEntry>>,
    /// Auxiliary data attached to the record, if any.
    pub aux_data: Vec<u8>,
    pub original_request: SharedLogMessage,
}

// ---------------------------------------------------------------------------
// Index accumulator
// ---------------------------------------------------------------------------

/// Index tuples accumulated between metalog applications.
#[derive(Debug, Default)]
struct IndexAccumulator {
    seqnum_lowhalves: Vec<u32>,
    engine_ids: Vec<u16>,
    user_logspaces: Vec<u32>,
    tag_sizes: Vec<u32>,
    tags: Vec<u64>,
    productive_shards: IndexSet<u16>,
}

impl IndexAccumulator {
    fn is_empty(&self) -> bool {
        self.seqnum_lowhalves.is_empty()
    }

    fn push(&mut self, seqnum: u64, localid: u64, user_logspace: u32, tags: &[u64]) {
        self.seqnum_lowhalves.push(types::position_of_seqnum(seqnum));
        self.engine_ids.push(local_id::shard_of(localid));
        self.user_logspaces.push(user_logspace);
        self.tag_sizes.push(tags.len() as u32);
        self.tags.extend_from_slice(tags);
    }
}

// ---------------------------------------------------------------------------
// LogStorage
// ---------------------------------------------------------------------------

/// Per-phylog storage FSM.
pub struct LogStorage {
    state: LogSpaceState,
    /// Local shard ids this node replicates, in progress-reporting order.
    local_shard_ids: Vec<u16>,
    pending_log_entries: BTreeMap<u64, LogEntry>,
    shard_progresses: HashMap<u16, u32>,
    shard_progress_dirty: bool,
    live_seqnums: VecDeque<u64>,
    live_log_entries: HashMap<u64, Arc<LogEntry>>,
    pending_read_requests: BTreeMap<u64, Vec<SharedLogMessage>>,
    pending_read_results: Vec<ReadResult>,
    persisted_seqnum_position: u64,
    max_live_entries: usize,
    index_acc: IndexAccumulator,
    index_data_packages: Vec<IndexDataPackage>,
    aux_data: HashMap<u64, Vec<u8>>,
}

impl LogStorage {
    /// Builds the storage FSM for `storage_id`'s share of `sequencer_id`'s
    /// phylog.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if the view does not place this storage node in
    /// that phylog.
    pub fn new(
        storage_id: u16,
        view: &View,
        sequencer_id: u16,
        max_live_entries: usize,
        tail_cap: usize,
    ) -> Result<Self> {
        let storage = view.get_storage_node(storage_id).ok_or_else(|| {
            LogError::ProtocolViolation(format!(
                "view {} has no storage node {storage_id}",
                view.id()
            ))
        })?;
        let local_shard_ids = storage.local_shard_ids(sequencer_id).to_vec();
        if local_shard_ids.is_empty() {
            return Err(LogError::ProtocolViolation(format!(
                "storage node {storage_id} replicates no shard of sequencer {sequencer_id}"
            )));
        }
        let logspace_id = types::logspace_id(view.id(), sequencer_id);
        let mut state = LogSpaceState::new(logspace_id, tail_cap);
        let mut shard_progresses = HashMap::new();
        for &shard_id in &local_shard_ids {
            state.add_interested_shard(shard_id);
            shard_progresses.insert(shard_id, 0);
        }
        Ok(Self {
            state,
            local_shard_ids,
            pending_log_entries: BTreeMap::new(),
            shard_progresses,
            shard_progress_dirty: false,
            live_seqnums: VecDeque::new(),
            live_log_entries: HashMap::new(),
            pending_read_requests: BTreeMap::new(),
            pending_read_results: Vec::new(),
            persisted_seqnum_position: 0,
            max_live_entries,
            index_acc: IndexAccumulator::default(),
            index_data_packages: Vec::new(),
            aux_data: HashMap::new(),
        })
    }

    #[must_use]
    pub fn logspace_id(&self) -> u32 {
        self.state.logspace_id()
    }

    #[must_use]
    pub fn metalog_position(&self) -> u32 {
        self.state.metalog_position()
    }

    #[must_use]
    pub fn seqnum_position(&self) -> u64 {
        self.state.seqnum_position()
    }

    #[must_use]
    pub fn persisted_seqnum_position(&self) -> u64 {
        self.persisted_seqnum_position
    }

    #[must_use]
    pub fn live_entry_count(&self) -> usize {
        self.live_seqnums.len()
    }

    /// Stores one replicated record and advances its shard's progress.
    ///
    /// # Errors
    ///
    /// `UnknownShard` for records of shards this node does not replicate;
    /// `ProtocolViolation` when `data_size` disagrees with the payload.
    pub fn store(
        &mut self,
        metadata: LogMetaData,
        user_tags: Vec<u64>,
        data: Vec<u8>,
    ) -> Result<()> {
        if metadata.data_size != data.len() {
            return Err(LogError::ProtocolViolation(format!(
                "data_size {} does not match payload length {}",
                metadata.data_size,
                data.len()
            )));
        }
        let localid = metadata.localid;
        let shard_id = local_id::shard_of(localid);
        if !self.shard_progresses.contains_key(&shard_id) {
            return Err(LogError::UnknownShard { shard_id });
        }
        debug!(
            shard_id,
            localid = format_args!("{localid:#x}"),
            "store replicated record"
        );
        self.pending_log_entries.insert(
            localid,
            LogEntry {
                metadata,
                user_tags,
                data,
                aux_data: Vec::new(),
            },
        );
        self.advance_shard_progress(shard_id);
        Ok(())
    }

    fn advance_shard_progress(&mut self, shard_id: u16) {
        let current = self.shard_progresses[&shard_id];
        let mut next = current;
        while self
            .pending_log_entries
            .contains_key(&local_id::pack(shard_id, u64::from(next)))
        {
            next += 1;
        }
        if next > current {
            debug!(shard_id, from = current, to = next, "advance shard progress");
            self.shard_progress_dirty = true;
            self.shard_progresses.insert(shard_id, next);
        }
    }

    /// Shard-progress vector for the sequencer, in the node's reporting
    /// order. `None` when nothing changed since the last grab.
    pub fn grab_shard_progress_for_sending(&mut self) -> Option<Vec<u32>> {
        if !self.shard_progress_dirty {
            return None;
        }
        self.shard_progress_dirty = false;
        Some(
            self.local_shard_ids
                .iter()
                .map(|shard_id| self.shard_progresses[shard_id])
                .collect(),
        )
    }

    /// Point read; parks the request if the seqnum is not sequenced yet.
    pub fn read_at(&mut self, request: SharedLogMessage) {
        let seqnum = types::seqnum(request.logspace_id, request.seqnum_lowhalf);
        if seqnum >= self.state.seqnum_position() {
            self.pending_read_requests
                .entry(seqnum)
                .or_default()
                .push(request);
            return;
        }
        self.resolve_read(seqnum, request);
    }

    fn resolve_read(&mut self, seqnum: u64, request: SharedLogMessage) {
        let result = if let Some(entry) = self.live_log_entries.get(&seqnum) {
            ReadResult {
                status: ReadStatus::Ok,
                entry: Some(Arc::clone(entry)),
                aux_data: self.aux_data.get(&seqnum).cloned().unwrap_or_default(),
                original_request: request,
            }
        } else if seqnum < self.persisted_seqnum_position {
            ReadResult {
                status: ReadStatus::LookupDb,
                entry: None,
                aux_data: self.aux_data.get(&seqnum).cloned().unwrap_or_default(),
                original_request: request,
            }
        } else {
            warn!(seqnum = format_args!("{seqnum:#x}"), "failed to locate seqnum");
            ReadResult {
                status: ReadStatus::Failed,
                entry: None,
                aux_data: Vec::new(),
                original_request: request,
            }
        };
        self.pending_read_results.push(result);
    }

    /// Applies metalog entries (buffering out-of-order arrivals): covered
    /// pending records become live, index tuples accumulate, parked reads
    /// resolve.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if a covered local id has no pending record.
    pub fn provide_metalog(&mut self, entry: MetaLogEntry) -> Result<()> {
        let cuts = self.state.provide_metalog(entry)?;
        self.apply_cuts(cuts)
    }

    fn apply_cuts(&mut self, cuts: Vec<AppliedCut>) -> Result<()> {
        for cut in cuts {
            // Reads parked below the cut were passed over by the advancing
            // metalog: no record will ever materialize for them here.
            let cut_start =
                types::seqnum(self.state.logspace_id(), cut.entry.start_seqnum);
            self.fail_passed_reads(cut_start);

            for range in &cut.ranges {
                for i in 0..u64::from(range.delta) {
                    let localid = range.start_localid + i;
                    let seqnum = range.start_seqnum + i;
                    let Some(mut entry) = self.pending_log_entries.remove(&localid) else {
                        return Err(LogError::ProtocolViolation(format!(
                            "no pending record for localid {localid:#x}"
                        )));
                    };
                    debug!(
                        seqnum = format_args!("{seqnum:#x}"),
                        localid = format_args!("{localid:#x}"),
                        "finalize record"
                    );
                    entry.metadata.seqnum = seqnum;
                    self.index_acc.push(
                        seqnum,
                        localid,
                        entry.metadata.user_logspace,
                        &entry.user_tags,
                    );
                    let entry = Arc::new(entry);
                    debug_assert!(self
                        .live_seqnums
                        .back()
                        .map_or(true, |&back| seqnum > back));
                    self.live_seqnums.push_back(seqnum);
                    self.live_log_entries.insert(seqnum, Arc::clone(&entry));
                    self.shrink_live_entries_if_needed();

                    if let Some(requests) = self.pending_read_requests.remove(&seqnum) {
                        for request in requests {
                            self.pending_read_results.push(ReadResult {
                                status: ReadStatus::Ok,
                                entry: Some(Arc::clone(&entry)),
                                aux_data: self
                                    .aux_data
                                    .get(&seqnum)
                                    .cloned()
                                    .unwrap_or_default(),
                                original_request: request,
                            });
                        }
                    }
                }
                self.index_acc.productive_shards.insert(range.shard_id);
            }
            self.on_metalog_applied(&cut);
        }
        Ok(())
    }

    fn fail_passed_reads(&mut self, up_to: u64) {
        let passed: Vec<u64> = self
            .pending_read_requests
            .range(..up_to)
            .map(|(&seqnum, _)| seqnum)
            .collect();
        for seqnum in passed {
            warn!(seqnum = format_args!("{seqnum:#x}"), "read request has past");
            for request in self.pending_read_requests.remove(&seqnum).unwrap() {
                self.pending_read_results.push(ReadResult {
                    status: ReadStatus::Failed,
                    entry: None,
                    aux_data: Vec::new(),
                    original_request: request,
                });
            }
        }
    }

    fn on_metalog_applied(&mut self, cut: &AppliedCut) {
        if self.index_acc.is_empty() {
            return;
        }
        let acc = std::mem::take(&mut self.index_acc);
        self.index_data_packages.push(IndexDataPackage {
            logspace_id: self.state.logspace_id(),
            metalog_position: self.state.metalog_position(),
            end_seqnum_position: self.state.seqnum_lowhalf(),
            // The metalog's shard count, not this node's contribution: the
            // index needs the phylog-wide productive count to know when a
            // position is complete.
            num_productive_storage_shards: cut.entry.shards.len() as u32,
            my_productive_shards: acc.productive_shards.iter().copied().collect(),
            seqnum_lowhalves: acc.seqnum_lowhalves,
            engine_ids: acc.engine_ids,
            user_logspaces: acc.user_logspaces,
            tag_sizes: acc.tag_sizes,
            tags: acc.tags,
        });
    }

    /// Swaps out the accumulated index packages for transmission.
    pub fn poll_index_data(&mut self) -> Option<Vec<IndexDataPackage>> {
        if self.index_data_packages.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.index_data_packages))
    }

    /// Drains resolved reads.
    pub fn poll_read_results(&mut self) -> Vec<ReadResult> {
        std::mem::take(&mut self.pending_read_results)
    }

    /// Live entries at or above the persisted watermark, for the KV
    /// backend, plus the watermark to install once they are durable.
    #[must_use]
    pub fn grab_log_entries_for_persistence(&self) -> Option<(Vec<Arc<LogEntry>>, u64)> {
        let &back = self.live_seqnums.back()?;
        if back < self.persisted_seqnum_position {
            return None;
        }
        let start = self
            .live_seqnums
            .partition_point(|&seqnum| seqnum < self.persisted_seqnum_position);
        let entries: Vec<Arc<LogEntry>> = self
            .live_seqnums
            .iter()
            .skip(start)
            .map(|seqnum| Arc::clone(&self.live_log_entries[seqnum]))
            .collect();
        debug_assert!(!entries.is_empty());
        Some((entries, back + 1))
    }

    /// Advances the persisted watermark and evicts excess live entries.
    pub fn log_entries_persisted(&mut self, new_position: u64) {
        debug_assert!(new_position >= self.persisted_seqnum_position);
        self.persisted_seqnum_position = new_position;
        self.shrink_live_entries_if_needed();
    }

    fn shrink_live_entries_if_needed(&mut self) {
        while self.live_seqnums.len() > self.max_live_entries
            && self
                .live_seqnums
                .front()
                .is_some_and(|&front| front < self.persisted_seqnum_position)
        {
            let front = self.live_seqnums.pop_front().unwrap();
            self.live_log_entries.remove(&front);
            debug_assert_eq!(self.live_seqnums.len(), self.live_log_entries.len());
        }
    }

    /// Drops pending records of one shard (scale-in cleanup).
    pub fn remove_pending_entries(&mut self, shard_id: u16) {
        self.pending_log_entries
            .retain(|&localid, _| local_id::shard_of(localid) != shard_id);
    }

    /// Attaches auxiliary data to a seqnum (last writer wins).
    pub fn put_aux_data(&mut self, seqnum: u64, data: Vec<u8>) {
        self.aux_data.insert(seqnum, data);
    }

    #[must_use]
    pub fn get_aux_data(&self, seqnum: u64) -> Option<&[u8]> {
        self.aux_data.get(&seqnum).map(Vec::as_slice)
    }

    /// Finalizes this phylog's storage: applies any buffered prefix, then
    /// discards pending records and fails still-parked reads.
    ///
    /// # Errors
    ///
    /// Propagates `ProtocolViolation` from the drain.
    pub fn on_finalized(&mut self, final_position: u32) -> Result<()> {
        let cuts = self.state.finalize(final_position)?;
        self.apply_cuts(cuts)?;
        if !self.pending_log_entries.is_empty() {
            warn!(
                count = self.pending_log_entries.len(),
                "pending log entries discarded"
            );
            self.pending_log_entries.clear();
        }
        let parked: Vec<u64> = self.pending_read_requests.keys().copied().collect();
        for seqnum in parked {
            for request in self.pending_read_requests.remove(&seqnum).unwrap() {
                self.pending_read_results.push(ReadResult {
                    status: ReadStatus::Failed,
                    entry: None,
                    aux_data: Vec::new(),
                    original_request: request,
                });
            }
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
    use crate::view::ViewSpec;
    use phylog_core::messages::{MetaLogType, ShardDelta};

    fn test_view() -> View {
        View::new(&ViewSpec {
            view_id: 1,
            metalog_replicas: 1,
            userlog_replicas: 1,
            index_replicas: 1,
            num_index_shards: 1,
            num_phylogs: 1,
            storage_shards_per_sequencer: 2,
            sequencer_nodes: vec![10],
            storage_nodes: vec![20],
            index_nodes: vec![30],
            aggregator_nodes: vec![],
            log_space_hash_seed: 1,
            log_space_hash_tokens: vec![],
            hash_token_count: 4,
        })
        .unwrap()
    }

    fn storage(max_live: usize) -> LogStorage {
        LogStorage::new(20, &test_view(), 10, max_live, 32).unwrap()
    }

    fn metadata(shard_id: u16, sequence: u64, user_logspace: u32, data_size: usize) -> LogMetaData {
        LogMetaData {
            user_logspace,
            seqnum: phylog_core::INVALID_SEQNUM,
            localid: local_id::pack(shard_id, sequence),
            num_tags: 0,
            data_size,
        }
    }

    fn new_logs(
        s: &LogStorage,
        metalog_seqnum: u32,
        start_seqnum: u32,
        shards: Vec<(u16, u32, u32)>,
    ) -> MetaLogEntry {
        MetaLogEntry {
            logspace_id: s.logspace_id(),
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
    fn store_advances_contiguous_shard_progress() {
        let mut s = storage(1024);
        s.store(metadata(0, 0, 7, 1), vec![], vec![b'a']).unwrap();
        // Gap at sequence 1: progress stops at 1.
        s.store(metadata(0, 2, 7, 1), vec![], vec![b'c']).unwrap();
        assert_eq!(s.grab_shard_progress_for_sending(), Some(vec![1, 0]));
        // Nothing new since the grab.
        assert!(s.grab_shard_progress_for_sending().is_none());

        // Filling the gap advances past both.
        s.store(metadata(0, 1, 7, 1), vec![], vec![b'b']).unwrap();
        assert_eq!(s.grab_shard_progress_for_sending(), Some(vec![3, 0]));
    }

    #[test]
    fn store_rejects_unknown_shard_and_bad_size() {
        let mut s = storage(1024);
        assert!(matches!(
            s.store(metadata(9, 0, 7, 1), vec![], vec![b'a']),
            Err(LogError::UnknownShard { shard_id: 9 })
        ));
        assert!(matches!(
            s.store(metadata(0, 0, 7, 5), vec![], vec![b'a']),
            Err(LogError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn metalog_apply_moves_pending_to_live_and_emits_index_data() {
        let mut s = storage(1024);
        s.store(metadata(0, 0, 7, 1), vec![42, 43], vec![b'x'])
            .unwrap();
        s.store(metadata(0, 1, 7, 1), vec![], vec![b'y']).unwrap();

        let entry = new_logs(&s, 0, 0, vec![(0, 0, 2)]);
        s.provide_metalog(entry).unwrap();

        assert_eq!(s.live_entry_count(), 2);
        assert_eq!(s.seqnum_position(), types::seqnum(s.logspace_id(), 2));

        let packages = s.poll_index_data().unwrap();
        assert_eq!(packages.len(), 1);
        let pkg = &packages[0];
        assert_eq!(pkg.metalog_position, 1);
        assert_eq!(pkg.end_seqnum_position, 2);
        assert_eq!(pkg.num_productive_storage_shards, 1);
        assert_eq!(pkg.my_productive_shards, vec![0]);
        assert_eq!(pkg.seqnum_lowhalves, vec![0, 1]);
        assert_eq!(pkg.tag_sizes, vec![2, 0]);
        assert_eq!(pkg.tags, vec![42, 43]);
        // Accumulator reset: nothing more to poll.
        assert!(s.poll_index_data().is_none());
    }

    #[test]
    fn metalog_apply_without_pending_record_is_fatal() {
        let mut s = storage(1024);
        let entry = new_logs(&s, 0, 0, vec![(0, 0, 1)]);
        assert!(matches!(
            s.provide_metalog(entry),
            Err(LogError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn read_at_parks_until_sequenced() {
        let mut s = storage(1024);
        let seqnum = types::seqnum(s.logspace_id(), 0);
        s.read_at(SharedLogMessage::new_read_at(seqnum));
        assert!(s.poll_read_results().is_empty());

        s.store(metadata(0, 0, 7, 1), vec![], vec![b'x']).unwrap();
        let entry = new_logs(&s, 0, 0, vec![(0, 0, 1)]);
        s.provide_metalog(entry).unwrap();

        let results = s.poll_read_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ReadStatus::Ok);
        assert_eq!(results[0].entry.as_ref().unwrap().data, vec![b'x']);
    }

    #[test]
    fn evicted_persisted_entries_redirect_to_db() {
        let mut s = storage(1);
        for i in 0..3u64 {
            s.store(metadata(0, i, 7, 1), vec![], vec![b'a' + i as u8])
                .unwrap();
        }
        s.provide_metalog(new_logs(&s, 0, 0, vec![(0, 0, 3)]))
            .unwrap();
        assert_eq!(s.live_entry_count(), 3);

        let (entries, new_position) = s.grab_log_entries_for_persistence().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(new_position, types::seqnum(s.logspace_id(), 3));

        s.log_entries_persisted(new_position);
        // max_live_entries = 1: evict down to the cap.
        assert_eq!(s.live_entry_count(), 1);

        s.read_at(SharedLogMessage::new_read_at(types::seqnum(
            s.logspace_id(),
            0,
        )));
        let results = s.poll_read_results();
        assert_eq!(results[0].status, ReadStatus::LookupDb);
    }

    #[test]
    fn persistence_grab_is_idempotent_until_new_entries() {
        let mut s = storage(1024);
        assert!(s.grab_log_entries_for_persistence().is_none());

        s.store(metadata(0, 0, 7, 1), vec![], vec![b'x']).unwrap();
        s.provide_metalog(new_logs(&s, 0, 0, vec![(0, 0, 1)]))
            .unwrap();
        let (_, position) = s.grab_log_entries_for_persistence().unwrap();
        s.log_entries_persisted(position);
        assert!(s.grab_log_entries_for_persistence().is_none());
        assert_eq!(s.persisted_seqnum_position(), position);
    }

    #[test]
    fn live_entries_below_cap_are_kept_even_if_persisted() {
        let mut s = storage(1024);
        s.store(metadata(0, 0, 7, 1), vec![], vec![b'x']).unwrap();
        s.provide_metalog(new_logs(&s, 0, 0, vec![(0, 0, 1)]))
            .unwrap();
        let (_, position) = s.grab_log_entries_for_persistence().unwrap();
        s.log_entries_persisted(position);
        // Under the cap: entry stays live despite being persisted.
        assert_eq!(s.live_entry_count(), 1);
    }

    #[test]
    fn parked_read_resolves_when_its_seqnum_materializes() {
        let mut s = storage(1024);
        s.store(metadata(0, 0, 7, 1), vec![], vec![b'x']).unwrap();
        s.provide_metalog(new_logs(&s, 0, 0, vec![(0, 0, 1)]))
            .unwrap();
        s.poll_read_results();

        s.read_at(SharedLogMessage::new_read_at(types::seqnum(
            s.logspace_id(),
            1,
        )));
        s.store(metadata(1, 0, 7, 1), vec![], vec![b'z']).unwrap();
        s.store(metadata(1, 1, 7, 1), vec![], vec![b'w']).unwrap();
        s.provide_metalog(new_logs(&s, 1, 1, vec![(1, 0, 2)]))
            .unwrap();
        let results = s.poll_read_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ReadStatus::Ok);
        assert_eq!(results[0].entry.as_ref().unwrap().data, vec![b'z']);
    }

    #[test]
    fn remove_pending_entries_uses_retain() {
        let mut s = storage(1024);
        s.store(metadata(0, 0, 7, 1), vec![], vec![b'x']).unwrap();
        s.store(metadata(1, 0, 7, 1), vec![], vec![b'y']).unwrap();
        s.store(metadata(1, 1, 7, 1), vec![], vec![b'z']).unwrap();
        s.remove_pending_entries(1);
        // Only shard 0's record remains pending.
        assert_eq!(s.pending_log_entries.len(), 1);
        assert_eq!(
            local_id::shard_of(*s.pending_log_entries.keys().next().unwrap()),
            0
        );
    }

    #[test]
    fn aux_data_last_writer_wins() {
        let mut s = storage(1024);
        s.store(metadata(0, 0, 7, 1), vec![], vec![b'x']).unwrap();
        s.provide_metalog(new_logs(&s, 0, 0, vec![(0, 0, 1)]))
            .unwrap();
        let seqnum = types::seqnum(s.logspace_id(), 0);
        s.put_aux_data(seqnum, b"first".to_vec());
        s.put_aux_data(seqnum, b"second".to_vec());
        assert_eq!(s.get_aux_data(seqnum), Some(b"second".as_slice()));

        s.read_at(SharedLogMessage::new_read_at(seqnum));
        let results = s.poll_read_results();
        assert_eq!(results[0].aux_data, b"second".to_vec());
    }

    #[test]
    fn finalization_discards_pending_and_fails_parked_reads() {
        let mut s = storage(1024);
        s.store(metadata(0, 0, 7, 1), vec![], vec![b'x']).unwrap();
        s.read_at(SharedLogMessage::new_read_at(types::seqnum(
            s.logspace_id(),
            5,
        )));
        s.on_finalized(0).unwrap();
        assert!(s.pending_log_entries.is_empty());
        let results = s.poll_read_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, ReadStatus::Failed);
    }

    #[test]
    fn two_shard_cut_preserves_intra_shard_order() {
        let mut s = storage(1024);
        for i in 0..3u64 {
            s.store(metadata(0, i, 7, 1), vec![], vec![b'a']).unwrap();
            s.store(metadata(1, i, 7, 1), vec![], vec![b'b']).unwrap();
        }
        s.provide_metalog(new_logs(&s, 0, 0, vec![(0, 0, 3), (1, 0, 3)]))
            .unwrap();
        // Shard 0 occupies positions 0..3, shard 1 positions 3..6.
        for position in 0..3u32 {
            let entry = &s.live_log_entries[&types::seqnum(s.logspace_id(), position)];
            assert_eq!(local_id::shard_of(entry.metadata.localid), 0);
            assert_eq!(
                local_id::sequence_of(entry.metadata.localid),
                u64::from(position)
            );
        }
        for position in 3..6u32 {
            let entry = &s.live_log_entries[&types::seqnum(s.logspace_id(), position)];
            assert_eq!(local_id::shard_of(entry.metadata.localid), 1);
            assert_eq!(
                local_id::sequence_of(entry.metadata.localid),
                u64::from(position - 3)
            );
        }
    }
}
