//! Primary and backup sequencer state machines for one phylog.
//!
//! The primary assembles *local cuts*: storage nodes report per-shard
//! high-water marks of contiguously replicated records, and once a shard's
//! position (the min across its storage replicas) passes the last cut, the
//! shard is dirty. The periodic cut turns all dirty shards into exactly one
//! `NEW_LOGS` metalog entry. Backups mirror the metalog and acknowledge
//! their position; the primary commits at the median acknowledged position.

use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;
use tracing::{debug, info, warn};

use phylog_core::messages::{MetaLogEntry, MetaLogType, ShardDelta};
use phylog_core::types;

use crate::error::{LogError, Result};
use crate::logspace::LogSpaceState;
use crate::view::View;

// ---------------------------------------------------------------------------
// MetaLogPrimary
// ---------------------------------------------------------------------------

/// Primary sequencer FSM for one phylog.
pub struct MetaLogPrimary {
    state: LogSpaceState,
    /// Reported progress per `(shard_id, storage_id)` pair.
    shard_progresses: HashMap<(u16, u16), u32>,
    /// Storage replicas per shard; the shard's replicated position is the
    /// min over these.
    shard_storages: HashMap<u16, Vec<u16>>,
    /// Shard ids each storage node reports, positionally matching its
    /// progress vectors.
    storage_shard_order: HashMap<u16, Vec<u16>>,
    last_cut: HashMap<u16, u32>,
    dirty_shards: IndexSet<u16>,
    unblocked_shards: HashSet<u16>,
    metalog_progresses: HashMap<u16, u32>,
    replicated_metalog_position: u32,
}

impl MetaLogPrimary {
    /// Builds the primary FSM for `sequencer_id`'s phylog in `view`.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if the view does not know this sequencer.
    pub fn new(view: &View, sequencer_id: u16, tail_cap: usize) -> Result<Self> {
        let sequencer = view.get_sequencer_node(sequencer_id).ok_or_else(|| {
            LogError::ProtocolViolation(format!(
                "view {} has no sequencer node {sequencer_id}",
                view.id()
            ))
        })?;
        let logspace_id = types::logspace_id(view.id(), sequencer_id);

        let mut shard_progresses = HashMap::new();
        let mut shard_storages = HashMap::new();
        let mut last_cut = HashMap::new();
        let mut unblocked_shards = HashSet::new();
        for &local_shard_id in view.storage_shard_ids(sequencer_id) {
            let shard = view
                .get_storage_shard(phylog_core::bits::join16(sequencer_id, local_shard_id))
                .ok_or_else(|| {
                    LogError::ProtocolViolation(format!(
                        "view {} has no storage shard {local_shard_id} under sequencer {sequencer_id}",
                        view.id()
                    ))
                })?;
            for &storage_id in shard.storage_nodes() {
                shard_progresses.insert((local_shard_id, storage_id), 0);
            }
            shard_storages.insert(local_shard_id, shard.storage_nodes().to_vec());
            last_cut.insert(local_shard_id, 0);
            unblocked_shards.insert(local_shard_id);
        }

        let mut storage_shard_order = HashMap::new();
        for &storage_id in view.storage_nodes() {
            if let Some(storage) = view.get_storage_node(storage_id) {
                let order = storage.local_shard_ids(sequencer_id).to_vec();
                if !order.is_empty() {
                    storage_shard_order.insert(storage_id, order);
                }
            }
        }

        let metalog_progresses: HashMap<u16, u32> = sequencer
            .replica_sequencer_nodes()
            .iter()
            .map(|&id| (id, 0))
            .collect();
        if metalog_progresses.is_empty() {
            warn!(logspace = format_args!("{logspace_id:#x}"), "no metalog replication");
        }

        Ok(Self {
            state: LogSpaceState::new(logspace_id, tail_cap),
            shard_progresses,
            shard_storages,
            storage_shard_order,
            last_cut,
            dirty_shards: IndexSet::new(),
            unblocked_shards,
            metalog_progresses,
            replicated_metalog_position: 0,
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
    pub fn replicated_metalog_position(&self) -> u32 {
        self.replicated_metalog_position
    }

    #[must_use]
    pub fn seqnum_position(&self) -> u64 {
        self.state.seqnum_position()
    }

    #[must_use]
    pub fn has_dirty_shards(&self) -> bool {
        !self.dirty_shards.is_empty()
    }

    /// Last cut position of a shard, if known.
    #[must_use]
    pub fn last_cut(&self, shard_id: u16) -> Option<u32> {
        self.last_cut.get(&shard_id).copied()
    }

    /// Ingests one storage node's shard-progress vector. The vector is
    /// positional against the shard order the view assigns that storage.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if the storage node is unknown to this phylog or
    /// the vector length disagrees with its shard count.
    pub fn update_storage_progress(&mut self, storage_id: u16, progress: &[u32]) -> Result<()> {
        let shard_order = self.storage_shard_order.get(&storage_id).ok_or_else(|| {
            LogError::ProtocolViolation(format!(
                "storage node {storage_id} does not replicate this phylog"
            ))
        })?;
        if progress.len() != shard_order.len() {
            return Err(LogError::ProtocolViolation(format!(
                "progress vector from storage {storage_id}: have {} entries, expected {}",
                progress.len(),
                shard_order.len()
            )));
        }
        for (i, &reported) in progress.iter().enumerate() {
            let shard_id = shard_order[i];
            if !self.unblocked_shards.contains(&shard_id) {
                debug!(shard_id, "shard is blocked");
                continue;
            }
            let slot = self
                .shard_progresses
                .get_mut(&(shard_id, storage_id))
                .expect("shard order entries always have progress slots");
            if reported > *slot {
                *slot = reported;
                let position = self.shard_replicated_position(shard_id);
                if position > self.last_cut[&shard_id] {
                    debug!(
                        storage_id,
                        shard_id,
                        position = format_args!("{position:#x}"),
                        "shard progress past last cut"
                    );
                    self.dirty_shards.insert(shard_id);
                }
            }
        }
        Ok(())
    }

    /// Min over the shard's storage replicas of their reported progress.
    fn shard_replicated_position(&self, shard_id: u16) -> u32 {
        self.shard_storages[&shard_id]
            .iter()
            .map(|&storage_id| self.shard_progresses[&(shard_id, storage_id)])
            .min()
            .expect("every shard has at least one storage replica")
    }

    /// Ingests a backup sequencer's metalog position acknowledgement and
    /// recomputes the committed position.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` for acks from non-replica nodes, and for a
    /// position strictly greater than the primary's own (the replica claims
    /// entries the primary never produced).
    pub fn update_replica_progress(
        &mut self,
        sequencer_id: u16,
        metalog_position: u32,
    ) -> Result<()> {
        let Some(slot) = self.metalog_progresses.get_mut(&sequencer_id) else {
            return Err(LogError::ProtocolViolation(format!(
                "META_PROG from non-replica sequencer {sequencer_id}"
            )));
        };
        if metalog_position > self.state.metalog_position() {
            return Err(LogError::ProtocolViolation(format!(
                "future metalog position from replica {sequencer_id}: received={metalog_position}, current={}",
                self.state.metalog_position()
            )));
        }
        if metalog_position > *slot {
            *slot = metalog_position;
            self.update_replicated_position();
        }
        Ok(())
    }

    fn update_replicated_position(&mut self) {
        if self.replicated_metalog_position == self.state.metalog_position()
            || self.metalog_progresses.is_empty()
        {
            return;
        }
        let mut positions: Vec<u32> = self.metalog_progresses.values().copied().collect();
        positions.sort_unstable();
        // Upper median: makes progress with any majority of replicas.
        let progress = positions[positions.len() / 2];
        if progress >= self.replicated_metalog_position {
            self.replicated_metalog_position = progress;
        }
    }

    /// Produces the next metalog entry if any shard is dirty.
    ///
    /// Atomically advances `last_cut` for every covered shard, clears the
    /// dirty set, applies the entry locally, and returns it for broadcast.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` if the freshly produced entry fails local apply
    /// (which would mean the FSM's own bookkeeping is inconsistent).
    pub fn mark_next_cut(&mut self) -> Result<Option<MetaLogEntry>> {
        if self.dirty_shards.is_empty() {
            return Ok(None);
        }
        let mut shards = Vec::with_capacity(self.dirty_shards.len());
        let mut total_delta = 0u32;
        for &shard_id in &self.dirty_shards {
            let position = self.shard_replicated_position(shard_id);
            let start = self.last_cut[&shard_id];
            debug_assert!(position > start);
            let delta = position - start;
            shards.push(ShardDelta {
                shard_id,
                shard_start: start,
                delta,
            });
            total_delta += delta;
        }
        let entry = MetaLogEntry {
            logspace_id: self.state.logspace_id(),
            metalog_seqnum: self.state.metalog_position(),
            entry_type: MetaLogType::NewLogs,
            start_seqnum: self.state.seqnum_lowhalf(),
            shards,
        };
        for shard in &entry.shards {
            self.last_cut
                .insert(shard.shard_id, shard.shard_start + shard.delta);
        }
        self.dirty_shards.clear();
        debug!(
            start_seqnum = entry.start_seqnum,
            total_delta, "generate NEW_LOGS metalog entry"
        );
        self.state.provide_metalog(entry.clone())?;
        debug_assert_eq!(entry.start_seqnum + total_delta, self.state.seqnum_lowhalf());
        Ok(Some(entry))
    }

    /// Excludes a shard from future cuts (graceful scale-in). Idempotent;
    /// returns the shard's current last cut.
    ///
    /// # Errors
    ///
    /// `UnknownShard` for shards outside this phylog.
    pub fn block_shard(&mut self, shard_id: u16) -> Result<u32> {
        let last_cut = *self
            .last_cut
            .get(&shard_id)
            .ok_or(LogError::UnknownShard { shard_id })?;
        if !self.unblocked_shards.contains(&shard_id) {
            info!(shard_id, "shard is already blocked");
            return Ok(last_cut);
        }
        if self.dirty_shards.shift_remove(&shard_id) {
            info!(shard_id, "shard was dirty");
        }
        info!(shard_id, "block shard");
        self.unblocked_shards.remove(&shard_id);
        Ok(last_cut)
    }

    /// Re-admits a blocked shard. Idempotent; returns the shard's current
    /// last cut.
    ///
    /// # Errors
    ///
    /// `UnknownShard` for shards outside this phylog.
    pub fn unblock_shard(&mut self, shard_id: u16) -> Result<u32> {
        let last_cut = *self
            .last_cut
            .get(&shard_id)
            .ok_or(LogError::UnknownShard { shard_id })?;
        if self.unblocked_shards.contains(&shard_id) {
            info!(shard_id, "shard is already unblocked");
            return Ok(last_cut);
        }
        info!(shard_id, "unblock shard");
        self.unblocked_shards.insert(shard_id);
        // Progress reported while blocked may already be past the cut.
        if self.shard_replicated_position(shard_id) > last_cut {
            self.dirty_shards.insert(shard_id);
        }
        Ok(last_cut)
    }
}

// ---------------------------------------------------------------------------
// MetaLogBackup
// ---------------------------------------------------------------------------

/// Backup sequencer FSM: mirrors the primary's metalog.
pub struct MetaLogBackup {
    state: LogSpaceState,
}

impl MetaLogBackup {
    #[must_use]
    pub fn new(view: &View, sequencer_id: u16, tail_cap: usize) -> Self {
        let logspace_id = types::logspace_id(view.id(), sequencer_id);
        Self {
            state: LogSpaceState::new(logspace_id, tail_cap),
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

    /// Stores replicated metalog entries; out-of-order arrivals are
    /// buffered. Returns the new metalog position for the `META_PROG` ack.
    ///
    /// # Errors
    ///
    /// Propagates `ProtocolViolation` from the apply machinery.
    pub fn provide_metalog(&mut self, entry: MetaLogEntry) -> Result<u32> {
        self.state.provide_metalog(entry)?;
        Ok(self.state.metalog_position())
    }

    /// Finalizes the backup at `final_position`.
    ///
    /// # Errors
    ///
    /// Propagates `ProtocolViolation` from the apply machinery.
    pub fn on_finalized(&mut self, final_position: u32) -> Result<()> {
        self.state.finalize(final_position)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
