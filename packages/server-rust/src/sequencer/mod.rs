//! Sequencer node: periodic local cuts and metalog broadcast.
//!
//! One node may be primary for its own phylog and backup for others'. The
//! primary's cut timer fires every `local_cut_interval_us`; each produced
//! `NEW_LOGS` entry is broadcast to replica sequencers and to the
//! storage/index/aggregator subscribers plus every registered engine.

pub mod metalog;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use phylog_core::messages::payload;
use phylog_core::messages::{ConnType, MetaLogEntry, SharedLogMessage, SharedLogOpType};
use phylog_core::types;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::network::{Delivery, MessageHub};
use crate::view::{FinalizedView, View, ViewLifecycleListener};

pub use metalog::{MetaLogBackup, MetaLogPrimary};

/// Sequencer node state.
pub struct SequencerServer {
    node_id: u16,
    config: Arc<ServerConfig>,
    hub: Arc<dyn MessageHub>,
    view: Mutex<Option<Arc<View>>>,
    /// Primary FSM when this node owns an active phylog.
    primary: Mutex<Option<MetaLogPrimary>>,
    /// Backup FSMs for phylogs this node replicates, keyed by logspace.
    backups: Mutex<HashMap<u32, MetaLogBackup>>,
    /// Engine nodes that registered for metalog broadcast.
    registered_engines: Mutex<HashSet<u16>>,
}

impl SequencerServer {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>, hub: Arc<dyn MessageHub>) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id,
            config,
            hub,
            view: Mutex::new(None),
            primary: Mutex::new(None),
            backups: Mutex::new(HashMap::new()),
            registered_engines: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Current metalog position of the primary, if this node is one.
    #[must_use]
    pub fn primary_metalog_position(&self) -> Option<u32> {
        self.primary.lock().as_ref().map(MetaLogPrimary::metalog_position)
    }

    /// Excludes a shard from future cuts (graceful scale-in); returns the
    /// shard's last cut.
    ///
    /// # Errors
    ///
    /// `UnknownShard` when this node is not the shard's primary or the
    /// shard is outside its phylog.
    pub fn block_shard(&self, shard_id: u16) -> Result<u32> {
        let mut primary = self.primary.lock();
        match primary.as_mut() {
            Some(primary) => primary.block_shard(shard_id),
            None => Err(crate::error::LogError::UnknownShard { shard_id }),
        }
    }

    /// Re-admits a blocked shard; returns the shard's last cut.
    ///
    /// # Errors
    ///
    /// `UnknownShard` as for [`Self::block_shard`].
    pub fn unblock_shard(&self, shard_id: u16) -> Result<u32> {
        let mut primary = self.primary.lock();
        match primary.as_mut() {
            Some(primary) => primary.unblock_shard(shard_id),
            None => Err(crate::error::LogError::UnknownShard { shard_id }),
        }
    }

    /// Handles one delivered message.
    ///
    /// # Errors
    ///
    /// Propagates decode failures and FSM protocol violations; callers
    /// treat `ProtocolViolation` as fatal for the node.
    pub fn handle_message(&self, delivery: &Delivery) -> Result<()> {
        let message = &delivery.message;
        match message.op_type {
            SharedLogOpType::ShardProg => {
                let progress: Vec<u32> = payload::decode(&delivery.payload)?;
                let mut primary = self.primary.lock();
                if let Some(primary) = primary.as_mut() {
                    primary.update_storage_progress(message.origin_node_id, &progress)?;
                } else {
                    warn!(origin = message.origin_node_id, "shard progress without primary");
                }
                Ok(())
            }
            SharedLogOpType::MetaProg => {
                let mut primary = self.primary.lock();
                if let Some(primary) = primary.as_mut() {
                    primary
                        .update_replica_progress(message.origin_node_id, message.metalog_position)?;
                }
                Ok(())
            }
            SharedLogOpType::Metalogs => {
                let entries: Vec<MetaLogEntry> = payload::decode(&delivery.payload)?;
                for entry in entries {
                    let logspace_id = entry.logspace_id;
                    let position = {
                        let mut backups = self.backups.lock();
                        let Some(backup) = backups.get_mut(&logspace_id) else {
                            warn!(
                                logspace = format_args!("{logspace_id:#x}"),
                                "metalog for phylog we do not back up"
                            );
                            continue;
                        };
                        backup.provide_metalog(entry)?
                    };
                    // Ack the primary with our new position.
                    let ack = SharedLogMessage {
                        origin_node_id: self.node_id,
                        ..SharedLogMessage::new_meta_prog(logspace_id, position)
                    };
                    let primary_node = types::sequencer_of_logspace(logspace_id);
                    self.hub.send(
                        ConnType::SequencerToSequencer,
                        primary_node,
                        &ack,
                        &[],
                    );
                }
                Ok(())
            }
            SharedLogOpType::Register => {
                self.registered_engines.lock().insert(message.origin_node_id);
                let response = SharedLogMessage {
                    origin_node_id: self.node_id,
                    ..SharedLogMessage::new(SharedLogOpType::Register)
                };
                self.hub.send(
                    ConnType::SequencerToEngine,
                    message.origin_node_id,
                    &response,
                    &[],
                );
                Ok(())
            }
            _ => {
                warn!(op_type = ?message.op_type, "unexpected op type at sequencer");
                Ok(())
            }
        }
    }

    /// One cut attempt; broadcasts the produced entry, if any.
    ///
    /// # Errors
    ///
    /// Propagates FSM protocol violations.
    pub fn tick(&self) -> Result<()> {
        let entry = {
            let mut primary = self.primary.lock();
            match primary.as_mut() {
                Some(primary) => primary.mark_next_cut()?,
                None => None,
            }
        };
        if let Some(entry) = entry {
            self.broadcast_metalog(&entry);
        }
        Ok(())
    }

    fn broadcast_metalog(&self, entry: &MetaLogEntry) {
        let Some(view) = self.view.lock().clone() else {
            return;
        };
        let message = SharedLogMessage::new_metalogs(entry.logspace_id);
        let bytes = payload::encode(&vec![entry.clone()]);

        if let Some(sequencer) = view.get_sequencer_node(self.node_id) {
            for &replica in sequencer.replica_sequencer_nodes() {
                self.send_retrying(ConnType::SequencerToSequencer, replica, &message, &bytes);
            }
        }
        for &storage_id in view.storage_nodes() {
            self.send_retrying(ConnType::SequencerToStorage, storage_id, &message, &bytes);
        }
        for &index_id in view.index_nodes() {
            self.send_retrying(ConnType::SequencerToIndex, index_id, &message, &bytes);
        }
        for &aggregator_id in view.aggregator_nodes() {
            self.send_retrying(
                ConnType::SequencerToAggregator,
                aggregator_id,
                &message,
                &bytes,
            );
        }
        let engines: Vec<u16> = self.registered_engines.lock().iter().copied().collect();
        for engine_id in engines {
            self.send_retrying(ConnType::SequencerToEngine, engine_id, &message, &bytes);
        }
    }

    fn send_retrying(
        &self,
        conn_type: ConnType,
        dst: u16,
        message: &SharedLogMessage,
        bytes: &[u8],
    ) {
        // Dropped messages heal through the next periodic cut or the
        // storage reconvergence path.
        let _ = crate::network::send_with_retry(
            self.hub.as_ref(),
            conn_type,
            dst,
            message,
            bytes,
            self.config.max_send_retries,
        );
    }

    /// Drives the cut timer until the task is aborted.
    pub async fn run_cut_timer(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(Duration::from_micros(self.config.local_cut_interval_us));
        loop {
            interval.tick().await;
            if let Err(err) = self.tick() {
                error!(%err, "local cut failed");
                return;
            }
        }
    }
}

impl ViewLifecycleListener for SequencerServer {
    fn on_view_created(&self, view: &Arc<View>) {
        *self.view.lock() = Some(Arc::clone(view));
        if view.is_active_phylog(self.node_id) {
            match MetaLogPrimary::new(view, self.node_id, self.config.num_tail_metalog_entries) {
                Ok(primary) => {
                    info!(
                        logspace = format_args!("{:#x}", primary.logspace_id()),
                        "serving as primary sequencer"
                    );
                    *self.primary.lock() = Some(primary);
                }
                Err(err) => error!(%err, "failed to build primary"),
            }
        }
        let mut backups = self.backups.lock();
        for sequencer_id in view.active_sequencer_nodes() {
            if sequencer_id == self.node_id {
                continue;
            }
            let is_replica = view
                .get_sequencer_node(sequencer_id)
                .is_some_and(|s| s.is_replica_sequencer_node(self.node_id));
            if is_replica {
                let logspace_id = types::logspace_id(view.id(), sequencer_id);
                backups.insert(
                    logspace_id,
                    MetaLogBackup::new(view, sequencer_id, self.config.num_tail_metalog_entries),
                );
            }
        }
    }

    fn on_view_frozen(&self, _view: &Arc<View>) {}

    fn on_view_finalized(&self, finalized: &Arc<FinalizedView>) {
        *self.primary.lock() = None;
        let mut backups = self.backups.lock();
        for (&logspace_id, backup) in backups.iter_mut() {
            let final_position = finalized.final_metalog_position(logspace_id);
            if let Err(err) = backup.on_finalized(final_position) {
                error!(%err, "finalize backup");
            }
        }
        backups.clear();
        self.registered_engines.lock().clear();
        *self.view.lock() = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
