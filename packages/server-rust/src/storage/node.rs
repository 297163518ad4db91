//! Storage node: message handling, background reporting, and persistence.
//!
//! Wraps one [`LogStorage`] per phylog the node replicates. The background
//! tick reports shard progress to sequencers, ships index-data packages to
//! the index tier (and registered engines running local indexes), and
//! hands live entries to the KV backend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use phylog_core::messages::payload;
use phylog_core::messages::{
    ConnType, MetaLogEntry, ReadResponsePayload, ReplicatePayload, SharedLogMessage,
    SharedLogOpType, SharedLogResultType,
};
use phylog_core::types;
use phylog_core::LogMetaData;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::network::{Delivery, MessageHub};
use crate::storage::{LogBackend, LogStorage, ReadResult, ReadStatus};
use crate::view::{FinalizedView, View, ViewLifecycleListener};

/// Storage node state.
pub struct StorageNode {
    node_id: u16,
    config: Arc<ServerConfig>,
    hub: Arc<dyn MessageHub>,
    backend: Arc<dyn LogBackend>,
    view: Mutex<Option<Arc<View>>>,
    /// Per-phylog storage, keyed by logspace id.
    phylogs: Mutex<HashMap<u32, LogStorage>>,
    /// Engines that registered for index-data shipping.
    registered_engines: Mutex<HashSet<u16>>,
}

impl StorageNode {
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        hub: Arc<dyn MessageHub>,
        backend: Arc<dyn LogBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id,
            config,
            hub,
            backend,
            view: Mutex::new(None),
            phylogs: Mutex::new(HashMap::new()),
            registered_engines: Mutex::new(HashSet::new()),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Handles one delivered message. Async because `ReadAt` may fall
    /// through to the KV backend.
    ///
    /// # Errors
    ///
    /// Propagates decode failures and FSM protocol violations.
    pub async fn handle_message(&self, delivery: &Delivery) -> Result<()> {
        let message = &delivery.message;
        match message.op_type {
            SharedLogOpType::Replicate => {
                let body: ReplicatePayload = payload::decode(&delivery.payload)?;
                let metadata = LogMetaData {
                    user_logspace: message.user_logspace,
                    seqnum: phylog_core::INVALID_SEQNUM,
                    localid: message.localid,
                    num_tags: body.tags.len(),
                    data_size: body.data.len(),
                };
                let mut phylogs = self.phylogs.lock();
                let Some(storage) = phylogs.get_mut(&message.logspace_id) else {
                    warn!(
                        logspace = format_args!("{:#x}", message.logspace_id),
                        "replicate for phylog we do not hold"
                    );
                    return Ok(());
                };
                storage.store(metadata, body.tags, body.data)?;
                Ok(())
            }
            SharedLogOpType::Metalogs => {
                let entries: Vec<MetaLogEntry> = payload::decode(&delivery.payload)?;
                let results = {
                    let mut phylogs = self.phylogs.lock();
                    let mut results = Vec::new();
                    for entry in entries {
                        if let Some(storage) = phylogs.get_mut(&entry.logspace_id) {
                            storage.provide_metalog(entry)?;
                            results.append(&mut storage.poll_read_results());
                        }
                    }
                    results
                };
                self.send_read_results(results).await;
                Ok(())
            }
            SharedLogOpType::ReadAt => {
                let results = {
                    let mut phylogs = self.phylogs.lock();
                    match phylogs.get_mut(&message.logspace_id) {
                        Some(storage) => {
                            storage.read_at(*message);
                            storage.poll_read_results()
                        }
                        None => vec![ReadResult {
                            status: ReadStatus::Failed,
                            entry: None,
                            aux_data: Vec::new(),
                            original_request: *message,
                        }],
                    }
                };
                self.send_read_results(results).await;
                Ok(())
            }
            SharedLogOpType::SetAuxData => {
                let seqnum = message.full_seqnum();
                let mut phylogs = self.phylogs.lock();
                if let Some(storage) = phylogs.get_mut(&message.logspace_id) {
                    storage.put_aux_data(seqnum, delivery.payload.to_vec());
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
                    ConnType::StorageToEngine,
                    message.origin_node_id,
                    &response,
                    &[],
                );
                Ok(())
            }
            _ => {
                warn!(op_type = ?message.op_type, "unexpected op type at storage");
                Ok(())
            }
        }
    }

    async fn send_read_results(&self, results: Vec<ReadResult>) {
        for result in results {
            let request = result.original_request;
            match result.status {
                ReadStatus::Ok => {
                    let entry = result.entry.expect("Ok results carry an entry");
                    self.respond_read_ok(
                        &request,
                        entry.user_tags.clone(),
                        entry.data.clone(),
                        result.aux_data,
                    );
                }
                ReadStatus::LookupDb => {
                    let seqnum =
                        types::seqnum(request.logspace_id, request.seqnum_lowhalf);
                    match self.backend.get_entry(seqnum).await {
                        Ok(Some(entry)) => {
                            self.respond_read_ok(
                                &request,
                                entry.user_tags,
                                entry.data,
                                result.aux_data,
                            );
                        }
                        Ok(None) => {
                            self.respond_failure(&request, SharedLogResultType::DataLost);
                        }
                        Err(err) => {
                            error!(%err, "backend lookup failed");
                            self.respond_failure(
                                &request,
                                SharedLogResultType::LookupFailed,
                            );
                        }
                    }
                }
                ReadStatus::Failed => {
                    self.respond_failure(&request, SharedLogResultType::LookupFailed);
                }
            }
        }
    }

    fn respond_read_ok(
        &self,
        request: &SharedLogMessage,
        tags: Vec<u64>,
        data: Vec<u8>,
        aux_data: Vec<u8>,
    ) {
        let mut response = SharedLogMessage::new_response(SharedLogResultType::ReadOk);
        response.logspace_id = request.logspace_id;
        response.seqnum_lowhalf = request.seqnum_lowhalf;
        response.user_metalog_progress = request.user_metalog_progress;
        response.origin_node_id = self.node_id;
        response.hop_times = request.hop_times + 1;
        response.client_data = request.client_data;
        let body = payload::encode(&ReadResponsePayload {
            tags,
            data,
            aux_data,
        });
        if !self.hub.send(
            ConnType::StorageToEngine,
            request.origin_node_id,
            &response,
            &body,
        ) {
            warn!(
                engine = request.origin_node_id,
                "failed to send read response"
            );
        }
    }

    fn respond_failure(&self, request: &SharedLogMessage, result: SharedLogResultType) {
        let mut response = SharedLogMessage::new_response(result);
        response.logspace_id = request.logspace_id;
        response.seqnum_lowhalf = request.seqnum_lowhalf;
        response.origin_node_id = self.node_id;
        response.hop_times = request.hop_times + 1;
        response.client_data = request.client_data;
        self.hub.send(
            ConnType::StorageToEngine,
            request.origin_node_id,
            &response,
            &[],
        );
    }

    /// One background round: report shard progress, ship index data, and
    /// persist live entries.
    pub async fn tick(&self) {
        let Some(view) = self.view.lock().clone() else {
            return;
        };

        // Shard progress to each phylog's sequencer.
        let progress_reports: Vec<(u32, Vec<u32>)> = {
            let mut phylogs = self.phylogs.lock();
            phylogs
                .iter_mut()
                .filter_map(|(&logspace_id, storage)| {
                    storage
                        .grab_shard_progress_for_sending()
                        .map(|progress| (logspace_id, progress))
                })
                .collect()
        };
        for (logspace_id, progress) in progress_reports {
            let message = SharedLogMessage {
                logspace_id,
                origin_node_id: self.node_id,
                ..SharedLogMessage::new(SharedLogOpType::ShardProg)
            };
            let sequencer_id = types::sequencer_of_logspace(logspace_id);
            let _ = crate::network::send_with_retry(
                self.hub.as_ref(),
                ConnType::StorageToSequencer,
                sequencer_id,
                &message,
                &payload::encode(&progress),
                self.config.max_send_retries,
            );
        }

        // Index data to the nodes serving each index shard (each retains
        // only its shards' slice) and to local-index engines. Nodes serving
        // several shards receive the package once.
        let packages: Vec<(u32, Vec<phylog_core::messages::IndexDataPackage>)> = {
            let mut phylogs = self.phylogs.lock();
            phylogs
                .iter_mut()
                .filter_map(|(&logspace_id, storage)| {
                    storage.poll_index_data().map(|pkgs| (logspace_id, pkgs))
                })
                .collect()
        };
        let engines: Vec<u16> = self.registered_engines.lock().iter().copied().collect();
        let mut shard_members: Vec<u16> = Vec::new();
        for index_shard in 0..view.num_index_shards() {
            for &index_id in view.index_shard_nodes(index_shard) {
                if !shard_members.contains(&index_id) {
                    shard_members.push(index_id);
                }
            }
        }
        for (logspace_id, packages) in packages {
            let message = SharedLogMessage::new_index_data(logspace_id);
            let bytes = payload::encode(&packages);
            for &index_id in &shard_members {
                let _ = crate::network::send_with_retry(
                    self.hub.as_ref(),
                    ConnType::StorageToIndex,
                    index_id,
                    &message,
                    &bytes,
                    self.config.max_send_retries,
                );
            }
            for &engine_id in &engines {
                let _ = crate::network::send_with_retry(
                    self.hub.as_ref(),
                    ConnType::StorageToEngine,
                    engine_id,
                    &message,
                    &bytes,
                    self.config.max_send_retries,
                );
            }
        }

        // Persistence handoff.
        let grabs: Vec<(u32, Vec<Arc<phylog_core::LogEntry>>, u64)> = {
            let phylogs = self.phylogs.lock();
            phylogs
                .iter()
                .filter_map(|(&logspace_id, storage)| {
                    storage
                        .grab_log_entries_for_persistence()
                        .map(|(entries, position)| (logspace_id, entries, position))
                })
                .collect()
        };
        for (logspace_id, entries, position) in grabs {
            match self.backend.put_entries(&entries).await {
                Ok(()) => {
                    let mut phylogs = self.phylogs.lock();
                    if let Some(storage) = phylogs.get_mut(&logspace_id) {
                        storage.log_entries_persisted(position);
                    }
                }
                Err(err) => error!(%err, "backend persistence failed"),
            }
        }
    }

    /// Drives the background tick until the task is aborted.
    pub async fn run_background(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_millis(
            self.config.storage_bgthread_interval_ms,
        ));
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}

impl ViewLifecycleListener for StorageNode {
    fn on_view_created(&self, view: &Arc<View>) {
        *self.view.lock() = Some(Arc::clone(view));
        let mut phylogs = self.phylogs.lock();
        for sequencer_id in view.active_sequencer_nodes() {
            let logspace_id = types::logspace_id(view.id(), sequencer_id);
            match LogStorage::new(
                self.node_id,
                view,
                sequencer_id,
                self.config.storage_max_live_entries,
                self.config.num_tail_metalog_entries,
            ) {
                Ok(storage) => {
                    info!(
                        logspace = format_args!("{logspace_id:#x}"),
                        "holding phylog storage"
                    );
                    phylogs.insert(logspace_id, storage);
                }
                // Not every storage node replicates every phylog.
                Err(_) => continue,
            }
        }
    }

    fn on_view_frozen(&self, _view: &Arc<View>) {}

    fn on_view_finalized(&self, finalized: &Arc<FinalizedView>) {
        let mut phylogs = self.phylogs.lock();
        for (&logspace_id, storage) in phylogs.iter_mut() {
            let final_position = finalized.final_metalog_position(logspace_id);
            if let Err(err) = storage.on_finalized(final_position) {
                error!(%err, "finalize storage");
            }
        }
        phylogs.clear();
        self.registered_engines.lock().clear();
        *self.view.lock() = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InProcessHub;
    use crate::storage::MemoryBackend;
    use crate::view::ViewSpec;
    use bytes::Bytes;
    use phylog_core::types::local_id;

    fn test_view() -> Arc<View> {
        Arc::new(
            View::new(&ViewSpec {
                view_id: 1,
                metalog_replicas: 1,
                userlog_replicas: 1,
                index_replicas: 1,
                num_index_shards: 1,
                num_phylogs: 1,
                storage_shards_per_sequencer: 1,
                sequencer_nodes: vec![10],
                storage_nodes: vec![20],
                index_nodes: vec![30],
                aggregator_nodes: vec![],
                log_space_hash_seed: 1,
                log_space_hash_tokens: vec![],
                hash_token_count: 4,
            })
            .unwrap(),
        )
    }

    fn node(hub: Arc<InProcessHub>) -> Arc<StorageNode> {
        let config = Arc::new(ServerConfig {
            node_id: 20,
            ..ServerConfig::default()
        });
        let node = StorageNode::new(config, hub, Arc::new(MemoryBackend::new()));
        node.on_view_created(&test_view());
        node
    }

    fn replicate_delivery(logspace_id: u32, sequence: u64, data: &[u8]) -> Delivery {
        let mut message = SharedLogMessage::new_replicate(logspace_id);
        message.user_logspace = 7;
        message.localid = local_id::pack(0, sequence);
        message.origin_node_id = 1;
        Delivery {
            conn_type: ConnType::EngineToStorage,
            message,
            payload: Bytes::from(payload::encode(&ReplicatePayload {
                tags: vec![42],
                data: data.to_vec(),
            })),
        }
    }

    fn metalog_delivery(logspace_id: u32, metalog_seqnum: u32, start: u32, delta: u32) -> Delivery {
        let entry = MetaLogEntry {
            logspace_id,
            metalog_seqnum,
            entry_type: phylog_core::messages::MetaLogType::NewLogs,
            start_seqnum: start,
            shards: vec![phylog_core::messages::ShardDelta {
                shard_id: 0,
                shard_start: start,
                delta,
            }],
        };
        Delivery {
            conn_type: ConnType::SequencerToStorage,
            message: SharedLogMessage::new_metalogs(logspace_id),
            payload: Bytes::from(payload::encode(&vec![entry])),
        }
    }

    #[tokio::test]
    async fn tick_reports_progress_and_ships_index_data() {
        let hub = Arc::new(InProcessHub::new());
        let mut sequencer_inbox = hub.register_node(10);
        let mut index_inbox = hub.register_node(30);
        let node = node(hub.clone());
        let logspace_id = types::logspace_id(1, 10);

        node.handle_message(&replicate_delivery(logspace_id, 0, b"x"))
            .await
            .unwrap();
        node.tick().await;

        let report = sequencer_inbox.try_recv().unwrap();
        assert_eq!(report.message.op_type, SharedLogOpType::ShardProg);
        let progress: Vec<u32> = payload::decode(&report.payload).unwrap();
        assert_eq!(progress, vec![1]);

        // Metalog applies; the next tick ships index data.
        node.handle_message(&metalog_delivery(logspace_id, 0, 0, 1))
            .await
            .unwrap();
        node.tick().await;
        let shipped = index_inbox.try_recv().unwrap();
        assert_eq!(shipped.message.op_type, SharedLogOpType::IndexData);
        let packages: Vec<phylog_core::messages::IndexDataPackage> =
            payload::decode(&shipped.payload).unwrap();
        assert_eq!(packages.len(), 1);
        assert_eq!(packages[0].tags, vec![42]);
    }

    #[tokio::test]
    async fn read_at_responds_to_origin_engine() {
        let hub = Arc::new(InProcessHub::new());
        let _sequencer_inbox = hub.register_node(10);
        let _index_inbox = hub.register_node(30);
        let mut engine_inbox = hub.register_node(1);
        let node = node(hub.clone());
        let logspace_id = types::logspace_id(1, 10);

        node.handle_message(&replicate_delivery(logspace_id, 0, b"x"))
            .await
            .unwrap();
        node.handle_message(&metalog_delivery(logspace_id, 0, 0, 1))
            .await
            .unwrap();

        let mut request = SharedLogMessage::new_read_at(types::seqnum(logspace_id, 0));
        request.origin_node_id = 1;
        request.client_data = 99;
        node.handle_message(&Delivery {
            conn_type: ConnType::EngineToStorage,
            message: request,
            payload: Bytes::new(),
        })
        .await
        .unwrap();

        let response = engine_inbox.try_recv().unwrap();
        assert_eq!(response.message.op_type, SharedLogOpType::Response);
        assert_eq!(response.message.result_type, SharedLogResultType::ReadOk);
        assert_eq!(response.message.client_data, 99);
        let body: ReadResponsePayload = payload::decode(&response.payload).unwrap();
        assert_eq!(body.data, b"x".to_vec());
        assert_eq!(body.tags, vec![42]);
    }

    #[tokio::test]
    async fn persisted_then_evicted_entry_served_from_backend() {
        let hub = Arc::new(InProcessHub::new());
        let _sequencer_inbox = hub.register_node(10);
        let _index_inbox = hub.register_node(30);
        let mut engine_inbox = hub.register_node(1);

        let config = Arc::new(ServerConfig {
            node_id: 20,
            storage_max_live_entries: 1,
            ..ServerConfig::default()
        });
        let node = StorageNode::new(config, hub.clone(), Arc::new(MemoryBackend::new()));
        node.on_view_created(&test_view());
        let logspace_id = types::logspace_id(1, 10);

        for i in 0..3u64 {
            node.handle_message(&replicate_delivery(logspace_id, i, b"x"))
                .await
                .unwrap();
        }
        node.handle_message(&metalog_delivery(logspace_id, 0, 0, 3))
            .await
            .unwrap();
        // Persist and evict down to the cap.
        node.tick().await;

        let mut request = SharedLogMessage::new_read_at(types::seqnum(logspace_id, 0));
        request.origin_node_id = 1;
        request.client_data = 5;
        node.handle_message(&Delivery {
            conn_type: ConnType::EngineToStorage,
            message: request,
            payload: Bytes::new(),
        })
        .await
        .unwrap();

        let response = engine_inbox.try_recv().unwrap();
        assert_eq!(response.message.result_type, SharedLogResultType::ReadOk);
    }

    #[tokio::test]
    async fn unknown_seqnum_fails_lookup() {
        let hub = Arc::new(InProcessHub::new());
        let mut engine_inbox = hub.register_node(1);
        let node = node(hub.clone());
        let logspace_id = types::logspace_id(1, 10);

        // Sequence a record so position 0 is resolvable, then ask for a
        // stale unknown one from another phylog.
        let mut request = SharedLogMessage::new_read_at(types::seqnum(0x0001_0063, 0));
        request.origin_node_id = 1;
        request.client_data = 5;
        node.handle_message(&Delivery {
            conn_type: ConnType::EngineToStorage,
            message: request,
            payload: Bytes::new(),
        })
        .await
        .unwrap();
        let response = engine_inbox.try_recv().unwrap();
        assert_eq!(
            response.message.result_type,
            SharedLogResultType::LookupFailed
        );
        let _ = logspace_id;
    }
}
