//! Index-tier node: sharded query handling and read dispatch.
//!
//! Wraps one sharded [`Index`] per phylog, covering the index shards the
//! view assigns this node. Tag queries arrive only at their owning shard;
//! a `Found` answer turns into a `ReadAt` dispatched straight to a storage
//! replica, so the record flows storage-to-engine without another index
//! hop. Tag-less queries arrive as a per-shard fan-out carrying a merge
//! target: each node sends its slice's answer there as a `SlaveResult`,
//! and when this node *is* the target (master–slave merging, used when the
//! view has no aggregator nodes) it merges through its own
//! [`QueryAggregator`]. Queries gated on future metalog progress park here
//! and re-run when the horizon advances.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use phylog_core::messages::payload;
use phylog_core::messages::{
    ConnType, IndexDataPackage, MetaLogEntry, SharedLogMessage, SharedLogOpType,
    SharedLogResultType,
};
use phylog_core::types::{self, INVALID_NODE_ID};
use phylog_core::bits;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::index::aggregator::dispatch_merged_result;
use crate::index::{
    Index, IndexCaps, IndexQuery, IndexQueryResult, QueryAggregator, QueryDirection, QueryState,
};
use crate::network::{Delivery, MessageHub};
use crate::view::{FinalizedView, View, ViewLifecycleListener};

/// Index node state.
pub struct IndexNode {
    node_id: u16,
    config: Arc<ServerConfig>,
    hub: Arc<dyn MessageHub>,
    view: Mutex<Option<Arc<View>>>,
    /// Per-phylog sharded index, keyed by logspace id.
    indexes: Mutex<HashMap<u32, Index>>,
    /// Queries whose required metalog progress is past the horizon, with
    /// their merge target.
    pending_queries: Mutex<HashMap<u32, Vec<(IndexQuery, u16)>>>,
    /// Merge state for fanned-out queries this node masters.
    aggregator: Mutex<QueryAggregator>,
}

impl IndexNode {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>, hub: Arc<dyn MessageHub>) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id,
            config,
            hub,
            view: Mutex::new(None),
            indexes: Mutex::new(HashMap::new()),
            pending_queries: Mutex::new(HashMap::new()),
            aggregator: Mutex::new(QueryAggregator::new()),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Handles one delivered message.
    ///
    /// # Errors
    ///
    /// Propagates decode failures and protocol violations.
    pub fn handle_message(&self, delivery: &Delivery) -> Result<()> {
        let message = &delivery.message;
        match message.op_type {
            SharedLogOpType::IndexData => {
                let packages: Vec<IndexDataPackage> = payload::decode(&delivery.payload)?;
                let mut touched = Vec::new();
                {
                    let mut indexes = self.indexes.lock();
                    for package in packages {
                        let logspace_id = package.logspace_id;
                        if let Some(index) = indexes.get_mut(&logspace_id) {
                            index.provide_index_data(package)?;
                            touched.push(logspace_id);
                        }
                    }
                }
                for logspace_id in touched {
                    self.retry_pending_queries(logspace_id);
                }
                Ok(())
            }
            // Index nodes also track the metalog stream so their horizon
            // advances on cuts that produced no records for their shards.
            SharedLogOpType::Metalogs => {
                let _entries: Vec<MetaLogEntry> = payload::decode(&delivery.payload)?;
                Ok(())
            }
            SharedLogOpType::ReadNext
            | SharedLogOpType::ReadPrev
            | SharedLogOpType::ReadNextBlocking => {
                let query = Self::query_from_message(message);
                self.run_query(message.logspace_id, query, message.aggregator_node_id);
                Ok(())
            }
            // A slave's answer for a fan-out this node masters.
            SharedLogOpType::SlaveResult => {
                let result: IndexQueryResult = payload::decode(&delivery.payload)?;
                self.handle_slave_result(result);
                Ok(())
            }
            _ => {
                warn!(op_type = ?message.op_type, "unexpected op type at index node");
                Ok(())
            }
        }
    }

    fn query_from_message(message: &SharedLogMessage) -> IndexQuery {
        IndexQuery {
            direction: match message.op_type {
                SharedLogOpType::ReadPrev => QueryDirection::ReadPrev,
                SharedLogOpType::ReadNextBlocking => QueryDirection::ReadNextBlocking,
                _ => QueryDirection::ReadNext,
            },
            origin_node_id: message.origin_node_id,
            hop_times: message.hop_times,
            client_data: message.client_data,
            user_logspace: message.user_logspace,
            tag: message.query_tag,
            query_seqnum: types::seqnum(message.logspace_id, message.seqnum_lowhalf),
            metalog_progress: message.user_metalog_progress,
        }
    }

    fn run_query(&self, logspace_id: u32, query: IndexQuery, aggregator_node_id: u16) {
        let result = {
            let indexes = self.indexes.lock();
            match indexes.get(&logspace_id) {
                Some(index) => index.make_query(query),
                None => {
                    // Unknown phylog: cannot prove anything about it.
                    IndexQueryResult {
                        state: QueryState::Miss,
                        found_seqnum: phylog_core::INVALID_SEQNUM,
                        found_engine_id: 0,
                        metalog_progress: 0,
                        original_query: query,
                    }
                }
            }
        };
        if result.state == QueryState::Continue {
            self.pending_queries
                .lock()
                .entry(logspace_id)
                .or_default()
                .push((query, aggregator_node_id));
            return;
        }
        if aggregator_node_id == INVALID_NODE_ID {
            match result.state {
                QueryState::Found => self.dispatch_storage_read(logspace_id, &result),
                QueryState::Empty => {
                    self.respond(&result, SharedLogResultType::Empty);
                }
                QueryState::Miss => {
                    self.respond(&result, SharedLogResultType::LookupFailed);
                }
                QueryState::Continue => unreachable!("parked above"),
            }
        } else {
            self.submit_slave_result(logspace_id, aggregator_node_id, result);
        }
    }

    /// Routes one shard's answer to its merge target; when this node is the
    /// target it merges locally (master–slave mode).
    fn submit_slave_result(
        &self,
        logspace_id: u32,
        aggregator_node_id: u16,
        result: IndexQueryResult,
    ) {
        if aggregator_node_id == self.node_id {
            self.handle_slave_result(result);
            return;
        }
        let mut message = SharedLogMessage::new(SharedLogOpType::SlaveResult);
        message.logspace_id = logspace_id;
        message.origin_node_id = self.node_id;
        message.client_data = result.original_query.client_data;
        let sent = crate::network::send_with_retry(
            self.hub.as_ref(),
            ConnType::IndexToAggregator,
            aggregator_node_id,
            &message,
            &payload::encode(&result),
            self.config.max_send_retries,
        );
        if sent.is_err() {
            warn!(aggregator_node_id, "failed to send slave result");
        }
    }

    fn handle_slave_result(&self, result: IndexQueryResult) {
        let Some(view) = self.view.lock().clone() else {
            return;
        };
        let merged = self
            .aggregator
            .lock()
            .add_result(view.num_index_shards(), result);
        if let Some(merged) = merged {
            dispatch_merged_result(
                self.hub.as_ref(),
                &self.config,
                &view,
                self.node_id,
                &merged,
            );
        }
    }

    fn retry_pending_queries(&self, logspace_id: u32) {
        let parked = {
            let mut pending = self.pending_queries.lock();
            pending.remove(&logspace_id).unwrap_or_default()
        };
        for (query, aggregator_node_id) in parked {
            self.run_query(logspace_id, query, aggregator_node_id);
        }
    }

    fn dispatch_storage_read(&self, logspace_id: u32, result: &IndexQueryResult) {
        let Some(view) = self.view.lock().clone() else {
            return;
        };
        let shard_id = bits::join16(
            types::sequencer_of_logspace(logspace_id),
            result.found_engine_id,
        );
        let storage_id = view
            .get_index_node(self.node_id)
            .and_then(|info| info.pick_storage_node(shard_id));
        let Some(storage_id) = storage_id else {
            warn!(shard_id, "no storage replica for found result");
            self.respond(result, SharedLogResultType::LookupFailed);
            return;
        };
        let mut request = SharedLogMessage::new_read_at(result.found_seqnum);
        request.user_metalog_progress = result.metalog_progress;
        request.storage_shard_id = result.found_engine_id;
        // The response goes straight to the querying engine.
        request.origin_node_id = result.original_query.origin_node_id;
        request.hop_times = result.original_query.hop_times + 1;
        request.client_data = result.original_query.client_data;
        let sent = crate::network::send_with_retry(
            self.hub.as_ref(),
            ConnType::IndexToStorage,
            storage_id,
            &request,
            &[],
            self.config.max_send_retries,
        );
        if sent.is_err() {
            self.respond(result, SharedLogResultType::LookupFailed);
        }
    }

    fn respond(&self, result: &IndexQueryResult, result_type: SharedLogResultType) {
        let query = &result.original_query;
        let mut response = SharedLogMessage::new_response(result_type);
        response.user_metalog_progress = result.metalog_progress;
        response.origin_node_id = self.node_id;
        response.hop_times = query.hop_times + 1;
        response.client_data = query.client_data;
        if !self.hub.send(
            ConnType::IndexToEngine,
            query.origin_node_id,
            &response,
            &[],
        ) {
            warn!(
                engine = query.origin_node_id,
                "failed to send index response"
            );
        }
    }

    /// Drops merge state for queries from a departed engine.
    pub fn on_engine_offline(&self, engine_node_id: u16) {
        self.aggregator.lock().remove_engine_queries(engine_node_id);
    }
}

impl ViewLifecycleListener for IndexNode {
    fn on_view_created(&self, view: &Arc<View>) {
        *self.view.lock() = Some(Arc::clone(view));
        let caps = IndexCaps {
            per_tag_seqnums_limit: self.config.engine_per_tag_seqnums_limit,
            seqnum_suffix_cap: self.config.engine_seqnum_suffix_cap,
            tag_cache_cap: self.config.engine_tag_cache_cap,
        };
        let my_shards = view
            .get_index_node(self.node_id)
            .map(|info| info.index_shards().clone())
            .unwrap_or_default();
        let mut indexes = self.indexes.lock();
        for sequencer_id in view.active_sequencer_nodes() {
            let logspace_id = types::logspace_id(view.id(), sequencer_id);
            indexes.insert(
                logspace_id,
                Index::new_sharded(
                    logspace_id,
                    caps,
                    view.num_index_shards(),
                    my_shards.clone(),
                ),
            );
            info!(
                logspace = format_args!("{logspace_id:#x}"),
                shards = my_shards.len(),
                "serving phylog index"
            );
        }
    }

    fn on_view_frozen(&self, _view: &Arc<View>) {}

    fn on_view_finalized(&self, finalized: &Arc<FinalizedView>) {
        // Parked queries are answered Empty with the final horizon; the
        // engine-side retry targets the next view.
        let parked: Vec<(u32, Vec<(IndexQuery, u16)>)> =
            self.pending_queries.lock().drain().collect();
        for (logspace_id, queries) in parked {
            let progress = {
                let indexes = self.indexes.lock();
                indexes
                    .get(&logspace_id)
                    .map_or(0, Index::progress_token)
            };
            for (query, _) in queries {
                let result = IndexQueryResult {
                    state: QueryState::Empty,
                    found_seqnum: phylog_core::INVALID_SEQNUM,
                    found_engine_id: 0,
                    metalog_progress: progress,
                    original_query: query,
                };
                self.respond(&result, SharedLogResultType::Empty);
            }
        }
        self.indexes.lock().clear();
        *self.aggregator.lock() = QueryAggregator::new();
        *self.view.lock() = None;
        let _ = finalized;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::InProcessHub;
    use crate::view::ViewSpec;
    use bytes::Bytes;
    use phylog_core::EMPTY_TAG;

    fn spec(num_index_shards: usize, index_nodes: Vec<u16>) -> ViewSpec {
        ViewSpec {
            view_id: 1,
            metalog_replicas: 1,
            userlog_replicas: 1,
            index_replicas: 1,
            num_index_shards,
            num_phylogs: 1,
            storage_shards_per_sequencer: 1,
            sequencer_nodes: vec![10],
            storage_nodes: vec![20],
            index_nodes,
            aggregator_nodes: vec![],
            log_space_hash_seed: 1,
            log_space_hash_tokens: vec![],
            hash_token_count: 4,
        }
    }

    fn test_view() -> Arc<View> {
        Arc::new(View::new(&spec(1, vec![30])).unwrap())
    }

    fn node_with_view(hub: Arc<InProcessHub>, node_id: u16, view: &Arc<View>) -> Arc<IndexNode> {
        let config = Arc::new(ServerConfig {
            node_id,
            ..ServerConfig::default()
        });
        let node = IndexNode::new(config, hub);
        node.on_view_created(view);
        node
    }

    fn node(hub: Arc<InProcessHub>) -> Arc<IndexNode> {
        node_with_view(hub, 30, &test_view())
    }

    fn index_data_delivery(logspace_id: u32, seqnums: Vec<u32>, tag: u64) -> Delivery {
        let pkg = IndexDataPackage {
            logspace_id,
            metalog_position: 1,
            end_seqnum_position: seqnums.iter().max().map_or(0, |&m| m + 1),
            num_productive_storage_shards: 1,
            my_productive_shards: vec![0],
            engine_ids: vec![0; seqnums.len()],
            user_logspaces: vec![7; seqnums.len()],
            tag_sizes: vec![1; seqnums.len()],
            tags: vec![tag; seqnums.len()],
            seqnum_lowhalves: seqnums,
        };
        Delivery {
            conn_type: ConnType::StorageToIndex,
            message: SharedLogMessage::new_index_data(logspace_id),
            payload: Bytes::from(payload::encode(&vec![pkg])),
        }
    }

    fn read_next_delivery(logspace_id: u32, tag: u64, progress: u64) -> Delivery {
        let mut message = SharedLogMessage::new(SharedLogOpType::ReadNext);
        message.logspace_id = logspace_id;
        message.user_logspace = 7;
        message.query_tag = tag;
        message.seqnum_lowhalf = 0;
        message.user_metalog_progress = progress;
        message.origin_node_id = 1;
        message.client_data = 99;
        Delivery {
            conn_type: ConnType::EngineToIndex,
            message,
            payload: Bytes::new(),
        }
    }

    #[test]
    fn found_query_dispatches_read_at_to_storage() {
        let hub = Arc::new(InProcessHub::new());
        let mut storage_inbox = hub.register_node(20);
        let node = node(hub.clone());
        let logspace_id = types::logspace_id(1, 10);

        node.handle_message(&index_data_delivery(logspace_id, vec![0], 42))
            .unwrap();
        node.handle_message(&read_next_delivery(logspace_id, 42, 0))
            .unwrap();

        let dispatched = storage_inbox.try_recv().unwrap();
        assert_eq!(dispatched.message.op_type, SharedLogOpType::ReadAt);
        assert_eq!(
            dispatched.message.full_seqnum(),
            types::seqnum(logspace_id, 0)
        );
        // The response will route straight to the querying engine.
        assert_eq!(dispatched.message.origin_node_id, 1);
        assert_eq!(dispatched.message.client_data, 99);
    }

    #[test]
    fn empty_query_answers_engine() {
        let hub = Arc::new(InProcessHub::new());
        let mut engine_inbox = hub.register_node(1);
        let node = node(hub.clone());
        let logspace_id = types::logspace_id(1, 10);

        node.handle_message(&read_next_delivery(logspace_id, 42, 0))
            .unwrap();
        let response = engine_inbox.try_recv().unwrap();
        assert_eq!(response.message.op_type, SharedLogOpType::Response);
        assert_eq!(response.message.result_type, SharedLogResultType::Empty);
        assert_eq!(response.message.client_data, 99);
    }

    #[test]
    fn progress_gated_query_parks_until_horizon_advances() {
        let hub = Arc::new(InProcessHub::new());
        let mut storage_inbox = hub.register_node(20);
        let _engine_inbox = hub.register_node(1);
        let node = node(hub.clone());
        let logspace_id = types::logspace_id(1, 10);

        // The engine requires progress 1 before the index applied anything.
        node.handle_message(&read_next_delivery(
            logspace_id,
            42,
            bits::join32(logspace_id, 1),
        ))
        .unwrap();
        assert!(storage_inbox.try_recv().is_err());

        // Index data arrives, horizon advances, the parked query re-runs
        // and finds the record.
        node.handle_message(&index_data_delivery(logspace_id, vec![0], 42))
            .unwrap();
        let dispatched = storage_inbox.try_recv().unwrap();
        assert_eq!(dispatched.message.op_type, SharedLogOpType::ReadAt);
    }

    #[test]
    fn unknown_phylog_is_lookup_failure() {
        let hub = Arc::new(InProcessHub::new());
        let mut engine_inbox = hub.register_node(1);
        let node = node(hub.clone());

        node.handle_message(&read_next_delivery(0xdead_beef, 42, 0))
            .unwrap();
        let response = engine_inbox.try_recv().unwrap();
        assert_eq!(
            response.message.result_type,
            SharedLogResultType::LookupFailed
        );
    }

    #[test]
    fn unowned_tag_is_lookup_failure() {
        // Two shards, this node serves only shard 0: tag 43 is not ours.
        let hub = Arc::new(InProcessHub::new());
        let mut engine_inbox = hub.register_node(1);
        let view = Arc::new(View::new(&spec(2, vec![30, 31])).unwrap());
        let node = node_with_view(hub.clone(), 30, &view);
        let logspace_id = types::logspace_id(1, 10);

        node.handle_message(&read_next_delivery(logspace_id, 43, 0))
            .unwrap();
        let response = engine_inbox.try_recv().unwrap();
        assert_eq!(
            response.message.result_type,
            SharedLogResultType::LookupFailed
        );
    }

    #[test]
    fn fanned_out_query_sends_slave_result_to_aggregator() {
        let hub = Arc::new(InProcessHub::new());
        let mut aggregator_inbox = hub.register_node(40);
        let view = Arc::new(View::new(&spec(2, vec![30, 31])).unwrap());
        let node = node_with_view(hub.clone(), 30, &view);
        let logspace_id = types::logspace_id(1, 10);

        node.handle_message(&index_data_delivery(logspace_id, vec![0], 42))
            .unwrap();
        let mut delivery = read_next_delivery(logspace_id, EMPTY_TAG, 0);
        delivery.message.aggregator_node_id = 40;
        node.handle_message(&delivery).unwrap();

        let slave = aggregator_inbox.try_recv().unwrap();
        assert_eq!(slave.conn_type, ConnType::IndexToAggregator);
        assert_eq!(slave.message.op_type, SharedLogOpType::SlaveResult);
        let result: IndexQueryResult = payload::decode(&slave.payload).unwrap();
        assert_eq!(result.state, QueryState::Found);
        assert_eq!(result.found_seqnum, types::seqnum(logspace_id, 0));
    }

    #[test]
    fn master_merges_own_and_slave_results() {
        // Node 30 masters a two-shard fan-out: its own slice answers
        // Empty, the slave's Found wins the merge and dispatches a read.
        let hub = Arc::new(InProcessHub::new());
        let mut storage_inbox = hub.register_node(20);
        let view = Arc::new(View::new(&spec(2, vec![30, 31])).unwrap());
        let node = node_with_view(hub.clone(), 30, &view);
        let logspace_id = types::logspace_id(1, 10);

        // Fan-out arrives with this node as the merge target; shard 0 has
        // nothing, so the node feeds its own aggregator with Empty.
        let mut delivery = read_next_delivery(logspace_id, EMPTY_TAG, 0);
        delivery.message.aggregator_node_id = 30;
        node.handle_message(&delivery).unwrap();
        assert!(storage_inbox.try_recv().is_err());

        // The slave (shard 1) found seqnum 1.
        let slave_result = IndexQueryResult {
            state: QueryState::Found,
            found_seqnum: types::seqnum(logspace_id, 1),
            found_engine_id: 0,
            metalog_progress: bits::join32(logspace_id, 1),
            original_query: IndexQuery {
                direction: QueryDirection::ReadNext,
                origin_node_id: 1,
                hop_times: 0,
                client_data: 99,
                user_logspace: 7,
                tag: EMPTY_TAG,
                query_seqnum: 0,
                metalog_progress: 0,
            },
        };
        let mut message = SharedLogMessage::new(SharedLogOpType::SlaveResult);
        message.logspace_id = logspace_id;
        message.origin_node_id = 31;
        message.client_data = 99;
        node.handle_message(&Delivery {
            conn_type: ConnType::IndexToAggregator,
            message,
            payload: Bytes::from(payload::encode(&slave_result)),
        })
        .unwrap();

        let dispatched = storage_inbox.try_recv().unwrap();
        assert_eq!(dispatched.message.op_type, SharedLogOpType::ReadAt);
        assert_eq!(
            dispatched.message.full_seqnum(),
            types::seqnum(logspace_id, 1)
        );
    }

    #[test]
    fn finalization_answers_parked_queries_empty() {
        let hub = Arc::new(InProcessHub::new());
        let mut engine_inbox = hub.register_node(1);
        let node = node(hub.clone());
        let view = test_view();
        let logspace_id = types::logspace_id(1, 10);

        node.handle_message(&read_next_delivery(
            logspace_id,
            42,
            bits::join32(logspace_id, 5),
        ))
        .unwrap();
        node.on_view_finalized(&Arc::new(FinalizedView::new(view, HashMap::new())));

        let response = engine_inbox.try_recv().unwrap();
        assert_eq!(response.message.result_type, SharedLogResultType::Empty);
    }
}
