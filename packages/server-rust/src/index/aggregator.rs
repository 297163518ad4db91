//! Result merging across index shards, and the aggregator node role.
//!
//! A phylog's tags are partitioned across index shards, so a tag-less seek
//! fans out one query per shard and the per-shard answers must merge before
//! anything is sent back. [`QueryAggregator`] is the merge core.
//! [`AggregatorNode`] runs it as a dedicated role when the view has
//! aggregator nodes; without them, one of the queried index nodes acts as
//! master and feeds the same machinery with its slaves' results.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use phylog_core::messages::payload;
use phylog_core::messages::{ConnType, SharedLogMessage, SharedLogOpType, SharedLogResultType};
use phylog_core::types;
use phylog_core::bits;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::index::{IndexQueryResult, QueryDirection, QueryState};
use crate::network::{Delivery, MessageHub};
use crate::view::{FinalizedView, View, ViewLifecycleListener};

// ---------------------------------------------------------------------------
// QueryAggregator
// ---------------------------------------------------------------------------

/// Per-query merge state, keyed by the query's `client_data` token.
#[derive(Debug, Default)]
struct PendingMerge {
    expected: usize,
    results: Vec<IndexQueryResult>,
}

/// Merges sharded index query results into a single answer.
#[derive(Debug, Default)]
pub struct QueryAggregator {
    pending: HashMap<u64, PendingMerge>,
}

impl QueryAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queries still awaiting results.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Adds one shard's result; returns the merged answer once all
    /// `expected` shards have reported.
    pub fn add_result(
        &mut self,
        expected: usize,
        result: IndexQueryResult,
    ) -> Option<IndexQueryResult> {
        let key = result.original_query.client_data;
        let merge = self.pending.entry(key).or_default();
        merge.expected = expected;
        merge.results.push(result);
        if merge.results.len() < merge.expected {
            return None;
        }
        let merge = self.pending.remove(&key).unwrap();
        Some(Self::merge(merge.results))
    }

    /// Drops merge state for queries abandoned by a departing engine.
    pub fn remove_engine_queries(&mut self, engine_node_id: u16) {
        self.pending.retain(|_, merge| {
            merge
                .results
                .first()
                .map_or(true, |r| r.original_query.origin_node_id != engine_node_id)
        });
    }

    fn merge(results: Vec<IndexQueryResult>) -> IndexQueryResult {
        debug_assert!(!results.is_empty());
        let direction = results[0].original_query.direction;
        let max_progress = results
            .iter()
            .map(|r| r.metalog_progress)
            .max()
            .unwrap_or(0);

        let best_found = results
            .iter()
            .filter(|r| r.state == QueryState::Found)
            .min_by_key(|r| match direction {
                QueryDirection::ReadNext | QueryDirection::ReadNextBlocking => {
                    r.found_seqnum
                }
                // Invert for prev: the max seqnum wins.
                QueryDirection::ReadPrev => u64::MAX - r.found_seqnum,
            });
        if let Some(found) = best_found {
            let mut merged = *found;
            merged.metalog_progress = max_progress;
            return merged;
        }

        // No shard found a match: a single Miss poisons the whole answer
        // (some shard cannot prove emptiness), then Continue, then Empty.
        let state = if results.iter().any(|r| r.state == QueryState::Miss) {
            QueryState::Miss
        } else if results.iter().any(|r| r.state == QueryState::Continue) {
            QueryState::Continue
        } else {
            QueryState::Empty
        };
        let mut merged = results[0];
        merged.state = state;
        merged.found_seqnum = phylog_core::INVALID_SEQNUM;
        merged.found_engine_id = 0;
        merged.metalog_progress = max_progress;
        merged
    }
}

// ---------------------------------------------------------------------------
// Merged-result dispatch
// ---------------------------------------------------------------------------

/// Acts on a fully merged answer: `Found` dispatches a `ReadAt` to a
/// storage replica of the owning shard (the record then flows straight to
/// the querying engine); everything else is answered to the engine over
/// the aggregator-to-engine connection.
pub(crate) fn dispatch_merged_result(
    hub: &dyn MessageHub,
    config: &ServerConfig,
    view: &View,
    responder_node_id: u16,
    merged: &IndexQueryResult,
) {
    let query = &merged.original_query;
    match merged.state {
        QueryState::Found => {
            let logspace_id = types::logspace_of_seqnum(merged.found_seqnum);
            let shard_id = bits::join16(
                types::sequencer_of_logspace(logspace_id),
                merged.found_engine_id,
            );
            let Some(shard) = view.get_storage_shard(shard_id) else {
                warn!(shard_id, "merged result names unknown storage shard");
                respond_failure(hub, responder_node_id, merged, SharedLogResultType::LookupFailed);
                return;
            };
            let mut request = SharedLogMessage::new_read_at(merged.found_seqnum);
            request.user_metalog_progress = merged.metalog_progress;
            request.storage_shard_id = merged.found_engine_id;
            request.origin_node_id = query.origin_node_id;
            request.hop_times = query.hop_times + 1;
            request.client_data = query.client_data;
            for _ in 0..config.max_send_retries {
                let storage_id = shard.pick_storage_node();
                if hub.send(ConnType::IndexToStorage, storage_id, &request, &[]) {
                    return;
                }
            }
            warn!(shard_id, "failed to dispatch merged read");
            respond_failure(hub, responder_node_id, merged, SharedLogResultType::LookupFailed);
        }
        QueryState::Empty => {
            respond_failure(hub, responder_node_id, merged, SharedLogResultType::Empty);
        }
        QueryState::Miss | QueryState::Continue => {
            respond_failure(
                hub,
                responder_node_id,
                merged,
                SharedLogResultType::LookupFailed,
            );
        }
    }
}

fn respond_failure(
    hub: &dyn MessageHub,
    responder_node_id: u16,
    merged: &IndexQueryResult,
    result_type: SharedLogResultType,
) {
    let query = &merged.original_query;
    let mut response = SharedLogMessage::new_response(result_type);
    response.user_metalog_progress = merged.metalog_progress;
    response.origin_node_id = responder_node_id;
    response.hop_times = query.hop_times + 1;
    response.client_data = query.client_data;
    if !hub.send(
        ConnType::AggregatorToEngine,
        query.origin_node_id,
        &response,
        &[],
    ) {
        warn!(engine = query.origin_node_id, "failed to send merged response");
    }
}

// ---------------------------------------------------------------------------
// AggregatorNode
// ---------------------------------------------------------------------------

/// Dedicated aggregator role: receives one `SlaveResult` per index shard
/// for each fanned-out query and acts on the merged answer.
pub struct AggregatorNode {
    node_id: u16,
    config: Arc<ServerConfig>,
    hub: Arc<dyn MessageHub>,
    view: Mutex<Option<Arc<View>>>,
    aggregator: Mutex<QueryAggregator>,
    merged_results: AtomicU64,
}

impl AggregatorNode {
    #[must_use]
    pub fn new(config: Arc<ServerConfig>, hub: Arc<dyn MessageHub>) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.node_id,
            config,
            hub,
            view: Mutex::new(None),
            aggregator: Mutex::new(QueryAggregator::new()),
            merged_results: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// Queries merged so far.
    #[must_use]
    pub fn merged_results(&self) -> u64 {
        self.merged_results.load(Ordering::Relaxed)
    }

    /// Handles one delivered message.
    ///
    /// # Errors
    ///
    /// Propagates payload decode failures.
    pub fn handle_message(&self, delivery: &Delivery) -> Result<()> {
        let message = &delivery.message;
        match message.op_type {
            SharedLogOpType::SlaveResult => {
                let result: IndexQueryResult = payload::decode(&delivery.payload)?;
                self.handle_slave_result(result);
                Ok(())
            }
            // Aggregators subscribe to the metalog stream like the rest of
            // the index tier but have no positions of their own to track.
            SharedLogOpType::Metalogs => Ok(()),
            _ => {
                warn!(op_type = ?message.op_type, "unexpected op type at aggregator");
                Ok(())
            }
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
            self.merged_results.fetch_add(1, Ordering::Relaxed);
            dispatch_merged_result(
                self.hub.as_ref(),
                &self.config,
                &view,
                self.node_id,
                &merged,
            );
        }
    }

    /// Drops merge state for queries from a departed engine.
    pub fn on_engine_offline(&self, engine_node_id: u16) {
        self.aggregator.lock().remove_engine_queries(engine_node_id);
    }
}

impl ViewLifecycleListener for AggregatorNode {
    fn on_view_created(&self, view: &Arc<View>) {
        *self.view.lock() = Some(Arc::clone(view));
        info!(view_id = view.id(), "aggregator serving view");
    }

    fn on_view_frozen(&self, _view: &Arc<View>) {}

    fn on_view_finalized(&self, _finalized: &Arc<FinalizedView>) {
        *self.aggregator.lock() = QueryAggregator::new();
        *self.view.lock() = None;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexQuery;
    use crate::network::InProcessHub;
    use crate::view::ViewSpec;
    use bytes::Bytes;
    use phylog_core::types;

    const LOGSPACE: u32 = 0x0001_000a;

    fn result(
        direction: QueryDirection,
        state: QueryState,
        seqnum: u64,
        progress: u64,
        client_data: u64,
    ) -> IndexQueryResult {
        IndexQueryResult {
            state,
            found_seqnum: seqnum,
            found_engine_id: 0,
            metalog_progress: progress,
            original_query: IndexQuery {
                direction,
                origin_node_id: 1,
                hop_times: 0,
                client_data,
                user_logspace: 7,
                tag: 42,
                query_seqnum: 0,
                metalog_progress: 0,
            },
        }
    }

    #[test]
    fn merges_min_found_for_read_next() {
        let mut agg = QueryAggregator::new();
        let a = result(
            QueryDirection::ReadNext,
            QueryState::Found,
            types::seqnum(LOGSPACE, 9),
            1,
            5,
        );
        let b = result(
            QueryDirection::ReadNext,
            QueryState::Found,
            types::seqnum(LOGSPACE, 3),
            2,
            5,
        );
        assert!(agg.add_result(2, a).is_none());
        let merged = agg.add_result(2, b).unwrap();
        assert_eq!(merged.state, QueryState::Found);
        assert_eq!(merged.found_seqnum, types::seqnum(LOGSPACE, 3));
        // Progress is the max across shards.
        assert_eq!(merged.metalog_progress, 2);
        assert_eq!(agg.pending_count(), 0);
    }

    #[test]
    fn merges_max_found_for_read_prev() {
        let mut agg = QueryAggregator::new();
        let a = result(
            QueryDirection::ReadPrev,
            QueryState::Found,
            types::seqnum(LOGSPACE, 3),
            1,
            5,
        );
        let b = result(
            QueryDirection::ReadPrev,
            QueryState::Found,
            types::seqnum(LOGSPACE, 9),
            1,
            5,
        );
        agg.add_result(2, a);
        let merged = agg.add_result(2, b).unwrap();
        assert_eq!(merged.found_seqnum, types::seqnum(LOGSPACE, 9));
    }

    #[test]
    fn found_beats_empty() {
        let mut agg = QueryAggregator::new();
        let a = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 5);
        let b = result(
            QueryDirection::ReadNext,
            QueryState::Found,
            types::seqnum(LOGSPACE, 4),
            1,
            5,
        );
        agg.add_result(2, a);
        let merged = agg.add_result(2, b).unwrap();
        assert_eq!(merged.state, QueryState::Found);
    }

    #[test]
    fn miss_poisons_empty() {
        let mut agg = QueryAggregator::new();
        let a = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 5);
        let b = result(QueryDirection::ReadNext, QueryState::Miss, 0, 1, 5);
        agg.add_result(2, a);
        let merged = agg.add_result(2, b).unwrap();
        assert_eq!(merged.state, QueryState::Miss);
    }

    #[test]
    fn continue_beats_empty_but_not_miss() {
        let mut agg = QueryAggregator::new();
        let a = result(QueryDirection::ReadNext, QueryState::Continue, 0, 3, 5);
        let b = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 5);
        agg.add_result(2, a);
        let merged = agg.add_result(2, b).unwrap();
        assert_eq!(merged.state, QueryState::Continue);
        assert_eq!(merged.metalog_progress, 3);
    }

    #[test]
    fn distinct_queries_merge_independently() {
        let mut agg = QueryAggregator::new();
        let a = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 5);
        let b = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 6);
        assert!(agg.add_result(2, a).is_none());
        assert!(agg.add_result(2, b).is_none());
        assert_eq!(agg.pending_count(), 2);
    }

    #[test]
    fn remove_engine_queries_drops_pending() {
        let mut agg = QueryAggregator::new();
        let a = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 5);
        agg.add_result(2, a);
        agg.remove_engine_queries(1);
        assert_eq!(agg.pending_count(), 0);
    }

    // -- AggregatorNode --

    fn test_view() -> Arc<View> {
        Arc::new(
            View::new(&ViewSpec {
                view_id: 1,
                metalog_replicas: 1,
                userlog_replicas: 1,
                index_replicas: 1,
                num_index_shards: 2,
                num_phylogs: 1,
                storage_shards_per_sequencer: 1,
                sequencer_nodes: vec![10],
                storage_nodes: vec![20],
                index_nodes: vec![30, 31],
                aggregator_nodes: vec![40],
                log_space_hash_seed: 1,
                log_space_hash_tokens: vec![],
                hash_token_count: 4,
            })
            .unwrap(),
        )
    }

    fn slave_delivery(result: &IndexQueryResult) -> Delivery {
        let mut message = SharedLogMessage::new(SharedLogOpType::SlaveResult);
        message.client_data = result.original_query.client_data;
        Delivery {
            conn_type: ConnType::IndexToAggregator,
            message,
            payload: Bytes::from(payload::encode(result)),
        }
    }

    fn node(hub: Arc<InProcessHub>) -> Arc<AggregatorNode> {
        let config = Arc::new(ServerConfig {
            node_id: 40,
            ..ServerConfig::default()
        });
        let node = AggregatorNode::new(config, hub);
        node.on_view_created(&test_view());
        node
    }

    #[test]
    fn merged_found_dispatches_read_at() {
        let hub = Arc::new(InProcessHub::new());
        let mut storage_inbox = hub.register_node(20);
        let node = node(hub.clone());
        // Two shards: shard 0 found seqnum 4, shard 1 empty.
        let logspace = phylog_core::types::logspace_id(1, 10);
        let found = result(
            QueryDirection::ReadNext,
            QueryState::Found,
            types::seqnum(logspace, 4),
            1,
            9,
        );
        let empty = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 9);

        node.handle_message(&slave_delivery(&found)).unwrap();
        assert!(storage_inbox.try_recv().is_err());
        node.handle_message(&slave_delivery(&empty)).unwrap();

        let dispatched = storage_inbox.try_recv().unwrap();
        assert_eq!(dispatched.message.op_type, SharedLogOpType::ReadAt);
        assert_eq!(
            dispatched.message.full_seqnum(),
            types::seqnum(logspace, 4)
        );
        // The response routes straight to the querying engine.
        assert_eq!(dispatched.message.origin_node_id, 1);
        assert_eq!(node.merged_results(), 1);
    }

    #[test]
    fn merged_empty_answers_engine() {
        let hub = Arc::new(InProcessHub::new());
        let mut engine_inbox = hub.register_node(1);
        let node = node(hub.clone());

        let a = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 9);
        let b = result(QueryDirection::ReadNext, QueryState::Empty, 0, 2, 9);
        node.handle_message(&slave_delivery(&a)).unwrap();
        node.handle_message(&slave_delivery(&b)).unwrap();

        let response = engine_inbox.try_recv().unwrap();
        assert_eq!(response.conn_type, ConnType::AggregatorToEngine);
        assert_eq!(response.message.result_type, SharedLogResultType::Empty);
        assert_eq!(response.message.user_metalog_progress, 2);
    }

    #[test]
    fn engine_offline_clears_pending_merges() {
        let hub = Arc::new(InProcessHub::new());
        let node = node(hub);
        let a = result(QueryDirection::ReadNext, QueryState::Empty, 0, 1, 9);
        node.handle_message(&slave_delivery(&a)).unwrap();
        assert_eq!(node.aggregator.lock().pending_count(), 1);
        node.on_engine_offline(1);
        assert_eq!(node.aggregator.lock().pending_count(), 0);
    }
}
