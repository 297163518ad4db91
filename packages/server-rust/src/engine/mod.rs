//! Engine: the front door function workers talk to.
//!
//! Appends replicate fire-and-forget to the owning shard's storage nodes
//! and park in the [`LogProducer`]; the `APPEND_OK` only goes back to the
//! worker once the covering metalog entry is applied here, which makes the
//! local apply the write's linearization point. Reads consult the local
//! cache, then the local per-phylog index, and fall back to the index tier.

pub mod cache;
pub mod producer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use phylog_core::messages::payload;
use phylog_core::messages::{
    ConnType, IndexDataPackage, MetaLogEntry, ReadResponsePayload, ReplicatePayload,
    SharedLogMessage, SharedLogOpType, SharedLogResultType, WorkerOpType, WorkerRequest,
    WorkerResponse,
};
use phylog_core::types::{self, INVALID_CALL_ID, INVALID_NODE_ID, INVALID_SEQNUM, INVALID_TAG};
use phylog_core::{bits, LogMetaData};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::index::{Index, IndexCaps, IndexQuery, IndexQueryResult, QueryDirection, QueryState};
use crate::network::MessageHub;
use crate::view::{FinalizedView, View, ViewLifecycleListener};

pub use cache::LogCache;
pub use producer::{AppendResult, LogProducer};

/// Storage `ReadAt` hops beyond this indicate a routing loop.
const MAX_READ_HOPS: u16 = 8;

// ---------------------------------------------------------------------------
// LocalOp
// ---------------------------------------------------------------------------

/// One in-flight worker operation.
#[derive(Debug, Clone)]
pub struct LocalOp {
    pub id: u64,
    pub client_id: u16,
    pub client_data: u64,
    pub call_id: u64,
    pub user_logspace: u32,
    pub metalog_progress: u64,
    pub op_type: WorkerOpType,
    pub seqnum: u64,
    pub query_tag: u64,
    pub user_tags: Vec<u64>,
    pub data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// FnCallContext
// ---------------------------------------------------------------------------

/// Per-function-call state: the call's logspace and the metalog progress it
/// has observed. Internal calls inherit the parent's progress; progress
/// only moves forward within a call.
#[derive(Debug, Clone, Copy)]
pub struct FnCallContext {
    pub user_logspace: u32,
    pub metalog_progress: u64,
    pub parent_call_id: u64,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct ViewState {
    current: Option<Arc<View>>,
    active: bool,
    missed: Option<Arc<View>>,
}

/// Engine node state.
pub struct Engine {
    node_id: u16,
    config: Arc<ServerConfig>,
    hub: Arc<dyn MessageHub>,
    views: Mutex<ViewState>,
    producers: Mutex<HashMap<u32, LogProducer>>,
    local_indexes: Mutex<HashMap<u32, Index>>,
    fn_ctx: Mutex<HashMap<u64, FnCallContext>>,
    ongoing_ops: Mutex<HashMap<u64, LocalOp>>,
    next_op_id: AtomicU64,
    cache: Option<LogCache>,
    postpone_registration: AtomicBool,
    postpone_caching: AtomicBool,
    registered: AtomicBool,
    responses_tx: mpsc::UnboundedSender<WorkerResponse>,
}

impl Engine {
    /// Builds an engine; the returned receiver yields worker responses.
    #[must_use]
    pub fn new(
        config: Arc<ServerConfig>,
        hub: Arc<dyn MessageHub>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<WorkerResponse>) {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        let postpone_registration =
            config.node_matches_moduli(&config.engine_postpone_registration);
        let postpone_caching = config.node_matches_moduli(&config.engine_postpone_caching);
        if postpone_registration {
            info!(node_id = config.node_id, "postponing registration");
        }
        if postpone_caching {
            info!(node_id = config.node_id, "postponing caching");
        }
        let cache = config
            .engine_enable_cache
            .then(|| LogCache::new(config.engine_cache_cap_mb));
        let engine = Arc::new(Self {
            node_id: config.node_id,
            config,
            hub,
            views: Mutex::new(ViewState {
                current: None,
                active: false,
                missed: None,
            }),
            producers: Mutex::new(HashMap::new()),
            local_indexes: Mutex::new(HashMap::new()),
            fn_ctx: Mutex::new(HashMap::new()),
            ongoing_ops: Mutex::new(HashMap::new()),
            next_op_id: AtomicU64::new(0),
            cache,
            postpone_registration: AtomicBool::new(postpone_registration),
            postpone_caching: AtomicBool::new(postpone_caching),
            registered: AtomicBool::new(false),
            responses_tx,
        });
        (engine, responses_rx)
    }

    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    /// The storage shard this engine appends through in the current view.
    fn local_shard_id(&self, view: &View) -> u16 {
        self.node_id % view.storage_shards_per_sequencer() as u16
    }

    // --- function-call context -------------------------------------------

    /// Registers a call arriving from outside the system.
    pub fn on_new_external_func_call(&self, call_id: u64, user_logspace: u32) {
        let mut ctx = self.fn_ctx.lock();
        if ctx.contains_key(&call_id) {
            error!(call_id, "function call already exists");
            return;
        }
        ctx.insert(
            call_id,
            FnCallContext {
                user_logspace,
                metalog_progress: 0,
                parent_call_id: INVALID_CALL_ID,
            },
        );
    }

    /// Registers an internal call; it inherits the parent's logspace and
    /// metalog progress.
    pub fn on_new_internal_func_call(&self, call_id: u64, parent_call_id: u64) {
        let mut ctx = self.fn_ctx.lock();
        if ctx.contains_key(&call_id) {
            error!(call_id, "function call already exists");
            return;
        }
        let Some(parent) = ctx.get(&parent_call_id).copied() else {
            error!(parent_call_id, "cannot find parent function call");
            return;
        };
        ctx.insert(
            call_id,
            FnCallContext {
                user_logspace: parent.user_logspace,
                metalog_progress: parent.metalog_progress,
                parent_call_id,
            },
        );
    }

    pub fn on_func_call_completed(&self, call_id: u64) {
        if self.fn_ctx.lock().remove(&call_id).is_none() {
            warn!(call_id, "cannot find function call");
        }
    }

    #[must_use]
    pub fn call_metalog_progress(&self, call_id: u64) -> Option<u64> {
        self.fn_ctx.lock().get(&call_id).map(|c| c.metalog_progress)
    }

    // --- worker requests --------------------------------------------------

    /// Entry point for one worker request.
    pub fn handle_worker_request(&self, request: WorkerRequest) {
        let Some(ctx) = self.fn_ctx.lock().get(&request.call_id).copied() else {
            error!(call_id = request.call_id, "cannot find function call");
            return;
        };

        // Postponed engines ack immediately with no side effects so
        // steady-state experiments skip startup transients.
        if self.postpone_caching.load(Ordering::Acquire)
            || !self.registered.load(Ordering::Acquire)
        {
            self.send_response(WorkerResponse {
                client_data: request.client_data,
                ..WorkerResponse::of(request.op.ok_result(), INVALID_SEQNUM, 0)
            });
            return;
        }

        let op = LocalOp {
            id: self.next_op_id.fetch_add(1, Ordering::AcqRel),
            client_id: request.client_id,
            client_data: request.client_data,
            call_id: request.call_id,
            user_logspace: ctx.user_logspace,
            metalog_progress: ctx.metalog_progress,
            op_type: request.op,
            seqnum: request.seqnum,
            query_tag: request.tag,
            user_tags: request.tags,
            data: request.data,
        };
        match op.op_type {
            WorkerOpType::Append => self.handle_local_append(op),
            WorkerOpType::ReadNext | WorkerOpType::ReadPrev | WorkerOpType::ReadNextBlocking => {
                self.handle_local_read(op);
            }
            WorkerOpType::Trim => self.handle_local_trim(&op),
            WorkerOpType::SetAuxData => self.handle_local_set_auxdata(op),
        }
    }

    fn handle_local_append(&self, op: LocalOp) {
        let Some(view) = self.active_view() else {
            self.finish_op_with_failure(&op, SharedLogResultType::Discarded, 0);
            return;
        };
        let logspace_id = view.logspace_id(op.user_logspace);
        let shard_id = bits::join16(
            types::sequencer_of_logspace(logspace_id),
            self.local_shard_id(&view),
        );
        let Some(shard) = view.get_storage_shard(shard_id) else {
            self.finish_op_with_failure(&op, SharedLogResultType::Discarded, 0);
            return;
        };

        let localid = {
            let mut producers = self.producers.lock();
            let Some(producer) = producers.get_mut(&logspace_id) else {
                drop(producers);
                self.finish_op_with_failure(&op, SharedLogResultType::Discarded, 0);
                return;
            };
            let (localid, _next_seqnum) = producer.local_append(op.id);
            localid
        };

        let metadata = LogMetaData {
            user_logspace: op.user_logspace,
            seqnum: INVALID_SEQNUM,
            localid,
            num_tags: op.user_tags.len(),
            data_size: op.data.len(),
        };
        self.replicate_log_entry(shard.storage_nodes(), logspace_id, &metadata, &op);
        self.ongoing_ops.lock().insert(op.id, op);
    }

    fn replicate_log_entry(
        &self,
        storage_nodes: &[u16],
        logspace_id: u32,
        metadata: &LogMetaData,
        op: &LocalOp,
    ) {
        let mut message = SharedLogMessage::new_replicate(logspace_id);
        message.user_logspace = metadata.user_logspace;
        message.localid = metadata.localid;
        message.num_tags = metadata.num_tags as u16;
        message.origin_node_id = self.node_id;
        let bytes = payload::encode(&ReplicatePayload {
            tags: op.user_tags.clone(),
            data: op.data.clone(),
        });
        // Fire-and-forget: convergence is measured by storage-to-sequencer
        // shard progress, not per-replica acks.
        for &storage_id in storage_nodes {
            self.hub
                .send(ConnType::EngineToStorage, storage_id, &message, &bytes);
        }
    }

    fn handle_local_read(&self, op: LocalOp) {
        let Some(view) = self.active_view() else {
            self.finish_op_with_failure(&op, SharedLogResultType::Discarded, 0);
            return;
        };
        let logspace_id = view.logspace_id(op.user_logspace);
        let query = Self::build_index_query(&op);

        let use_remote = self.config.engine_force_remote_index
            || (self.config.engine_prob_remote_index > 0.0
                && rand::thread_rng().gen::<f32>() < self.config.engine_prob_remote_index);
        if !use_remote {
            let local_result = {
                let indexes = self.local_indexes.lock();
                indexes.get(&logspace_id).map(|index| index.make_query(query))
            };
            if let Some(result) = local_result {
                self.ongoing_ops.lock().insert(op.id, op);
                self.process_index_query_result(&view, logspace_id, result);
                return;
            }
        }
        self.ongoing_ops.lock().insert(op.id, op);
        self.send_index_tier_read_request(&view, logspace_id, &query);
    }

    fn build_index_query(op: &LocalOp) -> IndexQuery {
        IndexQuery {
            direction: match op.op_type {
                WorkerOpType::ReadPrev => QueryDirection::ReadPrev,
                WorkerOpType::ReadNextBlocking => QueryDirection::ReadNextBlocking,
                _ => QueryDirection::ReadNext,
            },
            origin_node_id: 0,
            hop_times: 0,
            client_data: op.id,
            user_logspace: op.user_logspace,
            tag: if op.query_tag == INVALID_TAG {
                phylog_core::EMPTY_TAG
            } else {
                op.query_tag
            },
            query_seqnum: if op.seqnum == INVALID_SEQNUM {
                0
            } else {
                op.seqnum
            },
            metalog_progress: op.metalog_progress,
        }
    }

    fn process_index_query_result(
        &self,
        view: &Arc<View>,
        logspace_id: u32,
        result: IndexQueryResult,
    ) {
        match result.state {
            QueryState::Found => {
                self.send_storage_read_request(view, logspace_id, &result);
            }
            QueryState::Continue | QueryState::Miss => {
                // The local index cannot prove an answer; fan out to the
                // index tier with the progress the index vouched for.
                let mut query = result.original_query;
                query.metalog_progress = query.metalog_progress.max(result.metalog_progress);
                self.send_index_tier_read_request(view, logspace_id, &query);
            }
            QueryState::Empty => {
                let op_id = result.original_query.client_data;
                if let Some(op) = self.ongoing_ops.lock().remove(&op_id) {
                    self.finish_op_with_failure(
                        &op,
                        SharedLogResultType::Empty,
                        result.metalog_progress,
                    );
                }
            }
        }
    }

    /// Batch re-dispatch of local-index misses to the index tier.
    pub fn process_local_index_misses(&self, results: &[IndexQueryResult], logspace_id: u32) {
        let Some(view) = self.active_view() else {
            return;
        };
        for result in results {
            debug_assert_eq!(result.state, QueryState::Miss);
            self.send_index_tier_read_request(view.as_ref(), logspace_id, &result.original_query);
        }
    }

    /// A tag query routes to the shard owning `tag % num_index_shards`; a
    /// tag-less query fans out one node per index shard, each carrying the
    /// merge target (an aggregator node, or one of the queried index nodes
    /// when the view has none).
    fn send_index_tier_read_request(
        &self,
        view: &View,
        logspace_id: u32,
        query: &IndexQuery,
    ) {
        let shard_id = bits::join16(
            types::sequencer_of_logspace(logspace_id),
            self.local_shard_id(view),
        );
        let Some(shard) = view.get_storage_shard(shard_id) else {
            return;
        };
        let targets: Vec<(u16, u16)> = if query.tag == phylog_core::EMPTY_TAG {
            let sharded_nodes = shard.pick_index_node_per_shard();
            let aggregator = shard.pick_aggregator_node(&sharded_nodes);
            sharded_nodes
                .into_iter()
                .map(|node| (node, aggregator))
                .collect()
        } else {
            vec![(shard.pick_index_node_by_tag(query.tag), INVALID_NODE_ID)]
        };

        let mut message = SharedLogMessage::new(match query.direction {
            QueryDirection::ReadNext => SharedLogOpType::ReadNext,
            QueryDirection::ReadPrev => SharedLogOpType::ReadPrev,
            QueryDirection::ReadNextBlocking => SharedLogOpType::ReadNextBlocking,
        });
        message.logspace_id = logspace_id;
        message.user_logspace = query.user_logspace;
        message.query_tag = query.tag;
        message.seqnum_lowhalf = types::position_of_seqnum(query.query_seqnum);
        message.user_metalog_progress = query.metalog_progress;
        message.origin_node_id = self.node_id;
        message.hop_times = query.hop_times;
        message.client_data = query.client_data;

        'targets: for (index_node, aggregator_node_id) in targets {
            message.aggregator_node_id = aggregator_node_id;
            for _ in 0..self.config.max_send_retries {
                if self
                    .hub
                    .send(ConnType::EngineToIndex, index_node, &message, &[])
                {
                    continue 'targets;
                }
            }
            warn!(index_node, "failed to send index tier read request");
        }
    }

    fn send_storage_read_request(
        &self,
        view: &View,
        logspace_id: u32,
        result: &IndexQueryResult,
    ) {
        debug_assert_eq!(result.state, QueryState::Found);
        // Serve from the engine cache before touching storage.
        let op_id = result.original_query.client_data;
        if let Some(cache) = &self.cache {
            if let Some(entry) = cache.get(result.found_seqnum) {
                if let Some(op) = self.ongoing_ops.lock().remove(&op_id) {
                    self.finish_read_with_entry(
                        &op,
                        result.found_seqnum,
                        result.metalog_progress,
                        entry.user_tags,
                        entry.data,
                        entry.aux_data,
                    );
                }
                return;
            }
        }

        let shard_id = bits::join16(
            types::sequencer_of_logspace(logspace_id),
            result.found_engine_id,
        );
        let Some(shard) = view.get_storage_shard(shard_id) else {
            warn!(shard_id, "found result names unknown storage shard");
            return;
        };
        let mut message = SharedLogMessage::new_read_at(result.found_seqnum);
        message.user_metalog_progress = result.metalog_progress;
        message.storage_shard_id = result.found_engine_id;
        message.origin_node_id = self.node_id;
        message.hop_times = result.original_query.hop_times + 1;
        message.client_data = op_id;
        for _ in 0..self.config.max_send_retries {
            let storage_id = shard.pick_storage_node();
            if self
                .hub
                .send(ConnType::EngineToStorage, storage_id, &message, &[])
            {
                return;
            }
        }
        warn!(shard_id, "failed to send storage read request");
    }

    fn handle_local_trim(&self, op: &LocalOp) {
        // Trim markers are metadata-only; reclamation happens during
        // persistence compaction.
        self.finish_op_with_success(op, SharedLogResultType::TrimOk, op.seqnum, op.metalog_progress);
    }

    fn handle_local_set_auxdata(&self, op: LocalOp) {
        if let Some(cache) = &self.cache {
            cache.put_aux_data(op.seqnum, op.data.clone());
        }
        if self.config.engine_propagate_auxdata {
            if let Some(view) = self.active_view() {
                let logspace_id = view.logspace_id(op.user_logspace);
                let shard_id = bits::join16(
                    types::sequencer_of_logspace(logspace_id),
                    self.local_shard_id(&view),
                );
                if let Some(shard) = view.get_storage_shard(shard_id) {
                    let mut message = SharedLogMessage::new_set_auxdata(op.seqnum);
                    message.origin_node_id = self.node_id;
                    for &storage_id in shard.storage_nodes() {
                        self.hub.send(
                            ConnType::EngineToStorage,
                            storage_id,
                            &message,
                            &op.data,
                        );
                    }
                }
            }
        }
        self.finish_op_with_success(
            &op,
            SharedLogResultType::AuxDataOk,
            op.seqnum,
            op.metalog_progress,
        );
    }

    // --- inter-node messages ----------------------------------------------

    /// Handles one delivered shared-log message.
    ///
    /// # Errors
    ///
    /// Propagates payload decode failures and FSM protocol violations.
    pub fn message_handler(&self, message: &SharedLogMessage, payload_bytes: &[u8]) -> Result<()> {
        match message.op_type {
            SharedLogOpType::Metalogs => self.on_recv_new_metalogs(payload_bytes),
            SharedLogOpType::IndexData => self.on_recv_new_index_data(payload_bytes),
            SharedLogOpType::Response => {
                self.on_recv_response(message, payload_bytes);
                Ok(())
            }
            SharedLogOpType::Register => {
                self.registered.store(true, Ordering::Release);
                Ok(())
            }
            _ => {
                warn!(op_type = ?message.op_type, "unexpected op type at engine");
                Ok(())
            }
        }
    }

    fn on_recv_new_metalogs(&self, payload_bytes: &[u8]) -> Result<()> {
        let entries: Vec<MetaLogEntry> = payload::decode(payload_bytes)?;
        let mut resolved = Vec::new();
        {
            let mut producers = self.producers.lock();
            for entry in entries {
                let Some(producer) = producers.get_mut(&entry.logspace_id) else {
                    continue;
                };
                producer.provide_metalog(entry)?;
                resolved.append(&mut producer.poll_append_results());
            }
        }
        self.process_append_results(&resolved);
        Ok(())
    }

    fn on_recv_new_index_data(&self, payload_bytes: &[u8]) -> Result<()> {
        let packages: Vec<IndexDataPackage> = payload::decode(payload_bytes)?;
        let mut indexes = self.local_indexes.lock();
        for package in packages {
            if let Some(index) = indexes.get_mut(&package.logspace_id) {
                index.provide_index_data(package)?;
            }
        }
        Ok(())
    }

    fn on_recv_response(&self, message: &SharedLogMessage, payload_bytes: &[u8]) {
        let op_id = message.client_data;
        match message.result_type {
            SharedLogResultType::ReadOk => {
                let Ok(body) = payload::decode::<ReadResponsePayload>(payload_bytes) else {
                    warn!("malformed read response payload");
                    return;
                };
                let Some(op) = self.ongoing_ops.lock().remove(&op_id) else {
                    return;
                };
                let seqnum = message.full_seqnum();
                if let Some(cache) = &self.cache {
                    cache.put(
                        LogMetaData {
                            user_logspace: op.user_logspace,
                            seqnum,
                            localid: 0,
                            num_tags: body.tags.len(),
                            data_size: body.data.len(),
                        },
                        body.tags.clone(),
                        body.data.clone(),
                    );
                }
                self.finish_read_with_entry(
                    &op,
                    seqnum,
                    message.user_metalog_progress,
                    body.tags,
                    body.data,
                    body.aux_data,
                );
            }
            SharedLogResultType::Empty => {
                if let Some(op) = self.ongoing_ops.lock().remove(&op_id) {
                    self.finish_op_with_failure(
                        &op,
                        SharedLogResultType::Empty,
                        message.user_metalog_progress,
                    );
                }
            }
            SharedLogResultType::DataLost => {
                if let Some(op) = self.ongoing_ops.lock().remove(&op_id) {
                    self.finish_op_with_failure(&op, SharedLogResultType::DataLost, 0);
                }
            }
            SharedLogResultType::LookupFailed => {
                // Tier-side miss: re-dispatch with a hop budget against
                // routing loops.
                let op = self.ongoing_ops.lock().get(&op_id).cloned();
                let Some(op) = op else { return };
                if message.hop_times >= MAX_READ_HOPS {
                    if let Some(op) = self.ongoing_ops.lock().remove(&op_id) {
                        self.finish_op_with_failure(&op, SharedLogResultType::DataLost, 0);
                    }
                    return;
                }
                if let Some(view) = self.active_view() {
                    let logspace_id = view.logspace_id(op.user_logspace);
                    let mut query = Self::build_index_query(&op);
                    query.hop_times = message.hop_times + 1;
                    self.send_index_tier_read_request(&view, logspace_id, &query);
                }
            }
            _ => warn!(result = ?message.result_type, "unexpected response result"),
        }
    }

    fn process_append_results(&self, results: &[AppendResult]) {
        for result in results {
            let Some(op) = self.ongoing_ops.lock().remove(&result.op_id) else {
                warn!(op_id = result.op_id, "append result for unknown op");
                continue;
            };
            if result.seqnum == INVALID_SEQNUM {
                self.finish_op_with_failure(&op, SharedLogResultType::Discarded, 0);
                continue;
            }
            if let Some(cache) = &self.cache {
                cache.put(
                    LogMetaData {
                        user_logspace: op.user_logspace,
                        seqnum: result.seqnum,
                        localid: result.localid,
                        num_tags: op.user_tags.len(),
                        data_size: op.data.len(),
                    },
                    op.user_tags.clone(),
                    op.data.clone(),
                );
            }
            self.finish_op_with_success(
                &op,
                SharedLogResultType::AppendOk,
                result.seqnum,
                result.metalog_progress,
            );
        }
    }

    // --- responses --------------------------------------------------------

    fn finish_read_with_entry(
        &self,
        op: &LocalOp,
        seqnum: u64,
        metalog_progress: u64,
        tags: Vec<u64>,
        data: Vec<u8>,
        aux_data: Vec<u8>,
    ) {
        self.advance_call_progress(op.call_id, metalog_progress);
        self.send_response(WorkerResponse {
            client_data: op.client_data,
            result: SharedLogResultType::ReadOk,
            seqnum,
            metalog_progress,
            tags,
            data,
            aux_data,
        });
    }

    fn finish_op_with_success(
        &self,
        op: &LocalOp,
        result: SharedLogResultType,
        seqnum: u64,
        metalog_progress: u64,
    ) {
        self.advance_call_progress(op.call_id, metalog_progress);
        self.send_response(WorkerResponse {
            client_data: op.client_data,
            ..WorkerResponse::of(result, seqnum, metalog_progress)
        });
    }

    fn finish_op_with_failure(
        &self,
        op: &LocalOp,
        result: SharedLogResultType,
        metalog_progress: u64,
    ) {
        self.advance_call_progress(op.call_id, metalog_progress);
        self.send_response(WorkerResponse {
            client_data: op.client_data,
            ..WorkerResponse::of(result, INVALID_SEQNUM, metalog_progress)
        });
    }

    fn advance_call_progress(&self, call_id: u64, metalog_progress: u64) {
        if metalog_progress == 0 {
            return;
        }
        if let Some(ctx) = self.fn_ctx.lock().get_mut(&call_id) {
            if metalog_progress > ctx.metalog_progress {
                ctx.metalog_progress = metalog_progress;
            }
        }
    }

    fn send_response(&self, response: WorkerResponse) {
        let _ = self.responses_tx.send(response);
    }

    fn active_view(&self) -> Option<Arc<View>> {
        let views = self.views.lock();
        if !views.active {
            return None;
        }
        views.current.clone()
    }

    // --- activation -------------------------------------------------------

    /// Activation signal from the membership oracle: `"register"` installs
    /// the missed view on postponed engines, `"cache"` enables caching.
    pub fn on_activation(&self, path: &str) {
        info!(path, "received activation command");
        match path {
            "register" => {
                if !self.postpone_registration.swap(false, Ordering::AcqRel) {
                    return;
                }
                let missed = self.views.lock().missed.take();
                match missed {
                    Some(view) => self.install_view(&view),
                    None => warn!("no view yet"),
                }
            }
            "cache" => {
                self.postpone_caching.store(false, Ordering::Release);
            }
            _ => error!(path, "unknown activation command"),
        }
    }

    fn install_view(&self, view: &Arc<View>) {
        let caps = IndexCaps {
            per_tag_seqnums_limit: self.config.engine_per_tag_seqnums_limit,
            seqnum_suffix_cap: self.config.engine_seqnum_suffix_cap,
            tag_cache_cap: self.config.engine_tag_cache_cap,
        };
        {
            let mut producers = self.producers.lock();
            let mut indexes = self.local_indexes.lock();
            for sequencer_id in view.active_sequencer_nodes() {
                let logspace_id = types::logspace_id(view.id(), sequencer_id);
                producers.entry(logspace_id).or_insert_with(|| {
                    LogProducer::new(
                        self.local_shard_id(view),
                        logspace_id,
                        0,
                        0,
                        0,
                        self.config.num_tail_metalog_entries,
                    )
                });
                indexes
                    .entry(logspace_id)
                    .or_insert_with(|| Index::new(logspace_id, caps));
            }
        }
        {
            let mut views = self.views.lock();
            views.current = Some(Arc::clone(view));
            views.active = true;
        }
        self.send_registrations(view);
        self.registered.store(true, Ordering::Release);
        info!(view_id = view.id(), "engine serving view");
    }

    /// Announces this engine to the sequencers it appends through and the
    /// storage nodes of its shards, subscribing it to metalog and
    /// index-data broadcast.
    fn send_registrations(&self, view: &Arc<View>) {
        let message = SharedLogMessage {
            origin_node_id: self.node_id,
            ..SharedLogMessage::new(SharedLogOpType::Register)
        };
        for sequencer_id in view.active_sequencer_nodes() {
            for _ in 0..self.config.max_send_retries {
                if self
                    .hub
                    .send(ConnType::EngineToSequencer, sequencer_id, &message, &[])
                {
                    break;
                }
            }
            let shard_id = bits::join16(sequencer_id, self.local_shard_id(view));
            if let Some(shard) = view.get_storage_shard(shard_id) {
                for &storage_id in shard.storage_nodes() {
                    for _ in 0..self.config.max_send_retries {
                        if self
                            .hub
                            .send(ConnType::EngineToStorage, storage_id, &message, &[])
                        {
                            break;
                        }
                    }
                }
            }
        }
    }
}

impl ViewLifecycleListener for Engine {
    fn on_view_created(&self, view: &Arc<View>) {
        if self.postpone_registration.load(Ordering::Acquire) {
            self.views.lock().missed = Some(Arc::clone(view));
            return;
        }
        self.install_view(view);
    }

    fn on_view_frozen(&self, view: &Arc<View>) {
        let mut views = self.views.lock();
        if views.current.as_ref().is_some_and(|v| v.id() == view.id()) {
            views.active = false;
        }
    }

    fn on_view_finalized(&self, finalized: &Arc<FinalizedView>) {
        let mut resolved = Vec::new();
        {
            let mut producers = self.producers.lock();
            for (&logspace_id, producer) in producers.iter_mut() {
                let final_position = finalized.final_metalog_position(logspace_id);
                if let Err(err) = producer.on_finalized(final_position) {
                    error!(%err, logspace = format_args!("{logspace_id:#x}"), "finalize producer");
                }
                resolved.append(&mut producer.poll_append_results());
            }
            producers.clear();
        }
        self.local_indexes.lock().clear();
        {
            let mut views = self.views.lock();
            views.current = None;
            views.active = false;
        }
        self.process_append_results(&resolved);
        debug!(view_id = finalized.view().id(), "engine finalized view");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
