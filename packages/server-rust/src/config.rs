//! Immutable server configuration installed at bootstrap.
//!
//! Every runtime knob lives here; components receive an `Arc<ServerConfig>`
//! at construction and never consult mutable global state on the hot path.

use serde::{Deserialize, Serialize};

/// How the gateway picks an engine node for a new function call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Uniformly random over connected engine nodes.
    Random,
    /// Round-robin per function id.
    PerFunctionRoundRobin,
    /// Engine with the fewest in-flight requests.
    LeastLoad,
}

/// Server-wide configuration. Field defaults mirror the deployment defaults
/// the system ships with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// This node's id within the cluster.
    pub node_id: u16,

    // --- sequencer ---
    /// Interval between local-cut attempts (`mark_next_cut`), microseconds.
    pub local_cut_interval_us: u64,
    /// Number of hash tokens in the `user_logspace -> phylog` mapping.
    pub log_space_hash_tokens: usize,
    /// Applied metalog entries retained per logspace for catch-up.
    pub num_tail_metalog_entries: usize,

    // --- engine ---
    /// Always route read queries to the index tier, skipping the local index.
    pub engine_force_remote_index: bool,
    /// Probability of routing a read query to the index tier even when the
    /// local index could answer.
    pub engine_prob_remote_index: f32,
    /// Keep an engine-local record cache.
    pub engine_enable_cache: bool,
    /// Capacity of the engine record cache, MB.
    pub engine_cache_cap_mb: usize,
    /// Propagate `SET_AUXDATA` to every storage replica of the record.
    pub engine_propagate_auxdata: bool,
    /// Capacity of the tag-less seqnum cache per user logspace.
    pub engine_seqnum_cache_cap: usize,
    /// Length of the tag-less seqnum suffix kept per user logspace.
    pub engine_seqnum_suffix_cap: usize,
    /// Upper bound on distinct cached tags per phylog index.
    pub engine_tag_cache_cap: usize,
    /// Upper bound on retained seqnums per tag; oldest are evicted and the
    /// tag is marked truncated.
    pub engine_per_tag_seqnums_limit: usize,
    /// Node-id moduli: an engine whose id divides by any entry postpones
    /// view registration until the activation signal.
    pub engine_postpone_registration: Vec<u16>,
    /// Node-id moduli for postponing cache activation.
    pub engine_postpone_caching: Vec<u16>,

    // --- storage ---
    /// Interval of the storage background flush/report task, milliseconds.
    pub storage_bgthread_interval_ms: u64,
    /// Live in-memory entries retained per phylog before eviction of
    /// already-persisted records.
    pub storage_max_live_entries: usize,

    // --- network / gateway ---
    /// Attempts per inter-node send before the message is dropped.
    pub max_send_retries: u32,
    /// Cap on concurrent function calls per connected engine node; zero
    /// disables the cap.
    pub max_running_requests: usize,
    /// How the gateway picks engine nodes for new calls.
    pub dispatch_policy: DispatchPolicy,
    /// Seconds an engine removed by scale-in keeps draining in-flight calls.
    pub scale_in_grace_period_s: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            local_cut_interval_us: 1000,
            log_space_hash_tokens: 128,
            num_tail_metalog_entries: 32,
            engine_force_remote_index: false,
            engine_prob_remote_index: 0.0,
            engine_enable_cache: false,
            engine_cache_cap_mb: 1024,
            engine_propagate_auxdata: false,
            engine_seqnum_cache_cap: 1000,
            engine_seqnum_suffix_cap: 100_000,
            engine_tag_cache_cap: 1_000_000,
            engine_per_tag_seqnums_limit: 10_000,
            engine_postpone_registration: Vec::new(),
            engine_postpone_caching: Vec::new(),
            storage_bgthread_interval_ms: 1,
            storage_max_live_entries: 65_536,
            max_send_retries: 3,
            max_running_requests: 0,
            dispatch_policy: DispatchPolicy::Random,
            scale_in_grace_period_s: 10,
        }
    }
}

impl ServerConfig {
    /// True if this node's id matches any of the given moduli. Used by the
    /// postpone-registration / postpone-caching experiment knobs.
    #[must_use]
    pub fn node_matches_moduli(&self, moduli: &[u16]) -> bool {
        moduli.iter().any(|&m| m != 0 && self.node_id % m == 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
