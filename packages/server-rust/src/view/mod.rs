//! Views: immutable cluster configurations.
//!
//! A [`View`] describes one configuration epoch: which nodes play which
//! role, how storage shards are laid out under each sequencer, and how user
//! logspaces map onto phylogs. Views never change after construction;
//! reconfiguration installs a new view and finalizes the old one.
//!
//! The inner role structs (`StorageShard`, `SequencerInfo`, `StorageInfo`,
//! `IndexInfo`) are owned by the `View` and handed out as borrows whose
//! lifetime is tied to the view; holders that outlive a call keep the whole
//! `Arc<View>` instead.

pub mod watcher;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use serde::{Deserialize, Serialize};

use phylog_core::{bits, hash, types};

use crate::error::{LogError, Result};

pub use watcher::{FinalizedView, ViewLifecycleListener, ViewWatcher};

// ---------------------------------------------------------------------------
// ViewSpec
// ---------------------------------------------------------------------------

/// Wire/config description a [`View`] is built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewSpec {
    pub view_id: u16,
    pub metalog_replicas: usize,
    pub userlog_replicas: usize,
    pub index_replicas: usize,
    pub num_index_shards: usize,
    /// Number of active phylogs; the first `num_phylogs` sequencer nodes
    /// each own one.
    pub num_phylogs: usize,
    pub storage_shards_per_sequencer: usize,
    pub sequencer_nodes: Vec<u16>,
    pub storage_nodes: Vec<u16>,
    pub index_nodes: Vec<u16>,
    pub aggregator_nodes: Vec<u16>,
    pub log_space_hash_seed: u64,
    /// Token ring for `user_logspace -> phylog`; when empty, a ring cycling
    /// over the active sequencers is generated (`hash_token_count` long).
    pub log_space_hash_tokens: Vec<u16>,
    pub hash_token_count: usize,
}

// ---------------------------------------------------------------------------
// StorageShard
// ---------------------------------------------------------------------------

/// One replication unit under a sequencer: `shard_id` is
/// `sequencer_id‖local_shard_id`.
///
/// The pickers advance shared counters with relaxed ordering; distribution
/// only needs to be eventually uniform, not consecutive.
#[derive(Debug)]
pub struct StorageShard {
    shard_id: u32,
    sequencer_node: u16,
    storage_nodes: Vec<u16>,
    aggregator_nodes: Vec<u16>,
    /// Index nodes serving each index shard.
    index_shard_nodes: Vec<Vec<u16>>,
    next_storage_node: AtomicUsize,
    next_index_shard: AtomicUsize,
    next_index_replica: Vec<AtomicUsize>,
    next_aggregator_node: AtomicUsize,
}

impl StorageShard {
    #[must_use]
    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    #[must_use]
    pub fn local_shard_id(&self) -> u16 {
        bits::low_half32(self.shard_id)
    }

    #[must_use]
    pub fn sequencer_node(&self) -> u16 {
        self.sequencer_node
    }

    #[must_use]
    pub fn storage_nodes(&self) -> &[u16] {
        &self.storage_nodes
    }

    #[must_use]
    pub fn has_storage_node(&self, storage_node: u16) -> bool {
        self.storage_nodes.contains(&storage_node)
    }

    #[must_use]
    pub fn use_master_slave_merging(&self) -> bool {
        self.aggregator_nodes.is_empty()
    }

    /// Round-robin over the shard's storage replicas.
    #[must_use]
    pub fn pick_storage_node(&self) -> u16 {
        let idx = self.next_storage_node.fetch_add(1, Ordering::Relaxed);
        self.storage_nodes[idx % self.storage_nodes.len()]
    }

    /// Round-robin over index shards.
    #[must_use]
    pub fn pick_index_shard(&self) -> usize {
        let idx = self.next_index_shard.fetch_add(1, Ordering::Relaxed);
        idx % self.index_shard_nodes.len()
    }

    /// Round-robin over the replicas of one index shard.
    #[must_use]
    pub fn pick_index_node(&self, shard: usize) -> u16 {
        let nodes = &self.index_shard_nodes[shard];
        let idx = self.next_index_replica[shard].fetch_add(1, Ordering::Relaxed);
        nodes[idx % nodes.len()]
    }

    /// The index shard owning `tag`, with a random replica.
    #[must_use]
    pub fn pick_index_node_by_tag(&self, tag: u64) -> u16 {
        let shard = (tag % self.index_shard_nodes.len() as u64) as usize;
        let nodes = &self.index_shard_nodes[shard];
        nodes[rand::thread_rng().gen_range(0..nodes.len())]
    }

    /// One index node per index shard, starting from a rotating shard so
    /// fan-out load spreads across replicas.
    #[must_use]
    pub fn pick_index_node_per_shard(&self) -> Vec<u16> {
        let num_shards = self.index_shard_nodes.len();
        let first = self.pick_index_shard();
        (0..num_shards)
            .map(|i| self.pick_index_node((first + i) % num_shards))
            .collect()
    }

    /// Round-robin over aggregator nodes; with no aggregators (master-slave
    /// merging) a random node from `sharded_index_nodes` acts as master.
    #[must_use]
    pub fn pick_aggregator_node(&self, sharded_index_nodes: &[u16]) -> u16 {
        if self.aggregator_nodes.is_empty() {
            return sharded_index_nodes
                [rand::thread_rng().gen_range(0..sharded_index_nodes.len())];
        }
        let idx = self.next_aggregator_node.fetch_add(1, Ordering::Relaxed);
        self.aggregator_nodes[idx % self.aggregator_nodes.len()]
    }
}

// ---------------------------------------------------------------------------
// Per-role infos
// ---------------------------------------------------------------------------

/// Sequencer-role view of the configuration.
#[derive(Debug)]
pub struct SequencerInfo {
    node_id: u16,
    replica_sequencer_nodes: Vec<u16>,
    replica_set: HashSet<u16>,
}

impl SequencerInfo {
    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    #[must_use]
    pub fn replica_sequencer_nodes(&self) -> &[u16] {
        &self.replica_sequencer_nodes
    }

    #[must_use]
    pub fn is_replica_sequencer_node(&self, sequencer_id: u16) -> bool {
        self.replica_set.contains(&sequencer_id)
    }
}

/// Storage-role view of the configuration.
#[derive(Debug)]
pub struct StorageInfo {
    node_id: u16,
    /// Global shard ids this node replicates, in reporting order. The
    /// sequencer interprets shard-progress vectors positionally against
    /// this order.
    storage_shard_ids: Vec<u32>,
    /// Local shard ids grouped by owning sequencer.
    local_shard_ids: HashMap<u16, Vec<u16>>,
    next_index_shard: AtomicUsize,
}

impl StorageInfo {
    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    #[must_use]
    pub fn storage_shard_ids(&self) -> &[u32] {
        &self.storage_shard_ids
    }

    #[must_use]
    pub fn local_shard_ids(&self, sequencer_id: u16) -> &[u16] {
        self.local_shard_ids
            .get(&sequencer_id)
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn is_storage_shard_member(&self, shard_id: u32) -> bool {
        self.storage_shard_ids.contains(&shard_id)
    }

    /// Round-robin over index shards for index-data fan-out.
    #[must_use]
    pub fn pick_index_shard(&self, num_index_shards: usize) -> u16 {
        let idx = self.next_index_shard.fetch_add(1, Ordering::Relaxed);
        (idx % num_index_shards) as u16
    }
}

/// Index-role view of the configuration.
#[derive(Debug)]
pub struct IndexInfo {
    node_id: u16,
    /// Storage replicas per shard, for dispatching `ReadAt` after a hit.
    per_shard_storage_nodes: HashMap<u32, Vec<u16>>,
    next_shard_storage_node: HashMap<u32, AtomicUsize>,
    index_shards: HashSet<u16>,
}

impl IndexInfo {
    #[must_use]
    pub fn node_id(&self) -> u16 {
        self.node_id
    }

    #[must_use]
    pub fn is_index_shard_member(&self, index_shard: u16) -> bool {
        self.index_shards.contains(&index_shard)
    }

    /// Index shards this node serves.
    #[must_use]
    pub fn index_shards(&self) -> &HashSet<u16> {
        &self.index_shards
    }

    /// Round-robin over the storage replicas of `shard_id`.
    #[must_use]
    pub fn pick_storage_node(&self, shard_id: u32) -> Option<u16> {
        let nodes = self.per_shard_storage_nodes.get(&shard_id)?;
        let counter = self.next_shard_storage_node.get(&shard_id)?;
        let idx = counter.fetch_add(1, Ordering::Relaxed);
        Some(nodes[idx % nodes.len()])
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

const DEFAULT_HASH_TOKENS: usize = 128;

/// One immutable configuration epoch.
#[derive(Debug)]
pub struct View {
    id: u16,
    metalog_replicas: usize,
    userlog_replicas: usize,
    index_replicas: usize,
    num_index_shards: usize,
    num_phylogs: usize,
    storage_shards_per_sequencer: usize,

    sequencer_node_ids: Vec<u16>,
    storage_node_ids: Vec<u16>,
    index_node_ids: Vec<u16>,
    aggregator_node_ids: Vec<u16>,

    active_phylogs: HashSet<u16>,
    /// Local shard ids under each sequencer.
    sequencer_storage_shard_ids: HashMap<u16, Vec<u16>>,

    storage_shards: HashMap<u32, StorageShard>,
    sequencers: HashMap<u16, SequencerInfo>,
    storages: HashMap<u16, StorageInfo>,
    indexes: HashMap<u16, IndexInfo>,
    /// Index nodes serving each index shard.
    index_shard_nodes: Vec<Vec<u16>>,

    log_space_hash_seed: u64,
    log_space_hash_tokens: Vec<u16>,
}

impl View {
    /// Builds a view from its spec.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolViolation` when the spec cannot satisfy the
    /// replication requirements (fewer sequencers than `metalog_replicas`,
    /// fewer storage nodes than `userlog_replicas`, no index nodes, or no
    /// phylogs).
    pub fn new(spec: &ViewSpec) -> Result<Self> {
        if spec.num_phylogs == 0 || spec.num_phylogs > spec.sequencer_nodes.len() {
            return Err(LogError::ProtocolViolation(format!(
                "view {}: {} phylogs with {} sequencer nodes",
                spec.view_id,
                spec.num_phylogs,
                spec.sequencer_nodes.len()
            )));
        }
        if spec.sequencer_nodes.len() < spec.metalog_replicas {
            return Err(LogError::ProtocolViolation(format!(
                "view {}: {} sequencer nodes cannot hold {} metalog replicas",
                spec.view_id,
                spec.sequencer_nodes.len(),
                spec.metalog_replicas
            )));
        }
        if spec.storage_nodes.len() < spec.userlog_replicas || spec.userlog_replicas == 0 {
            return Err(LogError::ProtocolViolation(format!(
                "view {}: {} storage nodes cannot hold {} userlog replicas",
                spec.view_id,
                spec.storage_nodes.len(),
                spec.userlog_replicas
            )));
        }
        if spec.index_nodes.is_empty() || spec.num_index_shards == 0 {
            return Err(LogError::ProtocolViolation(format!(
                "view {}: no index nodes or shards",
                spec.view_id
            )));
        }

        let active_phylogs: HashSet<u16> = spec
            .sequencer_nodes
            .iter()
            .take(spec.num_phylogs)
            .copied()
            .collect();

        // Metalog replicas: ring successors of the primary.
        let num_sequencers = spec.sequencer_nodes.len();
        let mut sequencers = HashMap::new();
        for (i, &node_id) in spec.sequencer_nodes.iter().enumerate() {
            let replicas: Vec<u16> = (1..spec.metalog_replicas)
                .map(|k| spec.sequencer_nodes[(i + k) % num_sequencers])
                .collect();
            let replica_set = replicas.iter().copied().collect();
            sequencers.insert(
                node_id,
                SequencerInfo {
                    node_id,
                    replica_sequencer_nodes: replicas,
                    replica_set,
                },
            );
        }

        // Index shards: `index_replicas` ring successors per shard.
        let num_index_nodes = spec.index_nodes.len();
        let index_replicas = spec.index_replicas.max(1).min(num_index_nodes);
        let index_shard_nodes: Vec<Vec<u16>> = (0..spec.num_index_shards)
            .map(|shard| {
                (0..index_replicas)
                    .map(|k| spec.index_nodes[(shard + k) % num_index_nodes])
                    .collect()
            })
            .collect();

        // Storage shards: `userlog_replicas` ring successors per shard, the
        // ring offset advancing one node per shard.
        let num_storage_nodes = spec.storage_nodes.len();
        let mut storage_shards = HashMap::new();
        let mut sequencer_storage_shard_ids: HashMap<u16, Vec<u16>> = HashMap::new();
        let mut storage_memberships: HashMap<u16, Vec<u32>> = HashMap::new();
        let mut ring_offset = 0usize;
        for &sequencer_id in &spec.sequencer_nodes {
            let mut local_ids = Vec::with_capacity(spec.storage_shards_per_sequencer);
            for local_shard_id in 0..spec.storage_shards_per_sequencer as u16 {
                let shard_id = bits::join16(sequencer_id, local_shard_id);
                let storage_nodes: Vec<u16> = (0..spec.userlog_replicas)
                    .map(|k| spec.storage_nodes[(ring_offset + k) % num_storage_nodes])
                    .collect();
                ring_offset += 1;
                for &storage_node in &storage_nodes {
                    storage_memberships
                        .entry(storage_node)
                        .or_default()
                        .push(shard_id);
                }
                storage_shards.insert(
                    shard_id,
                    StorageShard {
                        shard_id,
                        sequencer_node: sequencer_id,
                        storage_nodes,
                        aggregator_nodes: spec.aggregator_nodes.clone(),
                        index_shard_nodes: index_shard_nodes.clone(),
                        next_storage_node: AtomicUsize::new(0),
                        next_index_shard: AtomicUsize::new(0),
                        next_index_replica: (0..spec.num_index_shards)
                            .map(|_| AtomicUsize::new(0))
                            .collect(),
                        next_aggregator_node: AtomicUsize::new(0),
                    },
                );
                local_ids.push(local_shard_id);
            }
            sequencer_storage_shard_ids.insert(sequencer_id, local_ids);
        }

        let mut storages = HashMap::new();
        for &node_id in &spec.storage_nodes {
            let mut shard_ids = storage_memberships.remove(&node_id).unwrap_or_default();
            shard_ids.sort_unstable();
            let mut local_shard_ids: HashMap<u16, Vec<u16>> = HashMap::new();
            for &shard_id in &shard_ids {
                local_shard_ids
                    .entry(bits::high_half32(shard_id))
                    .or_default()
                    .push(bits::low_half32(shard_id));
            }
            storages.insert(
                node_id,
                StorageInfo {
                    node_id,
                    storage_shard_ids: shard_ids,
                    local_shard_ids,
                    next_index_shard: AtomicUsize::new(0),
                },
            );
        }

        // Index nodes: shard membership plus per-storage-shard replica lists
        // for dispatching reads after an index hit.
        let per_shard_storage_nodes: HashMap<u32, Vec<u16>> = storage_shards
            .iter()
            .map(|(&shard_id, shard)| (shard_id, shard.storage_nodes.clone()))
            .collect();
        let mut indexes = HashMap::new();
        for &node_id in &spec.index_nodes {
            let index_shards: HashSet<u16> = (0..spec.num_index_shards as u16)
                .filter(|&shard| {
                    index_shard_nodes[shard as usize].contains(&node_id)
                })
                .collect();
            indexes.insert(
                node_id,
                IndexInfo {
                    node_id,
                    per_shard_storage_nodes: per_shard_storage_nodes.clone(),
                    next_shard_storage_node: per_shard_storage_nodes
                        .keys()
                        .map(|&shard_id| (shard_id, AtomicUsize::new(0)))
                        .collect(),
                    index_shards,
                },
            );
        }

        let log_space_hash_tokens = if spec.log_space_hash_tokens.is_empty() {
            let count = if spec.hash_token_count == 0 {
                DEFAULT_HASH_TOKENS
            } else {
                spec.hash_token_count
            };
            let actives: Vec<u16> = spec
                .sequencer_nodes
                .iter()
                .take(spec.num_phylogs)
                .copied()
                .collect();
            (0..count).map(|i| actives[i % actives.len()]).collect()
        } else {
            spec.log_space_hash_tokens.clone()
        };

        Ok(Self {
            id: spec.view_id,
            metalog_replicas: spec.metalog_replicas,
            userlog_replicas: spec.userlog_replicas,
            index_replicas,
            num_index_shards: spec.num_index_shards,
            num_phylogs: spec.num_phylogs,
            storage_shards_per_sequencer: spec.storage_shards_per_sequencer,
            sequencer_node_ids: spec.sequencer_nodes.clone(),
            storage_node_ids: spec.storage_nodes.clone(),
            index_node_ids: spec.index_nodes.clone(),
            aggregator_node_ids: spec.aggregator_nodes.clone(),
            active_phylogs,
            sequencer_storage_shard_ids,
            storage_shards,
            sequencers,
            storages,
            indexes,
            index_shard_nodes,
            log_space_hash_seed: spec.log_space_hash_seed,
            log_space_hash_tokens,
        })
    }

    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    #[must_use]
    pub fn metalog_replicas(&self) -> usize {
        self.metalog_replicas
    }

    #[must_use]
    pub fn userlog_replicas(&self) -> usize {
        self.userlog_replicas
    }

    #[must_use]
    pub fn index_replicas(&self) -> usize {
        self.index_replicas
    }

    #[must_use]
    pub fn num_index_shards(&self) -> usize {
        self.num_index_shards
    }

    #[must_use]
    pub fn num_phylogs(&self) -> usize {
        self.num_phylogs
    }

    #[must_use]
    pub fn storage_shards_per_sequencer(&self) -> usize {
        self.storage_shards_per_sequencer
    }

    #[must_use]
    pub fn sequencer_nodes(&self) -> &[u16] {
        &self.sequencer_node_ids
    }

    #[must_use]
    pub fn storage_nodes(&self) -> &[u16] {
        &self.storage_node_ids
    }

    #[must_use]
    pub fn index_nodes(&self) -> &[u16] {
        &self.index_node_ids
    }

    #[must_use]
    pub fn aggregator_nodes(&self) -> &[u16] {
        &self.aggregator_node_ids
    }

    /// Local storage shard ids under `sequencer_id`.
    #[must_use]
    pub fn storage_shard_ids(&self, sequencer_id: u16) -> &[u16] {
        self.sequencer_storage_shard_ids
            .get(&sequencer_id)
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn contains_sequencer_node(&self, node_id: u16) -> bool {
        self.sequencers.contains_key(&node_id)
    }

    #[must_use]
    pub fn contains_storage_node(&self, node_id: u16) -> bool {
        self.storages.contains_key(&node_id)
    }

    #[must_use]
    pub fn contains_index_node(&self, node_id: u16) -> bool {
        self.indexes.contains_key(&node_id)
    }

    #[must_use]
    pub fn is_active_phylog(&self, sequencer_id: u16) -> bool {
        self.active_phylogs.contains(&sequencer_id)
    }

    /// Sequencer nodes that own an active phylog, in declaration order.
    #[must_use]
    pub fn active_sequencer_nodes(&self) -> Vec<u16> {
        self.sequencer_node_ids
            .iter()
            .copied()
            .filter(|id| self.is_active_phylog(*id))
            .collect()
    }

    #[must_use]
    pub fn get_storage_shard(&self, shard_id: u32) -> Option<&StorageShard> {
        self.storage_shards.get(&shard_id)
    }

    #[must_use]
    pub fn get_sequencer_node(&self, node_id: u16) -> Option<&SequencerInfo> {
        self.sequencers.get(&node_id)
    }

    #[must_use]
    pub fn get_storage_node(&self, node_id: u16) -> Option<&StorageInfo> {
        self.storages.get(&node_id)
    }

    #[must_use]
    pub fn get_index_node(&self, node_id: u16) -> Option<&IndexInfo> {
        self.indexes.get(&node_id)
    }

    /// Index nodes serving `index_shard`.
    #[must_use]
    pub fn index_shard_nodes(&self, index_shard: usize) -> &[u16] {
        self.index_shard_nodes
            .get(index_shard)
            .map_or(&[], Vec::as_slice)
    }

    /// Deterministic mapping `user_logspace -> phylog logspace id` via a
    /// seeded hash over the token ring.
    #[must_use]
    pub fn logspace_id(&self, user_logspace: u32) -> u32 {
        let h = hash::hash64(u64::from(user_logspace), self.log_space_hash_seed);
        let token_idx = (h % self.log_space_hash_tokens.len() as u64) as usize;
        let sequencer_id = self.log_space_hash_tokens[token_idx];
        types::logspace_id(self.id, sequencer_id)
    }

    #[must_use]
    pub fn log_space_hash_seed(&self) -> u64 {
        self.log_space_hash_seed
    }

    #[must_use]
    pub fn log_space_hash_tokens(&self) -> &[u16] {
        &self.log_space_hash_tokens
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn small_spec() -> ViewSpec {
        ViewSpec {
            view_id: 1,
            metalog_replicas: 3,
            userlog_replicas: 3,
            index_replicas: 1,
            num_index_shards: 1,
            num_phylogs: 1,
            storage_shards_per_sequencer: 2,
            sequencer_nodes: vec![10, 11, 12],
            storage_nodes: vec![20, 21, 22],
            index_nodes: vec![30],
            aggregator_nodes: vec![],
            log_space_hash_seed: 0xfeed,
            log_space_hash_tokens: vec![],
            hash_token_count: 0,
        }
    }

    #[test]
    fn view_construction_basic_shape() {
        let view = View::new(&small_spec()).unwrap();
        assert_eq!(view.id(), 1);
        assert_eq!(view.num_phylogs(), 1);
        assert!(view.is_active_phylog(10));
        assert!(!view.is_active_phylog(11));
        assert_eq!(view.active_sequencer_nodes(), vec![10]);
        assert_eq!(view.storage_shard_ids(10), &[0, 1]);
    }

    #[test]
    fn every_shard_has_userlog_replicas_storage_nodes() {
        let spec = small_spec();
        let view = View::new(&spec).unwrap();
        for &sequencer_id in view.sequencer_nodes() {
            for &local_id in view.storage_shard_ids(sequencer_id) {
                let shard = view
                    .get_storage_shard(bits::join16(sequencer_id, local_id))
                    .unwrap();
                assert_eq!(shard.storage_nodes().len(), spec.userlog_replicas);
                assert_eq!(shard.sequencer_node(), sequencer_id);
            }
        }
    }

    #[test]
    fn sequencer_has_replica_ring() {
        let view = View::new(&small_spec()).unwrap();
        let seq = view.get_sequencer_node(10).unwrap();
        // metalog_replicas = 3 -> primary plus 2 backups.
        assert_eq!(seq.replica_sequencer_nodes(), &[11, 12]);
        assert!(seq.is_replica_sequencer_node(11));
        assert!(!seq.is_replica_sequencer_node(10));
    }

    #[test]
    fn storage_progress_reporting_order_is_stable() {
        let view = View::new(&small_spec()).unwrap();
        let storage = view.get_storage_node(20).unwrap();
        let ids = storage.storage_shard_ids();
        assert!(!ids.is_empty());
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        assert_eq!(ids, sorted.as_slice());
        for &shard_id in ids {
            assert!(storage.is_storage_shard_member(shard_id));
        }
    }

    #[test]
    fn logspace_mapping_is_deterministic_and_active() {
        let view = View::new(&small_spec()).unwrap();
        for user_logspace in 0..50u32 {
            let a = view.logspace_id(user_logspace);
            let b = view.logspace_id(user_logspace);
            assert_eq!(a, b);
            assert_eq!(phylog_core::types::view_of_logspace(a), 1);
            assert!(view.is_active_phylog(phylog_core::types::sequencer_of_logspace(a)));
        }
    }

    #[test]
    fn pickers_round_robin() {
        let view = View::new(&small_spec()).unwrap();
        let shard = view.get_storage_shard(bits::join16(10, 0)).unwrap();
        let picks: Vec<u16> = (0..6).map(|_| shard.pick_storage_node()).collect();
        // Cycle over the three replicas, repeated twice.
        assert_eq!(&picks[0..3], &picks[3..6]);
        let distinct: std::collections::HashSet<u16> = picks.iter().copied().collect();
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn master_slave_merging_without_aggregators() {
        let view = View::new(&small_spec()).unwrap();
        let shard = view.get_storage_shard(bits::join16(10, 0)).unwrap();
        assert!(shard.use_master_slave_merging());

        let mut spec = small_spec();
        spec.aggregator_nodes = vec![40];
        let view = View::new(&spec).unwrap();
        let shard = view.get_storage_shard(bits::join16(10, 0)).unwrap();
        assert!(!shard.use_master_slave_merging());
        assert_eq!(shard.pick_aggregator_node(&[30]), 40);
    }

    #[test]
    fn index_node_membership_and_read_dispatch() {
        let view = View::new(&small_spec()).unwrap();
        let index = view.get_index_node(30).unwrap();
        assert!(index.is_index_shard_member(0));
        assert_eq!(index.index_shards().len(), 1);
        assert_eq!(view.index_shard_nodes(0), &[30]);
        assert!(view.index_shard_nodes(9).is_empty());
        let shard_id = bits::join16(10, 0);
        let storage = index.pick_storage_node(shard_id).unwrap();
        assert!(view
            .get_storage_shard(shard_id)
            .unwrap()
            .has_storage_node(storage));
        assert!(index.pick_storage_node(0xffff_ffff).is_none());
    }

    #[test]
    fn invalid_specs_rejected() {
        let mut spec = small_spec();
        spec.num_phylogs = 0;
        assert!(View::new(&spec).is_err());

        let mut spec = small_spec();
        spec.metalog_replicas = 4;
        assert!(View::new(&spec).is_err());

        let mut spec = small_spec();
        spec.userlog_replicas = 4;
        assert!(View::new(&spec).is_err());

        let mut spec = small_spec();
        spec.index_nodes.clear();
        assert!(View::new(&spec).is_err());
    }

    #[test]
    fn unknown_ids_return_none() {
        let view = View::new(&small_spec()).unwrap();
        assert!(view.get_storage_shard(0xdead_beef).is_none());
        assert!(view.get_sequencer_node(99).is_none());
        assert!(view.get_storage_node(99).is_none());
        assert!(view.get_index_node(99).is_none());
        assert!(view.storage_shard_ids(99).is_empty());
    }
}
