//! Per-phylog tag index.
//!
//! The index ingests [`IndexDataPackage`]s emitted by storage nodes and
//! answers tag-filtered seek queries. Packages are applied atomically at
//! their metalog position, in order; a position is complete once packages
//! covering all of that metalog entry's productive shards have merged, and
//! only then does the index's *horizon* advance.
//!
//! Index-tier nodes hold *sharded* indexes: a tag belongs to index shard
//! `tag % num_index_shards` and the tag-less seqnum list to shard
//! `seqnum % num_index_shards`, so a sharded index only retains the slice
//! of each package its shards own. Tag queries route to the owning shard;
//! tag-less queries fan out one per shard and the per-shard answers merge
//! through [`QueryAggregator`]. Engine-local indexes are unsharded and
//! retain everything.
//!
//! Query outcomes:
//! - `Found`: the matching seqnum, with minimality/maximality guaranteed
//!   within the horizon (for a sharded index, within its shards).
//! - `Continue`: the query's required metalog progress is past the horizon;
//!   replay later (or on the next logspace).
//! - `Empty`: provably no match up to the horizon.
//! - `Miss`: this index cannot prove an answer (evicted state, or a tag it
//!   does not own); fan out to the index tier.

pub mod aggregator;
pub mod node;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use phylog_core::messages::IndexDataPackage;
use phylog_core::types::{self, EMPTY_TAG, INVALID_SEQNUM};
use phylog_core::bits;

use crate::error::{LogError, Result};

pub use aggregator::{AggregatorNode, QueryAggregator};
pub use node::IndexNode;

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Seek direction of a read query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryDirection {
    ReadNext,
    ReadPrev,
    /// `ReadNext` that the client retries on `Empty` until the horizon
    /// passes the requested point.
    ReadNextBlocking,
}

/// A tag-filtered seek query against one phylog's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexQuery {
    pub direction: QueryDirection,
    pub origin_node_id: u16,
    pub hop_times: u16,
    pub client_data: u64,
    pub user_logspace: u32,
    /// Query tag; [`EMPTY_TAG`] seeks over all records of the logspace.
    pub tag: u64,
    /// Full 64-bit seqnum the seek starts from.
    pub query_seqnum: u64,
    /// Metalog progress the querier has observed; the index must have
    /// applied at least this much before answering definitively.
    pub metalog_progress: u64,
}

/// Outcome discriminant of an index query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Found,
    Continue,
    Empty,
    Miss,
}

/// Index answer, carrying the original query for routing. Serializable:
/// sharded answers travel as `SlaveResult` payloads to their merge target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexQueryResult {
    pub state: QueryState,
    /// Matching seqnum; [`INVALID_SEQNUM`] unless `Found`.
    pub found_seqnum: u64,
    /// Storage shard the record came from, for `ReadAt` dispatch.
    pub found_engine_id: u16,
    /// The index's progress token at answer time.
    pub metalog_progress: u64,
    pub original_query: IndexQuery,
}

impl IndexQueryResult {
    fn of(state: QueryState, progress: u64, query: IndexQuery) -> Self {
        Self {
            state,
            found_seqnum: INVALID_SEQNUM,
            found_engine_id: 0,
            metalog_progress: progress,
            original_query: query,
        }
    }
}

// ---------------------------------------------------------------------------
// Caps
// ---------------------------------------------------------------------------

/// Eviction bounds for one phylog index.
#[derive(Debug, Clone, Copy)]
pub struct IndexCaps {
    /// Retained seqnums per tag.
    pub per_tag_seqnums_limit: usize,
    /// Retained seqnums in the tag-less per-logspace list.
    pub seqnum_suffix_cap: usize,
    /// Distinct tags retained per user logspace.
    pub tag_cache_cap: usize,
}

impl Default for IndexCaps {
    fn default() -> Self {
        Self {
            per_tag_seqnums_limit: 10_000,
            seqnum_suffix_cap: 100_000,
            tag_cache_cap: 1_000_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Sorted seqnum list with eviction marker.
#[derive(Debug, Default)]
struct SeqnumList {
    /// `(seqnum_lowhalf, engine_id)`, ascending by seqnum.
    entries: VecDeque<(u32, u16)>,
    /// Oldest entries were evicted; answers below the retained range are
    /// unprovable.
    truncated: bool,
}

impl SeqnumList {
    fn insert(&mut self, seqnum: u32, engine_id: u16, cap: usize) {
        // The common case is append-at-end; cross-shard interleaving within
        // one metalog position occasionally lands mid-list.
        match self.entries.back() {
            Some(&(back, _)) if back < seqnum => self.entries.push_back((seqnum, engine_id)),
            Some(&(back, _)) if back == seqnum => {}
            _ => {
                let at = self.entries.partition_point(|&(s, _)| s < seqnum);
                if self.entries.get(at).map(|&(s, _)| s) != Some(seqnum) {
                    self.entries.insert(at, (seqnum, engine_id));
                }
            }
        }
        while self.entries.len() > cap {
            self.entries.pop_front();
            self.truncated = true;
        }
    }

    /// Smallest retained entry `>= position`.
    fn next(&self, position: u32) -> Option<(u32, u16)> {
        let at = self.entries.partition_point(|&(s, _)| s < position);
        self.entries.get(at).copied()
    }

    /// Largest retained entry `<= position`.
    fn prev(&self, position: u32) -> Option<(u32, u16)> {
        let at = self.entries.partition_point(|&(s, _)| s <= position);
        at.checked_sub(1).and_then(|i| self.entries.get(i)).copied()
    }

    fn min_retained(&self) -> Option<u32> {
        self.entries.front().map(|&(s, _)| s)
    }
}

/// Index state for one user logspace.
#[derive(Debug, Default)]
struct SpaceIndex {
    tags: HashMap<u64, SeqnumList>,
    /// Tag-less list over every record of the logspace.
    seqnums: SeqnumList,
    /// Tag insertion order for whole-tag eviction.
    tag_order: VecDeque<u64>,
    /// Whole tags were evicted; absent tags are no longer provably empty.
    tags_evicted: bool,
}

/// Packages buffered for one not-yet-complete metalog position.
#[derive(Debug, Default)]
struct PackageMerge {
    expected_shards: u32,
    shards_seen: HashSet<u16>,
    packages: Vec<IndexDataPackage>,
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Tag index over one phylog.
pub struct Index {
    logspace_id: u32,
    caps: IndexCaps,
    /// Highest metalog position fully applied.
    metalog_position: u32,
    end_seqnum_position: u32,
    spaces: HashMap<u32, SpaceIndex>,
    pending_packages: BTreeMap<u32, PackageMerge>,
    num_index_shards: usize,
    /// Index shards this instance owns; `None` means unsharded (engine-
    /// local indexes retain everything).
    my_index_shards: Option<HashSet<u16>>,
}

impl Index {
    /// An unsharded index retaining every record it ingests.
    #[must_use]
    pub fn new(logspace_id: u32, caps: IndexCaps) -> Self {
        Self {
            logspace_id,
            caps,
            metalog_position: 0,
            end_seqnum_position: 0,
            spaces: HashMap::new(),
            pending_packages: BTreeMap::new(),
            num_index_shards: 1,
            my_index_shards: None,
        }
    }

    /// A sharded index-tier instance: retains tags with
    /// `tag % num_index_shards` in `my_shards` and tag-less seqnums with
    /// `seqnum % num_index_shards` in `my_shards`.
    #[must_use]
    pub fn new_sharded(
        logspace_id: u32,
        caps: IndexCaps,
        num_index_shards: usize,
        my_shards: HashSet<u16>,
    ) -> Self {
        Self {
            num_index_shards: num_index_shards.max(1),
            my_index_shards: Some(my_shards),
            ..Self::new(logspace_id, caps)
        }
    }

    fn owns_tag(&self, tag: u64) -> bool {
        match &self.my_index_shards {
            None => true,
            Some(shards) => {
                shards.contains(&((tag % self.num_index_shards as u64) as u16))
            }
        }
    }

    fn owns_seqnum(&self, seqnum_lowhalf: u32) -> bool {
        match &self.my_index_shards {
            None => true,
            Some(shards) => shards
                .contains(&((seqnum_lowhalf as usize % self.num_index_shards) as u16)),
        }
    }

    #[must_use]
    pub fn logspace_id(&self) -> u32 {
        self.logspace_id
    }

    /// Applied-entry count; the index's horizon.
    #[must_use]
    pub fn metalog_position(&self) -> u32 {
        self.metalog_position
    }

    #[must_use]
    pub fn end_seqnum_position(&self) -> u32 {
        self.end_seqnum_position
    }

    /// Progress token equivalent of the horizon.
    #[must_use]
    pub fn progress_token(&self) -> u64 {
        bits::join32(self.logspace_id, self.metalog_position)
    }

    /// Ingests one package. Out-of-order packages are buffered; each
    /// position applies atomically once all its productive shards reported.
    ///
    /// # Errors
    ///
    /// `ProtocolViolation` for packages addressing another logspace.
    pub fn provide_index_data(&mut self, package: IndexDataPackage) -> Result<()> {
        if package.logspace_id != self.logspace_id {
            return Err(LogError::ProtocolViolation(format!(
                "index data for logspace {:#x} offered to index of {:#x}",
                package.logspace_id, self.logspace_id
            )));
        }
        if package.metalog_position <= self.metalog_position {
            return Ok(());
        }
        let merge = self
            .pending_packages
            .entry(package.metalog_position)
            .or_default();
        merge.expected_shards = package.num_productive_storage_shards;
        merge.shards_seen.extend(package.my_productive_shards.iter());
        merge.packages.push(package);

        self.try_advance_horizon();
        Ok(())
    }

    fn try_advance_horizon(&mut self) {
        loop {
            let next = self.metalog_position + 1;
            let complete = match self.pending_packages.get(&next) {
                Some(merge) => merge.shards_seen.len() as u32 >= merge.expected_shards,
                None => false,
            };
            if !complete {
                return;
            }
            let merge = self.pending_packages.remove(&next).unwrap();
            for package in &merge.packages {
                for record in package.records() {
                    self.apply_record(
                        record.user_logspace,
                        record.seqnum_lowhalf,
                        record.engine_id,
                        record.tags,
                    );
                }
                self.end_seqnum_position =
                    self.end_seqnum_position.max(package.end_seqnum_position);
            }
            self.metalog_position = next;
            debug!(
                logspace = format_args!("{:#x}", self.logspace_id),
                horizon = self.metalog_position,
                "index horizon advanced"
            );
        }
    }

    fn apply_record(&mut self, user_logspace: u32, seqnum: u32, engine_id: u16, tags: &[u64]) {
        let caps = self.caps;
        let owns_seqnum = self.owns_seqnum(seqnum);
        let owned_tags: Vec<u64> = tags
            .iter()
            .copied()
            .filter(|&tag| tag != EMPTY_TAG && self.owns_tag(tag))
            .collect();
        if !owns_seqnum && owned_tags.is_empty() {
            return;
        }
        let space = self.spaces.entry(user_logspace).or_default();
        if owns_seqnum {
            space.seqnums.insert(seqnum, engine_id, caps.seqnum_suffix_cap);
        }
        for &tag in &owned_tags {
            if !space.tags.contains_key(&tag) {
                space.tag_order.push_back(tag);
                while space.tag_order.len() > caps.tag_cache_cap {
                    let evicted = space.tag_order.pop_front().unwrap();
                    space.tags.remove(&evicted);
                    space.tags_evicted = true;
                }
            }
            space
                .tags
                .entry(tag)
                .or_default()
                .insert(seqnum, engine_id, caps.per_tag_seqnums_limit);
        }
    }

    /// Answers a seek query against the current horizon.
    #[must_use]
    pub fn make_query(&self, query: IndexQuery) -> IndexQueryResult {
        let progress = self.progress_token();

        // Progress gate: the querier has observed metalog state this index
        // has not applied yet.
        if types::logspace_of_seqnum(query.metalog_progress) == self.logspace_id
            && types::position_of_seqnum(query.metalog_progress) > self.metalog_position
        {
            return IndexQueryResult::of(QueryState::Continue, progress, query);
        }

        // A sharded index cannot prove anything about tags it does not own;
        // the query belongs on the owning shard.
        if query.tag != EMPTY_TAG && !self.owns_tag(query.tag) {
            return IndexQueryResult::of(QueryState::Miss, progress, query);
        }

        let position = self.normalize_position(query.query_seqnum);
        let Some(space) = self.spaces.get(&query.user_logspace) else {
            // Nothing of this logspace was ever indexed here.
            return IndexQueryResult::of(QueryState::Empty, progress, query);
        };
        let list = if query.tag == EMPTY_TAG {
            Some(&space.seqnums)
        } else {
            space.tags.get(&query.tag)
        };
        let Some(list) = list else {
            // Unknown tag: provably empty unless whole tags were evicted.
            let state = if space.tags_evicted {
                QueryState::Miss
            } else {
                QueryState::Empty
            };
            return IndexQueryResult::of(state, progress, query);
        };

        match query.direction {
            QueryDirection::ReadNext | QueryDirection::ReadNextBlocking => {
                // Evicted entries are the oldest: a seek starting below the
                // retained range cannot prove minimality of a hit.
                if list.truncated
                    && list.min_retained().is_some_and(|min| position < min)
                {
                    return IndexQueryResult::of(QueryState::Miss, progress, query);
                }
                match list.next(position) {
                    Some((seqnum, engine_id)) => IndexQueryResult {
                        state: QueryState::Found,
                        found_seqnum: types::seqnum(self.logspace_id, seqnum),
                        found_engine_id: engine_id,
                        metalog_progress: progress,
                        original_query: query,
                    },
                    None => IndexQueryResult::of(QueryState::Empty, progress, query),
                }
            }
            QueryDirection::ReadPrev => match list.prev(position) {
                Some((seqnum, engine_id)) => IndexQueryResult {
                    state: QueryState::Found,
                    found_seqnum: types::seqnum(self.logspace_id, seqnum),
                    found_engine_id: engine_id,
                    metalog_progress: progress,
                    original_query: query,
                },
                None if list.truncated => {
                    IndexQueryResult::of(QueryState::Miss, progress, query)
                }
                None => IndexQueryResult::of(QueryState::Empty, progress, query),
            },
        }
    }

    /// Projects a full query seqnum onto this phylog's position space.
    fn normalize_position(&self, query_seqnum: u64) -> u32 {
        if query_seqnum == 0 {
            return 0;
        }
        let logspace = types::logspace_of_seqnum(query_seqnum);
        if logspace < self.logspace_id {
            0
        } else if logspace == self.logspace_id {
            types::position_of_seqnum(query_seqnum)
        } else {
            u32::MAX
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
