//! Index-data packages: the storage-to-index feed that populates tag
//! indexes.
//!
//! A storage node emits exactly one package per applied `NEW_LOGS` entry
//! that produced live records on that node. Entries are encoded as parallel
//! arrays (one element per new record, tags flattened) so the index can
//! ingest without per-record allocation.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// IndexDataPackage
// ---------------------------------------------------------------------------

/// Index feed for one applied metalog entry, from one storage node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDataPackage {
    pub logspace_id: u32,
    /// Metalog position after applying the covered entry.
    pub metalog_position: u32,
    /// Low half of the phylog seqnum position after applying.
    pub end_seqnum_position: u32,
    /// Number of shards the covering metalog entry cut. The index's horizon
    /// advances once packages from this many distinct shards have merged.
    pub num_productive_storage_shards: u32,
    /// Local shard ids this package's records came from.
    pub my_productive_shards: Vec<u16>,
    /// Low halves of the new records' seqnums, ascending.
    pub seqnum_lowhalves: Vec<u32>,
    /// Originating storage shard id per record (high half of the localid).
    pub engine_ids: Vec<u16>,
    /// User logspace per record.
    pub user_logspaces: Vec<u32>,
    /// Tag count per record; indexes into `tags`.
    pub tag_sizes: Vec<u32>,
    /// All records' tags, flattened in record order.
    pub tags: Vec<u64>,
}

impl IndexDataPackage {
    /// Number of records carried.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seqnum_lowhalves.len()
    }

    /// True if the package carries no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seqnum_lowhalves.is_empty()
    }

    /// Iterates `(seqnum_lowhalf, engine_id, user_logspace, tags)` per
    /// record, walking the flattened tag array with `tag_sizes`.
    pub fn records(&self) -> impl Iterator<Item = IndexRecord<'_>> {
        let mut tag_offset = 0usize;
        (0..self.len()).map(move |i| {
            let num_tags = self.tag_sizes[i] as usize;
            let tags = &self.tags[tag_offset..tag_offset + num_tags];
            tag_offset += num_tags;
            IndexRecord {
                seqnum_lowhalf: self.seqnum_lowhalves[i],
                engine_id: self.engine_ids[i],
                user_logspace: self.user_logspaces[i],
                tags,
            }
        })
    }
}

/// Borrowed view of one record inside an [`IndexDataPackage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRecord<'a> {
    pub seqnum_lowhalf: u32,
    pub engine_id: u16,
    pub user_logspace: u32,
    pub tags: &'a [u64],
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
