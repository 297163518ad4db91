//! Metalog entry types: the records that linearize appends within a phylog.
//!
//! A `NEW_LOGS` entry assigns a contiguous seqnum range to the appends that
//! a set of storage shards replicated since the previous cut. Entries are
//! msgpack-encoded (via `rmp-serde`) when carried as a `Metalogs` payload.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// MetaLogEntry
// ---------------------------------------------------------------------------

/// Discriminant for metalog entry kinds. Only `NewLogs` exists today; trims
/// will get their own kind when server-side trimming lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaLogType {
    NewLogs,
}

/// Per-shard slice of a `NEW_LOGS` entry. The three parallel arrays of the
/// wire form are exposed as one struct per shard for ergonomic iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDelta {
    /// Local storage shard id within the owning phylog.
    pub shard_id: u16,
    /// Shard-local cut position this slice starts at.
    pub shard_start: u32,
    /// Number of records this slice contributes.
    pub delta: u32,
}

/// One totally-ordered metalog record for a phylog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaLogEntry {
    pub logspace_id: u32,
    /// Dense, strictly increasing position of this entry in the metalog.
    pub metalog_seqnum: u32,
    pub entry_type: MetaLogType,
    /// Low half of the phylog seqnum the covered range starts at.
    pub start_seqnum: u32,
    /// Covered shards, in the order the sequencer cut them.
    pub shards: Vec<ShardDelta>,
}

impl MetaLogEntry {
    /// Sum of all shard deltas: the number of seqnums this entry assigns.
    #[must_use]
    pub fn total_delta(&self) -> u32 {
        self.shards.iter().map(|s| s.delta).sum()
    }

    /// Low half of the first seqnum past the covered range.
    #[must_use]
    pub fn end_seqnum(&self) -> u32 {
        self.start_seqnum + self.total_delta()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> MetaLogEntry {
        MetaLogEntry {
            logspace_id: 0x0001_0002,
            metalog_seqnum: 5,
            entry_type: MetaLogType::NewLogs,
            start_seqnum: 100,
            shards: vec![
                ShardDelta {
                    shard_id: 1,
                    shard_start: 40,
                    delta: 10,
                },
                ShardDelta {
                    shard_id: 2,
                    shard_start: 0,
                    delta: 5,
                },
            ],
        }
    }

    #[test]
    fn total_delta_sums_shards() {
        assert_eq!(entry().total_delta(), 15);
        assert_eq!(entry().end_seqnum(), 115);
    }

    #[test]
    fn msgpack_round_trip() {
        let e = entry();
        let bytes = rmp_serde::to_vec(&e).unwrap();
        let back: MetaLogEntry = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, e);
    }
}
