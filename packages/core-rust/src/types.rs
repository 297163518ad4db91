//! Core identifier types and constants shared by every node role.
//!
//! A *phylog* (physical log) is identified by a 32-bit logspace id,
//! `view_id‖sequencer_id`. Sequence numbers are 64-bit,
//! `logspace_id‖position`, so a seqnum is globally unique and orders
//! records within its phylog. Local ids are assigned by engines before
//! sequencing: `storage_shard_id (hi16)‖sequence (lo48)`.

use serde::{Deserialize, Serialize};

use crate::bits;

/// Sentinel for "no seqnum assigned yet" / failed operations.
pub const INVALID_SEQNUM: u64 = u64::MAX;

/// Sentinel tag meaning "no tag filter".
pub const INVALID_TAG: u64 = u64::MAX;

/// Tag value of untagged records; they are indexed by seqnum only.
pub const EMPTY_TAG: u64 = 0;

/// Sentinel for "no function call".
pub const INVALID_CALL_ID: u64 = u64::MAX;

/// Sentinel for "no node".
pub const INVALID_NODE_ID: u16 = u16::MAX;

// ---------------------------------------------------------------------------
// Logspace / seqnum / metalog-progress packing
// ---------------------------------------------------------------------------

/// Builds a logspace id from view and sequencer ids.
#[inline]
#[must_use]
pub const fn logspace_id(view_id: u16, sequencer_id: u16) -> u32 {
    bits::join16(view_id, sequencer_id)
}

/// View id half of a logspace id.
#[inline]
#[must_use]
pub const fn view_of_logspace(logspace_id: u32) -> u16 {
    bits::high_half32(logspace_id)
}

/// Sequencer id half of a logspace id.
#[inline]
#[must_use]
pub const fn sequencer_of_logspace(logspace_id: u32) -> u16 {
    bits::low_half32(logspace_id)
}

/// Builds a full seqnum from a logspace id and a 32-bit position.
#[inline]
#[must_use]
pub const fn seqnum(logspace_id: u32, position: u32) -> u64 {
    bits::join32(logspace_id, position)
}

/// Logspace half of a seqnum.
#[inline]
#[must_use]
pub const fn logspace_of_seqnum(seqnum: u64) -> u32 {
    bits::high_half64(seqnum)
}

/// Position half of a seqnum.
#[inline]
#[must_use]
pub const fn position_of_seqnum(seqnum: u64) -> u32 {
    bits::low_half64(seqnum)
}

/// Packs a metalog progress token: `logspace_id‖(metalog_seqnum + 1)`.
///
/// The `+ 1` makes the token the count of applied metalog entries, so a
/// zero token means "no progress required".
#[inline]
#[must_use]
pub const fn metalog_progress(logspace_id: u32, metalog_seqnum: u32) -> u64 {
    bits::join32(logspace_id, metalog_seqnum + 1)
}

// ---------------------------------------------------------------------------
// LocalId
// ---------------------------------------------------------------------------

/// Per-shard identifier assigned to an append before it has a seqnum.
///
/// Layout: `storage_shard_id` in the high 16 bits, a monotonically
/// increasing per-shard sequence in the low 48. The sequence portion is what
/// shard-progress vectors and metalog cuts count in.
pub mod local_id {
    const SEQ_BITS: u32 = 48;
    const SEQ_MASK: u64 = (1 << SEQ_BITS) - 1;

    /// Packs a local id.
    #[inline]
    #[must_use]
    pub const fn pack(storage_shard_id: u16, sequence: u64) -> u64 {
        ((storage_shard_id as u64) << SEQ_BITS) | (sequence & SEQ_MASK)
    }

    /// Storage shard that issued this local id.
    #[inline]
    #[must_use]
    pub const fn shard_of(localid: u64) -> u16 {
        (localid >> SEQ_BITS) as u16
    }

    /// Per-shard sequence portion.
    #[inline]
    #[must_use]
    pub const fn sequence_of(localid: u64) -> u64 {
        localid & SEQ_MASK
    }
}

// ---------------------------------------------------------------------------
// Log entry data model
// ---------------------------------------------------------------------------

/// Metadata of a log record as it moves through replication and sequencing.
///
/// `seqnum` stays [`INVALID_SEQNUM`] until the covering metalog entry is
/// applied; `localid` is zero until the owning engine assigns one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMetaData {
    pub user_logspace: u32,
    pub seqnum: u64,
    pub localid: u64,
    pub num_tags: usize,
    pub data_size: usize,
}

/// A fully materialized log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub metadata: LogMetaData,
    pub user_tags: Vec<u64>,
    pub data: Vec<u8>,
    pub aux_data: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
