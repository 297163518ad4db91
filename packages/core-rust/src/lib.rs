//! phylog core — identifier packing, hashing, and wire message types shared
//! by the sequencer, engine, storage, index, and gateway roles.

pub mod bits;
pub mod hash;
pub mod messages;
pub mod types;

pub use types::{
    LogEntry, LogMetaData, EMPTY_TAG, INVALID_CALL_ID, INVALID_NODE_ID, INVALID_SEQNUM,
    INVALID_TAG,
};
