//! Wire message types for the phylog protocol.
//!
//! `base` holds the fixed [`SharedLogMessage`](base::SharedLogMessage)
//! header and its binary codec; the other submodules define the structured
//! payloads carried behind it, all msgpack-encoded via `rmp-serde`.

pub mod base;
pub mod index_data;
pub mod metalog;
pub mod payload;
pub mod worker;

pub use base::{
    ConnType, DecodeError, SharedLogMessage, SharedLogOpType, SharedLogResultType, HEADER_SIZE,
};
pub use index_data::{IndexDataPackage, IndexRecord};
pub use metalog::{MetaLogEntry, MetaLogType, ShardDelta};
pub use payload::{ReadResponsePayload, ReplicatePayload};
pub use worker::{WorkerOpType, WorkerRequest, WorkerResponse};
