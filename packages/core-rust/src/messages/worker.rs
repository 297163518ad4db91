//! Function-worker IPC messages.
//!
//! Workers talk to their local engine over a pre-established IPC channel;
//! these are the inline request/response shapes carried on it. A request's
//! inline data is `num_tags × 8 B` tags followed by the record payload.

use serde::{Deserialize, Serialize};

use crate::messages::base::SharedLogResultType;
use crate::types::{INVALID_SEQNUM, INVALID_TAG};

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

/// Shared-log operation requested by a function worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOpType {
    Append,
    ReadNext,
    ReadPrev,
    ReadNextBlocking,
    Trim,
    SetAuxData,
}

impl WorkerOpType {
    /// True for the three read-query operations.
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, Self::ReadNext | Self::ReadPrev | Self::ReadNextBlocking)
    }

    /// The success result type acknowledging this op.
    #[must_use]
    pub fn ok_result(self) -> SharedLogResultType {
        match self {
            Self::Append => SharedLogResultType::AppendOk,
            Self::ReadNext | Self::ReadPrev | Self::ReadNextBlocking => {
                SharedLogResultType::ReadOk
            }
            Self::Trim => SharedLogResultType::TrimOk,
            Self::SetAuxData => SharedLogResultType::AuxDataOk,
        }
    }
}

// ---------------------------------------------------------------------------
// Request / response
// ---------------------------------------------------------------------------

/// A worker's shared-log request as delivered to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// IPC channel of the requesting worker.
    pub client_id: u16,
    /// Opaque token echoed back on the response.
    pub client_data: u64,
    /// Function call this request belongs to.
    pub call_id: u64,
    pub op: WorkerOpType,
    /// Query tag for reads; [`INVALID_TAG`] when absent.
    pub tag: u64,
    /// Query/trim/aux-data seqnum; [`INVALID_SEQNUM`] when absent.
    pub seqnum: u64,
    /// Tags attached to an append.
    pub tags: Vec<u64>,
    /// Record payload for appends, aux bytes for `SetAuxData`.
    pub data: Vec<u8>,
}

impl WorkerRequest {
    /// An append of `(tags, data)` in the worker's logspace.
    #[must_use]
    pub fn append(client_id: u16, client_data: u64, call_id: u64, tags: Vec<u64>, data: Vec<u8>) -> Self {
        Self {
            client_id,
            client_data,
            call_id,
            op: WorkerOpType::Append,
            tag: INVALID_TAG,
            seqnum: INVALID_SEQNUM,
            tags,
            data,
        }
    }

    /// A read query starting from `seqnum`, optionally filtered by `tag`.
    #[must_use]
    pub fn read(
        client_id: u16,
        client_data: u64,
        call_id: u64,
        op: WorkerOpType,
        tag: u64,
        seqnum: u64,
    ) -> Self {
        Self {
            client_id,
            client_data,
            call_id,
            op,
            tag,
            seqnum,
            tags: Vec::new(),
            data: Vec::new(),
        }
    }
}

/// Engine's reply to a [`WorkerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub client_data: u64,
    pub result: SharedLogResultType,
    /// Assigned or located seqnum; [`INVALID_SEQNUM`] on failure.
    pub seqnum: u64,
    /// Metalog progress token the worker should carry forward.
    pub metalog_progress: u64,
    /// Located record's tags (reads only).
    pub tags: Vec<u64>,
    /// Located record's payload (reads only).
    pub data: Vec<u8>,
    /// Auxiliary data attached to the record, if any.
    pub aux_data: Vec<u8>,
}

impl WorkerResponse {
    /// A bare success/failure response with no record payload.
    #[must_use]
    pub fn of(result: SharedLogResultType, seqnum: u64, metalog_progress: u64) -> Self {
        Self {
            client_data: 0,
            result,
            seqnum,
            metalog_progress,
            tags: Vec::new(),
            data: Vec::new(),
            aux_data: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
