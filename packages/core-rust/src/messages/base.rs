//! The `SharedLogMessage` wire header and its binary codec.
//!
//! Every inter-node message is a fixed-size header followed by an opaque
//! payload (`payload_size` bytes). The header is encoded manually with
//! explicit little-endian layout; payloads are either raw record bytes or
//! msgpack-encoded structs from the sibling modules.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::types::{INVALID_NODE_ID, INVALID_SEQNUM, INVALID_TAG};

/// Encoded size of a [`SharedLogMessage`] header.
pub const HEADER_SIZE: usize = 72;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Operation carried by a [`SharedLogMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SharedLogOpType {
    Invalid = 0x00,
    Replicate = 0x01,
    Metalogs = 0x02,
    IndexData = 0x03,
    ReadNext = 0x04,
    ReadPrev = 0x05,
    ReadNextBlocking = 0x06,
    ReadAt = 0x07,
    Response = 0x08,
    SetAuxData = 0x09,
    Register = 0x0a,
    MetaProg = 0x0b,
    /// Storage-to-sequencer shard-progress vector.
    ShardProg = 0x0c,
    /// One index shard's answer to a fanned-out query, bound for the
    /// merging aggregator (or master index node).
    SlaveResult = 0x0d,
}

impl SharedLogOpType {
    /// Decodes a wire value; unknown values map to `Invalid`.
    #[must_use]
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x01 => Self::Replicate,
            0x02 => Self::Metalogs,
            0x03 => Self::IndexData,
            0x04 => Self::ReadNext,
            0x05 => Self::ReadPrev,
            0x06 => Self::ReadNextBlocking,
            0x07 => Self::ReadAt,
            0x08 => Self::Response,
            0x09 => Self::SetAuxData,
            0x0a => Self::Register,
            0x0b => Self::MetaProg,
            0x0c => Self::ShardProg,
            0x0d => Self::SlaveResult,
            _ => Self::Invalid,
        }
    }

    /// True for the three read-query operations.
    #[must_use]
    pub fn is_read_query(self) -> bool {
        matches!(
            self,
            Self::ReadNext | Self::ReadPrev | Self::ReadNextBlocking
        )
    }
}

/// Result carried by a `Response` message, and by worker responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum SharedLogResultType {
    Invalid = 0x00,
    AppendOk = 0x20,
    ReadOk = 0x21,
    TrimOk = 0x22,
    AuxDataOk = 0x23,
    /// No matching record exists up to the responder's horizon.
    Empty = 0x30,
    /// The record existed but has been trimmed away.
    DataLost = 0x31,
    /// The operation was invalidated by a view change; retry under the
    /// next view.
    Discarded = 0x32,
    /// Storage could not locate the record (in-memory nor backend).
    LookupFailed = 0x33,
}

impl SharedLogResultType {
    /// Decodes a wire value; unknown values map to `Invalid`.
    #[must_use]
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x20 => Self::AppendOk,
            0x21 => Self::ReadOk,
            0x22 => Self::TrimOk,
            0x23 => Self::AuxDataOk,
            0x30 => Self::Empty,
            0x31 => Self::DataLost,
            0x32 => Self::Discarded,
            0x33 => Self::LookupFailed,
            _ => Self::Invalid,
        }
    }
}

/// Typed connection classes between node roles.
///
/// Sends are routed per `(conn_type, dst_node_id)`; receivers use the type
/// to validate which operations a peer may legally send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    EngineToStorage,
    EngineToSequencer,
    EngineToIndex,
    EngineToEngine,
    StorageToSequencer,
    StorageToIndex,
    StorageToEngine,
    SequencerToSequencer,
    SequencerToEngine,
    SequencerToStorage,
    SequencerToIndex,
    SequencerToAggregator,
    IndexToAggregator,
    IndexToStorage,
    IndexToEngine,
    AggregatorToEngine,
}

// ---------------------------------------------------------------------------
// SharedLogMessage
// ---------------------------------------------------------------------------

/// Fixed wire header preceding every inter-node payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedLogMessage {
    pub op_type: SharedLogOpType,
    pub result_type: SharedLogResultType,
    pub logspace_id: u32,
    pub user_logspace: u32,
    /// Low half of the seqnum this message refers to (`ReadAt`, responses).
    pub seqnum_lowhalf: u32,
    /// Metalog position for `Metalogs` / `MetaProg` / index-data messages.
    pub metalog_position: u32,
    pub query_tag: u64,
    /// Metalog progress token the sender requires or reports.
    pub user_metalog_progress: u64,
    /// Local id of the record being replicated (`Replicate` only).
    pub localid: u64,
    pub storage_shard_id: u16,
    pub origin_node_id: u16,
    pub hop_times: u16,
    pub num_tags: u16,
    /// Merge target of a fanned-out read query; [`INVALID_NODE_ID`] for
    /// single-target queries.
    pub aggregator_node_id: u16,
    pub client_data: u64,
    pub payload_size: u32,
}

impl SharedLogMessage {
    /// A zeroed header with the given op type.
    #[must_use]
    pub fn new(op_type: SharedLogOpType) -> Self {
        Self {
            op_type,
            result_type: SharedLogResultType::Invalid,
            logspace_id: 0,
            user_logspace: 0,
            seqnum_lowhalf: 0,
            metalog_position: 0,
            query_tag: INVALID_TAG,
            user_metalog_progress: 0,
            localid: 0,
            storage_shard_id: 0,
            origin_node_id: 0,
            hop_times: 0,
            num_tags: 0,
            aggregator_node_id: INVALID_NODE_ID,
            client_data: 0,
            payload_size: 0,
        }
    }

    /// Header for replicating a record from an engine to storage nodes.
    #[must_use]
    pub fn new_replicate(logspace_id: u32) -> Self {
        Self {
            logspace_id,
            ..Self::new(SharedLogOpType::Replicate)
        }
    }

    /// Header for a point read of `seqnum` at a storage node.
    #[must_use]
    pub fn new_read_at(seqnum: u64) -> Self {
        Self {
            logspace_id: crate::types::logspace_of_seqnum(seqnum),
            seqnum_lowhalf: crate::types::position_of_seqnum(seqnum),
            ..Self::new(SharedLogOpType::ReadAt)
        }
    }

    /// Header for broadcasting metalog entries.
    #[must_use]
    pub fn new_metalogs(logspace_id: u32) -> Self {
        Self {
            logspace_id,
            ..Self::new(SharedLogOpType::Metalogs)
        }
    }

    /// Header for a backup sequencer acknowledging its metalog position.
    #[must_use]
    pub fn new_meta_prog(logspace_id: u32, metalog_position: u32) -> Self {
        Self {
            logspace_id,
            metalog_position,
            ..Self::new(SharedLogOpType::MetaProg)
        }
    }

    /// Header for shipping index-data packages from storage to index nodes.
    #[must_use]
    pub fn new_index_data(logspace_id: u32) -> Self {
        Self {
            logspace_id,
            ..Self::new(SharedLogOpType::IndexData)
        }
    }

    /// Header for writing auxiliary data attached to `seqnum`.
    #[must_use]
    pub fn new_set_auxdata(seqnum: u64) -> Self {
        Self {
            logspace_id: crate::types::logspace_of_seqnum(seqnum),
            seqnum_lowhalf: crate::types::position_of_seqnum(seqnum),
            ..Self::new(SharedLogOpType::SetAuxData)
        }
    }

    /// Header for a response with the given result.
    #[must_use]
    pub fn new_response(result_type: SharedLogResultType) -> Self {
        Self {
            result_type,
            ..Self::new(SharedLogOpType::Response)
        }
    }

    /// Full seqnum referred to by this header.
    #[must_use]
    pub fn full_seqnum(&self) -> u64 {
        if self.logspace_id == 0 && self.seqnum_lowhalf == 0 {
            INVALID_SEQNUM
        } else {
            crate::types::seqnum(self.logspace_id, self.seqnum_lowhalf)
        }
    }

    /// Encodes the header into `HEADER_SIZE` bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);
        buf.put_u16_le(self.op_type as u16);
        buf.put_u16_le(self.result_type as u16);
        buf.put_u32_le(self.logspace_id);
        buf.put_u32_le(self.user_logspace);
        buf.put_u32_le(self.seqnum_lowhalf);
        buf.put_u32_le(self.metalog_position);
        buf.put_u64_le(self.query_tag);
        buf.put_u64_le(self.user_metalog_progress);
        buf.put_u64_le(self.localid);
        buf.put_u16_le(self.storage_shard_id);
        buf.put_u16_le(self.origin_node_id);
        buf.put_u16_le(self.hop_times);
        buf.put_u16_le(self.num_tags);
        buf.put_u16_le(self.aggregator_node_id);
        buf.put_u64_le(self.client_data);
        buf.put_u32_le(self.payload_size);
        // Reserved tail pads the header to HEADER_SIZE.
        buf.resize(HEADER_SIZE, 0);
        buf.freeze()
    }

    /// Decodes a header from exactly `HEADER_SIZE` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::Truncated`] if `buf` is too short.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < HEADER_SIZE {
            return Err(DecodeError::Truncated {
                have: buf.len(),
                need: HEADER_SIZE,
            });
        }
        let mut buf = buf;
        Ok(Self {
            op_type: SharedLogOpType::from_u16(buf.get_u16_le()),
            result_type: SharedLogResultType::from_u16(buf.get_u16_le()),
            logspace_id: buf.get_u32_le(),
            user_logspace: buf.get_u32_le(),
            seqnum_lowhalf: buf.get_u32_le(),
            metalog_position: buf.get_u32_le(),
            query_tag: buf.get_u64_le(),
            user_metalog_progress: buf.get_u64_le(),
            localid: buf.get_u64_le(),
            storage_shard_id: buf.get_u16_le(),
            origin_node_id: buf.get_u16_le(),
            hop_times: buf.get_u16_le(),
            num_tags: buf.get_u16_le(),
            aggregator_node_id: buf.get_u16_le(),
            client_data: buf.get_u64_le(),
            payload_size: buf.get_u32_le(),
        })
    }
}

/// Errors from decoding wire headers.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated header: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },
    #[error("malformed payload: {0}")]
    Payload(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types;

    #[test]
    fn header_encode_decode_round_trip() {
        let mut msg = SharedLogMessage::new_replicate(types::logspace_id(1, 2));
        msg.user_logspace = 7;
        msg.localid = (3u64 << 48) | 99;
        msg.aggregator_node_id = 40;
        msg.storage_shard_id = 3;
        msg.origin_node_id = 11;
        msg.num_tags = 2;
        msg.client_data = 0xdead_beef;
        msg.payload_size = 48;

        let encoded = msg.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = SharedLogMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_rejects_short_buffer() {
        let err = SharedLogMessage::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, DecodeError::Truncated { have: 10, .. }));
    }

    #[test]
    fn read_at_carries_split_seqnum() {
        let seqnum = types::seqnum(types::logspace_id(4, 9), 1234);
        let msg = SharedLogMessage::new_read_at(seqnum);
        assert_eq!(msg.logspace_id, types::logspace_id(4, 9));
        assert_eq!(msg.seqnum_lowhalf, 1234);
        assert_eq!(msg.full_seqnum(), seqnum);
    }

    #[test]
    fn unknown_op_type_decodes_to_invalid() {
        assert_eq!(SharedLogOpType::from_u16(0xff), SharedLogOpType::Invalid);
        assert_eq!(
            SharedLogResultType::from_u16(0xff),
            SharedLogResultType::Invalid
        );
    }

    #[test]
    fn read_query_classification() {
        assert!(SharedLogOpType::ReadNext.is_read_query());
        assert!(SharedLogOpType::ReadPrev.is_read_query());
        assert!(SharedLogOpType::ReadNextBlocking.is_read_query());
        assert!(!SharedLogOpType::ReadAt.is_read_query());
        assert!(!SharedLogOpType::Replicate.is_read_query());
    }
}
