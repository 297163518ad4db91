//! Error taxonomy for the server components.
//!
//! The split follows how failures propagate: anything that breaks an
//! invariant between the sequencer and storage is a `ProtocolViolation` and
//! the caller is expected to treat it as fatal; transient network failures
//! are retried a bounded number of times and then dropped, relying on the
//! next periodic cut to heal.

use phylog_core::messages::DecodeError;

/// Unified error type for sequencer/engine/storage/index operations.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// An inter-node invariant was broken (e.g. a metalog entry referencing
    /// an append that was never issued). Callers treat this as fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The shard id is not part of the addressed phylog.
    #[error("unknown shard {shard_id}")]
    UnknownShard { shard_id: u16 },

    /// A send kept failing after the retry budget was exhausted. The message
    /// is dropped; periodic reconvergence re-triggers the work.
    #[error("send to node {node_id} failed after {attempts} attempts")]
    TransientSend { node_id: u16, attempts: u32 },

    /// No matching record exists. Surfaces to workers as `EMPTY`.
    #[error("no matching record")]
    NotFound,

    /// The record existed but was trimmed. Surfaces as `DATA_LOST`.
    #[error("record trimmed")]
    Truncated,

    /// The operation was tied to a view that is no longer current; the
    /// worker retries under the next view.
    #[error("view changed")]
    ViewChanged,

    /// Malformed wire data.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The cold-storage KV backend failed.
    #[error("storage backend: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LogError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = LogError::UnknownShard { shard_id: 7 };
        assert_eq!(format!("{err}"), "unknown shard 7");

        let err = LogError::TransientSend {
            node_id: 3,
            attempts: 3,
        };
        assert_eq!(format!("{err}"), "send to node 3 failed after 3 attempts");

        let err = LogError::ProtocolViolation("future position".to_string());
        assert!(format!("{err}").contains("future position"));
    }
}
