//! Structured payload shapes carried behind [`SharedLogMessage`] headers,
//! with their msgpack codecs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::messages::base::DecodeError;

/// Payload of a `Replicate` message: the record's tags and data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatePayload {
    pub tags: Vec<u64>,
    pub data: Vec<u8>,
}

/// Payload of a `ReadOk` response: the located record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponsePayload {
    pub tags: Vec<u64>,
    pub data: Vec<u8>,
    pub aux_data: Vec<u8>,
}

/// Encodes any payload struct to msgpack bytes.
#[must_use]
pub fn encode<T: Serialize>(payload: &T) -> Vec<u8> {
    rmp_serde::to_vec(payload).expect("payload types always serialize")
}

/// Decodes a msgpack payload.
///
/// # Errors
///
/// `DecodeError::Payload` on malformed bytes.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    rmp_serde::from_slice(bytes).map_err(|e| DecodeError::Payload(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
