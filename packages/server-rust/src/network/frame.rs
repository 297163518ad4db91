//! Frame codec for the TCP transport: a fixed header followed by
//! `payload_size` payload bytes.

use bytes::{Bytes, BytesMut};

use phylog_core::messages::{DecodeError, SharedLogMessage, HEADER_SIZE};

/// Encodes a message and its payload into one contiguous frame. The
/// header's `payload_size` is stamped from the payload argument.
#[must_use]
pub fn encode_frame(message: &SharedLogMessage, payload: &[u8]) -> Bytes {
    let mut message = *message;
    message.payload_size = payload.len() as u32;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&message.encode());
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Tries to decode one frame from the front of `buf`. Returns the message,
/// its payload, and the number of bytes consumed; `None` when the buffer
/// does not yet hold a complete frame.
///
/// # Errors
///
/// Propagates header decode failures.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(SharedLogMessage, Bytes, usize)>, DecodeError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let message = SharedLogMessage::decode(buf)?;
    let frame_len = HEADER_SIZE + message.payload_size as usize;
    if buf.len() < frame_len {
        return Ok(None);
    }
    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..frame_len]);
    Ok(Some((message, payload, frame_len)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
