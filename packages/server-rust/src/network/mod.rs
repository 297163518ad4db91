//! Typed point-to-point messaging between node roles.
//!
//! Senders address peers by `(connection type, node id)`; the hub hides
//! whether the peer is in-process or across a TCP frame. Sends are
//! fire-and-forget with a small bounded retry: after `max_send_retries`
//! failed attempts the message is dropped and periodic reconvergence
//! (shard-progress reports, local cuts) heals the gap.

pub mod frame;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::warn;

use phylog_core::messages::{ConnType, SharedLogMessage};

use crate::error::{LogError, Result};

// ---------------------------------------------------------------------------
// MessageHub
// ---------------------------------------------------------------------------

/// One delivered message, as handed to the receiving node.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub conn_type: ConnType,
    pub message: SharedLogMessage,
    pub payload: Bytes,
}

/// Connection-typed send abstraction. A `true` return means the message was
/// accepted for delivery, not that the peer processed it.
pub trait MessageHub: Send + Sync {
    fn send(
        &self,
        conn_type: ConnType,
        dst_node_id: u16,
        message: &SharedLogMessage,
        payload: &[u8],
    ) -> bool;
}

/// Retries a send up to `max_retries` attempts, then drops.
///
/// # Errors
///
/// `TransientSend` when every attempt failed.
pub fn send_with_retry(
    hub: &dyn MessageHub,
    conn_type: ConnType,
    dst_node_id: u16,
    message: &SharedLogMessage,
    payload: &[u8],
    max_retries: u32,
) -> Result<()> {
    for _ in 0..max_retries {
        if hub.send(conn_type, dst_node_id, message, payload) {
            return Ok(());
        }
    }
    warn!(dst_node_id, "send failed, dropping message");
    Err(LogError::TransientSend {
        node_id: dst_node_id,
        attempts: max_retries,
    })
}

// ---------------------------------------------------------------------------
// InProcessHub
// ---------------------------------------------------------------------------

/// Hub for single-process deployments and tests: every node registers an
/// unbounded inbox and sends route by destination id.
#[derive(Default)]
pub struct InProcessHub {
    inboxes: DashMap<u16, mpsc::UnboundedSender<Delivery>>,
}

impl InProcessHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node and returns its inbox receiver. Re-registering a
    /// node id replaces the previous inbox.
    pub fn register_node(&self, node_id: u16) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.insert(node_id, tx);
        rx
    }

    /// Removes a departed node; subsequent sends to it fail.
    pub fn remove_node(&self, node_id: u16) {
        self.inboxes.remove(&node_id);
    }
}

impl MessageHub for InProcessHub {
    fn send(
        &self,
        conn_type: ConnType,
        dst_node_id: u16,
        message: &SharedLogMessage,
        payload: &[u8],
    ) -> bool {
        let Some(inbox) = self.inboxes.get(&dst_node_id) else {
            return false;
        };
        inbox
            .send(Delivery {
                conn_type,
                message: *message,
                payload: Bytes::copy_from_slice(payload),
            })
            .is_ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use phylog_core::messages::SharedLogOpType;

    #[test]
    fn delivers_to_registered_node() {
        let hub = InProcessHub::new();
        let mut inbox = hub.register_node(5);

        let msg = SharedLogMessage::new(SharedLogOpType::Replicate);
        assert!(hub.send(ConnType::EngineToStorage, 5, &msg, b"payload"));

        let delivery = inbox.try_recv().unwrap();
        assert_eq!(delivery.conn_type, ConnType::EngineToStorage);
        assert_eq!(delivery.message.op_type, SharedLogOpType::Replicate);
        assert_eq!(&delivery.payload[..], b"payload");
    }

    #[test]
    fn send_to_unknown_node_fails() {
        let hub = InProcessHub::new();
        let msg = SharedLogMessage::new(SharedLogOpType::Replicate);
        assert!(!hub.send(ConnType::EngineToStorage, 9, &msg, b""));
    }

    #[test]
    fn retry_exhaustion_is_transient_send() {
        let hub = InProcessHub::new();
        let msg = SharedLogMessage::new(SharedLogOpType::Replicate);
        let err = send_with_retry(&hub, ConnType::EngineToStorage, 9, &msg, b"", 3)
            .unwrap_err();
        assert!(matches!(
            err,
            LogError::TransientSend {
                node_id: 9,
                attempts: 3
            }
        ));
    }

    #[test]
    fn removed_node_stops_receiving() {
        let hub = InProcessHub::new();
        let _inbox = hub.register_node(5);
        hub.remove_node(5);
        let msg = SharedLogMessage::new(SharedLogOpType::Replicate);
        assert!(!hub.send(ConnType::EngineToStorage, 5, &msg, b""));
    }
}
