//! In-memory transport for deterministic tests.
//!
//! Two FIFO queues behind one lock. [`Transport::send`] pushes onto the
//! outgoing queue and [`Transport::receive`] pops from the incoming queue
//! without waiting. The handle is cheap to clone, so a test keeps one clone to
//! feed input and inspect output while the other is driven as a transport.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::trace;

use crate::error::McpError;
use crate::mcp::protocol::Message;
use crate::mcp::transport::Transport;

#[derive(Debug, Default)]
struct Queues {
    incoming: VecDeque<Message>,
    outgoing: VecDeque<Message>,
    connected: bool,
}

/// Queue-backed transport.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    queues: Arc<Mutex<Queues>>,
}

impl MemoryTransport {
    /// Creates an unconnected transport with empty queues.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a message for the next [`Transport::receive`].
    pub fn queue_incoming(&self, message: Message) {
        self.lock().incoming.push_back(message);
    }

    /// Takes the oldest message written by [`Transport::send`].
    #[must_use]
    pub fn pop_outgoing(&self) -> Option<Message> {
        self.lock().outgoing.pop_front()
    }

    /// Takes every message written by [`Transport::send`], oldest first.
    #[must_use]
    pub fn drain_outgoing(&self) -> Vec<Message> {
        self.lock().outgoing.drain(..).collect()
    }

    /// Number of messages waiting to be received.
    #[must_use]
    pub fn incoming_len(&self) -> usize {
        self.lock().incoming.len()
    }

    /// Number of messages sent and not yet taken.
    #[must_use]
    pub fn outgoing_len(&self) -> usize {
        self.lock().outgoing.len()
    }

    /// Empties both queues.
    pub fn clear(&self) {
        let mut queues = self.lock();
        queues.incoming.clear();
        queues.outgoing.clear();
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&mut self) -> Result<(), McpError> {
        self.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.lock().connected = false;
    }

    fn is_connected(&mut self) -> bool {
        self.lock().connected
    }

    async fn send(&mut self, message: &Message) -> Result<(), McpError> {
        let mut queues = self.lock();
        if !queues.connected {
            return Err(McpError::NotConnected);
        }
        trace!(kind = message.kind(), "memory send");
        queues.outgoing.push_back(message.clone());
        Ok(())
    }

    async fn receive(&mut self) -> Result<Message, McpError> {
        let mut queues = self.lock();
        if !queues.connected {
            return Err(McpError::NotConnected);
        }
        queues.incoming.pop_front().ok_or(McpError::QueueEmpty)
    }

    async fn ping(&mut self) -> bool {
        self.is_connected()
    }

    fn connection_info(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_goes_to_outgoing_and_receive_reads_incoming() {
        let mut transport = MemoryTransport::new();
        let peer = transport.clone();
        transport.connect().await.unwrap();

        peer.queue_incoming(Message::request(1, "ping", None));
        let received = transport.receive().await.unwrap();
        assert_eq!(received.method(), Some("ping"));

        transport
            .send(&Message::response(1.into(), json!({})))
            .await
            .unwrap();
        assert_eq!(peer.outgoing_len(), 1);
        assert!(peer.pop_outgoing().unwrap().is_reply());
        assert!(peer.pop_outgoing().is_none());
    }

    #[tokio::test]
    async fn receive_on_empty_queue_fails_immediately() {
        let mut transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        assert!(matches!(
            transport.receive().await,
            Err(McpError::QueueEmpty)
        ));
    }

    #[tokio::test]
    async fn unconnected_transport_refuses_io() {
        let mut transport = MemoryTransport::new();
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.send(&Message::notification("x", None)).await,
            Err(McpError::NotConnected)
        ));
        assert!(!transport.ping().await);
    }

    #[tokio::test]
    async fn clear_empties_both_queues() {
        let mut transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        transport.queue_incoming(Message::notification("a", None));
        transport
            .send(&Message::notification("b", None))
            .await
            .unwrap();
        transport.clear();
        assert_eq!(transport.incoming_len(), 0);
        assert!(transport.drain_outgoing().is_empty());
    }

    #[tokio::test]
    async fn queues_are_fifo() {
        let mut transport = MemoryTransport::new();
        transport.connect().await.unwrap();
        for id in 1..=3 {
            transport.queue_incoming(Message::request(id, "ping", None));
        }
        for id in 1..=3_i64 {
            let msg = transport.receive().await.unwrap();
            assert_eq!(msg.id(), Some(&id.into()));
        }
    }
}
