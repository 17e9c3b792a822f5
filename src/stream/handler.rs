//! Shared plumbing for stream handlers: a bounded backpressure send queue
//! (spec §5 "Shared-resource policy" / §4.5 common contract). Grounded on
//! `examples/original_source/network/stream/__init__.py`'s
//! `asyncio.Queue(maxsize=...)` send buffer.

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};

use crate::protocol::ProtocolMessage;

/// A bounded queue of outbound messages. Unlike the drop-oldest queue in
/// `MessageExchange`'s receive path, `push` exerts backpressure: it awaits
/// room rather than discarding, since senders (input device hooks) should
/// stall rather than silently lose events.
pub struct SendQueue {
    tx: mpsc::Sender<ProtocolMessage>,
    rx: Mutex<mpsc::Receiver<ProtocolMessage>>,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: Mutex::new(rx) }
    }

    pub async fn push(&self, message: ProtocolMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| anyhow::anyhow!("send queue closed"))
    }

    pub async fn pop(&self) -> Option<ProtocolMessage> {
        self.rx.lock().await.recv().await
    }

    /// Discard everything currently queued without blocking (spec §4.5:
    /// "the handler clears its backlog on screen/stream transitions").
    pub async fn drain(&self) {
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_then_pop_preserves_order() {
        let queue = SendQueue::new(4);
        queue.push(ProtocolMessage::new("mouse", "server", 0, 0.0)).await.unwrap();
        queue.push(ProtocolMessage::new("mouse", "server", 1, 0.0)).await.unwrap();

        let first = queue.pop().await.unwrap();
        let second = queue.pop().await.unwrap();
        assert_eq!(first.sequence_id, 0);
        assert_eq!(second.sequence_id, 1);
    }

    #[tokio::test]
    async fn drain_discards_queued_messages() {
        let queue = SendQueue::new(4);
        queue.push(ProtocolMessage::new("mouse", "server", 0, 0.0)).await.unwrap();
        queue.drain().await;

        let popped = tokio::time::timeout(std::time::Duration::from_millis(50), queue.pop()).await;
        assert!(popped.is_err(), "queue should be empty after drain");
    }
}
