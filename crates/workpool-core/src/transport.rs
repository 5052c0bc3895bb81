//! Broadcast sink for observer-facing events.

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::protocol::ServerMessage;

/// Delivers a message to every currently connected observer.
///
/// Fire-and-forget: implementations swallow delivery failures and must
/// accept being called with no observers at all.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn broadcast(&self, message: &ServerMessage);
}

/// [`Transport`] over a tokio broadcast channel. Each observer holds a
/// receiver from [`BroadcastTransport::subscribe`].
#[derive(Debug, Clone)]
pub struct BroadcastTransport {
    tx: broadcast::Sender<ServerMessage>,
}

impl BroadcastTransport {
    /// Create a transport buffering up to `capacity` messages per observer.
    /// Observers that fall further behind skip ahead.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.tx.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastTransport {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl Transport for BroadcastTransport {
    async fn broadcast(&self, message: &ServerMessage) {
        // No observers is fine.
        let _ = self.tx.send(*message);
    }
}
