//! In-process bus transport over a tokio broadcast channel.

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{BusMessage, BusTransport};
use crate::error::GatewayResult;

pub struct MemoryBus {
    tx: broadcast::Sender<BusMessage>,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new(8192)
    }
}

#[async_trait]
impl BusTransport for MemoryBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> GatewayResult<()> {
        // A send error only means there are no subscribers yet; the bus
        // itself is healthy.
        let _ = self.tx.send(BusMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.tx.subscribe()
    }
}
