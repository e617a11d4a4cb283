//! Internal pub/sub bus.
//!
//! Topic scheme: `ticker:{class}:{stream}` where `class` is the
//! underlying family (`nifty`, `banknifty`, ...) and `stream` is one of
//! `options`, `futures`, `underlying`, `events`. Payloads are UTF-8 JSON.
//! The transport is in-process by default; setting `REDIS_URL` swaps in
//! Redis pub/sub with identical topic semantics.

pub mod memory;
pub mod publisher;
pub mod redis_transport;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::GatewayResult;

pub use memory::MemoryBus;
pub use publisher::{BatchingPublisher, Publisher};
pub use redis_transport::RedisBus;

pub const TOPIC_PREFIX: &str = "ticker";

pub fn options_topic(class: &str) -> String {
    format!("{TOPIC_PREFIX}:{class}:options")
}

pub fn futures_topic(class: &str) -> String {
    format!("{TOPIC_PREFIX}:{class}:futures")
}

pub fn underlying_topic(class: &str) -> String {
    format!("{TOPIC_PREFIX}:{class}:underlying")
}

pub fn events_topic(class: &str) -> String {
    format!("{TOPIC_PREFIX}:{class}:events")
}

/// One message observed on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Transport abstraction under the publisher. Subscribers receive every
/// `ticker:*` message via a broadcast receiver; lagging receivers lose
/// the oldest messages (drop-under-backpressure is part of the contract).
#[async_trait]
pub trait BusTransport: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> GatewayResult<()>;
    fn subscribe(&self) -> broadcast::Receiver<BusMessage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(options_topic("nifty"), "ticker:nifty:options");
        assert_eq!(underlying_topic("banknifty"), "ticker:banknifty:underlying");
        assert_eq!(events_topic("nifty"), "ticker:nifty:events");
    }
}
