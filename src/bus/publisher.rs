//! Circuit-broken bus publisher.
//!
//! The tick pipeline must never block or fail because the bus is sick:
//! when the breaker is open the message is dropped and counted; publish
//! failures after the inner retry budget are recorded in the breaker and
//! swallowed. An optional batching layer buffers messages per topic and
//! flushes on size, age or explicit request.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::BusTransport;
use crate::config::BusSettings;
use crate::reliability::{BreakerConfig, CircuitBreaker, CircuitState, RetryPolicy, with_retry};

pub struct Publisher {
    transport: Arc<dyn BusTransport>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(transport: Arc<dyn BusTransport>, settings: &BusSettings) -> Self {
        Self {
            transport,
            breaker: CircuitBreaker::new(
                "bus",
                BreakerConfig {
                    failure_threshold: settings.failure_threshold,
                    recovery_timeout: settings.recovery_timeout,
                    half_open_max_attempts: 3,
                },
            ),
            // publish_retries counts retries on top of the first attempt.
            retry: RetryPolicy::new(
                settings.publish_retries + 1,
                settings.retry_backoff,
                settings.retry_backoff * 4,
            ),
        }
    }

    /// Publish with drop-on-open semantics. Never returns an error and
    /// never blocks past the inner retry budget.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) {
        if !self.breaker.can_execute() {
            metrics::increment_counter!("bus_publish_dropped", "topic" => topic.to_string());
            debug!(topic, "bus breaker open, dropping message");
            return;
        }

        let result = with_retry(&self.retry, "bus_publish", |_| true, || {
            let payload = payload.clone();
            async move { self.transport.publish(topic, &payload).await }
        })
        .await;

        match result {
            Ok(()) => self.breaker.record_success(),
            Err(e) => {
                metrics::increment_counter!("bus_publish_failed", "topic" => topic.to_string());
                self.breaker.record_failure(&e.to_string());
                warn!(topic, error = %e, "bus publish failed after retries");
            }
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<super::BusMessage> {
        self.transport.subscribe()
    }
}

struct TopicBuffer {
    items: Vec<serde_json::Value>,
    opened_at: Instant,
}

/// Per-topic batching layer over [`Publisher`]. Batches serialize as a
/// JSON array payload on the same topic.
pub struct BatchingPublisher {
    publisher: Arc<Publisher>,
    buffers: Arc<Mutex<HashMap<String, TopicBuffer>>>,
    max_size: usize,
    window: Duration,
}

impl BatchingPublisher {
    pub fn new(publisher: Arc<Publisher>, max_size: usize, window: Duration) -> Arc<Self> {
        let batcher = Arc::new(Self {
            publisher,
            buffers: Arc::new(Mutex::new(HashMap::new())),
            max_size,
            window,
        });

        let timer = batcher.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(timer.window.max(Duration::from_millis(10)) / 2);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                timer.flush_aged().await;
            }
        });

        batcher
    }

    pub async fn push(&self, topic: &str, value: serde_json::Value) {
        let full_batch = {
            let mut buffers = self.buffers.lock();
            let buffer = buffers.entry(topic.to_string()).or_insert_with(|| TopicBuffer {
                items: Vec::with_capacity(self.max_size),
                opened_at: Instant::now(),
            });
            if buffer.items.is_empty() {
                buffer.opened_at = Instant::now();
            }
            buffer.items.push(value);
            if buffer.items.len() >= self.max_size {
                Some(std::mem::take(&mut buffer.items))
            } else {
                None
            }
        };

        if let Some(items) = full_batch {
            self.publish_batch(topic, items).await;
        }
    }

    /// Flush buffers whose oldest message exceeds the window.
    async fn flush_aged(&self) {
        let due: Vec<(String, Vec<serde_json::Value>)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .filter(|(_, b)| !b.items.is_empty() && b.opened_at.elapsed() >= self.window)
                .map(|(topic, b)| {
                    b.opened_at = Instant::now();
                    (topic.clone(), std::mem::take(&mut b.items))
                })
                .collect()
        };
        for (topic, items) in due {
            self.publish_batch(&topic, items).await;
        }
    }

    /// Flush everything immediately (shutdown path).
    pub async fn flush(&self) {
        let all: Vec<(String, Vec<serde_json::Value>)> = {
            let mut buffers = self.buffers.lock();
            buffers
                .iter_mut()
                .filter(|(_, b)| !b.items.is_empty())
                .map(|(topic, b)| (topic.clone(), std::mem::take(&mut b.items)))
                .collect()
        };
        for (topic, items) in all {
            self.publish_batch(&topic, items).await;
        }
    }

    async fn publish_batch(&self, topic: &str, items: Vec<serde_json::Value>) {
        let count = items.len();
        match serde_json::to_vec(&items) {
            Ok(payload) => {
                self.publisher.publish(topic, payload).await;
                metrics::counter!("bus_batch_messages", count as u64, "topic" => topic.to_string());
            }
            Err(e) => warn!(topic, error = %e, "failed to serialize batch"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, BusTransport, MemoryBus};

    fn settings() -> BusSettings {
        BusSettings {
            redis_url: None,
            publish_retries: 2,
            retry_backoff: Duration::from_millis(1),
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_publish_delivers_through_transport() {
        let transport = Arc::new(MemoryBus::new(16));
        let publisher = Publisher::new(transport.clone(), &settings());
        let mut rx = transport.subscribe();
        publisher
            .publish("ticker:nifty:options", b"{\"x\":1}".to_vec())
            .await;
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "ticker:nifty:options");
    }

    struct FailingTransport;

    #[async_trait::async_trait]
    impl BusTransport for FailingTransport {
        async fn publish(&self, _: &str, _: &[u8]) -> crate::error::GatewayResult<()> {
            Err(crate::error::GatewayError::UpstreamTransient("down".into()))
        }
        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BusMessage> {
            let (tx, rx) = tokio::sync::broadcast::channel(1);
            std::mem::forget(tx);
            rx
        }
    }

    #[tokio::test]
    async fn test_failures_open_breaker_then_drop() {
        let publisher = Publisher::new(Arc::new(FailingTransport), &settings());
        for _ in 0..3 {
            publisher.publish("ticker:nifty:events", b"x".to_vec()).await;
        }
        assert_eq!(publisher.breaker_state(), CircuitState::Open);
        // Open breaker: message dropped without touching the transport,
        // and the call still completes quickly.
        publisher.publish("ticker:nifty:events", b"x".to_vec()).await;
    }

    #[tokio::test]
    async fn test_batch_flushes_on_size() {
        let transport = Arc::new(MemoryBus::new(16));
        let publisher = Arc::new(Publisher::new(transport.clone(), &settings()));
        let batcher = BatchingPublisher::new(publisher, 3, Duration::from_secs(60));
        let mut rx = transport.subscribe();

        for i in 0..3 {
            batcher.push("ticker:nifty:options", serde_json::json!({ "i": i })).await;
        }
        let msg = rx.recv().await.unwrap();
        let items: Vec<serde_json::Value> = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(items.len(), 3);
    }

    #[tokio::test]
    async fn test_batch_flushes_on_age() {
        let transport = Arc::new(MemoryBus::new(16));
        let publisher = Arc::new(Publisher::new(transport.clone(), &settings()));
        let batcher = BatchingPublisher::new(publisher, 100, Duration::from_millis(30));
        let mut rx = transport.subscribe();

        batcher.push("ticker:nifty:options", serde_json::json!({ "i": 0 })).await;
        let msg = tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timer flush")
            .unwrap();
        let items: Vec<serde_json::Value> = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(items.len(), 1);
    }
}
