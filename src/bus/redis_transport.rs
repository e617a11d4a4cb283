//! Redis pub/sub bus transport.
//!
//! Publishes on a multiplexed connection; a background listener
//! psubscribes to `ticker:*` and re-broadcasts into a local channel so
//! in-process consumers (the client hub) see the same stream regardless
//! of transport.

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{BusMessage, BusTransport};
use crate::error::{GatewayError, GatewayResult};

pub struct RedisBus {
    client: redis::Client,
    conn: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    local_tx: broadcast::Sender<BusMessage>,
}

impl RedisBus {
    pub async fn connect(url: &str) -> GatewayResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GatewayError::Config(format!("invalid REDIS_URL: {e}")))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| GatewayError::UpstreamTransient(format!("redis connect: {e}")))?;

        let (local_tx, _) = broadcast::channel(8192);
        let bus = Self {
            client,
            conn: tokio::sync::Mutex::new(Some(conn)),
            local_tx,
        };
        bus.spawn_listener();
        info!("redis bus connected");
        Ok(bus)
    }

    fn spawn_listener(&self) {
        let client = self.client.clone();
        let local_tx = self.local_tx.clone();
        tokio::spawn(async move {
            let mut backoff = std::time::Duration::from_secs(1);
            loop {
                match Self::listen_once(&client, &local_tx).await {
                    Ok(()) => {
                        backoff = std::time::Duration::from_secs(1);
                    }
                    Err(e) => {
                        warn!(error = %e, "redis pubsub listener disconnected");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(std::time::Duration::from_secs(30));
                    }
                }
            }
        });
    }

    async fn listen_once(
        client: &redis::Client,
        local_tx: &broadcast::Sender<BusMessage>,
    ) -> Result<(), redis::RedisError> {
        let conn = client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        pubsub.psubscribe(format!("{}:*", super::TOPIC_PREFIX)).await?;
        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            let topic = msg.get_channel_name().to_string();
            let payload: Vec<u8> = msg.get_payload().unwrap_or_default();
            let _ = local_tx.send(BusMessage { topic, payload });
        }
        Ok(())
    }
}

#[async_trait]
impl BusTransport for RedisBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> GatewayResult<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let conn = self
                .client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(|e| GatewayError::UpstreamTransient(format!("redis reconnect: {e}")))?;
            *guard = Some(conn);
        }
        let conn = guard.as_mut().expect("connection populated above");
        match conn.publish::<_, _, ()>(topic, payload).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Drop the connection so the next publish re-dials.
                *guard = None;
                Err(GatewayError::UpstreamTransient(format!(
                    "redis publish: {e}"
                )))
            }
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.local_tx.subscribe()
    }
}
