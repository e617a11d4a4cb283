//! Vendor market-data WebSocket feed.
//!
//! One worker task per connection: a command channel carries
//! subscribe/unsubscribe requests (acked over oneshot so callers observe
//! the write outcome), a ping timer keeps the link warm, and every
//! inbound frame is decoded into raw ticks and handed to the pool's
//! event handler. Reconnection policy lives in the pool's health loop,
//! not here; a dead link simply reports `Disconnected` and exits.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::session::SessionOrchestrator;
use super::{FeedEvent, FeedEventHandler, MarketConnection, MarketFeedFactory};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{RawTick, SubscribeMode};

enum WsCommand {
    Subscribe {
        tokens: Vec<u32>,
        mode: SubscribeMode,
        ack: oneshot::Sender<GatewayResult<()>>,
    },
    Unsubscribe {
        tokens: Vec<u32>,
        ack: oneshot::Sender<GatewayResult<()>>,
    },
    Close,
}

pub struct VendorWsFeed {
    ws_url: String,
    sessions: Arc<SessionOrchestrator>,
}

impl VendorWsFeed {
    pub fn new(sessions: Arc<SessionOrchestrator>) -> Self {
        Self {
            ws_url: std::env::var("BROKER_WS_URL")
                .unwrap_or_else(|_| "wss://stream.broker.invalid/ticks".to_string()),
            sessions,
        }
    }
}

#[async_trait]
impl MarketFeedFactory for VendorWsFeed {
    async fn connect(
        &self,
        account_id: &str,
        handler: FeedEventHandler,
    ) -> GatewayResult<Arc<dyn MarketConnection>> {
        let (api_key, access_token) = self.sessions.stream_credentials(account_id)?;
        let url = format!(
            "{}?api_key={}&access_token={}",
            self.ws_url, api_key, access_token
        );

        let (ws_stream, resp) = connect_async(&url).await.map_err(|e| {
            GatewayError::UpstreamTransient(format!("ws connect for {account_id}: {e}"))
        })?;
        info!(account = %account_id, status = %resp.status(), "market ws connected");
        handler(FeedEvent::Connected);

        let (cmd_tx, cmd_rx) = mpsc::channel::<WsCommand>(256);
        let worker_account = account_id.to_string();
        tokio::spawn(async move {
            run_connection(ws_stream, cmd_rx, handler, worker_account).await;
        });

        Ok(Arc::new(WsConnection { cmd_tx }))
    }
}

struct WsConnection {
    cmd_tx: mpsc::Sender<WsCommand>,
}

impl WsConnection {
    async fn send_command(
        &self,
        build: impl FnOnce(oneshot::Sender<GatewayResult<()>>) -> WsCommand,
    ) -> GatewayResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(ack_tx))
            .await
            .map_err(|_| GatewayError::UpstreamTransient("connection worker gone".into()))?;
        ack_rx
            .await
            .map_err(|_| GatewayError::UpstreamTransient("connection dropped mid-command".into()))?
    }
}

#[async_trait]
impl MarketConnection for WsConnection {
    async fn subscribe(&self, tokens: &[u32], mode: SubscribeMode) -> GatewayResult<()> {
        let tokens = tokens.to_vec();
        self.send_command(|ack| WsCommand::Subscribe { tokens, mode, ack })
            .await
    }

    async fn unsubscribe(&self, tokens: &[u32]) -> GatewayResult<()> {
        let tokens = tokens.to_vec();
        self.send_command(|ack| WsCommand::Unsubscribe { tokens, ack })
            .await
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(WsCommand::Close).await;
    }
}

/// Inbound frame shapes the vendor emits: a bare tick array or an
/// envelope with a `ticks` field.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Ticks(Vec<RawTick>),
    Envelope {
        ticks: Vec<RawTick>,
    },
    Control {
        #[serde(rename = "type")]
        frame_type: String,
        #[serde(default)]
        message: Option<String>,
    },
}

async fn run_connection<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    mut cmd_rx: mpsc::Receiver<WsCommand>,
    handler: FeedEventHandler,
    account_id: String,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();
    let mut ping = tokio::time::interval(std::time::Duration::from_secs(15));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ping.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    handler(FeedEvent::Disconnected { reason: "ping write failed".into() });
                    return;
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                };
                match cmd {
                    WsCommand::Subscribe { tokens, mode, ack } => {
                        let frame = serde_json::json!({
                            "action": "subscribe",
                            "tokens": tokens,
                            "mode": mode.as_str(),
                        });
                        let result = write
                            .send(Message::Text(frame.to_string()))
                            .await
                            .map_err(|e| GatewayError::UpstreamTransient(format!("subscribe write: {e}")));
                        let _ = ack.send(result);
                    }
                    WsCommand::Unsubscribe { tokens, ack } => {
                        let frame = serde_json::json!({
                            "action": "unsubscribe",
                            "tokens": tokens,
                        });
                        let result = write
                            .send(Message::Text(frame.to_string()))
                            .await
                            .map_err(|e| GatewayError::UpstreamTransient(format!("unsubscribe write: {e}")));
                        let _ = ack.send(result);
                    }
                    WsCommand::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => handle_text(&text, &handler),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(account = %account_id, ?frame, "market ws close frame");
                        handler(FeedEvent::Disconnected { reason: "server close".into() });
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(account = %account_id, error = %e, "market ws read error");
                        handler(FeedEvent::Disconnected { reason: e.to_string() });
                        return;
                    }
                    None => {
                        handler(FeedEvent::Disconnected { reason: "stream ended".into() });
                        return;
                    }
                }
            }
        }
    }
}

fn handle_text(text: &str, handler: &FeedEventHandler) {
    match serde_json::from_str::<InboundFrame>(text) {
        Ok(InboundFrame::Ticks(ticks)) | Ok(InboundFrame::Envelope { ticks }) => {
            if !ticks.is_empty() {
                handler(FeedEvent::Ticks(ticks));
            }
        }
        Ok(InboundFrame::Control { frame_type, message }) => {
            if frame_type == "error" {
                handler(FeedEvent::Error(message.unwrap_or_default()));
            }
        }
        Err(e) => {
            debug!(error = %e, "unparseable market ws frame");
        }
    }
}
