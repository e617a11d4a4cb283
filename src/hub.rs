//! Client WebSocket fan-out hub.
//!
//! One bus reader receives every published snapshot and bar; routing is
//! per instrument token through a reverse index. Each client has a
//! bounded outbound queue written by its own writer task: sends are
//! strictly `try_send`, a full queue drops the frame for that client
//! only, and enough consecutive drops disconnect the slow client so it
//! can never stall the fast ones.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::auth::{Claims, RevocationRegistry};
use crate::bus::BusMessage;
use crate::config::HubSettings;

/// Policy close code for auth failures (RFC 6455).
const CLOSE_POLICY: u16 = 1008;
/// Close code sent to clients disconnected for sustained backpressure.
const CLOSE_OVERLOAD: u16 = 1013;

struct ClientEntry {
    sender: mpsc::Sender<Message>,
    user_id: String,
    token_hash: String,
    subs: HashSet<u32>,
    consecutive_drops: u32,
}

pub struct ClientHub {
    settings: HubSettings,
    revocations: Arc<RevocationRegistry>,
    clients: RwLock<HashMap<u64, ClientEntry>>,
    subscribers: RwLock<HashMap<u32, HashSet<u64>>>,
    /// Underlying bars carry a symbol, not a token; this maps them back
    /// for routing.
    underlying_tokens: RwLock<HashMap<String, u32>>,
    next_conn_id: AtomicU64,
}

impl ClientHub {
    pub fn new(settings: HubSettings, revocations: Arc<RevocationRegistry>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            revocations,
            clients: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            underlying_tokens: RwLock::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
        })
    }

    /// Seed the symbol -> token index for underlying bar routing.
    pub fn index_underlyings(&self, pairs: Vec<(u32, String)>) {
        let mut map = self.underlying_tokens.write();
        for (token, symbol) in pairs {
            map.insert(symbol, token);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn register(&self, user_id: &str, token_hash: &str) -> (u64, mpsc::Receiver<Message>) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(self.settings.client_buffer);
        self.clients.write().insert(
            conn_id,
            ClientEntry {
                sender: tx,
                user_id: user_id.to_string(),
                token_hash: token_hash.to_string(),
                subs: HashSet::new(),
                consecutive_drops: 0,
            },
        );
        metrics::gauge!("hub_clients", self.client_count() as f64);
        (conn_id, rx)
    }

    pub fn unregister(&self, conn_id: u64) {
        let removed = self.clients.write().remove(&conn_id);
        if let Some(entry) = removed {
            let mut subscribers = self.subscribers.write();
            for token in entry.subs {
                if let Some(set) = subscribers.get_mut(&token) {
                    set.remove(&conn_id);
                    if set.is_empty() {
                        subscribers.remove(&token);
                    }
                }
            }
            info!(conn = conn_id, user = %entry.user_id, "client disconnected");
        }
        metrics::gauge!("hub_clients", self.client_count() as f64);
    }

    pub fn subscribe_tokens(&self, conn_id: u64, tokens: &[u32]) {
        let mut clients = self.clients.write();
        let Some(entry) = clients.get_mut(&conn_id) else {
            return;
        };
        let mut subscribers = self.subscribers.write();
        for &token in tokens {
            entry.subs.insert(token);
            subscribers.entry(token).or_default().insert(conn_id);
        }
    }

    pub fn unsubscribe_tokens(&self, conn_id: u64, tokens: &[u32]) {
        let mut clients = self.clients.write();
        let Some(entry) = clients.get_mut(&conn_id) else {
            return;
        };
        let mut subscribers = self.subscribers.write();
        for &token in tokens {
            entry.subs.remove(&token);
            if let Some(set) = subscribers.get_mut(&token) {
                set.remove(&conn_id);
                if set.is_empty() {
                    subscribers.remove(&token);
                }
            }
        }
    }

    /// Fan one frame out to every subscriber of `token`. Never blocks;
    /// slow clients accumulate drops and are eventually cut.
    fn fanout(&self, token: u32, frame: &str) {
        let targets: Vec<u64> = match self.subscribers.read().get(&token) {
            Some(set) => set.iter().copied().collect(),
            None => return,
        };

        let mut to_disconnect: Vec<u64> = Vec::new();
        {
            let mut clients = self.clients.write();
            for conn_id in targets {
                let Some(entry) = clients.get_mut(&conn_id) else {
                    continue;
                };
                match entry.sender.try_send(Message::Text(frame.to_string())) {
                    Ok(()) => entry.consecutive_drops = 0,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        entry.consecutive_drops += 1;
                        metrics::increment_counter!("hub_frames_dropped");
                        if entry.consecutive_drops >= self.settings.max_consecutive_drops {
                            warn!(
                                conn = conn_id,
                                drops = entry.consecutive_drops,
                                "slow client exceeded drop budget"
                            );
                            to_disconnect.push(conn_id);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => to_disconnect.push(conn_id),
                }
            }
        }

        for conn_id in to_disconnect {
            // Best-effort close frame; the queue is full, so usually the
            // drop of the sender is what ends the writer.
            if let Some(entry) = self.clients.read().get(&conn_id) {
                let _ = entry.sender.try_send(Message::Close(Some(CloseFrame {
                    code: CLOSE_OVERLOAD,
                    reason: "outbound buffer overflow".into(),
                })));
            }
            metrics::increment_counter!("hub_clients_disconnected", "reason" => "overload");
            self.unregister(conn_id);
        }
    }

    /// Route one payload item (snapshot, bar or event) to subscribers.
    fn route_value(&self, topic: &str, value: &serde_json::Value) {
        let token = value
            .get("token")
            .and_then(|t| t.as_u64())
            .map(|t| t as u32)
            .or_else(|| {
                value
                    .get("symbol")
                    .and_then(|s| s.as_str())
                    .and_then(|symbol| self.underlying_tokens.read().get(symbol).copied())
            });
        let Some(token) = token else {
            debug!(topic, "bus message without routable identity");
            return;
        };

        let frame = json!({
            "type": "tick",
            "topic": topic,
            "data": value,
        })
        .to_string();
        self.fanout(token, &frame);
    }

    fn route_message(&self, msg: &BusMessage) {
        match serde_json::from_slice::<serde_json::Value>(&msg.payload) {
            Ok(serde_json::Value::Array(items)) => {
                for item in items {
                    self.route_value(&msg.topic, &item);
                }
            }
            Ok(value) => self.route_value(&msg.topic, &value),
            Err(e) => debug!(topic = %msg.topic, error = %e, "unparseable bus payload"),
        }
    }

    /// Single bus reader feeding every connected client.
    pub async fn run_bus_reader(
        self: Arc<Self>,
        mut rx: tokio::sync::broadcast::Receiver<BusMessage>,
        mut cancel: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Ok(msg) => self.route_message(&msg),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        metrics::counter!("hub_bus_lagged", skipped);
                        warn!(skipped, "hub reader lagged the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                },
                _ = cancel.changed() => return Ok(()),
            }
        }
    }

    /// Revoke-and-cut: close every live session bound to this token hash.
    pub fn close_revoked(&self, token_hash: &str) {
        let targets: Vec<u64> = self
            .clients
            .read()
            .iter()
            .filter(|(_, entry)| entry.token_hash == token_hash)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in targets {
            if let Some(entry) = self.clients.read().get(&conn_id) {
                let _ = entry.sender.try_send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY,
                    reason: "token revoked".into(),
                })));
            }
            self.unregister(conn_id);
        }
    }
}

/// Client -> server protocol.
#[derive(Debug, Deserialize)]
struct ClientFrame {
    action: String,
    #[serde(default)]
    tokens: Vec<u32>,
}

fn frame_connected(conn_id: u64) -> String {
    json!({"type": "connected", "conn_id": conn_id}).to_string()
}

fn frame_ack(kind: &str, tokens: &[u32]) -> String {
    json!({"type": kind, "tokens": tokens}).to_string()
}

fn frame_error(message: &str) -> String {
    json!({"type": "error", "message": message}).to_string()
}

/// Drive one accepted client socket until it disconnects.
pub async fn handle_socket(
    socket: WebSocket,
    hub: Arc<ClientHub>,
    claims: Claims,
    token_hash: String,
) {
    let (conn_id, mut outbound) = hub.register(&claims.sub, &token_hash);
    info!(conn = conn_id, user = %claims.username, "client connected");

    let (mut sink, mut stream) = socket.split();

    // Writer: drains the bounded queue; exits when the hub drops the
    // sender or the socket dies.
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // The register channel is fresh, so this cannot drop.
    if let Some(entry) = hub.clients.read().get(&conn_id) {
        let _ = entry
            .sender
            .try_send(Message::Text(frame_connected(conn_id)));
    }

    while let Some(frame) = stream.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(conn = conn_id, error = %e, "client socket error");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                let reply = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => match frame.action.as_str() {
                        "subscribe" => {
                            if hub.revocations.is_revoked(&token_hash) {
                                let _ = send_to(&hub, conn_id, Message::Close(Some(CloseFrame {
                                    code: CLOSE_POLICY,
                                    reason: "token revoked".into(),
                                })));
                                break;
                            }
                            hub.subscribe_tokens(conn_id, &frame.tokens);
                            frame_ack("subscribed", &frame.tokens)
                        }
                        "unsubscribe" => {
                            hub.unsubscribe_tokens(conn_id, &frame.tokens);
                            frame_ack("unsubscribed", &frame.tokens)
                        }
                        "ping" => json!({"type": "pong"}).to_string(),
                        other => frame_error(&format!("unknown action: {other}")),
                    },
                    Err(_) => frame_error("malformed frame"),
                };
                let _ = send_to(&hub, conn_id, Message::Text(reply));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    hub.unregister(conn_id);
    writer.abort();
}

fn send_to(hub: &ClientHub, conn_id: u64, msg: Message) -> bool {
    hub.clients
        .read()
        .get(&conn_id)
        .map(|entry| entry.sender.try_send(msg).is_ok())
        .unwrap_or(false)
}
