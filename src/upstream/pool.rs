//! Per-account upstream connection pool.
//!
//! Each account owns a list of streaming connections, each carrying at
//! most `max_instruments_per_ws_connection` tokens. Placement is
//! first-fit; a new connection is created only when no existing one can
//! accept the token. All mutation for one account is serialized by a
//! single async mutex; upstream dispatch happens with the lock held so
//! ownership commits exactly reflect what the vendor accepted.
//! Ownership is committed only after the upstream call succeeds, so a
//! failed or timed-out subscribe leaves no residue to roll back.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::{FeedEvent, MarketConnection, MarketFeedFactory, TickBatch};
use crate::config::PoolSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::models::SubscribeMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnected,
}

impl ConnState {
    fn as_str(&self) -> &'static str {
        match self {
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Disconnected => "disconnected",
        }
    }
}

/// Connection status shared with the feed event handler.
struct SlotStatus {
    state: parking_lot::Mutex<ConnState>,
    last_tick_ms: AtomicI64,
}

impl SlotStatus {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: parking_lot::Mutex::new(ConnState::Connecting),
            last_tick_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
        })
    }

    fn touch(&self) {
        self.last_tick_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock() = state;
        if state == ConnState::Connected {
            self.touch();
        }
    }

    fn state(&self) -> ConnState {
        *self.state.lock()
    }

    fn millis_since_tick(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() - self.last_tick_ms.load(Ordering::Relaxed)
    }
}

struct ConnectionSlot {
    id: u64,
    conn: Arc<dyn MarketConnection>,
    status: Arc<SlotStatus>,
    subscribed: HashMap<u32, SubscribeMode>,
}

struct AccountState {
    next_conn_id: u64,
    connections: Vec<ConnectionSlot>,
}

impl AccountState {
    fn owner_of(&self, token: u32) -> Option<usize> {
        self.connections
            .iter()
            .position(|slot| slot.subscribed.contains_key(&token))
    }
}

struct AccountPool {
    account_id: String,
    state: Mutex<AccountState>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub id: u64,
    pub state: String,
    pub subscribed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub connections: usize,
    pub subscribed: usize,
    pub per_connection: Vec<ConnectionStats>,
}

pub struct ConnectionPool {
    settings: PoolSettings,
    factory: Arc<dyn MarketFeedFactory>,
    tick_tx: mpsc::Sender<TickBatch>,
    accounts: RwLock<HashMap<String, Arc<AccountPool>>>,
}

impl ConnectionPool {
    pub fn new(
        settings: PoolSettings,
        factory: Arc<dyn MarketFeedFactory>,
        tick_tx: mpsc::Sender<TickBatch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            factory,
            tick_tx,
            accounts: RwLock::new(HashMap::new()),
        })
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn account(&self, account_id: &str) -> Arc<AccountPool> {
        if let Some(pool) = self.accounts.read().get(account_id) {
            return pool.clone();
        }
        self.accounts
            .write()
            .entry(account_id.to_string())
            .or_insert_with(|| {
                Arc::new(AccountPool {
                    account_id: account_id.to_string(),
                    state: Mutex::new(AccountState {
                        next_conn_id: 0,
                        connections: Vec::new(),
                    }),
                })
            })
            .clone()
    }

    fn make_handler(&self, account_id: &str, status: Arc<SlotStatus>) -> super::FeedEventHandler {
        let tick_tx = self.tick_tx.clone();
        let account_id = account_id.to_string();
        Arc::new(move |event: FeedEvent| match event {
            FeedEvent::Connected => status.set_state(ConnState::Connected),
            FeedEvent::Ticks(ticks) => {
                status.touch();
                if tick_tx
                    .try_send(TickBatch {
                        account_id: account_id.clone(),
                        ticks,
                    })
                    .is_err()
                {
                    metrics::increment_counter!("pool_tick_batches_dropped");
                }
            }
            FeedEvent::Disconnected { reason } => {
                debug!(account = %account_id, reason, "connection reported disconnect");
                status.set_state(ConnState::Disconnected);
            }
            FeedEvent::Error(err) => {
                warn!(account = %account_id, error = %err, "connection error");
            }
        })
    }

    async fn open_connection(
        &self,
        account_id: &str,
        state: &mut AccountState,
    ) -> GatewayResult<usize> {
        if state.connections.len() >= self.settings.max_conns_per_account {
            warn!(
                account = %account_id,
                connections = state.connections.len(),
                "exceeding soft connection cap"
            );
        }
        let status = SlotStatus::new();
        let handler = self.make_handler(account_id, status.clone());
        let conn = self.factory.connect(account_id, handler).await?;
        status.set_state(ConnState::Connected);

        let id = state.next_conn_id;
        state.next_conn_id += 1;
        state.connections.push(ConnectionSlot {
            id,
            conn,
            status,
            subscribed: HashMap::new(),
        });
        info!(account = %account_id, conn = id, "opened upstream connection");
        Ok(state.connections.len() - 1)
    }

    /// Subscribe `tokens` for `account_id`. Tokens already owned by any
    /// connection of the account are skipped. Returns the number of
    /// newly subscribed tokens.
    pub async fn subscribe(
        &self,
        account_id: &str,
        tokens: &[u32],
        mode: SubscribeMode,
    ) -> GatewayResult<usize> {
        let account = self.account(account_id);
        let mut state = account.state.lock().await;

        let owned: HashSet<u32> = state
            .connections
            .iter()
            .flat_map(|slot| slot.subscribed.keys().copied())
            .collect();
        let new_tokens: Vec<u32> = {
            let mut seen = owned;
            tokens
                .iter()
                .copied()
                .filter(|t| seen.insert(*t))
                .collect()
        };
        if new_tokens.is_empty() {
            return Ok(0);
        }

        // First-fit placement plan: slot index -> tokens headed there.
        let mut plan: Vec<(usize, Vec<u32>)> = Vec::new();
        let mut planned_extra: HashMap<usize, usize> = HashMap::new();
        for token in new_tokens {
            let mut fit = None;
            for (i, slot) in state.connections.iter().enumerate() {
                let pending = planned_extra.get(&i).copied().unwrap_or(0);
                if slot.status.state() != ConnState::Disconnected
                    && slot.subscribed.len() + pending < self.settings.max_instruments_per_conn
                {
                    fit = Some(i);
                    break;
                }
            }
            let index = match fit {
                Some(i) => i,
                None => self.open_connection(account_id, &mut state).await?,
            };
            *planned_extra.entry(index).or_default() += 1;
            match plan.iter_mut().find(|(i, _)| *i == index) {
                Some((_, chunk)) => chunk.push(token),
                None => plan.push((index, vec![token])),
            }
        }

        // Dispatch upstream and commit per connection.
        let mut committed = 0;
        for (index, chunk) in plan {
            let slot = &mut state.connections[index];
            let dispatch =
                tokio::time::timeout(self.settings.subscribe_timeout, slot.conn.subscribe(&chunk, mode))
                    .await;
            match dispatch {
                Ok(Ok(())) => {
                    for token in &chunk {
                        slot.subscribed.insert(*token, mode);
                    }
                    committed += chunk.len();
                }
                Ok(Err(e)) => {
                    warn!(account = %account_id, conn = slot.id, error = %e, "upstream subscribe failed");
                    return Err(e);
                }
                Err(_) => {
                    warn!(account = %account_id, conn = slot.id, "upstream subscribe timed out");
                    return Err(GatewayError::UpstreamTransient(format!(
                        "subscribe timed out after {:?}",
                        self.settings.subscribe_timeout
                    )));
                }
            }
        }

        metrics::gauge!(
            "pool_subscribed_tokens",
            state
                .connections
                .iter()
                .map(|s| s.subscribed.len())
                .sum::<usize>() as f64,
            "account" => account_id.to_string()
        );
        Ok(committed)
    }

    /// Unsubscribe `tokens`; connections left empty are closed and
    /// dropped. Returns the number of tokens actually removed.
    pub async fn unsubscribe(&self, account_id: &str, tokens: &[u32]) -> GatewayResult<usize> {
        let account = self.account(account_id);
        let mut state = account.state.lock().await;

        let mut by_slot: HashMap<usize, Vec<u32>> = HashMap::new();
        for token in tokens {
            if let Some(index) = state.owner_of(*token) {
                by_slot.entry(index).or_default().push(*token);
            }
        }

        let mut removed = 0;
        for (index, chunk) in &by_slot {
            let slot = &mut state.connections[*index];
            let dispatch =
                tokio::time::timeout(self.settings.subscribe_timeout, slot.conn.unsubscribe(chunk))
                    .await;
            match dispatch {
                Ok(Ok(())) => {
                    for token in chunk {
                        slot.subscribed.remove(token);
                    }
                    removed += chunk.len();
                }
                Ok(Err(e)) => {
                    warn!(account = %account_id, conn = slot.id, error = %e, "upstream unsubscribe failed");
                    return Err(e);
                }
                Err(_) => {
                    return Err(GatewayError::UpstreamTransient(
                        "unsubscribe timed out".to_string(),
                    ));
                }
            }
        }

        // Drop connections with nothing left on them.
        let mut index = 0;
        while index < state.connections.len() {
            if state.connections[index].subscribed.is_empty() {
                let slot = state.connections.remove(index);
                info!(account = %account_id, conn = slot.id, "closing empty connection");
                slot.conn.close().await;
            } else {
                index += 1;
            }
        }

        Ok(removed)
    }

    /// Tokens currently owned by the account across all connections.
    pub async fn live_tokens(&self, account_id: &str) -> HashSet<u32> {
        let account = self.account(account_id);
        let state = account.state.lock().await;
        state
            .connections
            .iter()
            .flat_map(|slot| slot.subscribed.keys().copied())
            .collect()
    }

    pub async fn stats(&self, account_id: &str) -> PoolStats {
        let account = self.account(account_id);
        let state = account.state.lock().await;
        PoolStats {
            connections: state.connections.len(),
            subscribed: state
                .connections
                .iter()
                .map(|slot| slot.subscribed.len())
                .sum(),
            per_connection: state
                .connections
                .iter()
                .map(|slot| ConnectionStats {
                    id: slot.id,
                    state: slot.status.state().as_str().to_string(),
                    subscribed: slot.subscribed.len(),
                })
                .collect(),
        }
    }

    pub fn account_ids(&self) -> Vec<String> {
        self.accounts.read().keys().cloned().collect()
    }

    /// Stall detection and reconnect loop. Connected slots that have not
    /// ticked within the stall timeout are torn down and re-dialed with a
    /// full re-subscribe of the tokens they own.
    pub async fn run_health_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.settings.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => return Ok(()),
            }

            let pools: Vec<Arc<AccountPool>> = self.accounts.read().values().cloned().collect();
            for account in pools {
                self.heal_account(&account).await;
            }
        }
    }

    async fn heal_account(&self, account: &AccountPool) {
        let stall_ms = self.settings.stall_timeout.as_millis() as i64;
        let mut state = account.state.lock().await;

        for slot in state.connections.iter_mut() {
            if slot.status.state() == ConnState::Connected
                && !slot.subscribed.is_empty()
                && slot.status.millis_since_tick() > stall_ms
            {
                warn!(
                    account = %account.account_id,
                    conn = slot.id,
                    silent_ms = slot.status.millis_since_tick(),
                    "connection stalled, marking disconnected"
                );
                slot.status.set_state(ConnState::Disconnected);
            }
        }

        for index in 0..state.connections.len() {
            if state.connections[index].status.state() != ConnState::Disconnected {
                continue;
            }
            let slot_id = state.connections[index].id;
            metrics::increment_counter!("pool_reconnects", "account" => account.account_id.clone());

            let status = SlotStatus::new();
            let handler = self.make_handler(&account.account_id, status.clone());
            let fresh = match self.factory.connect(&account.account_id, handler).await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(account = %account.account_id, conn = slot_id, error = %e, "reconnect failed");
                    continue;
                }
            };
            status.set_state(ConnState::Connected);

            // Re-subscribe everything the dead connection owned, one
            // upstream call per mode.
            let mut by_mode: HashMap<SubscribeMode, Vec<u32>> = HashMap::new();
            for (token, mode) in &state.connections[index].subscribed {
                by_mode.entry(*mode).or_default().push(*token);
            }
            let mut resubscribed = true;
            for (mode, chunk) in by_mode {
                let outcome =
                    tokio::time::timeout(self.settings.subscribe_timeout, fresh.subscribe(&chunk, mode))
                        .await;
                if !matches!(outcome, Ok(Ok(()))) {
                    warn!(account = %account.account_id, conn = slot_id, "re-subscribe failed");
                    resubscribed = false;
                    break;
                }
            }
            if !resubscribed {
                fresh.close().await;
                continue;
            }

            let old = std::mem::replace(&mut state.connections[index].conn, fresh);
            state.connections[index].status = status;
            old.close().await;
            info!(account = %account.account_id, conn = slot_id, "connection re-established");
        }
    }

    pub async fn shutdown(&self) {
        let pools: Vec<Arc<AccountPool>> = self.accounts.read().values().cloned().collect();
        for account in pools {
            let mut state = account.state.lock().await;
            for slot in state.connections.drain(..) {
                slot.conn.close().await;
            }
        }
    }
}
