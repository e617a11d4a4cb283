//! Subscription reconciler.
//!
//! Converges the live token set held by the connection pool toward the
//! persistent desired set. Placement is sticky: a subscription stays on
//! its recorded account while that account is available and under its
//! token cap; otherwise it moves to the account with the most remaining
//! capacity (stable account order breaks ties). All triggers coalesce
//! through the debounced reloader so at most one reconcile runs at a
//! time.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::ReconcilerSettings;
use crate::error::GatewayError;
use crate::models::{Instrument, SubscribeMode, SubscriptionRecord};
use crate::reliability::{DebounceConfig, DebouncedReloader};
use crate::store::SubscriptionStore;
use crate::upstream::{ConnectionPool, SessionOrchestrator};

pub struct Reconciler {
    store: Arc<SubscriptionStore>,
    sessions: Arc<SessionOrchestrator>,
    pool: Arc<ConnectionPool>,
    settings: ReconcilerSettings,
    account_token_cap: usize,
    /// Serializes direct `reconcile_once` callers; the debouncer already
    /// guarantees single flight for triggered runs.
    guard: tokio::sync::Mutex<()>,
    /// Tokens rejected in the previous run (capacity/auth); retried on
    /// the follow-up reconcile. Runtime-only, never persisted.
    parked: Mutex<HashSet<u32>>,
    reloader: OnceLock<Arc<DebouncedReloader>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<SubscriptionStore>,
        sessions: Arc<SessionOrchestrator>,
        pool: Arc<ConnectionPool>,
        settings: ReconcilerSettings,
    ) -> Arc<Self> {
        let pool_settings = pool.settings();
        let account_token_cap =
            pool_settings.max_instruments_per_conn * pool_settings.max_conns_per_account;
        Arc::new(Self {
            store,
            sessions,
            pool,
            settings,
            account_token_cap,
            guard: tokio::sync::Mutex::new(()),
            parked: Mutex::new(HashSet::new()),
            reloader: OnceLock::new(),
        })
    }

    /// Attach the debounced trigger path. Called once at wiring time.
    pub fn start(self: &Arc<Self>) {
        let worker = self.clone();
        let reloader = DebouncedReloader::spawn(
            "reconciler",
            DebounceConfig {
                debounce: self.settings.debounce,
                min_interval: self.settings.min_interval,
            },
            move || {
                let worker = worker.clone();
                async move { worker.reconcile_once().await }
            },
        );
        let _ = self.reloader.set(reloader);
    }

    /// Request a reconcile; bursts coalesce.
    pub fn trigger(&self) {
        if let Some(reloader) = self.reloader.get() {
            reloader.trigger();
        }
    }

    pub fn reconcile_runs(&self) -> u64 {
        self.reloader.get().map(|r| r.run_count()).unwrap_or(0)
    }

    /// One full reconcile pass.
    pub async fn reconcile_once(&self) -> Result<()> {
        let _guard = self.guard.lock().await;
        let started = Instant::now();
        metrics::increment_counter!("reconciles_started");

        // Previous run's rejects get another chance this pass.
        self.parked.lock().clear();

        let desired = self.store.load_desired()?;
        let available = self.sessions.available_accounts();
        if available.is_empty() {
            warn!("no available accounts; skipping reconcile");
            return Ok(());
        }

        let assignment = self.compute_assignment(&desired, &available);

        // Union of accounts we may need to touch: anything assigned plus
        // anything currently holding tokens.
        let mut touched: Vec<String> = assignment.keys().cloned().collect();
        for account in self.pool.account_ids() {
            if !touched.contains(&account) {
                touched.push(account);
            }
        }

        let mut reassigned: Vec<(u32, String)> = Vec::new();
        for account_id in &touched {
            let assigned = assignment.get(account_id).cloned().unwrap_or_default();
            let assigned_tokens: HashSet<u32> = assigned.iter().map(|(inst, _)| inst.token).collect();
            let live = self.pool.live_tokens(account_id).await;

            let to_unsubscribe: Vec<u32> = live.difference(&assigned_tokens).copied().collect();
            let to_subscribe: Vec<&(Arc<Instrument>, SubscriptionRecord)> = assigned
                .iter()
                .filter(|(inst, _)| !live.contains(&inst.token))
                .collect();

            if !to_unsubscribe.is_empty() {
                if let Err(e) = self.pool.unsubscribe(account_id, &to_unsubscribe).await {
                    warn!(account = %account_id, error = %e, "unsubscribe failed during reconcile");
                    self.handle_apply_error(account_id, &to_unsubscribe, &e);
                }
            }

            if !to_subscribe.is_empty() {
                // One upstream call per requested mode.
                let mut by_mode: HashMap<SubscribeMode, Vec<u32>> = HashMap::new();
                for (inst, sub) in &to_subscribe {
                    by_mode.entry(sub.requested_mode).or_default().push(inst.token);
                }
                for (mode, tokens) in by_mode {
                    match self.pool.subscribe(account_id, &tokens, mode).await {
                        Ok(_) => {}
                        Err(e) => {
                            warn!(account = %account_id, error = %e, "subscribe failed during reconcile");
                            self.handle_apply_error(account_id, &tokens, &e);
                        }
                    }
                }
            }

            // Record assignments that changed.
            for (inst, sub) in &assigned {
                if sub.account_id.as_deref() != Some(account_id.as_str()) {
                    reassigned.push((inst.token, account_id.clone()));
                }
            }
        }

        for (token, account_id) in reassigned {
            if let Err(e) = self.store.set_account(token, &account_id) {
                warn!(token, account = %account_id, error = %e, "failed to persist assignment");
            }
        }

        let elapsed = started.elapsed();
        if elapsed > self.settings.soft_budget {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "reconcile over budget");
            self.trigger();
        }
        if !self.parked.lock().is_empty() {
            // Rejected tokens retry on the follow-up pass.
            self.trigger();
        }
        info!(
            desired = desired.len(),
            accounts = available.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "reconcile complete"
        );
        Ok(())
    }

    fn handle_apply_error(&self, account_id: &str, tokens: &[u32], error: &GatewayError) {
        if matches!(error, GatewayError::Auth(_)) {
            self.sessions.mark_auth_failed(account_id);
        }
        let mut parked = self.parked.lock();
        parked.extend(tokens.iter().copied());
        metrics::increment_counter!("reconcile_tokens_parked", "account" => account_id.to_string());
    }

    /// Sticky-first placement under the per-account token cap.
    fn compute_assignment(
        &self,
        desired: &HashMap<u32, (Instrument, SubscriptionRecord)>,
        available: &[String],
    ) -> HashMap<String, Vec<(Arc<Instrument>, SubscriptionRecord)>> {
        let mut assignment: HashMap<String, Vec<(Arc<Instrument>, SubscriptionRecord)>> =
            available.iter().map(|a| (a.clone(), Vec::new())).collect();

        // Deterministic iteration: sticky placements first, then the
        // rest in token order.
        let mut ordered: Vec<&(Instrument, SubscriptionRecord)> = desired.values().collect();
        ordered.sort_by_key(|(inst, _)| inst.token);

        let mut deferred: Vec<&(Instrument, SubscriptionRecord)> = Vec::new();
        for entry in ordered {
            let (_, sub) = entry;
            let sticky = sub
                .account_id
                .as_ref()
                .filter(|account| {
                    assignment
                        .get(*account)
                        .map(|v| v.len() < self.account_token_cap)
                        .unwrap_or(false)
                })
                .cloned();
            match sticky {
                Some(account) => {
                    let (inst, sub) = entry;
                    assignment
                        .get_mut(&account)
                        .expect("sticky account present")
                        .push((Arc::new(inst.clone()), sub.clone()));
                }
                None => deferred.push(entry),
            }
        }

        for (inst, sub) in deferred {
            // Most remaining capacity; `available` is already in stable
            // account order, and max_by_key keeps the last max, so scan
            // reversed to prefer earlier accounts on ties.
            let target = available
                .iter()
                .rev()
                .max_by_key(|account| {
                    self.account_token_cap
                        .saturating_sub(assignment.get(*account).map(|v| v.len()).unwrap_or(0))
                })
                .filter(|account| {
                    assignment
                        .get(*account)
                        .map(|v| v.len() < self.account_token_cap)
                        .unwrap_or(false)
                });
            match target {
                Some(account) => {
                    assignment
                        .get_mut(account)
                        .expect("target account present")
                        .push((Arc::new(inst.clone()), sub.clone()));
                }
                None => {
                    warn!(token = inst.token, "no account capacity; parking subscription");
                    self.parked.lock().insert(inst.token);
                }
            }
        }

        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolSettings;
    use crate::models::{Segment, SubscriptionStatus};
    use crate::reliability::BreakerConfig;
    use crate::store::TradingAccount;
    use crate::upstream::session::BrokerApiFactory;
    use crate::upstream::{
        FeedEventHandler, MarketConnection, MarketFeedFactory, TickBatch,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct OkConnection;

    #[async_trait]
    impl MarketConnection for OkConnection {
        async fn subscribe(
            &self,
            _: &[u32],
            _: SubscribeMode,
        ) -> crate::error::GatewayResult<()> {
            Ok(())
        }
        async fn unsubscribe(&self, _: &[u32]) -> crate::error::GatewayResult<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    struct OkFactory;

    #[async_trait]
    impl MarketFeedFactory for OkFactory {
        async fn connect(
            &self,
            _: &str,
            _: FeedEventHandler,
        ) -> crate::error::GatewayResult<Arc<dyn MarketConnection>> {
            Ok(Arc::new(OkConnection))
        }
    }

    struct NullBrokerFactory;

    impl BrokerApiFactory for NullBrokerFactory {
        fn create(&self, _: &TradingAccount) -> Arc<dyn crate::upstream::BrokerApi> {
            struct Never;
            #[async_trait]
            impl crate::upstream::BrokerApi for Never {
                async fn place_order(
                    &self,
                    _: &serde_json::Value,
                ) -> crate::error::GatewayResult<serde_json::Value> {
                    unreachable!("not used in reconciler tests")
                }
                async fn modify_order(
                    &self,
                    _: &str,
                    _: &serde_json::Value,
                ) -> crate::error::GatewayResult<serde_json::Value> {
                    unreachable!()
                }
                async fn cancel_order(
                    &self,
                    _: &str,
                ) -> crate::error::GatewayResult<serde_json::Value> {
                    unreachable!()
                }
                async fn get_quote(
                    &self,
                    _: &[u32],
                ) -> crate::error::GatewayResult<serde_json::Value> {
                    unreachable!()
                }
                async fn historical_candles(
                    &self,
                    _: u32,
                    _: chrono::DateTime<chrono::Utc>,
                    _: chrono::DateTime<chrono::Utc>,
                    _: &str,
                    _: bool,
                ) -> crate::error::GatewayResult<Vec<crate::models::Candle>> {
                    unreachable!()
                }
            }
            Arc::new(Never)
        }
    }

    fn account(id: &str) -> TradingAccount {
        TradingAccount {
            account_id: id.to_string(),
            api_key: "k".into(),
            api_secret: "s".into(),
            access_token: Some("t".into()),
            totp_seed: None,
            last_auth_at: None,
        }
    }

    struct Harness {
        store: Arc<SubscriptionStore>,
        sessions: Arc<SessionOrchestrator>,
        pool: Arc<ConnectionPool>,
        reconciler: Arc<Reconciler>,
        _tick_rx: mpsc::Receiver<TickBatch>,
    }

    fn harness(accounts: &[&str], cap_per_conn: usize) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.db");
        std::mem::forget(dir);
        let store = Arc::new(SubscriptionStore::new(path.to_str().unwrap()).unwrap());

        let sessions = Arc::new(SessionOrchestrator::new(
            accounts.iter().map(|a| account(a)).collect(),
            Arc::new(NullBrokerFactory),
            BreakerConfig::default(),
        ));

        let (tick_tx, tick_rx) = mpsc::channel(16);
        let pool = ConnectionPool::new(
            PoolSettings {
                max_instruments_per_conn: cap_per_conn,
                max_conns_per_account: 2,
                subscribe_timeout: Duration::from_secs(1),
                stall_timeout: Duration::from_secs(60),
                health_interval: Duration::from_secs(60),
            },
            Arc::new(OkFactory),
            tick_tx,
        );

        let reconciler = Reconciler::new(
            store.clone(),
            sessions.clone(),
            pool.clone(),
            ReconcilerSettings {
                debounce: Duration::from_millis(10),
                min_interval: Duration::from_millis(20),
                soft_budget: Duration::from_secs(60),
            },
        );

        Harness {
            store,
            sessions,
            pool,
            reconciler,
            _tick_rx: tick_rx,
        }
    }

    fn seed(store: &SubscriptionStore, tokens: &[u32], account: Option<&str>) {
        let instruments: Vec<Instrument> = tokens
            .iter()
            .map(|&token| Instrument {
                token,
                symbol: format!("NIFTY{token}"),
                segment: Segment::Eq,
                option_type: None,
                strike: None,
                expiry: None,
                lot_size: 1,
                tick_size: 0.05,
                underlying_token: None,
            })
            .collect();
        // Append without clobbering earlier seeds.
        let mut all = store.load_instruments().unwrap();
        all.extend(instruments);
        store.replace_instruments(&all).unwrap();
        for &token in tokens {
            store
                .upsert_subscription(
                    token,
                    &format!("NIFTY{token}"),
                    Segment::Eq,
                    SubscribeMode::Quote,
                    account,
                )
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_converges_live_set_to_desired() {
        let h = harness(&["A1"], 100);
        seed(&h.store, &[1, 2, 3], None);
        h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(h.pool.live_tokens("A1").await, HashSet::from([1, 2, 3]));

        // Deactivate one and add another; reconcile converges again.
        h.store.deactivate(2).unwrap();
        seed(&h.store, &[4], None);
        h.reconciler.reconcile_once().await.unwrap();
        assert_eq!(h.pool.live_tokens("A1").await, HashSet::from([1, 3, 4]));
    }

    #[tokio::test]
    async fn test_assignment_persisted_back_to_store() {
        let h = harness(&["A1"], 100);
        seed(&h.store, &[7], None);
        h.reconciler.reconcile_once().await.unwrap();
        let sub = h.store.get(7).unwrap().unwrap();
        assert_eq!(sub.account_id.as_deref(), Some("A1"));
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_sticky_assignment_survives_reconcile() {
        let h = harness(&["A1", "A2"], 100);
        seed(&h.store, &[1], Some("A2"));
        h.reconciler.reconcile_once().await.unwrap();
        assert!(h.pool.live_tokens("A2").await.contains(&1));
        assert!(h.pool.live_tokens("A1").await.is_empty());

        // Reconcile again: no churn.
        h.reconciler.reconcile_once().await.unwrap();
        assert!(h.pool.live_tokens("A2").await.contains(&1));
    }

    #[tokio::test]
    async fn test_failover_when_sticky_account_unavailable() {
        let h = harness(&["A1", "A2"], 100);
        seed(&h.store, &[1], Some("A2"));
        h.reconciler.reconcile_once().await.unwrap();
        assert!(h.pool.live_tokens("A2").await.contains(&1));

        h.sessions.mark_auth_failed("A2");
        h.reconciler.reconcile_once().await.unwrap();
        assert!(h.pool.live_tokens("A1").await.contains(&1));
        assert!(!h.pool.live_tokens("A2").await.contains(&1));
        assert_eq!(h.store.get(1).unwrap().unwrap().account_id.as_deref(), Some("A1"));
    }

    #[tokio::test]
    async fn test_spreads_by_remaining_capacity() {
        let h = harness(&["A1", "A2"], 2);
        // Cap per account = 2 per conn * 2 conns = 4. Six tokens exceed
        // one account's cap, so both accounts get work.
        seed(&h.store, &[1, 2, 3, 4, 5, 6], None);
        h.reconciler.reconcile_once().await.unwrap();
        let a1 = h.pool.live_tokens("A1").await;
        let a2 = h.pool.live_tokens("A2").await;
        assert_eq!(a1.len() + a2.len(), 6);
        assert!(a1.len() <= 4 && a2.len() <= 4);
        assert!(!a1.is_empty() && !a2.is_empty());
    }

    #[tokio::test]
    async fn test_trigger_bursts_coalesce() {
        let h = harness(&["A1"], 100);
        seed(&h.store, &[1], None);
        h.reconciler.start();

        for _ in 0..100 {
            h.reconciler.trigger();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        let runs = h.reconciler.reconcile_runs();
        assert!(runs >= 1 && runs <= 2, "expected <=2 runs, got {runs}");
        assert!(h.pool.live_tokens("A1").await.contains(&1));
    }
}
