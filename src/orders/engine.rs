//! Order execution engine.
//!
//! Submissions dedupe on the idempotency key before anything touches the
//! broker. Workers claim due tasks from the persistent queue, gate on
//! the per-account circuit breaker, dispatch through the session
//! orchestrator and classify failures: retryable errors back off
//! exponentially until attempts run out (dead letter), caller faults
//! fail immediately without feeding the breaker.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrderSettings;
use crate::error::{GatewayError, GatewayResult};
use crate::orders::{idempotency_key, OrderOperation, OrderTask, OrderTaskStatus};
use crate::reliability::RetryPolicy;
use crate::store::OrderTaskStore;
use crate::upstream::SessionOrchestrator;

pub struct OrderEngine {
    store: Arc<OrderTaskStore>,
    sessions: Arc<SessionOrchestrator>,
    settings: OrderSettings,
    backoff: RetryPolicy,
}

/// Cloneable submission/query surface handed to the API layer.
#[derive(Clone)]
pub struct OrderEngineHandle(pub Arc<OrderEngine>);

impl OrderEngine {
    pub fn new(
        store: Arc<OrderTaskStore>,
        sessions: Arc<SessionOrchestrator>,
        settings: OrderSettings,
    ) -> Arc<Self> {
        let backoff = RetryPolicy::new(
            settings.max_attempts,
            settings.base_backoff,
            settings.max_backoff,
        );
        Arc::new(Self {
            store,
            sessions,
            settings,
            backoff,
        })
    }

    /// Create or dedupe an order task. The returned task may be an
    /// existing row in any status; the caller inspects `status`.
    pub fn submit(
        &self,
        operation: OrderOperation,
        params: serde_json::Value,
        account_id: &str,
    ) -> GatewayResult<OrderTask> {
        if !params.is_object() {
            return Err(GatewayError::Validation(
                "order params must be an object".into(),
            ));
        }
        let key = idempotency_key(operation, account_id, &params);
        let now = Utc::now();
        let task = OrderTask {
            task_id: Uuid::new_v4(),
            idempotency_key: key,
            operation,
            params,
            account_id: account_id.to_string(),
            status: OrderTaskStatus::Pending,
            attempts: 0,
            max_attempts: self.settings.max_attempts,
            last_error: None,
            result: None,
            created_at: now,
            updated_at: now,
        };
        let stored = self
            .store
            .insert_or_get(&task)
            .map_err(|e| GatewayError::Store(e.to_string()))?;
        if stored.task_id != task.task_id {
            metrics::increment_counter!("order_submissions_deduped");
            debug!(task = %stored.task_id, "submission deduplicated");
        } else {
            metrics::increment_counter!("order_submissions");
        }
        Ok(stored)
    }

    pub fn get(&self, task_id: Uuid) -> GatewayResult<Option<OrderTask>> {
        self.store
            .get(task_id)
            .map_err(|e| GatewayError::Store(e.to_string()))
    }

    pub fn dead_letter(&self, limit: usize) -> GatewayResult<Vec<OrderTask>> {
        self.store
            .list_dead_letter(limit)
            .map_err(|e| GatewayError::Store(e.to_string()))
    }

    /// Admin replay of a dead-letter task: attempts reset to zero and
    /// the task re-enters the queue as pending.
    pub fn replay(&self, task_id: Uuid) -> GatewayResult<bool> {
        self.store
            .replay_dead_letter(task_id)
            .map_err(|e| GatewayError::Store(e.to_string()))
    }

    pub fn status_counts(&self) -> GatewayResult<std::collections::HashMap<String, u64>> {
        self.store
            .counts_by_status()
            .map_err(|e| GatewayError::Store(e.to_string()))
    }

    /// Worker loop: claim due tasks and execute them. Run N of these
    /// under the supervisor.
    pub async fn run_worker(
        self: Arc<Self>,
        worker_id: usize,
        mut cancel: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        debug!(worker = worker_id, "order worker started");
        loop {
            if *cancel.borrow() {
                return Ok(());
            }
            let claimed = self.store.claim_due(Utc::now())?;
            match claimed {
                Some(task) => self.execute(task).await,
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                        _ = cancel.changed() => return Ok(()),
                    }
                }
            }
        }
    }

    /// Workers idle when nothing is due; true when every task is
    /// terminal or scheduled in the future.
    pub fn is_quiescent(&self) -> bool {
        match self.store.counts_by_status() {
            Ok(counts) => counts.get("running").copied().unwrap_or(0) == 0,
            Err(_) => false,
        }
    }

    async fn execute(&self, task: OrderTask) {
        let account_id = task.account_id.clone();
        let breaker = self.sessions.breaker(&account_id);

        // Breaker gate. Rejections consume attempt budget like real
        // failures; a task gated max_attempts times fails with a
        // distinct reason.
        if let Some(ref breaker) = breaker {
            if !breaker.can_execute() {
                if task.attempts >= task.max_attempts {
                    warn!(task = %task.task_id, account = %account_id, "circuit open, giving up");
                    let _ = self.store.mark_failed(task.task_id, "circuit_open");
                    metrics::increment_counter!("order_tasks_failed", "reason" => "circuit_open");
                } else {
                    let backoff = self.backoff.backoff_for(task.attempts.max(1));
                    let _ = self
                        .store
                        .requeue(task.task_id, backoff.as_secs().max(1) as i64);
                }
                return;
            }
        }

        let outcome = match self.dispatch(&task).await {
            Ok(result) => {
                if let Some(ref breaker) = breaker {
                    breaker.record_success();
                }
                let _ = self.store.mark_completed(task.task_id, &result);
                metrics::increment_counter!("order_tasks_completed");
                info!(
                    task = %task.task_id,
                    attempts = task.attempts,
                    operation = task.operation.as_str(),
                    "order task completed"
                );
                return;
            }
            Err(e) => e,
        };

        if outcome.counts_against_breaker() {
            if let Some(ref breaker) = breaker {
                breaker.record_failure(&outcome.to_string());
            }
        }
        if matches!(outcome, GatewayError::Auth(_)) {
            self.sessions.mark_auth_failed(&account_id);
        }

        if outcome.is_retryable() {
            if task.attempts < task.max_attempts {
                let backoff = self.backoff.backoff_for(task.attempts);
                warn!(
                    task = %task.task_id,
                    attempt = task.attempts,
                    backoff_s = backoff.as_secs(),
                    error = %outcome,
                    "order attempt failed, retrying"
                );
                let _ = self.store.mark_retrying(
                    task.task_id,
                    &outcome.to_string(),
                    backoff.as_secs().max(1) as i64,
                );
                metrics::increment_counter!("order_tasks_retried");
            } else {
                warn!(task = %task.task_id, error = %outcome, "attempts exhausted, dead-lettering");
                let _ = self.store.mark_dead_letter(task.task_id, &outcome.to_string());
                metrics::increment_counter!("order_tasks_dead_lettered");
            }
        } else {
            warn!(task = %task.task_id, error = %outcome, "order task failed");
            let _ = self.store.mark_failed(task.task_id, &outcome.to_string());
            metrics::increment_counter!("order_tasks_failed", "reason" => outcome.kind());
        }
    }

    async fn dispatch(&self, task: &OrderTask) -> GatewayResult<serde_json::Value> {
        let broker = self.sessions.broker(&task.account_id)?;
        match task.operation {
            OrderOperation::Place => broker.place_order(&task.params).await,
            OrderOperation::Modify => {
                let order_id = order_id_of(task)?;
                broker.modify_order(&order_id, &task.params).await
            }
            OrderOperation::Cancel => {
                let order_id = order_id_of(task)?;
                broker.cancel_order(&order_id).await
            }
        }
    }

    /// Periodic retention pruning and queue-depth export.
    pub async fn run_cleanup(
        self: Arc<Self>,
        mut cancel: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => return Ok(()),
            }
            match self.store.prune_terminal(self.settings.retention.as_secs() as i64) {
                Ok(0) => {}
                Ok(n) => info!(pruned = n, "pruned terminal order tasks"),
                Err(e) => warn!(error = %e, "order task prune failed"),
            }
            if let Ok(counts) = self.store.counts_by_status() {
                for (status, count) in counts {
                    metrics::gauge!("order_tasks", count as f64, "status" => status);
                }
            }
        }
    }
}

fn order_id_of(task: &OrderTask) -> GatewayResult<String> {
    task.params
        .get("order_id")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| GatewayError::Validation("order_id required".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::{BreakerConfig, CircuitState};
    use crate::store::TradingAccount;
    use crate::upstream::session::BrokerApiFactory;
    use crate::upstream::BrokerApi;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted broker: pops the front outcome per call; empty script
    /// means success.
    struct ScriptedBroker {
        calls: AtomicUsize,
        script: Mutex<Vec<GatewayError>>,
    }

    impl ScriptedBroker {
        fn new(script: Vec<GatewayError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script),
            })
        }

        fn next(&self) -> GatewayResult<serde_json::Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(json!({"order_id": "X"}))
            } else {
                Err(script.remove(0))
            }
        }
    }

    #[async_trait]
    impl BrokerApi for ScriptedBroker {
        async fn place_order(&self, _: &serde_json::Value) -> GatewayResult<serde_json::Value> {
            self.next()
        }
        async fn modify_order(
            &self,
            _: &str,
            _: &serde_json::Value,
        ) -> GatewayResult<serde_json::Value> {
            self.next()
        }
        async fn cancel_order(&self, _: &str) -> GatewayResult<serde_json::Value> {
            self.next()
        }
        async fn get_quote(&self, _: &[u32]) -> GatewayResult<serde_json::Value> {
            self.next()
        }
        async fn historical_candles(
            &self,
            _: u32,
            _: chrono::DateTime<Utc>,
            _: chrono::DateTime<Utc>,
            _: &str,
            _: bool,
        ) -> GatewayResult<Vec<crate::models::Candle>> {
            Ok(Vec::new())
        }
    }

    struct ScriptedFactory(Arc<ScriptedBroker>);

    impl BrokerApiFactory for ScriptedFactory {
        fn create(&self, _: &TradingAccount) -> Arc<dyn BrokerApi> {
            self.0.clone()
        }
    }

    fn harness(script: Vec<GatewayError>, threshold: u32) -> (Arc<OrderEngine>, Arc<ScriptedBroker>, Arc<SessionOrchestrator>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.db");
        std::mem::forget(dir);
        let store = Arc::new(OrderTaskStore::new(path.to_str().unwrap()).unwrap());

        let broker = ScriptedBroker::new(script);
        let sessions = Arc::new(SessionOrchestrator::new(
            vec![TradingAccount {
                account_id: "A1".into(),
                api_key: "k".into(),
                api_secret: "s".into(),
                access_token: Some("t".into()),
                totp_seed: None,
                last_auth_at: None,
            }],
            Arc::new(ScriptedFactory(broker.clone())),
            BreakerConfig {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(50),
                half_open_max_attempts: 3,
            },
        ));

        let engine = OrderEngine::new(
            store,
            sessions.clone(),
            OrderSettings {
                workers: 1,
                max_attempts: 5,
                base_backoff: Duration::from_millis(500),
                max_backoff: Duration::from_secs(60),
                retention: Duration::from_secs(3600),
                poll_interval: Duration::from_millis(10),
            },
        );
        (engine, broker, sessions)
    }

    fn place_params() -> serde_json::Value {
        json!({
            "tradingsymbol": "NIFTY25NOVFUT",
            "quantity": 50,
            "transaction_type": "BUY",
            "exchange": "NFO",
            "product": "NRML",
            "order_type": "MARKET"
        })
    }

    /// Drain due tasks until quiescent, stepping the clock past
    /// backoffs by re-claiming with a future timestamp.
    async fn drain(engine: &Arc<OrderEngine>) {
        for _ in 0..20 {
            let due = engine
                .store
                .claim_due(Utc::now() + chrono::Duration::hours(1))
                .unwrap();
            match due {
                Some(task) => engine.execute(task).await,
                None => break,
            }
        }
    }

    #[tokio::test]
    async fn test_duplicate_submission_returns_same_task() {
        let (engine, broker, _) = harness(vec![], 3);
        let first = engine
            .submit(OrderOperation::Place, place_params(), "A1")
            .unwrap();
        let second = engine
            .submit(OrderOperation::Place, place_params(), "A1")
            .unwrap();
        assert_eq!(first.task_id, second.task_id);

        drain(&engine).await;
        // Upstream touched exactly once despite two submissions.
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
        let done = engine.get(first.task_id).unwrap().unwrap();
        assert_eq!(done.status, OrderTaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let (engine, broker, sessions) = harness(
            vec![
                GatewayError::UpstreamTransient("connection reset".into()),
                GatewayError::UpstreamTransient("connection reset".into()),
            ],
            10,
        );
        let task = engine
            .submit(OrderOperation::Place, place_params(), "A1")
            .unwrap();
        drain(&engine).await;

        let done = engine.get(task.task_id).unwrap().unwrap();
        assert_eq!(done.status, OrderTaskStatus::Completed);
        assert_eq!(done.attempts, 3);
        assert_eq!(done.result.unwrap()["order_id"], "X");
        assert_eq!(broker.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            sessions.breaker("A1").unwrap().state(),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_validation_failure_is_terminal_without_breaker_feed() {
        let (engine, broker, sessions) = harness(
            vec![GatewayError::Validation("bad quantity".into())],
            3,
        );
        let task = engine
            .submit(OrderOperation::Place, place_params(), "A1")
            .unwrap();
        drain(&engine).await;

        let done = engine.get(task.task_id).unwrap().unwrap();
        assert_eq!(done.status, OrderTaskStatus::Failed);
        assert_eq!(done.attempts, 1);
        assert_eq!(broker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            sessions.breaker("A1").unwrap().snapshot().failure_count,
            0
        );
    }

    #[tokio::test]
    async fn test_exhausted_retryable_goes_dead_letter_then_replays() {
        let script: Vec<GatewayError> = (0..5)
            .map(|_| GatewayError::UpstreamTransient("down".into()))
            .collect();
        let (engine, broker, _) = harness(script, 100);
        let task = engine
            .submit(OrderOperation::Place, place_params(), "A1")
            .unwrap();
        drain(&engine).await;

        let dead = engine.get(task.task_id).unwrap().unwrap();
        assert_eq!(dead.status, OrderTaskStatus::DeadLetter);
        assert_eq!(dead.attempts, 5);
        assert_eq!(broker.calls.load(Ordering::SeqCst), 5);
        assert_eq!(engine.dead_letter(10).unwrap().len(), 1);

        // Replay resets attempts; the (now empty) script succeeds.
        assert!(engine.replay(task.task_id).unwrap());
        drain(&engine).await;
        let done = engine.get(task.task_id).unwrap().unwrap();
        assert_eq!(done.status, OrderTaskStatus::Completed);
        assert_eq!(done.attempts, 1);
    }

    #[tokio::test]
    async fn test_rate_limits_open_breaker_and_block_dispatch() {
        let script: Vec<GatewayError> = (0..3)
            .map(|_| GatewayError::RateLimited("429".into()))
            .collect();
        let (engine, broker, sessions) = harness(script, 3);

        // Three distinct orders, each failing once with 429.
        for qty in [10, 20, 30] {
            let mut params = place_params();
            params["quantity"] = json!(qty);
            engine.submit(OrderOperation::Place, params, "A1").unwrap();
        }
        for _ in 0..3 {
            let task = engine
                .store
                .claim_due(Utc::now() + chrono::Duration::hours(1))
                .unwrap()
                .unwrap();
            engine.execute(task).await;
        }
        assert_eq!(sessions.breaker("A1").unwrap().state(), CircuitState::Open);
        let calls_before = broker.calls.load(Ordering::SeqCst);

        // Fourth submission while open: dispatch is gated, upstream
        // untouched, task requeued.
        let mut params = place_params();
        params["quantity"] = json!(40);
        let gated = engine.submit(OrderOperation::Place, params, "A1").unwrap();
        let task = engine
            .store
            .claim_due(Utc::now() + chrono::Duration::hours(1))
            .unwrap()
            .unwrap();
        assert_eq!(task.task_id, gated.task_id);
        engine.execute(task).await;
        assert_eq!(broker.calls.load(Ordering::SeqCst), calls_before);
        assert_eq!(
            engine.get(gated.task_id).unwrap().unwrap().status,
            OrderTaskStatus::Retrying
        );

        // After the recovery timeout one probe goes through and, with the
        // script drained, succeeds.
        tokio::time::sleep(Duration::from_millis(60)).await;
        drain(&engine).await;
        assert_eq!(
            engine.get(gated.task_id).unwrap().unwrap().status,
            OrderTaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_modify_requires_order_id() {
        let (engine, _broker, _) = harness(vec![], 3);
        let task = engine
            .submit(
                OrderOperation::Modify,
                json!({"quantity": 25}),
                "A1",
            )
            .unwrap();
        drain(&engine).await;
        let done = engine.get(task.task_id).unwrap().unwrap();
        assert_eq!(done.status, OrderTaskStatus::Failed);
        assert!(done.last_error.unwrap().contains("order_id"));
    }
}
