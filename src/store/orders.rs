//! Order task persistence.
//!
//! The UNIQUE constraint on `idempotency_key` is the dedupe backstop:
//! two submissions racing past the lookup collapse onto one row at
//! insert time.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;
use uuid::Uuid;

use crate::orders::{OrderOperation, OrderTask, OrderTaskStatus};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS order_tasks (
    task_id TEXT PRIMARY KEY,
    idempotency_key TEXT NOT NULL UNIQUE,
    operation TEXT NOT NULL,
    params_json TEXT NOT NULL,
    account_id TEXT NOT NULL,
    status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL,
    last_error TEXT,
    result_json TEXT,
    next_attempt_at INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_order_tasks_due
    ON order_tasks(status, next_attempt_at);

CREATE INDEX IF NOT EXISTS idx_order_tasks_account
    ON order_tasks(account_id, status);
"#;

pub struct OrderTaskStore {
    conn: Mutex<Connection>,
}

impl OrderTaskStore {
    pub fn new(path: &str) -> Result<Self> {
        let conn = super::open_connection(path)?;
        conn.execute_batch(SCHEMA_SQL)
            .context("create order task schema")?;
        info!(path, "order task store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a fresh task, or return the existing row that owns this
    /// idempotency key.
    pub fn insert_or_get(&self, task: &OrderTask) -> Result<OrderTask> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO order_tasks
             (task_id, idempotency_key, operation, params_json, account_id, status,
              attempts, max_attempts, last_error, result_json, next_attempt_at,
              created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
            params![
                task.task_id.to_string(),
                task.idempotency_key,
                task.operation.as_str(),
                task.params.to_string(),
                task.account_id,
                task.status.as_str(),
                task.attempts,
                task.max_attempts,
                task.last_error,
                task.result.as_ref().map(|v| v.to_string()),
                task.created_at.timestamp(),
            ],
        )?;

        if inserted > 0 {
            return Ok(task.clone());
        }
        let existing = conn
            .query_row(
                &format!("{SELECT_TASK} WHERE idempotency_key = ?1"),
                params![task.idempotency_key],
                row_to_task,
            )
            .context("load deduplicated task")?;
        Ok(existing)
    }

    pub fn get(&self, task_id: Uuid) -> Result<Option<OrderTask>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{SELECT_TASK} WHERE task_id = ?1"),
            params![task_id.to_string()],
            row_to_task,
        )
        .optional()
        .context("get order task")
    }

    /// Claim the next due task: oldest pending/retrying row whose
    /// backoff deadline has passed. The claim flips it to running so
    /// concurrent workers never double-execute.
    pub fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<OrderTask>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let candidate = tx
            .query_row(
                &format!(
                    "{SELECT_TASK} WHERE status IN ('pending', 'retrying')
                     AND next_attempt_at <= ?1
                     ORDER BY next_attempt_at, created_at LIMIT 1"
                ),
                params![now.timestamp()],
                row_to_task,
            )
            .optional()?;

        let Some(mut task) = candidate else {
            tx.commit()?;
            return Ok(None);
        };

        task.status = OrderTaskStatus::Running;
        task.attempts += 1;
        tx.execute(
            "UPDATE order_tasks SET status = 'running', attempts = ?2, updated_at = ?3
             WHERE task_id = ?1",
            params![task.task_id.to_string(), task.attempts, now.timestamp()],
        )?;
        tx.commit()?;
        Ok(Some(task))
    }

    pub fn mark_completed(&self, task_id: Uuid, result: &serde_json::Value) -> Result<()> {
        self.finish(task_id, OrderTaskStatus::Completed, None, Some(result))
    }

    pub fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<()> {
        self.finish(task_id, OrderTaskStatus::Failed, Some(error), None)
    }

    pub fn mark_dead_letter(&self, task_id: Uuid, error: &str) -> Result<()> {
        self.finish(task_id, OrderTaskStatus::DeadLetter, Some(error), None)
    }

    fn finish(
        &self,
        task_id: Uuid,
        status: OrderTaskStatus,
        error: Option<&str>,
        result: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE order_tasks
             SET status = ?2, last_error = COALESCE(?3, last_error),
                 result_json = COALESCE(?4, result_json), updated_at = ?5
             WHERE task_id = ?1",
            params![
                task_id.to_string(),
                status.as_str(),
                error,
                result.map(|v| v.to_string()),
                super::now_epoch(),
            ],
        )?;
        Ok(())
    }

    /// Schedule a retry after `backoff_secs`.
    pub fn mark_retrying(&self, task_id: Uuid, error: &str, backoff_secs: i64) -> Result<()> {
        let now = super::now_epoch();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE order_tasks
             SET status = 'retrying', last_error = ?2, next_attempt_at = ?3, updated_at = ?4
             WHERE task_id = ?1",
            params![task_id.to_string(), error, now + backoff_secs, now],
        )?;
        Ok(())
    }

    /// Requeue a breaker-rejected dispatch. The attempt consumed by the
    /// claim stays spent, so a task gated `max_attempts` times runs out
    /// of budget like any other failure.
    pub fn requeue(&self, task_id: Uuid, backoff_secs: i64) -> Result<()> {
        let now = super::now_epoch();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE order_tasks
             SET status = 'retrying', next_attempt_at = ?2, updated_at = ?3
             WHERE task_id = ?1",
            params![task_id.to_string(), now + backoff_secs, now],
        )?;
        Ok(())
    }

    pub fn list_dead_letter(&self, limit: usize) -> Result<Vec<OrderTask>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{SELECT_TASK} WHERE status = 'dead_letter' ORDER BY updated_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit], row_to_task)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Admin replay: attempts reset to zero, status back to pending.
    pub fn replay_dead_letter(&self, task_id: Uuid) -> Result<bool> {
        let now = super::now_epoch();
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE order_tasks
             SET status = 'pending', attempts = 0, next_attempt_at = 0,
                 last_error = NULL, updated_at = ?2
             WHERE task_id = ?1 AND status = 'dead_letter'",
            params![task_id.to_string(), now],
        )?;
        Ok(n > 0)
    }

    pub fn counts_by_status(&self) -> Result<HashMap<String, u64>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM order_tasks GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (status, count) = row?;
            out.insert(status, count);
        }
        Ok(out)
    }

    /// Remove terminal tasks older than the retention window.
    pub fn prune_terminal(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = super::now_epoch() - older_than_secs;
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM order_tasks
             WHERE status IN ('completed', 'failed', 'dead_letter') AND updated_at < ?1",
            params![cutoff],
        )?;
        Ok(n)
    }
}

const SELECT_TASK: &str = "SELECT task_id, idempotency_key, operation, params_json, account_id,
    status, attempts, max_attempts, last_error, result_json, created_at, updated_at
    FROM order_tasks";

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderTask> {
    let task_id: String = row.get(0)?;
    let operation: String = row.get(2)?;
    let params_json: String = row.get(3)?;
    let status: String = row.get(5)?;
    let result_json: Option<String> = row.get(9)?;
    let created: i64 = row.get(10)?;
    let updated: i64 = row.get(11)?;
    Ok(OrderTask {
        task_id: Uuid::parse_str(&task_id).unwrap_or_default(),
        idempotency_key: row.get(1)?,
        operation: OrderOperation::parse(&operation).unwrap_or(OrderOperation::Place),
        params: serde_json::from_str(&params_json).unwrap_or(serde_json::Value::Null),
        account_id: row.get(4)?,
        status: OrderTaskStatus::parse(&status).unwrap_or(OrderTaskStatus::Failed),
        attempts: row.get(6)?,
        max_attempts: row.get(7)?,
        last_error: row.get(8)?,
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: DateTime::from_timestamp(created, 0).unwrap_or_else(Utc::now),
        updated_at: DateTime::from_timestamp(updated, 0).unwrap_or_else(Utc::now),
    })
}
