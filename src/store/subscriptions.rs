//! Instrument master and subscription persistence.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::models::{
    Instrument, OptionType, Segment, SubscribeMode, SubscriptionRecord, SubscriptionStatus,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS instruments (
    token INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL,
    segment TEXT NOT NULL,
    option_type TEXT,
    strike REAL,
    expiry TEXT,
    lot_size INTEGER NOT NULL DEFAULT 1,
    tick_size REAL NOT NULL DEFAULT 0.05,
    underlying_token INTEGER
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_instruments_segment ON instruments(segment);

CREATE TABLE IF NOT EXISTS instrument_subscriptions (
    token INTEGER PRIMARY KEY,
    symbol TEXT NOT NULL,
    segment TEXT NOT NULL,
    status TEXT NOT NULL,
    requested_mode TEXT NOT NULL,
    account_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_subscriptions_status_account
    ON instrument_subscriptions(status, account_id);
"#;

pub struct SubscriptionStore {
    conn: Mutex<Connection>,
}

impl SubscriptionStore {
    pub fn new(path: &str) -> Result<Self> {
        let conn = super::open_connection(path)?;
        conn.execute_batch(SCHEMA_SQL)
            .context("create subscription schema")?;
        info!(path, "subscription store ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Replace the instrument master wholesale (daily refresh).
    pub fn replace_instruments(&self, instruments: &[Instrument]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM instruments", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO instruments
                 (token, symbol, segment, option_type, strike, expiry, lot_size, tick_size, underlying_token)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for inst in instruments {
                stmt.execute(params![
                    inst.token,
                    inst.symbol,
                    inst.segment.as_str(),
                    inst.option_type.map(|t| t.as_str()),
                    inst.strike,
                    inst.expiry.map(|d| d.format("%Y-%m-%d").to_string()),
                    inst.lot_size,
                    inst.tick_size,
                    inst.underlying_token,
                ])?;
            }
        }
        tx.commit()?;
        Ok(instruments.len())
    }

    pub fn load_instruments(&self) -> Result<Vec<Instrument>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT token, symbol, segment, option_type, strike, expiry, lot_size, tick_size, underlying_token
             FROM instruments",
        )?;
        let rows = stmt.query_map([], row_to_instrument)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Upsert keeps an existing assignment unless the caller supplies one.
    pub fn upsert_subscription(
        &self,
        token: u32,
        symbol: &str,
        segment: Segment,
        mode: SubscribeMode,
        account_id: Option<&str>,
    ) -> Result<()> {
        let now = super::now_epoch();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instrument_subscriptions
             (token, symbol, segment, status, requested_mode, account_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5, ?6, ?6)
             ON CONFLICT(token) DO UPDATE SET
                 status = 'active',
                 requested_mode = excluded.requested_mode,
                 account_id = COALESCE(excluded.account_id, instrument_subscriptions.account_id),
                 updated_at = excluded.updated_at",
            params![token, symbol, segment.as_str(), mode.as_str(), account_id, now],
        )?;
        Ok(())
    }

    /// Soft delete: flips status to inactive, keeps the row.
    pub fn deactivate(&self, token: u32) -> Result<bool> {
        let now = super::now_epoch();
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE instrument_subscriptions SET status = 'inactive', updated_at = ?2 WHERE token = ?1",
            params![token, now],
        )?;
        Ok(n > 0)
    }

    pub fn set_account(&self, token: u32, account_id: &str) -> Result<()> {
        let now = super::now_epoch();
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE instrument_subscriptions SET account_id = ?2, updated_at = ?3 WHERE token = ?1",
            params![token, account_id, now],
        )?;
        Ok(())
    }

    pub fn get(&self, token: u32) -> Result<Option<SubscriptionRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT token, symbol, segment, status, requested_mode, account_id, created_at, updated_at
             FROM instrument_subscriptions WHERE token = ?1",
            params![token],
            row_to_subscription,
        )
        .optional()
        .context("get subscription")
    }

    pub fn list(&self, status: Option<SubscriptionStatus>) -> Result<Vec<SubscriptionRecord>> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(
                    "SELECT token, symbol, segment, status, requested_mode, account_id, created_at, updated_at
                     FROM instrument_subscriptions WHERE status = ?1 ORDER BY token",
                )?;
                let rows = stmt.query_map(params![status.as_str()], row_to_subscription)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT token, symbol, segment, status, requested_mode, account_id, created_at, updated_at
                     FROM instrument_subscriptions ORDER BY token",
                )?;
                let rows = stmt.query_map([], row_to_subscription)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    pub fn active_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM instrument_subscriptions WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Desired set for the reconciler: active subscriptions resolved
    /// against the instrument master. Subscriptions with no matching
    /// instrument are skipped.
    pub fn load_desired(&self) -> Result<HashMap<u32, (Instrument, SubscriptionRecord)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT s.token, s.symbol, s.segment, s.status, s.requested_mode, s.account_id,
                    s.created_at, s.updated_at,
                    i.token, i.symbol, i.segment, i.option_type, i.strike, i.expiry,
                    i.lot_size, i.tick_size, i.underlying_token
             FROM instrument_subscriptions s
             JOIN instruments i ON i.token = s.token
             WHERE s.status = 'active'",
        )?;
        let rows = stmt.query_map([], |row| {
            let sub = row_to_subscription(row)?;
            let inst = Instrument {
                token: row.get(8)?,
                symbol: row.get(9)?,
                segment: Segment::parse(&row.get::<_, String>(10)?).unwrap_or(Segment::Eq),
                option_type: row
                    .get::<_, Option<String>>(11)?
                    .as_deref()
                    .and_then(OptionType::parse),
                strike: row.get(12)?,
                expiry: row
                    .get::<_, Option<String>>(13)?
                    .as_deref()
                    .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
                lot_size: row.get(14)?,
                tick_size: row.get(15)?,
                underlying_token: row.get(16)?,
            };
            Ok((sub.token, (inst, sub)))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (token, pair) = row?;
            out.insert(token, pair);
        }
        Ok(out)
    }
}

fn row_to_instrument(row: &rusqlite::Row<'_>) -> rusqlite::Result<Instrument> {
    Ok(Instrument {
        token: row.get(0)?,
        symbol: row.get(1)?,
        segment: Segment::parse(&row.get::<_, String>(2)?).unwrap_or(Segment::Eq),
        option_type: row
            .get::<_, Option<String>>(3)?
            .as_deref()
            .and_then(OptionType::parse),
        strike: row.get(4)?,
        expiry: row
            .get::<_, Option<String>>(5)?
            .as_deref()
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()),
        lot_size: row.get(6)?,
        tick_size: row.get(7)?,
        underlying_token: row.get(8)?,
    })
}

fn row_to_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<SubscriptionRecord> {
    let created: i64 = row.get(6)?;
    let updated: i64 = row.get(7)?;
    Ok(SubscriptionRecord {
        token: row.get(0)?,
        symbol: row.get(1)?,
        segment: Segment::parse(&row.get::<_, String>(2)?).unwrap_or(Segment::Eq),
        status: SubscriptionStatus::parse(&row.get::<_, String>(3)?)
            .unwrap_or(SubscriptionStatus::Inactive),
        requested_mode: SubscribeMode::parse(&row.get::<_, String>(4)?)
            .unwrap_or(SubscribeMode::Quote),
        account_id: row.get(5)?,
        created_at: epoch_to_datetime(created),
        updated_at: epoch_to_datetime(updated),
    })
}

fn epoch_to_datetime(epoch: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(epoch, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SubscriptionStore {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.db");
        // Leak the tempdir so the db outlives the helper.
        std::mem::forget(dir);
        SubscriptionStore::new(path.to_str().unwrap()).unwrap()
    }

    fn nifty_call(token: u32) -> Instrument {
        Instrument {
            token,
            symbol: format!("NIFTY25AUG{token}CE"),
            segment: Segment::Opt,
            option_type: Some(OptionType::Ce),
            strike: Some(24_000.0),
            expiry: NaiveDate::from_ymd_opt(2025, 8, 28),
            lot_size: 50,
            tick_size: 0.05,
            underlying_token: Some(256_265),
        }
    }

    #[test]
    fn test_instrument_replace_and_load() {
        let store = store();
        let instruments = vec![nifty_call(1), nifty_call(2)];
        assert_eq!(store.replace_instruments(&instruments).unwrap(), 2);
        let loaded = store.load_instruments().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].option_type, Some(OptionType::Ce));
        assert_eq!(loaded[0].expiry, NaiveDate::from_ymd_opt(2025, 8, 28));
    }

    #[test]
    fn test_upsert_reactivates_and_keeps_assignment() {
        let store = store();
        store
            .upsert_subscription(10, "NIFTY", Segment::Idx, SubscribeMode::Full, None)
            .unwrap();
        store.set_account(10, "A1").unwrap();
        store.deactivate(10).unwrap();

        // Re-upsert without an account: status flips back, assignment survives.
        store
            .upsert_subscription(10, "NIFTY", Segment::Idx, SubscribeMode::Ltp, None)
            .unwrap();
        let sub = store.get(10).unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert_eq!(sub.requested_mode, SubscribeMode::Ltp);
        assert_eq!(sub.account_id.as_deref(), Some("A1"));
    }

    #[test]
    fn test_list_filters_by_status() {
        let store = store();
        store
            .upsert_subscription(1, "A", Segment::Eq, SubscribeMode::Quote, None)
            .unwrap();
        store
            .upsert_subscription(2, "B", Segment::Eq, SubscribeMode::Quote, None)
            .unwrap();
        store.deactivate(2).unwrap();

        assert_eq!(store.list(Some(SubscriptionStatus::Active)).unwrap().len(), 1);
        assert_eq!(store.list(Some(SubscriptionStatus::Inactive)).unwrap().len(), 1);
        assert_eq!(store.list(None).unwrap().len(), 2);
        assert_eq!(store.active_count().unwrap(), 1);
    }

    #[test]
    fn test_load_desired_joins_instruments() {
        let store = store();
        store.replace_instruments(&[nifty_call(42)]).unwrap();
        store
            .upsert_subscription(42, "NIFTY25AUG42CE", Segment::Opt, SubscribeMode::Full, None)
            .unwrap();
        // Subscription without instrument metadata is excluded.
        store
            .upsert_subscription(99, "ORPHAN", Segment::Eq, SubscribeMode::Quote, None)
            .unwrap();

        let desired = store.load_desired().unwrap();
        assert_eq!(desired.len(), 1);
        assert!(desired.contains_key(&42));
    }
}
