//! rusqlite persistence.
//!
//! Each store owns its own connection behind a `parking_lot::Mutex` and
//! applies WAL pragmas on open. Schema creation is idempotent and runs at
//! boot; a failed schema verify aborts startup.

pub mod accounts;
pub mod orders;
pub mod subscriptions;

use anyhow::{Context, Result};
use rusqlite::Connection;

pub use accounts::{AccountStore, CredentialCipher, TradingAccount};
pub use orders::OrderTaskStore;
pub use subscriptions::SubscriptionStore;

/// Open a connection with the pragmas every store relies on.
pub(crate) fn open_connection(path: &str) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open sqlite db at {path}"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA temp_store = MEMORY;
         PRAGMA busy_timeout = 5000;",
    )
    .context("apply sqlite pragmas")?;
    Ok(conn)
}

pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}
