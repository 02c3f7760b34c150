//! SQLite-backed ledger store.
//!
//! A single database file holds the account table. Thread-safe via an
//! internal `Mutex<Connection>`; the atomic check-and-decrement is a
//! single conditional `UPDATE`, so no two deductions can both observe a
//! pre-deduction balance even across processes.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{Connection, params};

use super::{AuthoritativeBalance, Credits, LedgerError, LedgerStore, UserId};

/// Database filename within the ledger root directory.
const DB_FILENAME: &str = "ledger.db";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    user_id    TEXT PRIMARY KEY,
    credits    INTEGER NOT NULL CHECK (credits >= 0),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// SQLite-backed credit ledger.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish()
    }
}

impl SqliteLedger {
    /// Open (or create) the ledger database at `{root_dir}/ledger.db`.
    pub fn new(root_dir: &Path) -> Result<Self, LedgerError> {
        std::fs::create_dir_all(root_dir)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        let conn = Connection::open(root_dir.join(DB_FILENAME))
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (tests).
    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn =
            Connection::open_in_memory().map_err(|e| LedgerError::Storage(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::Storage("ledger connection lock poisoned".to_owned()))
    }
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn create_account(&self, user: &UserId, welcome: Credits) -> Result<(), LedgerError> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO accounts (user_id, credits, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?3)",
            params![user.0, welcome as i64, now],
        )
        .map_err(|e| LedgerError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn balance(&self, user: &UserId) -> Result<AuthoritativeBalance, LedgerError> {
        let conn = self.lock()?;
        let credits: Option<i64> = conn
            .query_row(
                "SELECT credits FROM accounts WHERE user_id = ?1",
                params![user.0],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(LedgerError::Storage(other.to_string())),
            })?;
        credits
            .map(|c| AuthoritativeBalance::new(c.max(0) as Credits))
            .ok_or_else(|| LedgerError::UnknownUser(user.to_string()))
    }

    async fn try_deduct(&self, user: &UserId, amount: Credits) -> Result<bool, LedgerError> {
        let now = chrono::Utc::now().to_rfc3339();
        // Guard scoped to the block so the future stays Send.
        let changed = {
            let conn = self.lock()?;
            // Single conditional UPDATE: check and decrement are indivisible.
            conn.execute(
                "UPDATE accounts SET credits = credits - ?2, updated_at = ?3 \
                 WHERE user_id = ?1 AND credits >= ?2",
                params![user.0, amount as i64, now],
            )
            .map_err(|e| LedgerError::Storage(e.to_string()))?
        };
        if changed == 1 {
            return Ok(true);
        }
        // Distinguish "insufficient" from "no such account".
        self.balance(user).await.map(|_| false)
    }

    async fn credit(&self, user: &UserId, amount: Credits) -> Result<(), LedgerError> {
        let now = chrono::Utc::now().to_rfc3339();
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE accounts SET credits = credits + ?2, updated_at = ?3 \
                 WHERE user_id = ?1",
                params![user.0, amount as i64, now],
            )
            .map_err(|e| LedgerError::Storage(e.to_string()))?;
        if changed == 0 {
            return Err(LedgerError::UnknownUser(user.to_string()));
        }
        Ok(())
    }
}
