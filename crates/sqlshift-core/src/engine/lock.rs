//! Run-level exclusivity.
//!
//! A single lock row in the target database marks an orchestrator as active.
//! The row is inserted under an immediate transaction so two processes
//! cannot both observe the table as empty.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Error, Result};
use crate::sql::table_exists;
use crate::time::{current_timestamp, to_rfc3339};

/// Name of the lock table.
pub const LOCK_TABLE: &str = "_sqlshift_lock";

/// Who holds the lock and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockInfo {
    /// Holder identity.
    pub holder: String,
    /// Acquisition time (RFC 3339).
    pub acquired_at: String,
}

impl From<LockInfo> for Error {
    fn from(info: LockInfo) -> Self {
        Error::Lock {
            holder: info.holder,
            acquired_at: info.acquired_at,
        }
    }
}

/// A held run lock. Release it explicitly with [`RunLock::release`].
#[derive(Debug)]
#[must_use = "a run lock must be released"]
pub struct RunLock {
    holder: String,
}

impl RunLock {
    /// Acquire the lock for `holder`, failing with [`Error::Lock`] if held.
    pub fn acquire(conn: &mut Connection, holder: impl Into<String>) -> Result<Self> {
        let holder = holder.into();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {LOCK_TABLE} (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL
            )"
        ))?;

        if let Some(existing) = read_lock(&tx)? {
            return Err(existing.into());
        }

        tx.execute(
            &format!("INSERT INTO {LOCK_TABLE} (id, holder, acquired_at) VALUES (1, ?1, ?2)"),
            params![holder, to_rfc3339(current_timestamp())],
        )?;
        tx.commit()?;

        tracing::debug!(holder = %holder, "run lock acquired");
        Ok(Self { holder })
    }

    /// Holder identity.
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Release the lock.
    pub fn release(self, conn: &Connection) -> Result<()> {
        conn.execute(
            &format!("DELETE FROM {LOCK_TABLE} WHERE id = 1 AND holder = ?1"),
            [&self.holder],
        )?;
        tracing::debug!(holder = %self.holder, "run lock released");
        Ok(())
    }

    /// Current lock holder, if any. Never writes.
    pub fn current(conn: &Connection) -> Result<Option<LockInfo>> {
        if !table_exists(conn, LOCK_TABLE)? {
            return Ok(None);
        }
        Ok(read_lock(conn)?)
    }

    /// Fail with [`Error::Lock`] if another run holds the lock. Never writes.
    pub fn ensure_free(conn: &Connection) -> Result<()> {
        match Self::current(conn)? {
            Some(info) => Err(info.into()),
            None => Ok(()),
        }
    }

    /// Remove a stale lock regardless of holder. Returns the removed holder.
    pub fn force_unlock(conn: &Connection) -> Result<Option<LockInfo>> {
        let current = Self::current(conn)?;
        if current.is_some() {
            conn.execute(&format!("DELETE FROM {LOCK_TABLE} WHERE id = 1"), [])?;
            tracing::warn!(holder = ?current.as_ref().map(|l| &l.holder), "stale run lock removed");
        }
        Ok(current)
    }
}

fn read_lock(conn: &Connection) -> rusqlite::Result<Option<LockInfo>> {
    conn.query_row(
        &format!("SELECT holder, acquired_at FROM {LOCK_TABLE} WHERE id = 1"),
        [],
        |row| {
            Ok(LockInfo {
                holder: row.get(0)?,
                acquired_at: row.get(1)?,
            })
        },
    )
    .optional()
}
