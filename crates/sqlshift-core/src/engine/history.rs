//! Applied-unit bookkeeping in the target database.
//!
//! A unit's history row is written inside the unit's own transaction and
//! removed inside its undo transaction, so the table always agrees with the
//! schema.

use std::collections::BTreeMap;

use rusqlite::{params, Connection};

use crate::sql::table_exists;
use crate::time::{current_timestamp, to_rfc3339};
use crate::unit::MigrationUnit;

/// Name of the history table.
pub const HISTORY_TABLE: &str = "_sqlshift_history";

/// One applied unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Unit ordinal.
    pub ordinal: u32,
    /// Unit name.
    pub name: String,
    /// Checksum at the time the unit was applied.
    pub checksum: String,
    /// Commit time (RFC 3339).
    pub applied_at: String,
    /// Run that applied it.
    pub run_id: String,
}

/// Create the history table if it does not exist.
pub fn ensure_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (
            ordinal INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            checksum TEXT NOT NULL,
            applied_at TEXT NOT NULL,
            run_id TEXT NOT NULL
        )"
    ))
}

/// Record `unit` as applied. Call inside the unit's transaction.
pub fn record(conn: &Connection, unit: &MigrationUnit, run_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {HISTORY_TABLE} (ordinal, name, checksum, applied_at, run_id)
             VALUES (?1, ?2, ?3, ?4, ?5)"
        ),
        params![
            unit.ordinal(),
            unit.name(),
            unit.checksum(),
            to_rfc3339(current_timestamp()),
            run_id
        ],
    )?;
    Ok(())
}

/// Remove the history row of a unit. Call inside the undo transaction.
pub fn remove(conn: &Connection, name: &str) -> rusqlite::Result<usize> {
    conn.execute(
        &format!("DELETE FROM {HISTORY_TABLE} WHERE name = ?1"),
        [name],
    )
}

/// Statement that removes a unit's history row, for standalone scripts.
pub fn remove_statement(name: &str) -> String {
    format!(
        "DELETE FROM {HISTORY_TABLE} WHERE name = {}",
        crate::sql::quote_literal(name)
    )
}

/// Applied units keyed by name. Read-only; empty if the table does not exist.
pub fn applied(conn: &Connection) -> rusqlite::Result<BTreeMap<String, HistoryEntry>> {
    if !table_exists(conn, HISTORY_TABLE)? {
        return Ok(BTreeMap::new());
    }

    let mut stmt = conn.prepare(&format!(
        "SELECT ordinal, name, checksum, applied_at, run_id FROM {HISTORY_TABLE} ORDER BY ordinal"
    ))?;
    let rows = stmt.query_map([], |row| {
        Ok(HistoryEntry {
            ordinal: row.get(0)?,
            name: row.get(1)?,
            checksum: row.get(2)?,
            applied_at: row.get(3)?,
            run_id: row.get(4)?,
        })
    })?;

    let mut entries = BTreeMap::new();
    for row in rows {
        let entry = row?;
        entries.insert(entry.name.clone(), entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_remove() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(applied(&conn).unwrap().is_empty());

        ensure_table(&conn).unwrap();
        let unit = MigrationUnit::new(3, "0003_sessions");
        record(&conn, &unit, "run-1").unwrap();

        let entries = applied(&conn).unwrap();
        let entry = &entries["0003_sessions"];
        assert_eq!(entry.ordinal, 3);
        assert_eq!(entry.checksum, unit.checksum());
        assert_eq!(entry.run_id, "run-1");

        assert_eq!(remove(&conn, "0003_sessions").unwrap(), 1);
        assert!(applied(&conn).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_record_fails() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_table(&conn).unwrap();
        let unit = MigrationUnit::new(1, "0001_users");
        record(&conn, &unit, "a").unwrap();
        assert!(record(&conn, &unit, "b").is_err());
    }

    #[test]
    fn test_remove_statement_quotes_name() {
        assert_eq!(
            remove_statement("0001_o'brien"),
            "DELETE FROM _sqlshift_history WHERE name = '0001_o''brien'"
        );
    }
}
