//! SQL text helpers and read-only schema introspection.

use std::collections::BTreeMap;

use rkyv::{Archive, Deserialize, Serialize};
use rusqlite::{Connection, OptionalExtension};

/// Prefix reserved for the engine's bookkeeping tables.
pub const INTERNAL_PREFIX: &str = "_sqlshift_";

/// Kind of a schema object as reported by `sqlite_master`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Serialize, Deserialize)]
pub enum ObjectKind {
    /// A table.
    Table,
    /// An index.
    Index,
    /// A trigger.
    Trigger,
    /// A view.
    View,
}

impl ObjectKind {
    fn from_master(kind: &str) -> Option<Self> {
        match kind {
            "table" => Some(ObjectKind::Table),
            "index" => Some(ObjectKind::Index),
            "trigger" => Some(ObjectKind::Trigger),
            "view" => Some(ObjectKind::View),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Table => write!(f, "table"),
            ObjectKind::Index => write!(f, "index"),
            ObjectKind::Trigger => write!(f, "trigger"),
            ObjectKind::View => write!(f, "view"),
        }
    }
}

/// Quote an identifier for use in generated SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a string literal for use in generated SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Normalized lookup key for an object name (SQLite names are case-insensitive).
pub fn object_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

/// List user schema objects, keyed by normalized name.
///
/// SQLite internals and the engine's own tables are excluded.
pub fn schema_objects(conn: &Connection) -> rusqlite::Result<BTreeMap<String, ObjectKind>> {
    let mut stmt = conn.prepare("SELECT type, name FROM sqlite_master ORDER BY type, name")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut objects = BTreeMap::new();
    for row in rows {
        let (kind, name) = row?;
        if is_internal(&name) {
            continue;
        }
        if let Some(kind) = ObjectKind::from_master(&kind) {
            objects.insert(object_key(&name), kind);
        }
    }
    Ok(objects)
}

/// Kind of a named object, if it exists.
pub fn object_kind(conn: &Connection, name: &str) -> rusqlite::Result<Option<ObjectKind>> {
    let kind: Option<String> = conn
        .query_row(
            "SELECT type FROM sqlite_master WHERE name = ?1 COLLATE NOCASE",
            [name.trim()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(kind.as_deref().and_then(ObjectKind::from_master))
}

/// Whether a table exists.
pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    Ok(object_kind(conn, name)? == Some(ObjectKind::Table))
}

/// Count rows in a table.
pub fn row_count(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
    let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
    let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
    Ok(count.max(0) as u64)
}

/// Names of user tables in the schema.
pub fn user_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.into_iter().filter(|n| !is_internal(n)).collect())
}

/// Whether a name belongs to SQLite or to the engine's own bookkeeping.
pub(crate) fn is_internal(name: &str) -> bool {
    name.starts_with("sqlite_") || name.starts_with(INTERNAL_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_literal_escapes_quotes() {
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }

    #[test]
    fn test_schema_objects_skips_internal() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT UNIQUE);
             CREATE INDEX idx_users_email ON users(email);
             CREATE VIEW active_users AS SELECT * FROM users;
             CREATE TABLE _sqlshift_history (ordinal INTEGER);",
        )
        .unwrap();

        let objects = schema_objects(&conn).unwrap();
        assert_eq!(objects.get("users"), Some(&ObjectKind::Table));
        assert_eq!(objects.get("idx_users_email"), Some(&ObjectKind::Index));
        assert_eq!(objects.get("active_users"), Some(&ObjectKind::View));
        assert!(!objects.contains_key("_sqlshift_history"));
        assert!(objects.keys().all(|k| !k.starts_with("sqlite_")));
    }

    #[test]
    fn test_object_kind_is_case_insensitive() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE Users (id INTEGER)").unwrap();
        assert_eq!(object_kind(&conn, "users").unwrap(), Some(ObjectKind::Table));
        assert!(table_exists(&conn, "USERS").unwrap());
        assert!(!table_exists(&conn, "posts").unwrap());
    }

    #[test]
    fn test_row_count() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (id INTEGER); INSERT INTO t VALUES (1), (2), (3);",
        )
        .unwrap();
        assert_eq!(row_count(&conn, "t").unwrap(), 3);
        assert_eq!(user_tables(&conn).unwrap(), vec!["t".to_string()]);
    }
}
