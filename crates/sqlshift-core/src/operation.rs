//! Forward operations and their structurally derived inverses.
//!
//! Each operation a unit can carry is one variant of [`OperationKind`]. The
//! inverse is computed from the variant alone, so adding a kind means adding
//! a match arm to [`Operation::inverse`] and [`Operation::created_object`].

use crate::sql::{quote_ident, quote_literal};

/// The closed set of forward operation kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationKind {
    /// `CREATE TABLE`.
    CreateTable {
        /// Table name.
        name: String,
    },
    /// `CREATE INDEX`.
    CreateIndex {
        /// Index name.
        name: String,
    },
    /// `CREATE TRIGGER`.
    CreateTrigger {
        /// Trigger name.
        name: String,
    },
    /// `CREATE VIEW`.
    CreateView {
        /// View name.
        name: String,
    },
    /// `ALTER TABLE ... ADD COLUMN`.
    AddColumn {
        /// Table being altered.
        table: String,
        /// Column added.
        column: String,
    },
    /// `ALTER TABLE ... RENAME TO`.
    RenameTable {
        /// Original name.
        from: String,
        /// New name.
        to: String,
    },
    /// Seed rows identified by a key column.
    InsertRows {
        /// Target table.
        table: String,
        /// Column that identifies the seeded rows.
        key_column: String,
        /// Key values of the seeded rows.
        keys: Vec<String>,
    },
    /// Any other statement. Reversible only if the author supplies an inverse.
    Raw {
        /// Author-supplied inverse SQL.
        inverse: Option<String>,
    },
}

impl OperationKind {
    /// Short name used in logs and directives.
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::CreateTable { .. } => "create-table",
            OperationKind::CreateIndex { .. } => "create-index",
            OperationKind::CreateTrigger { .. } => "create-trigger",
            OperationKind::CreateView { .. } => "create-view",
            OperationKind::AddColumn { .. } => "add-column",
            OperationKind::RenameTable { .. } => "rename-table",
            OperationKind::InsertRows { .. } => "insert-rows",
            OperationKind::Raw { .. } => "raw",
        }
    }
}

/// A forward statement paired with its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// What the statement does.
    pub kind: OperationKind,
    /// The statement text, executed verbatim.
    pub sql: String,
}

impl Operation {
    /// Create an operation of the given kind.
    pub fn new(kind: OperationKind, sql: impl Into<String>) -> Self {
        Self {
            kind,
            sql: sql.into(),
        }
    }

    /// A `CREATE TABLE` operation.
    pub fn create_table(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(OperationKind::CreateTable { name: name.into() }, sql)
    }

    /// A `CREATE INDEX` operation.
    pub fn create_index(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(OperationKind::CreateIndex { name: name.into() }, sql)
    }

    /// A `CREATE TRIGGER` operation.
    pub fn create_trigger(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(OperationKind::CreateTrigger { name: name.into() }, sql)
    }

    /// A `CREATE VIEW` operation.
    pub fn create_view(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(OperationKind::CreateView { name: name.into() }, sql)
    }

    /// An `ADD COLUMN` operation.
    pub fn add_column(
        table: impl Into<String>,
        column: impl Into<String>,
        sql: impl Into<String>,
    ) -> Self {
        Self::new(
            OperationKind::AddColumn {
                table: table.into(),
                column: column.into(),
            },
            sql,
        )
    }

    /// A table rename.
    pub fn rename_table(from: impl Into<String>, to: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(
            OperationKind::RenameTable {
                from: from.into(),
                to: to.into(),
            },
            sql,
        )
    }

    /// Seed rows identified by `key_column IN keys`.
    pub fn insert_rows<K, S>(
        table: impl Into<String>,
        key_column: impl Into<String>,
        keys: K,
        sql: impl Into<String>,
    ) -> Self
    where
        K: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            OperationKind::InsertRows {
                table: table.into(),
                key_column: key_column.into(),
                keys: keys.into_iter().map(Into::into).collect(),
            },
            sql,
        )
    }

    /// A raw statement with an optional author-supplied inverse.
    pub fn raw(sql: impl Into<String>, inverse: Option<String>) -> Self {
        Self::new(OperationKind::Raw { inverse }, sql)
    }

    /// The statement that undoes this operation, if one can be derived.
    pub fn inverse(&self) -> Option<String> {
        match &self.kind {
            OperationKind::CreateTable { name } => {
                Some(format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
            }
            OperationKind::CreateIndex { name } => {
                Some(format!("DROP INDEX IF EXISTS {}", quote_ident(name)))
            }
            OperationKind::CreateTrigger { name } => {
                Some(format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))
            }
            OperationKind::CreateView { name } => {
                Some(format!("DROP VIEW IF EXISTS {}", quote_ident(name)))
            }
            OperationKind::AddColumn { table, column } => Some(format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            )),
            OperationKind::RenameTable { from, to } => Some(format!(
                "ALTER TABLE {} RENAME TO {}",
                quote_ident(to),
                quote_ident(from)
            )),
            OperationKind::InsertRows {
                table,
                key_column,
                keys,
            } => {
                if keys.is_empty() {
                    return None;
                }
                let values: Vec<String> = keys.iter().map(|k| key_literal(k)).collect();
                Some(format!(
                    "DELETE FROM {} WHERE {} IN ({})",
                    quote_ident(table),
                    quote_ident(key_column),
                    values.join(", ")
                ))
            }
            OperationKind::Raw { inverse } => inverse
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
        }
    }

    /// The schema object this operation brings into existence.
    pub fn created_object(&self) -> Option<&str> {
        match &self.kind {
            OperationKind::CreateTable { name }
            | OperationKind::CreateIndex { name }
            | OperationKind::CreateTrigger { name }
            | OperationKind::CreateView { name } => Some(name),
            OperationKind::RenameTable { to, .. } => Some(to),
            OperationKind::AddColumn { .. }
            | OperationKind::InsertRows { .. }
            | OperationKind::Raw { .. } => None,
        }
    }

    /// Tables whose row counts are worth recording around this operation.
    pub fn touched_tables(&self) -> Vec<&str> {
        match &self.kind {
            OperationKind::CreateTable { name } => vec![name],
            OperationKind::AddColumn { table, .. } | OperationKind::InsertRows { table, .. } => {
                vec![table]
            }
            OperationKind::RenameTable { from, to } => vec![from, to],
            OperationKind::CreateIndex { .. }
            | OperationKind::CreateTrigger { .. }
            | OperationKind::CreateView { .. }
            | OperationKind::Raw { .. } => Vec::new(),
        }
    }

    /// One-line description for logs and plans.
    pub fn describe(&self) -> String {
        match &self.kind {
            OperationKind::CreateTable { name }
            | OperationKind::CreateIndex { name }
            | OperationKind::CreateTrigger { name }
            | OperationKind::CreateView { name } => format!("{} {}", self.kind.label(), name),
            OperationKind::AddColumn { table, column } => {
                format!("add-column {}.{}", table, column)
            }
            OperationKind::RenameTable { from, to } => format!("rename-table {} -> {}", from, to),
            OperationKind::InsertRows { table, keys, .. } => {
                format!("insert-rows {} ({} keys)", table, keys.len())
            }
            OperationKind::Raw { .. } => {
                let first = self.sql.lines().next().unwrap_or("").trim();
                format!("raw {}", first)
            }
        }
    }
}

/// Render a row key for an `IN (...)` list.
///
/// Integer keys stay bare so they match integer storage in columns without
/// type affinity; typed columns coerce either form.
fn key_literal(key: &str) -> String {
    match key.parse::<i64>() {
        Ok(n) if n.to_string() == key => key.to_string(),
        _ => quote_literal(key),
    }
}
