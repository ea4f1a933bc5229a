//! Post-run integrity validation.
//!
//! Every check here is a read-only query. Findings are aggregated into one
//! report so an operator sees everything in a single pass.

use std::collections::BTreeMap;

use rusqlite::Connection;

use crate::error::Result;
use crate::sql::{self, quote_ident};

/// Category of an integrity finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FindingKind {
    /// An object the applied units declare does not exist.
    MissingObject,
    /// Child rows reference parent rows that do not exist.
    OrphanedReference,
    /// Rows share a value on a unique key.
    DuplicateKey,
    /// SQLite's own consistency check reported a problem.
    Corruption,
}

impl std::fmt::Display for FindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FindingKind::MissingObject => write!(f, "missing-object"),
            FindingKind::OrphanedReference => write!(f, "orphaned-reference"),
            FindingKind::DuplicateKey => write!(f, "duplicate-key"),
            FindingKind::Corruption => write!(f, "corruption"),
        }
    }
}

/// One integrity problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Category.
    pub kind: FindingKind,
    /// Object the finding is about.
    pub object: String,
    /// Human-readable detail.
    pub detail: String,
}

impl std::fmt::Display for Finding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.object, self.detail)
    }
}

/// Result of an integrity pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Findings in check order.
    pub findings: Vec<Finding>,
    /// Number of tables inspected.
    pub tables_checked: usize,
}

impl ValidationReport {
    /// Whether nothing was found.
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    /// Number of findings.
    pub fn len(&self) -> usize {
        self.findings.len()
    }

    /// Whether there are no findings.
    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    /// Findings of one kind.
    pub fn of_kind(&self, kind: FindingKind) -> impl Iterator<Item = &Finding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }

    /// Findings rendered as strings.
    pub fn messages(&self) -> Vec<String> {
        self.findings.iter().map(|f| f.to_string()).collect()
    }
}

/// Check the whole schema; `expected` lists objects that must exist.
pub fn check(conn: &Connection, expected: &[String]) -> Result<ValidationReport> {
    let mut report = ValidationReport::default();

    for object in expected {
        if sql::object_kind(conn, object)?.is_none() {
            report.findings.push(Finding {
                kind: FindingKind::MissingObject,
                object: object.clone(),
                detail: "declared by an applied unit but absent".to_string(),
            });
        }
    }

    let tables = sql::user_tables(conn)?;
    report.tables_checked = tables.len();

    check_foreign_keys(conn, &mut report)?;
    for table in &tables {
        check_unique_keys(conn, table, &mut report)?;
    }
    check_consistency(conn, &mut report)?;

    tracing::debug!(
        tables = report.tables_checked,
        findings = report.len(),
        "integrity check complete"
    );
    Ok(report)
}

fn check_foreign_keys(conn: &Connection, report: &mut ValidationReport) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(2)?))
    })?;

    // (child, parent) -> orphaned row count
    let mut orphans: BTreeMap<(String, String), u64> = BTreeMap::new();
    for row in rows {
        let (child, parent) = row?;
        if sql::is_internal(&child) {
            continue;
        }
        *orphans.entry((child, parent)).or_default() += 1;
    }

    for ((child, parent), count) in orphans {
        report.findings.push(Finding {
            kind: FindingKind::OrphanedReference,
            object: child,
            detail: format!("{} row(s) reference missing rows in {}", count, parent),
        });
    }
    Ok(())
}

fn check_unique_keys(conn: &Connection, table: &str, report: &mut ValidationReport) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list({})", quote_ident(table)))?;
    // columns: seq, name, unique, origin, partial
    let indexes = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
                row.get::<_, bool>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    for (index, unique, partial) in indexes {
        if !unique || partial {
            continue;
        }
        let columns = index_columns(conn, &index)?;
        let Some(columns) = columns else {
            continue;
        };

        let groups = duplicate_groups(conn, table, &columns)?;
        if groups > 0 {
            report.findings.push(Finding {
                kind: FindingKind::DuplicateKey,
                object: table.to_string(),
                detail: format!(
                    "{} duplicated value(s) on unique key ({}) of index {}",
                    groups,
                    columns.join(", "),
                    index
                ),
            });
        }
    }
    Ok(())
}

/// Number of distinct non-null values of `columns` that occur more than once.
fn duplicate_groups(conn: &Connection, table: &str, columns: &[String]) -> Result<i64> {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let not_null = columns
        .iter()
        .map(|c| format!("{} IS NOT NULL", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(" AND ");
    let query = format!(
        "SELECT COUNT(*) FROM (SELECT 1 FROM {} WHERE {} GROUP BY {} HAVING COUNT(*) > 1)",
        quote_ident(table),
        not_null,
        column_list
    );
    Ok(conn.query_row(&query, [], |row| row.get(0))?)
}

/// Column names of an index, or None if it indexes an expression.
fn index_columns(conn: &Connection, index: &str) -> Result<Option<Vec<String>>> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_info({})", quote_ident(index)))?;
    let names = stmt
        .query_map([], |row| row.get::<_, Option<String>>(2))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.into_iter().collect())
}

fn check_consistency(conn: &Connection, report: &mut ValidationReport) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA quick_check")?;
    let lines = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for line in lines {
        if line != "ok" {
            report.findings.push(Finding {
                kind: FindingKind::Corruption,
                object: "database".to_string(),
                detail: line,
            });
        }
    }
    Ok(())
}
