//! Migration file parser.
//!
//! A file is a header of comment directives followed by operation blocks:
//!
//! ```text
//! -- description: sessions for logged-in users
//! -- requires: users
//! -- @op create-table user_sessions
//! CREATE TABLE user_sessions (...);
//! -- @op create-index idx_sessions_user_id
//! CREATE INDEX idx_sessions_user_id ON user_sessions(user_id);
//! -- @op raw
//! UPDATE users SET role = 'member' WHERE role IS NULL;
//! -- @inverse
//! UPDATE users SET role = NULL WHERE role = 'member';
//! ```
//!
//! A file without any `-- @op` line is a single raw operation.

use std::path::Path;

use crate::error::{Error, Result};
use crate::operation::{Operation, OperationKind};
use crate::unit::MigrationUnit;

const OP_MARKER: &str = "@op";
const INVERSE_MARKER: &str = "@inverse";

/// Parse the numeric ordinal from a file stem such as `0003_create_sessions`.
pub fn parse_ordinal(stem: &str) -> Option<u32> {
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    let rest = &stem[digits.len()..];
    if !(rest.is_empty() || rest.starts_with('_') || rest.starts_with('-')) {
        return None;
    }
    digits.parse().ok()
}

/// Parse one migration file into a unit.
pub fn parse_unit(ordinal: u32, name: &str, text: &str, path: &Path) -> Result<MigrationUnit> {
    let mut unit = MigrationUnit::new(ordinal, name);
    let mut block: Option<Block> = None;
    let mut saw_op = false;
    let mut preamble = String::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();

        if let Some(directive) = directive_body(trimmed) {
            if let Some(args) = strip_keyword(directive, OP_MARKER) {
                if let Some(done) = block.take() {
                    unit = unit.with_operation(done.finish(path)?);
                }
                let kind = parse_kind(args).map_err(|reason| {
                    Error::load(path, format!("line {}: {}", line_no, reason))
                })?;
                block = Some(Block::new(kind, line_no));
                saw_op = true;
                continue;
            }
            if strip_keyword(directive, INVERSE_MARKER).is_some() {
                match block.as_mut() {
                    Some(b) if matches!(b.kind, OperationKind::Raw { .. }) && b.inverse.is_none() => {
                        b.inverse = Some(String::new());
                    }
                    _ => {
                        return Err(Error::load(
                            path,
                            format!("line {}: @inverse is only valid once inside a raw block", line_no),
                        ));
                    }
                }
                continue;
            }
            if !saw_op {
                unit = apply_header(unit, directive, path, line_no)?;
                continue;
            }
        }

        match block.as_mut() {
            Some(b) => b.push(line),
            None => {
                if !trimmed.is_empty() && !trimmed.starts_with("--") {
                    preamble.push_str(line);
                    preamble.push('\n');
                }
            }
        }
    }

    if let Some(done) = block.take() {
        unit = unit.with_operation(done.finish(path)?);
    }

    if !preamble.trim().is_empty() {
        if saw_op {
            return Err(Error::load(
                path,
                "statements before the first -- @op block",
            ));
        }
        unit = unit.with_operation(Operation::raw(preamble.trim().to_string(), None));
    }

    if unit.operations().is_empty() {
        return Err(Error::load(path, "file contains no statements"));
    }

    Ok(unit)
}

/// Operation block being accumulated.
struct Block {
    kind: OperationKind,
    line: usize,
    sql: String,
    inverse: Option<String>,
}

impl Block {
    fn new(kind: OperationKind, line: usize) -> Self {
        Self {
            kind,
            line,
            sql: String::new(),
            inverse: None,
        }
    }

    fn push(&mut self, line: &str) {
        let target = match self.inverse.as_mut() {
            Some(inverse) => inverse,
            None => &mut self.sql,
        };
        target.push_str(line);
        target.push('\n');
    }

    fn finish(self, path: &Path) -> Result<Operation> {
        let sql = self.sql.trim().to_string();
        if sql.is_empty() {
            return Err(Error::load(
                path,
                format!("line {}: empty {} block", self.line, self.kind.label()),
            ));
        }
        let kind = match self.kind {
            OperationKind::Raw { .. } => OperationKind::Raw {
                inverse: self
                    .inverse
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()),
            },
            other => other,
        };
        Ok(Operation::new(kind, sql))
    }
}

fn directive_body(line: &str) -> Option<&str> {
    line.strip_prefix("--").map(str::trim)
}

fn strip_keyword<'a>(directive: &'a str, keyword: &str) -> Option<&'a str> {
    let rest = directive.strip_prefix(keyword)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest.trim())
    } else {
        None
    }
}

fn apply_header(
    unit: MigrationUnit,
    directive: &str,
    path: &Path,
    line_no: usize,
) -> Result<MigrationUnit> {
    let Some((key, value)) = directive.split_once(':') else {
        if directive.eq_ignore_ascii_case("irreversible") {
            return Ok(unit.irreversible());
        }
        return Ok(unit);
    };

    let value = value.trim();
    match key.trim().to_ascii_lowercase().as_str() {
        "requires" => Ok(split_list(value).fold(unit, |u, o| u.requires(o))),
        "creates" => Ok(split_list(value).fold(unit, |u, o| u.creates(o))),
        "description" => Ok(unit.with_description(value)),
        "irreversible" => match value.to_ascii_lowercase().as_str() {
            "" | "true" | "yes" => Ok(unit.irreversible()),
            "false" | "no" => Ok(unit),
            other => Err(Error::load(
                path,
                format!("line {}: invalid irreversible value '{}'", line_no, other),
            )),
        },
        // Ordinary comments that happen to contain a colon.
        _ => Ok(unit),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_kind(args: &str) -> std::result::Result<OperationKind, String> {
    let mut parts = args.split_whitespace();
    let label = parts.next().ok_or("missing operation kind")?;
    let rest: Vec<&str> = parts.collect();

    let single = |what: &str| -> std::result::Result<String, String> {
        match rest.as_slice() {
            [name] => Ok(name.to_string()),
            _ => Err(format!("{} expects exactly one {}", label, what)),
        }
    };

    match label {
        "create-table" => Ok(OperationKind::CreateTable {
            name: single("table name")?,
        }),
        "create-index" => Ok(OperationKind::CreateIndex {
            name: single("index name")?,
        }),
        "create-trigger" => Ok(OperationKind::CreateTrigger {
            name: single("trigger name")?,
        }),
        "create-view" => Ok(OperationKind::CreateView {
            name: single("view name")?,
        }),
        "add-column" => {
            let target = single("table.column")?;
            let (table, column) = target
                .split_once('.')
                .filter(|(t, c)| !t.is_empty() && !c.is_empty())
                .ok_or_else(|| format!("add-column expects table.column, got '{}'", target))?;
            Ok(OperationKind::AddColumn {
                table: table.to_string(),
                column: column.to_string(),
            })
        }
        "rename-table" => match rest.as_slice() {
            [from, to] => Ok(OperationKind::RenameTable {
                from: from.to_string(),
                to: to.to_string(),
            }),
            _ => Err("rename-table expects <from> <to>".to_string()),
        },
        "insert-rows" => parse_insert_rows(&rest),
        "raw" => {
            if rest.is_empty() {
                Ok(OperationKind::Raw { inverse: None })
            } else {
                Err("raw takes no arguments".to_string())
            }
        }
        other => Err(format!("unknown operation kind '{}'", other)),
    }
}

fn parse_insert_rows(args: &[&str]) -> std::result::Result<OperationKind, String> {
    let (table, options) = args
        .split_first()
        .ok_or("insert-rows expects <table> key=<column> keys=<k1,k2,...>")?;

    let mut key_column = None;
    let mut keys = Vec::new();
    for option in options {
        match option.split_once('=') {
            Some(("key", column)) if !column.is_empty() => key_column = Some(column.to_string()),
            Some(("keys", values)) => keys.extend(split_list(values)),
            _ => return Err(format!("unexpected insert-rows argument '{}'", option)),
        }
    }

    let key_column = key_column.ok_or("insert-rows requires key=<column>")?;
    if keys.is_empty() {
        return Err("insert-rows requires keys=<k1,k2,...>".to_string());
    }

    Ok(OperationKind::InsertRows {
        table: table.to_string(),
        key_column,
        keys,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<MigrationUnit> {
        parse_unit(2, "0002_sessions", text, Path::new("0002_sessions.sql"))
    }

    #[test]
    fn test_parse_ordinal() {
        assert_eq!(parse_ordinal("0003_create_sessions"), Some(3));
        assert_eq!(parse_ordinal("12-seed"), Some(12));
        assert_eq!(parse_ordinal("7"), Some(7));
        assert_eq!(parse_ordinal("create_sessions"), None);
        assert_eq!(parse_ordinal("3a_bad"), None);
    }

    #[test]
    fn test_parse_full_unit() {
        let text = "\
-- description: user sessions
-- requires: users
-- creates: session_cleanup_marker
-- @op create-table user_sessions
CREATE TABLE user_sessions (
    id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id)
);
-- @op create-index idx_sessions_user_id
CREATE INDEX idx_sessions_user_id ON user_sessions(user_id);
-- @op insert-rows user_sessions key=id keys=1,2
INSERT INTO user_sessions (id, user_id) VALUES (1, 1), (2, 1);
";
        let unit = parse(text).unwrap();
        assert_eq!(unit.ordinal(), 2);
        assert_eq!(unit.description(), Some("user sessions"));
        assert_eq!(unit.required_objects(), &["users".to_string()]);
        assert_eq!(unit.operations().len(), 3);
        assert!(unit
            .created_objects()
            .iter()
            .any(|o| o == "session_cleanup_marker"));
        assert!(unit.created_objects().iter().any(|o| o == "user_sessions"));
        assert!(unit.operations()[0].sql.contains("REFERENCES users(id)"));
        assert!(!unit.is_irreversible());
    }

    #[test]
    fn test_parse_raw_with_inverse() {
        let text = "\
-- @op raw
UPDATE users SET role = 'member' WHERE role IS NULL;
-- @inverse
UPDATE users SET role = NULL WHERE role = 'member';
";
        let unit = parse(text).unwrap();
        let op = &unit.operations()[0];
        assert_eq!(
            op.inverse().unwrap(),
            "UPDATE users SET role = NULL WHERE role = 'member';"
        );
        assert!(!op.sql.contains("@inverse"));
    }

    #[test]
    fn test_file_without_blocks_is_single_raw_operation() {
        let text = "-- irreversible\nDELETE FROM audit_logs WHERE created_at < '2020-01-01';\n";
        let unit = parse(text).unwrap();
        assert!(unit.is_irreversible());
        assert_eq!(unit.operations().len(), 1);
        assert!(unit.operations()[0].inverse().is_none());
    }

    #[test]
    fn test_unknown_kind_is_load_error() {
        let err = parse("-- @op drop-everything\nDROP TABLE users;").unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(err.to_string().contains("line 1"));
        assert!(err.to_string().contains("drop-everything"));
    }

    #[test]
    fn test_empty_block_is_load_error() {
        let err = parse("-- @op create-table users\n-- @op create-table posts\nCREATE TABLE posts (id INTEGER);")
            .unwrap_err();
        assert!(err.to_string().contains("empty create-table block"));
    }

    #[test]
    fn test_statement_before_first_block_is_load_error() {
        let err = parse("CREATE TABLE a (id INTEGER);\n-- @op create-table b\nCREATE TABLE b (id INTEGER);")
            .unwrap_err();
        assert!(err.to_string().contains("before the first"));
    }

    #[test]
    fn test_inverse_outside_raw_is_load_error() {
        let err = parse("-- @op create-table a\nCREATE TABLE a (id INTEGER);\n-- @inverse\nDROP TABLE a;")
            .unwrap_err();
        assert!(err.to_string().contains("@inverse"));
    }

    #[test]
    fn test_insert_rows_requires_keys() {
        let err = parse("-- @op insert-rows users key=id\nINSERT INTO users VALUES (1);").unwrap_err();
        assert!(err.to_string().contains("keys="));
    }

    #[test]
    fn test_add_column_and_rename() {
        let text = "\
-- @op add-column users.email
ALTER TABLE users ADD COLUMN email TEXT;
-- @op rename-table kb_entries kb_entries_backup
ALTER TABLE kb_entries RENAME TO kb_entries_backup;
";
        let unit = parse(text).unwrap();
        assert_eq!(
            unit.operations()[0].kind,
            OperationKind::AddColumn {
                table: "users".to_string(),
                column: "email".to_string()
            }
        );
        assert_eq!(unit.created_objects(), &["kb_entries_backup".to_string()]);
    }

    #[test]
    fn test_empty_file_is_load_error() {
        let err = parse("-- just a comment\n\n").unwrap_err();
        assert!(err.to_string().contains("no statements"));
    }
}
