//! Checkpoints: durable pre/post markers around each unit.
//!
//! A checkpoint records which unit it belongs to, advisory schema statistics,
//! and the inverse script that undoes the unit. Checkpoints are append-only;
//! rollback state is tracked beside them, never written into them.

pub mod store;

use rkyv::{Archive, Deserialize, Serialize};
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::sql::{self, ObjectKind};
use crate::unit::MigrationUnit;

pub use store::{CheckpointStore, Checkpoints, RollbackMarker};

/// Unique, monotonically increasing checkpoint identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Archive, Serialize, Deserialize,
)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    /// Big-endian key bytes; sled orders these by creation.
    pub fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Decode key bytes written by [`CheckpointId::to_key`].
    pub fn from_key(bytes: &[u8]) -> Result<Self> {
        let buf: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Deserialization(format!("invalid checkpoint key length {}", bytes.len())))?;
        Ok(CheckpointId(u64::from_be_bytes(buf)))
    }
}

impl std::fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ckpt-{}", self.0)
    }
}

impl std::str::FromStr for CheckpointId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.trim().strip_prefix("ckpt-").unwrap_or(s.trim());
        digits
            .parse()
            .map(CheckpointId)
            .map_err(|_| format!("invalid checkpoint id '{}'", s))
    }
}

/// Whether a checkpoint precedes or follows the unit's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum Phase {
    /// Captured before the transaction begins.
    Pre,
    /// Captured after the transaction commits.
    Post,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Pre => write!(f, "pre"),
            Phase::Post => write!(f, "post"),
        }
    }
}

/// Number of schema objects of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct ObjectCount {
    /// Object kind.
    pub kind: ObjectKind,
    /// How many exist.
    pub count: u64,
}

/// Row count of one table.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct TableRows {
    /// Table name.
    pub table: String,
    /// Rows at capture time.
    pub rows: u64,
}

/// Advisory schema statistics, used for auditing only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct SchemaStats {
    /// Object counts per kind.
    pub objects: Vec<ObjectCount>,
    /// Row counts for tables the unit touches (those that exist).
    pub rows: Vec<TableRows>,
}

impl SchemaStats {
    /// Collect statistics for the tables a unit touches.
    pub fn collect(conn: &Connection, tables: &[String]) -> rusqlite::Result<Self> {
        let objects = sql::schema_objects(conn)?;
        let mut counts: Vec<ObjectCount> = Vec::new();
        for kind in [
            ObjectKind::Table,
            ObjectKind::Index,
            ObjectKind::Trigger,
            ObjectKind::View,
        ] {
            let count = objects.values().filter(|k| **k == kind).count() as u64;
            counts.push(ObjectCount { kind, count });
        }

        let mut rows = Vec::new();
        for table in tables {
            if sql::table_exists(conn, table)? {
                rows.push(TableRows {
                    table: table.clone(),
                    rows: sql::row_count(conn, table)?,
                });
            }
        }

        Ok(Self {
            objects: counts,
            rows,
        })
    }

    /// Count of objects of the given kind.
    pub fn count_of(&self, kind: ObjectKind) -> u64 {
        self.objects
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Recorded row count of a table, if captured.
    pub fn rows_of(&self, table: &str) -> Option<u64> {
        self.rows
            .iter()
            .find(|r| r.table.eq_ignore_ascii_case(table))
            .map(|r| r.rows)
    }
}

/// Statements that undo a unit, computed at capture time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct InverseScript {
    /// Inverse statements in execution order.
    pub statements: Vec<String>,
    /// Operations for which no inverse could be derived.
    pub missing: Vec<String>,
    /// Whether the unit author flagged the unit irreversible.
    pub irreversible: bool,
}

impl InverseScript {
    /// Derive the script for a unit.
    pub fn for_unit(unit: &MigrationUnit) -> Self {
        let (statements, missing) = unit.inverse_script();
        Self {
            statements,
            missing,
            irreversible: unit.is_irreversible(),
        }
    }

    /// Whether every operation has an inverse.
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// A durable marker taken immediately before or after a unit's transaction.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique identifier.
    pub id: CheckpointId,
    /// Run that created it.
    pub run_id: String,
    /// Ordinal of the unit.
    pub unit_ordinal: u32,
    /// Stable name of the unit.
    pub unit_name: String,
    /// Checksum of the unit's statements.
    pub unit_checksum: String,
    /// Pre or post.
    pub phase: Phase,
    /// Creation time (microseconds since epoch).
    pub created_at: u64,
    /// Advisory statistics.
    pub stats: SchemaStats,
    /// Undo information for the unit.
    pub inverse: InverseScript,
}

impl Checkpoint {
    /// Serialize the checkpoint to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a checkpoint from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // sled values carry no alignment guarantee
        let mut aligned: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }

    /// Creation time as RFC 3339.
    pub fn created_at_rfc3339(&self) -> String {
        crate::time::to_rfc3339(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;

    #[test]
    fn test_checkpoint_id_parse_and_display() {
        assert_eq!("ckpt-42".parse::<CheckpointId>().unwrap(), CheckpointId(42));
        assert_eq!("42".parse::<CheckpointId>().unwrap(), CheckpointId(42));
        assert!("ckpt-x".parse::<CheckpointId>().is_err());
        assert_eq!(CheckpointId(9).to_string(), "ckpt-9");
        assert_eq!(
            CheckpointId::from_key(&CheckpointId(300).to_key()).unwrap(),
            CheckpointId(300)
        );
    }

    #[test]
    fn test_key_order_matches_id_order() {
        assert!(CheckpointId(2).to_key() < CheckpointId(256).to_key());
    }

    #[test]
    fn test_stats_collect() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY);
             CREATE INDEX idx_users ON users(id);
             INSERT INTO users VALUES (1), (2);",
        )
        .unwrap();

        let stats =
            SchemaStats::collect(&conn, &["users".to_string(), "missing".to_string()]).unwrap();
        assert_eq!(stats.count_of(ObjectKind::Table), 1);
        assert_eq!(stats.count_of(ObjectKind::Index), 1);
        assert_eq!(stats.count_of(ObjectKind::View), 0);
        assert_eq!(stats.rows_of("users"), Some(2));
        assert_eq!(stats.rows_of("missing"), None);
    }

    #[test]
    fn test_checkpoint_serialization() {
        let unit = MigrationUnit::new(1, "0001_users")
            .with_operation(Operation::create_table("users", "CREATE TABLE users (id INTEGER)"));
        let checkpoint = Checkpoint {
            id: CheckpointId(5),
            run_id: "run-1".to_string(),
            unit_ordinal: 1,
            unit_name: "0001_users".to_string(),
            unit_checksum: unit.checksum(),
            phase: Phase::Post,
            created_at: 1_700_000_000_000_000,
            stats: SchemaStats::default(),
            inverse: InverseScript::for_unit(&unit),
        };

        let bytes = checkpoint.to_bytes().unwrap();
        let restored = Checkpoint::from_bytes(&bytes).unwrap();
        assert_eq!(restored, checkpoint);
        assert!(restored.inverse.is_complete());
    }
}
