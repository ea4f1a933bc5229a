//! Durable checkpoint persistence on sled.
//!
//! The store lives outside the target database, so a `pre` checkpoint
//! survives even when the unit's transaction is aborted. Every write is
//! flushed before the caller proceeds.

use std::path::Path;

use rkyv::{Archive, Deserialize, Serialize};
use rusqlite::Connection;
use sled::{Db, Tree};

use super::{Checkpoint, CheckpointId, InverseScript, Phase, SchemaStats};
use crate::engine::run::MigrationRun;
use crate::error::{Error, Result};
use crate::time::current_timestamp;
use crate::unit::MigrationUnit;

/// Tree name for checkpoint records.
const CHECKPOINT_TREE: &str = "checkpoint:records";

/// Tree name for rolled-back markers.
const MARKER_TREE: &str = "checkpoint:rolled_back";

/// Tree name for run records.
const RUN_TREE: &str = "run:records";

/// Informational marker recorded when a checkpoint's unit is undone.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct RollbackMarker {
    /// When the undo transaction committed (microseconds since epoch).
    pub rolled_back_at: u64,
    /// Checkpoint the rollback targeted.
    pub target: CheckpointId,
}

impl RollbackMarker {
    fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // sled values carry no alignment guarantee
        let mut aligned: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Append-only checkpoint store.
pub struct CheckpointStore {
    db: Db,
    checkpoints: Tree,
    markers: Tree,
    runs: Tree,
}

impl CheckpointStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// Open a throwaway store that is deleted on drop.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    /// Use an already-open sled database.
    pub fn from_db(db: Db) -> Result<Self> {
        let checkpoints = db.open_tree(CHECKPOINT_TREE)?;
        let markers = db.open_tree(MARKER_TREE)?;
        let runs = db.open_tree(RUN_TREE)?;
        Ok(Self {
            db,
            checkpoints,
            markers,
            runs,
        })
    }

    /// Build a checkpoint for `unit` from the current database state.
    ///
    /// The identifier is reserved here; nothing is written until
    /// [`CheckpointStore::persist`].
    pub fn capture(
        &self,
        phase: Phase,
        unit: &MigrationUnit,
        run_id: &str,
        conn: &Connection,
    ) -> Result<Checkpoint> {
        let capture_error = |reason: String| Error::Capture {
            unit: unit.name().to_string(),
            phase: phase.to_string(),
            reason,
        };

        let stats = SchemaStats::collect(conn, &unit.touched_tables())
            .map_err(|e| capture_error(e.to_string()))?;
        let id = self
            .db
            .generate_id()
            .map_err(|e| capture_error(e.to_string()))?;

        Ok(Checkpoint {
            id: CheckpointId(id),
            run_id: run_id.to_string(),
            unit_ordinal: unit.ordinal(),
            unit_name: unit.name().to_string(),
            unit_checksum: unit.checksum(),
            phase,
            created_at: current_timestamp(),
            stats,
            inverse: InverseScript::for_unit(unit),
        })
    }

    /// Durably write a checkpoint. Existing checkpoints are never overwritten.
    pub fn persist(&self, checkpoint: &Checkpoint) -> Result<()> {
        let value = checkpoint.to_bytes()?;
        let swapped = self
            .checkpoints
            .compare_and_swap(checkpoint.id.to_key(), None as Option<&[u8]>, Some(value))?;
        if swapped.is_err() {
            return Err(Error::Capture {
                unit: checkpoint.unit_name.clone(),
                phase: checkpoint.phase.to_string(),
                reason: format!("checkpoint {} already exists", checkpoint.id),
            });
        }
        self.checkpoints.flush()?;

        tracing::debug!(
            checkpoint = %checkpoint.id,
            unit = %checkpoint.unit_name,
            phase = %checkpoint.phase,
            "checkpoint persisted"
        );
        Ok(())
    }

    /// Load a checkpoint by id.
    pub fn get(&self, id: CheckpointId) -> Result<Checkpoint> {
        match self.checkpoints.get(id.to_key())? {
            Some(bytes) => Checkpoint::from_bytes(&bytes),
            None => Err(Error::NotFound {
                kind: "checkpoint",
                id: id.to_string(),
            }),
        }
    }

    /// Checkpoints of one run, in creation order.
    pub fn list(&self, run_id: &str) -> Checkpoints {
        Checkpoints::new(self.checkpoints.clone(), None, Some(run_id.to_string()))
    }

    /// Every checkpoint, in creation order.
    pub fn all(&self) -> Checkpoints {
        Checkpoints::new(self.checkpoints.clone(), None, None)
    }

    /// Checkpoints created after `id`, in creation order.
    pub fn newer_than(&self, id: CheckpointId) -> Checkpoints {
        Checkpoints::new(self.checkpoints.clone(), Some(id), None)
    }

    /// The most recently created checkpoint.
    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        self.all().next_back().transpose()
    }

    /// The most recent `post` checkpoint.
    pub fn latest_post(&self) -> Result<Option<Checkpoint>> {
        for checkpoint in self.all().rev() {
            let checkpoint = checkpoint?;
            if checkpoint.phase == Phase::Post {
                return Ok(Some(checkpoint));
            }
        }
        Ok(None)
    }

    /// Record that the unit behind `id` has been undone.
    pub fn mark_rolled_back(&self, id: CheckpointId, target: CheckpointId) -> Result<()> {
        let marker = RollbackMarker {
            rolled_back_at: current_timestamp(),
            target,
        };
        self.markers.insert(id.to_key(), marker.to_bytes()?)?;
        self.markers.flush()?;
        Ok(())
    }

    /// Rollback marker for a checkpoint, if its unit was undone.
    pub fn rollback_marker(&self, id: CheckpointId) -> Result<Option<RollbackMarker>> {
        match self.markers.get(id.to_key())? {
            Some(bytes) => Ok(Some(RollbackMarker::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Whether the unit behind `id` was undone.
    pub fn is_rolled_back(&self, id: CheckpointId) -> Result<bool> {
        Ok(self.markers.contains_key(id.to_key())?)
    }

    /// Save (insert or replace) a run record.
    pub fn save_run(&self, run: &MigrationRun) -> Result<()> {
        self.runs.insert(run.id.as_bytes(), run.to_bytes()?)?;
        self.runs.flush()?;
        Ok(())
    }

    /// Load a run record.
    pub fn load_run(&self, run_id: &str) -> Result<MigrationRun> {
        match self.runs.get(run_id.as_bytes())? {
            Some(bytes) => MigrationRun::from_bytes(&bytes),
            None => Err(Error::NotFound {
                kind: "run",
                id: run_id.to_string(),
            }),
        }
    }

    /// All run records, oldest first.
    pub fn list_runs(&self) -> Result<Vec<MigrationRun>> {
        let mut runs = Vec::new();
        for entry in self.runs.iter() {
            let (_, value) = entry?;
            runs.push(MigrationRun::from_bytes(&value)?);
        }
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    /// Flush all trees to disk.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Lazy, finite iterator over checkpoints in creation order.
///
/// Iterating never mutates the store; [`Checkpoints::restart`] begins again
/// from the first matching checkpoint.
pub struct Checkpoints {
    tree: Tree,
    after: Option<CheckpointId>,
    run_id: Option<String>,
    inner: sled::Iter,
}

impl Checkpoints {
    fn new(tree: Tree, after: Option<CheckpointId>, run_id: Option<String>) -> Self {
        let inner = Self::scan(&tree, after);
        Self {
            tree,
            after,
            run_id,
            inner,
        }
    }

    fn scan(tree: &Tree, after: Option<CheckpointId>) -> sled::Iter {
        match after {
            Some(id) => match id.0.checked_add(1) {
                Some(next) => tree.range(CheckpointId(next).to_key()..),
                None => tree.range(CheckpointId(u64::MAX).to_key()..CheckpointId(u64::MAX).to_key()),
            },
            None => tree.iter(),
        }
    }

    /// Start again from the beginning of the sequence.
    pub fn restart(&mut self) {
        self.inner = Self::scan(&self.tree, self.after);
    }

    fn decode(&self, entry: sled::Result<(sled::IVec, sled::IVec)>) -> Option<Result<Checkpoint>> {
        let (_, value) = match entry {
            Ok(kv) => kv,
            Err(e) => return Some(Err(e.into())),
        };
        match Checkpoint::from_bytes(&value) {
            Ok(checkpoint) => match &self.run_id {
                Some(run_id) if &checkpoint.run_id != run_id => None,
                _ => Some(Ok(checkpoint)),
            },
            Err(e) => Some(Err(e)),
        }
    }
}

impl Iterator for Checkpoints {
    type Item = Result<Checkpoint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.inner.next()?;
            if let Some(item) = self.decode(entry) {
                return Some(item);
            }
        }
    }
}

impl DoubleEndedIterator for Checkpoints {
    fn next_back(&mut self) -> Option<Self::Item> {
        loop {
            let entry = self.inner.next_back()?;
            if let Some(item) = self.decode(entry) {
                return Some(item);
            }
        }
    }
}
