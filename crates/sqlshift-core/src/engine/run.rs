//! Run state: one top-to-bottom pass over the catalog.

use rkyv::{Archive, Deserialize, Serialize};

use crate::checkpoint::CheckpointId;
use crate::error::{Error, Result};
use crate::time::{current_timestamp, to_rfc3339};

/// Where a unit is in its per-run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Not yet started.
    Pending,
    /// Checking declared preconditions.
    Validating,
    /// Writing the pre or post checkpoint.
    Checkpointing,
    /// Forward transaction open.
    Applying,
    /// Transaction committed and post checkpoint persisted.
    Applied,
    /// Aborted; no effects persisted.
    Failed,
}

impl std::fmt::Display for UnitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitState::Pending => write!(f, "pending"),
            UnitState::Validating => write!(f, "validating"),
            UnitState::Checkpointing => write!(f, "checkpointing"),
            UnitState::Applying => write!(f, "applying"),
            UnitState::Applied => write!(f, "applied"),
            UnitState::Failed => write!(f, "failed"),
        }
    }
}

/// Recorded result of one unit within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum UnitStatus {
    /// Committed by this run.
    Applied,
    /// Already present in history; not executed.
    Skipped,
    /// Transaction aborted.
    Failed,
    /// Applied, then undone by a rollback.
    RolledBack,
    /// Would be applied (dry run).
    Planned,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Applied => write!(f, "applied"),
            UnitStatus::Skipped => write!(f, "skipped"),
            UnitStatus::Failed => write!(f, "failed"),
            UnitStatus::RolledBack => write!(f, "rolled-back"),
            UnitStatus::Planned => write!(f, "planned"),
        }
    }
}

/// Outcome of one unit.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct UnitOutcome {
    /// Unit ordinal.
    pub ordinal: u32,
    /// Unit name.
    pub name: String,
    /// Final status.
    pub status: UnitStatus,
    /// Pre checkpoint, if one was persisted.
    pub pre_checkpoint: Option<CheckpointId>,
    /// Post checkpoint, if the unit committed.
    pub post_checkpoint: Option<CheckpointId>,
    /// Wall time spent on the unit.
    pub duration_ms: u64,
    /// Failure or skip reason.
    pub message: Option<String>,
}

impl UnitOutcome {
    pub(crate) fn new(ordinal: u32, name: impl Into<String>, status: UnitStatus) -> Self {
        Self {
            ordinal,
            name: name.into(),
            status,
            pre_checkpoint: None,
            post_checkpoint: None,
            duration_ms: 0,
            message: None,
        }
    }
}

/// Terminal (or in-flight) status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum RunStatus {
    /// Units are being applied.
    Running,
    /// Every unit applied and integrity validated.
    Applied,
    /// Every unit applied but integrity validation reported findings.
    AppliedWithWarnings,
    /// Halted at a failing unit or failed strict validation.
    Failed,
    /// Halted at a unit boundary on operator request.
    Cancelled,
    /// Dry run finished; nothing was written.
    Planned,
}

impl RunStatus {
    /// Whether the run has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    /// Whether the run ended without a failure.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RunStatus::Applied | RunStatus::AppliedWithWarnings | RunStatus::Planned
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Running => write!(f, "running"),
            RunStatus::Applied => write!(f, "applied"),
            RunStatus::AppliedWithWarnings => write!(f, "applied-with-warnings"),
            RunStatus::Failed => write!(f, "failed"),
            RunStatus::Cancelled => write!(f, "cancelled"),
            RunStatus::Planned => write!(f, "planned"),
        }
    }
}

/// One complete attempt to apply the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct MigrationRun {
    /// Unique run identifier.
    pub id: String,
    /// Environment tag.
    pub environment: String,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Start time (microseconds since epoch).
    pub started_at: u64,
    /// End time, once terminal.
    pub finished_at: Option<u64>,
    /// Overall status.
    pub status: RunStatus,
    /// Outcomes in ordinal order.
    pub outcomes: Vec<UnitOutcome>,
    /// Non-fatal findings (validation warnings, integrity report entries).
    pub warnings: Vec<String>,
    /// Error that halted the run.
    pub error: Option<String>,
    /// Path of the emergency rollback script, if written.
    pub rollback_script: Option<String>,
}

impl MigrationRun {
    /// Start a new run.
    pub fn new(id: impl Into<String>, environment: impl Into<String>, dry_run: bool) -> Self {
        Self {
            id: id.into(),
            environment: environment.into(),
            dry_run,
            started_at: current_timestamp(),
            finished_at: None,
            status: RunStatus::Running,
            outcomes: Vec::new(),
            warnings: Vec::new(),
            error: None,
            rollback_script: None,
        }
    }

    /// Finish with the given status.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(current_timestamp());
    }

    /// Finish as failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.finish(RunStatus::Failed);
    }

    /// Outcome for a unit, by name.
    pub fn outcome(&self, name: &str) -> Option<&UnitOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    pub(crate) fn outcome_mut(&mut self, name: &str) -> Option<&mut UnitOutcome> {
        self.outcomes.iter_mut().find(|o| o.name == name)
    }

    /// Number of units with the given status.
    pub fn count(&self, status: UnitStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Most recent unit this run committed.
    pub fn last_applied(&self) -> Option<&UnitOutcome> {
        self.outcomes
            .iter()
            .rev()
            .find(|o| o.status == UnitStatus::Applied)
    }

    /// Most recent post checkpoint, the last known-good state.
    pub fn last_checkpoint(&self) -> Option<CheckpointId> {
        self.outcomes.iter().filter_map(|o| o.post_checkpoint).max()
    }

    /// Run duration in milliseconds, once finished.
    pub fn duration_ms(&self) -> Option<u64> {
        self.finished_at
            .map(|end| end.saturating_sub(self.started_at) / 1000)
    }

    /// Start time as RFC 3339.
    pub fn started_at_rfc3339(&self) -> String {
        to_rfc3339(self.started_at)
    }

    /// Serialize the run to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a run from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        // sled values carry no alignment guarantee
        let mut aligned: rkyv::util::AlignedVec<16> = rkyv::util::AlignedVec::new();
        aligned.extend_from_slice(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_lifecycle() {
        let mut run = MigrationRun::new("run-1", "test", false);
        assert_eq!(run.status, RunStatus::Running);
        assert!(!run.status.is_terminal());

        let mut first = UnitOutcome::new(1, "0001_users", UnitStatus::Applied);
        first.pre_checkpoint = Some(CheckpointId(1));
        first.post_checkpoint = Some(CheckpointId(2));
        let mut second = UnitOutcome::new(2, "0002_sessions", UnitStatus::Failed);
        second.pre_checkpoint = Some(CheckpointId(3));
        run.outcomes.push(first);
        run.outcomes.push(second);

        run.fail("boom");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.finished_at.is_some());
        assert_eq!(run.last_applied().unwrap().name, "0001_users");
        assert_eq!(run.last_checkpoint(), Some(CheckpointId(2)));
        assert_eq!(run.count(UnitStatus::Applied), 1);
    }

    #[test]
    fn test_run_serialization() {
        let mut run = MigrationRun::new("run-2", "production", true);
        run.outcomes
            .push(UnitOutcome::new(1, "0001_users", UnitStatus::Planned));
        run.warnings.push("orphaned row".to_string());
        run.finish(RunStatus::Planned);

        let restored = MigrationRun::from_bytes(&run.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, run);
        assert!(restored.status.is_success());
    }

    #[test]
    fn test_run_decodes_from_unaligned_bytes() {
        let mut run = MigrationRun::new("run-3", "staging", false);
        run.outcomes
            .push(UnitOutcome::new(1, "0001_users", UnitStatus::Applied));
        let bytes = run.to_bytes().unwrap();

        let mut shifted = vec![0u8];
        shifted.extend_from_slice(&bytes);
        assert_eq!(MigrationRun::from_bytes(&shifted[1..]).unwrap(), run);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(
            RunStatus::AppliedWithWarnings.to_string(),
            "applied-with-warnings"
        );
        assert_eq!(UnitStatus::RolledBack.to_string(), "rolled-back");
    }
}
