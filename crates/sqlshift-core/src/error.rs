//! Engine error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::checkpoint::CheckpointId;

/// Broad class of an error, used to pick a process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Catalog, ordering, or integrity validation failed.
    Validation,
    /// A unit could not be applied.
    Execution,
    /// A rollback could not be planned or executed.
    Rollback,
    /// The run could not start (lock held, store unavailable).
    Precondition,
}

/// Errors produced by the migration engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A migration source is unreadable or malformed.
    #[error("failed to load {}: {reason}", path.display())]
    Load {
        /// File or directory that failed.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The dependency graph is cyclic or names an undeclared object.
    #[error("dependency error in unit {unit}: {reason}")]
    Dependency {
        /// Unit whose declarations are at fault.
        unit: String,
        /// Description of the problem.
        reason: String,
    },

    /// A unit depends on an object created by a later unit.
    #[error(
        "order error: unit {unit} (#{ordinal}) requires '{object}' created by later unit {provider} (#{provider_ordinal})"
    )]
    Order {
        /// Dependent unit.
        unit: String,
        /// Ordinal of the dependent unit.
        ordinal: u32,
        /// Object named in the dependency.
        object: String,
        /// Unit that creates the object.
        provider: String,
        /// Ordinal of the creating unit.
        provider_ordinal: u32,
    },

    /// Checkpoint statistics collection failed.
    #[error("failed to capture {phase} checkpoint for unit {unit}: {reason}")]
    Capture {
        /// Unit being checkpointed.
        unit: String,
        /// Checkpoint phase.
        phase: String,
        /// Underlying failure.
        reason: String,
    },

    /// A unit's forward transaction failed and was aborted.
    #[error(
        "unit {unit} failed: {message} (last applied unit: {}, last checkpoint: {})",
        last_applied.as_deref().unwrap_or("none"),
        last_checkpoint.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
    )]
    Transaction {
        /// Unit whose transaction failed.
        unit: String,
        /// Database error text.
        message: String,
        /// Most recent unit that committed before the failure.
        last_applied: Option<String>,
        /// Most recent checkpoint persisted before the failure.
        last_checkpoint: Option<CheckpointId>,
    },

    /// Validation findings that are fatal in the current mode.
    #[error("validation failed: {}", findings.join("; "))]
    Validation {
        /// Individual findings.
        findings: Vec<String>,
    },

    /// Rollback would cross a checkpoint flagged irreversible.
    #[error("cannot roll back past irreversible unit {unit} (checkpoint {checkpoint})")]
    Irreversible {
        /// Irreversible unit.
        unit: String,
        /// Its post checkpoint.
        checkpoint: CheckpointId,
    },

    /// A rollback plan could not be built or executed.
    #[error("rollback plan error: {reason}")]
    Plan {
        /// Why the plan is unusable.
        reason: String,
    },

    /// An undo transaction failed and was aborted.
    #[error("rollback of unit {unit} failed: {message} ({} unit(s) already undone)", undone.len())]
    Rollback {
        /// Unit whose undo transaction failed.
        unit: String,
        /// Database error text.
        message: String,
        /// Units undone before the failure, newest first.
        undone: Vec<String>,
    },

    /// Another orchestrator holds the run lock.
    #[error("database is locked by {holder} since {acquired_at}")]
    Lock {
        /// Identity of the lock holder.
        holder: String,
        /// When the lock was acquired (RFC 3339).
        acquired_at: String,
    },

    /// A checkpoint or run was not found.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Kind of record.
        kind: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// The run was cancelled at a unit boundary.
    #[error("run cancelled after unit {}", after.as_deref().unwrap_or("none"))]
    Cancelled {
        /// Last unit completed before cancellation.
        after: Option<String>,
    },

    /// Checkpoint store error.
    #[error("checkpoint store error: {0}")]
    Store(#[from] sled::Error),

    /// Target database error outside a unit transaction.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify the error for exit status reporting.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Load { .. }
            | Error::Dependency { .. }
            | Error::Order { .. }
            | Error::Validation { .. } => ErrorClass::Validation,
            Error::Capture { .. } | Error::Transaction { .. } | Error::Cancelled { .. } => {
                ErrorClass::Execution
            }
            Error::Irreversible { .. } | Error::Plan { .. } | Error::Rollback { .. } => {
                ErrorClass::Rollback
            }
            Error::Lock { .. }
            | Error::NotFound { .. }
            | Error::Store(_)
            | Error::Database(_)
            | Error::Serialization(_)
            | Error::Deserialization(_)
            | Error::Io(_) => ErrorClass::Precondition,
        }
    }

    pub(crate) fn load(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Load {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn plan(reason: impl Into<String>) -> Self {
        Error::Plan {
            reason: reason.into(),
        }
    }
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
