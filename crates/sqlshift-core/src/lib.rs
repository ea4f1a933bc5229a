//! sqlshift core - checkpointed schema migrations for SQLite.
//!
//! This crate applies an ordered catalog of migration units to a database,
//! one transaction per unit, and keeps enough checkpoint state to roll any
//! prefix of the work back.
//!
//! | Component | Module |
//! |-----------|--------|
//! | Migration catalog | [`catalog`] |
//! | Checkpoint store | [`checkpoint`] |
//! | Execution engine | [`engine`] |
//! | Integrity validator | [`integrity`] |
//! | Rollback engine | [`rollback`] |
//!
//! # Example
//!
//! ```ignore
//! use sqlshift_core::{run, Catalog, EngineConfig, RunContext, RunOptions};
//!
//! let catalog = Catalog::load("migrations")?;
//! let mut ctx = RunContext::open(EngineConfig::default())?;
//! let report = run(&catalog, &mut ctx, &RunOptions::new())?;
//! println!("run {} finished: {}", report.run.id, report.run.status);
//! ```

pub mod catalog;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod integrity;
pub mod operation;
pub mod rollback;
pub mod sql;
pub mod time;
pub mod unit;

pub use catalog::{Catalog, DependencyGraph};
pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointStore, Checkpoints, InverseScript, Phase, RollbackMarker,
    SchemaStats,
};
pub use config::{EngineConfig, Environment};
pub use engine::{
    run, HistoryEntry, LockInfo, MigrationRun, RunContext, RunLock, RunOptions, RunReport,
    RunStatus, UnitOutcome, UnitState, UnitStatus,
};
pub use error::{Error, ErrorClass, Result};
pub use events::{EventKind, EventRecord, EventSink, MemorySink, TracingSink};
pub use integrity::{Finding, FindingKind, ValidationReport};
pub use operation::{Operation, OperationKind};
pub use rollback::{rollback, RollbackOutcome, RollbackPlan, RollbackStep, StepAction, UndoneUnit};
pub use sql::ObjectKind;
pub use unit::MigrationUnit;
