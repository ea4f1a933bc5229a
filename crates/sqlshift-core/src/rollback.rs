//! Rollback planning and execution.
//!
//! A plan walks post checkpoints newer than the target in descending order
//! and pairs each with the inverse script captured when the unit ran. A unit
//! that committed but never got its post checkpoint is planned from its pre
//! checkpoint once the history table confirms it was applied. Every refusal
//! (irreversible unit, missing inverse) is decided while planning, before
//! anything is executed.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Instant;

use rusqlite::{Connection, OpenFlags};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointStore, Phase};
use crate::config::EngineConfig;
use crate::engine::history::{self, HistoryEntry};
use crate::engine::run::UnitStatus;
use crate::engine::{RunContext, RunLock};
use crate::error::{Error, Result};
use crate::events::{EventKind, EventRecord};

/// What to do with one unit newer than the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Execute the inverse script.
    Undo,
    /// Leave in place; the unit is irreversible and the operator overrode.
    PassOver,
}

/// One unit to reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackStep {
    /// Checkpoint carrying the unit's inverse: its post checkpoint, or its
    /// pre checkpoint when the post capture never happened.
    pub checkpoint: Checkpoint,
    /// Planned action.
    pub action: StepAction,
}

/// Ordered (newest first) list of units to reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackPlan {
    /// Checkpoint the database is rolled back to.
    pub target: Checkpoint,
    /// Steps in execution order.
    pub steps: Vec<RollbackStep>,
}

impl RollbackPlan {
    /// Build the plan for rolling back to `target` from checkpoints alone.
    ///
    /// Fails with [`Error::Irreversible`] if a newer unit is flagged
    /// irreversible and `allow_irreversible` is false, and with
    /// [`Error::Plan`] if a newer unit lacks inverse operations.
    pub fn build(
        store: &CheckpointStore,
        target: CheckpointId,
        allow_irreversible: bool,
    ) -> Result<Self> {
        Self::plan(store, target, allow_irreversible, &BTreeMap::new())
    }

    /// Build the plan, also covering units the database's history table
    /// records as applied whose post checkpoint is missing.
    pub fn build_with_history(
        store: &CheckpointStore,
        conn: &Connection,
        target: CheckpointId,
        allow_irreversible: bool,
    ) -> Result<Self> {
        let applied = history::applied(conn)?;
        Self::plan(store, target, allow_irreversible, &applied)
    }

    /// Build the plan for the configured database without modifying it.
    pub fn for_config(
        config: &EngineConfig,
        target: CheckpointId,
        allow_irreversible: bool,
    ) -> Result<Self> {
        let store = CheckpointStore::open(config.checkpoint_path())?;
        if !config.database_path.exists() {
            return Self::build(&store, target, allow_irreversible);
        }
        let conn =
            Connection::open_with_flags(&config.database_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        Self::build_with_history(&store, &conn, target, allow_irreversible)
    }

    fn plan(
        store: &CheckpointStore,
        target: CheckpointId,
        allow_irreversible: bool,
        applied: &BTreeMap<String, HistoryEntry>,
    ) -> Result<Self> {
        let target = store.get(target)?;
        let mut seen = HashSet::new();
        let mut steps = Vec::new();

        // A pre checkpoint target still names a state before its own unit.
        let own = (target.phase == Phase::Pre).then(|| Ok::<_, Error>(target.clone()));
        for checkpoint in store.newer_than(target.id).rev().chain(own) {
            let checkpoint = checkpoint?;
            if store.is_rolled_back(checkpoint.id)? {
                continue;
            }
            if checkpoint.phase == Phase::Pre {
                // Committed, but the post capture failed.
                let committed = applied
                    .get(&checkpoint.unit_name)
                    .is_some_and(|entry| entry.run_id == checkpoint.run_id);
                if !committed || seen.contains(&checkpoint.unit_name) {
                    continue;
                }
                tracing::warn!(
                    unit = %checkpoint.unit_name,
                    checkpoint = %checkpoint.id,
                    "no post checkpoint for applied unit, planning from its pre checkpoint"
                );
            }
            if !seen.insert(checkpoint.unit_name.clone()) {
                continue;
            }

            let action = if checkpoint.inverse.irreversible {
                if !allow_irreversible {
                    return Err(Error::Irreversible {
                        unit: checkpoint.unit_name.clone(),
                        checkpoint: checkpoint.id,
                    });
                }
                StepAction::PassOver
            } else if !checkpoint.inverse.is_complete() {
                return Err(Error::plan(format!(
                    "unit {} has no inverse for: {}",
                    checkpoint.unit_name,
                    checkpoint.inverse.missing.join(", ")
                )));
            } else {
                StepAction::Undo
            };

            steps.push(RollbackStep { checkpoint, action });
        }

        Ok(Self { target, steps })
    }

    /// Whether there is nothing to undo.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Units that will be undone, newest first.
    pub fn undo_units(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.action == StepAction::Undo)
            .map(|s| s.checkpoint.unit_name.as_str())
            .collect()
    }

    /// Render the plan as a standalone SQL script.
    pub fn render_script(&self) -> String {
        let mut script = format!(
            "-- sqlshift rollback to {} ({} {} of {})\n",
            self.target.id, self.target.phase, self.target.unit_name, self.target.created_at_rfc3339()
        );
        for step in &self.steps {
            script.push('\n');
            match step.action {
                StepAction::Undo => script.push_str(&unit_script(&step.checkpoint)),
                StepAction::PassOver => script.push_str(&format!(
                    "-- {} is irreversible and is left in place\n",
                    step.checkpoint.unit_name
                )),
            }
        }
        script
    }
}

/// A unit reversed by a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoneUnit {
    /// Unit ordinal.
    pub ordinal: u32,
    /// Unit name.
    pub name: String,
    /// Post checkpoint that was undone.
    pub checkpoint: CheckpointId,
    /// Inverse statements executed.
    pub statements: usize,
}

/// Result of a rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    /// Rollback identifier.
    pub id: String,
    /// Target checkpoint.
    pub target: CheckpointId,
    /// Units reversed, newest first.
    pub undone: Vec<UndoneUnit>,
    /// Irreversible units left in place under override.
    pub passed_over: Vec<String>,
    /// Wall time.
    pub duration_ms: u64,
}

/// Roll the database back to `target`.
///
/// Each undone unit gets its own transaction, which also removes the unit's
/// history row. Undone checkpoints are marked rolled back and never deleted.
pub fn rollback(
    ctx: &mut RunContext,
    target: CheckpointId,
    allow_irreversible: bool,
) -> Result<RollbackOutcome> {
    let plan =
        RollbackPlan::build_with_history(&ctx.store, &ctx.conn, target, allow_irreversible)?;
    let id = Uuid::now_v7().to_string();

    let holder = ctx.lock_holder(&id);
    let lock = RunLock::acquire(&mut ctx.conn, holder)?;
    let result = execute(ctx, &plan, id);
    let released = lock.release(&ctx.conn);

    let outcome = result?;
    released?;
    Ok(outcome)
}

fn execute(ctx: &mut RunContext, plan: &RollbackPlan, id: String) -> Result<RollbackOutcome> {
    let started = Instant::now();
    tracing::info!(
        rollback_id = %id,
        target = %plan.target.id,
        steps = plan.steps.len(),
        "rollback started"
    );
    ctx.emit(
        EventRecord::new(&id, EventKind::RollbackStart)
            .outcome(format!("target {}", plan.target.id)),
    );

    let mut outcome = RollbackOutcome {
        id,
        target: plan.target.id,
        undone: Vec::new(),
        passed_over: Vec::new(),
        duration_ms: 0,
    };

    for step in &plan.steps {
        let checkpoint = &step.checkpoint;
        if step.action == StepAction::PassOver {
            tracing::warn!(unit = %checkpoint.unit_name, "irreversible unit left in place");
            outcome.passed_over.push(checkpoint.unit_name.clone());
            continue;
        }

        let unit_started = Instant::now();
        if let Err(e) = undo_in_transaction(&mut ctx.conn, checkpoint) {
            let err = Error::Rollback {
                unit: checkpoint.unit_name.clone(),
                message: e.to_string(),
                undone: outcome.undone.iter().map(|u| u.name.clone()).collect(),
            };
            ctx.emit(
                EventRecord::new(&outcome.id, EventKind::RollbackEnd)
                    .duration_ms(started.elapsed().as_millis() as u64)
                    .outcome(err.to_string()),
            );
            return Err(err);
        }

        mark_undone(&ctx.store, checkpoint, plan.target.id)?;

        let elapsed = unit_started.elapsed().as_millis() as u64;
        ctx.emit(
            EventRecord::new(&outcome.id, EventKind::UnitEnd)
                .unit(&checkpoint.unit_name)
                .duration_ms(elapsed)
                .outcome(UnitStatus::RolledBack.to_string()),
        );
        tracing::info!(unit = %checkpoint.unit_name, checkpoint = %checkpoint.id, "unit rolled back");

        outcome.undone.push(UndoneUnit {
            ordinal: checkpoint.unit_ordinal,
            name: checkpoint.unit_name.clone(),
            checkpoint: checkpoint.id,
            statements: checkpoint.inverse.statements.len(),
        });
    }

    outcome.duration_ms = started.elapsed().as_millis() as u64;
    ctx.emit(
        EventRecord::new(&outcome.id, EventKind::RollbackEnd)
            .duration_ms(outcome.duration_ms)
            .outcome(format!("{} unit(s) undone", outcome.undone.len())),
    );
    tracing::info!(
        target = %outcome.target,
        undone = outcome.undone.len(),
        passed_over = outcome.passed_over.len(),
        duration_ms = outcome.duration_ms,
        "rollback finished"
    );
    Ok(outcome)
}

fn undo_in_transaction(conn: &mut Connection, checkpoint: &Checkpoint) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for statement in &checkpoint.inverse.statements {
        tracing::debug!(unit = %checkpoint.unit_name, statement = %statement, "executing inverse");
        tx.execute_batch(statement)?;
    }
    history::remove(&tx, &checkpoint.unit_name)?;
    tx.commit()
}

/// Mark the unit's checkpoints rolled back and update the run that applied it.
///
/// `post` is the planned checkpoint; a pre checkpoint has no earlier pair.
fn mark_undone(store: &CheckpointStore, post: &Checkpoint, target: CheckpointId) -> Result<()> {
    store.mark_rolled_back(post.id, target)?;

    let mut pre = None;
    for checkpoint in store.list(&post.run_id) {
        let checkpoint = checkpoint?;
        if checkpoint.unit_name == post.unit_name
            && checkpoint.phase == Phase::Pre
            && checkpoint.id < post.id
        {
            pre = Some(checkpoint.id);
        }
    }
    if let Some(pre) = pre {
        store.mark_rolled_back(pre, target)?;
    }

    match store.load_run(&post.run_id) {
        Ok(mut run) => {
            if let Some(outcome) = run.outcome_mut(&post.unit_name) {
                outcome.status = UnitStatus::RolledBack;
            }
            store.save_run(&run)
        }
        Err(Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Standalone script that undoes the unit behind `checkpoint`.
pub fn unit_script(checkpoint: &Checkpoint) -> String {
    let mut script = format!(
        "-- undo {} (#{}), {} captured {}\n",
        checkpoint.unit_name,
        checkpoint.unit_ordinal,
        checkpoint.id,
        checkpoint.created_at_rfc3339()
    );
    if checkpoint.inverse.irreversible {
        script.push_str("-- unit is flagged irreversible; this script cannot fully restore it\n");
    }
    for missing in &checkpoint.inverse.missing {
        script.push_str(&format!("-- no inverse for: {}\n", missing));
    }
    script.push_str("BEGIN;\n");
    for statement in &checkpoint.inverse.statements {
        script.push_str(statement.trim_end().trim_end_matches(';'));
        script.push_str(";\n");
    }
    script.push_str(&history::remove_statement(&checkpoint.unit_name));
    script.push_str(";\nCOMMIT;\n");
    script
}

/// Write the emergency rollback artifact for `checkpoint` into `dir`.
pub fn write_emergency_script(dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("rollback-{}.sql", checkpoint.id));
    let script = format!(
        "-- sqlshift emergency rollback script\n-- run {}\n\n{}",
        checkpoint.run_id,
        unit_script(checkpoint)
    );
    std::fs::write(&path, script)?;
    Ok(path)
}
