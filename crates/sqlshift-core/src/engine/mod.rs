//! Execution engine.
//!
//! Applies catalog units strictly in ordinal order. Each unit moves through
//! `Pending -> Validating -> Checkpointing(pre) -> Applying ->
//! Checkpointing(post) -> Applied`; any error moves it to `Failed` and halts
//! the run. A unit's statements and its history row share one transaction,
//! and no two units share a transaction.

pub mod history;
pub mod lock;
pub mod run;
pub mod watchdog;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rusqlite::{Connection, OpenFlags};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointStore, Phase};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{EventKind, EventRecord, EventSink, TracingSink};
use crate::integrity::{self, ValidationReport};
use crate::operation::OperationKind;
use crate::rollback;
use crate::sql::{self, object_key};
use crate::unit::MigrationUnit;

pub use history::HistoryEntry;
pub use lock::{LockInfo, RunLock};
pub use run::{MigrationRun, RunStatus, UnitOutcome, UnitState, UnitStatus};

/// Options recognized by [`run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Validate and log intended operations without writing anything.
    pub dry_run: bool,
    /// Bypass the post-run integrity pass.
    pub skip_validation: bool,
    /// Continue past validation warnings. Never continues past a failed
    /// transaction.
    pub force: bool,
    /// Fail the run on any integrity finding.
    pub strict: bool,
}

impl RunOptions {
    /// Default options: real run, integrity validated, warnings fatal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable dry-run mode.
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    /// Skip integrity validation.
    pub fn skip_validation(mut self) -> Self {
        self.skip_validation = true;
        self
    }

    /// Continue past validation warnings.
    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Treat integrity findings as fatal.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

/// The explicit context for one run or rollback.
///
/// Owns the only connection to the target database and hands it to the
/// checkpoint, integrity, and rollback components as a borrowed capability.
pub struct RunContext {
    pub(crate) conn: Connection,
    pub(crate) store: CheckpointStore,
    pub(crate) config: EngineConfig,
    sink: Box<dyn EventSink>,
    cancel: Arc<AtomicBool>,
}

impl RunContext {
    /// Open the configured database and checkpoint store.
    pub fn open(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.state_dir)?;
        let conn = Connection::open(&config.database_path)?;
        let store = CheckpointStore::open(config.checkpoint_path())?;
        tracing::debug!(
            database = %config.database_path.display(),
            state_dir = %config.state_dir.display(),
            "run context opened"
        );
        Self::new(conn, store, config)
    }

    /// Open the configured database read-only, for dry runs.
    ///
    /// A database file that does not exist yet is simulated as empty.
    pub fn open_read_only(config: EngineConfig) -> Result<Self> {
        let conn = if config.database_path.exists() {
            Connection::open_with_flags(&config.database_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?
        } else {
            tracing::info!(
                database = %config.database_path.display(),
                "database does not exist yet, planning against an empty schema"
            );
            Connection::open_in_memory()?
        };
        let store = CheckpointStore::temporary()?;
        Self::new(conn, store, config)
    }

    /// Build a context from an existing connection and store.
    pub fn new(conn: Connection, store: CheckpointStore, config: EngineConfig) -> Result<Self> {
        conn.busy_timeout(config.busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", config.foreign_keys)?;
        Ok(Self {
            conn,
            store,
            config,
            sink: Box::new(TracingSink),
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Replace the event sink.
    pub fn with_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    /// The target database connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The checkpoint store.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Flag that requests cancellation at the next unit boundary.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Request cancellation at the next unit boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, record: EventRecord) {
        self.sink.emit(record);
    }

    pub(crate) fn lock_holder(&self, id: &str) -> String {
        format!("pid {} ({})", std::process::id(), id)
    }
}

/// Result of [`run`]: the run record plus the error that halted it, if any.
#[derive(Debug)]
pub struct RunReport {
    /// The run as persisted.
    pub run: MigrationRun,
    /// Integrity report, if the pass ran.
    pub integrity: Option<ValidationReport>,
    /// Error that halted the run.
    pub error: Option<Error>,
    /// Last unit known applied when the run halted.
    pub last_applied: Option<String>,
    /// Newest post checkpoint when the run halted; the rollback target for
    /// everything the run committed.
    pub last_checkpoint: Option<CheckpointId>,
}

impl RunReport {
    /// Whether the run ended without an error.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The run, or the error that halted it.
    pub fn into_result(self) -> Result<MigrationRun> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.run),
        }
    }
}

/// Apply `catalog` to the context's database.
///
/// Structural validation and lock acquisition happen before any unit runs;
/// their failures are returned as `Err`. Once units start, the outcome is
/// always a [`RunReport`] whose `error` names what halted the run.
pub fn run(catalog: &Catalog, ctx: &mut RunContext, options: &RunOptions) -> Result<RunReport> {
    catalog.validate(&ctx.config.existing_objects)?;

    let run_id = Uuid::now_v7().to_string();
    let lock = if options.dry_run {
        RunLock::ensure_free(&ctx.conn)?;
        None
    } else {
        let holder = ctx.lock_holder(&run_id);
        Some(RunLock::acquire(&mut ctx.conn, holder)?)
    };

    let environment = ctx.config.environment.to_string();
    let mut executor = Executor {
        ctx: &mut *ctx,
        options,
        run: MigrationRun::new(run_id, environment, options.dry_run),
        integrity: None,
        previously_applied: None,
    };
    let result = executor.execute(catalog);
    let (last_applied, last_checkpoint) = match &result {
        Ok(()) => (None, None),
        Err(_) => executor.halt_context(),
    };
    let Executor { run, integrity, .. } = executor;

    if let Some(lock) = lock {
        if let Err(e) = lock.release(&ctx.conn) {
            tracing::error!(error = %e, "failed to release run lock");
        }
    }

    Ok(RunReport {
        run,
        integrity,
        error: result.err(),
        last_applied,
        last_checkpoint,
    })
}

struct Executor<'a> {
    ctx: &'a mut RunContext,
    options: &'a RunOptions,
    run: MigrationRun,
    integrity: Option<ValidationReport>,
    previously_applied: Option<String>,
}

impl Executor<'_> {
    fn execute(&mut self, catalog: &Catalog) -> Result<()> {
        let started = Instant::now();
        tracing::info!(
            run_id = %self.run.id,
            environment = %self.run.environment,
            units = catalog.len(),
            dry_run = self.options.dry_run,
            "migration run started"
        );
        self.ctx.emit(
            EventRecord::new(&self.run.id, EventKind::RunStart)
                .outcome(if self.options.dry_run { "dry-run" } else { "run" }),
        );

        let result = self.stages(catalog);

        match &result {
            Ok(()) if self.options.dry_run => self.run.finish(RunStatus::Planned),
            Ok(()) => {
                self.write_rollback_script();
                if self.run.warnings.is_empty() {
                    self.run.finish(RunStatus::Applied);
                } else {
                    self.run.finish(RunStatus::AppliedWithWarnings);
                }
            }
            Err(Error::Cancelled { .. }) => {
                self.run.error = result.as_ref().err().map(|e| e.to_string());
                self.run.finish(RunStatus::Cancelled);
            }
            Err(e) => self.run.fail(e.to_string()),
        }

        let saved = self.save();
        let elapsed = started.elapsed().as_millis() as u64;
        self.ctx.emit(
            EventRecord::new(&self.run.id, EventKind::RunEnd)
                .duration_ms(elapsed)
                .outcome(self.run.status.to_string()),
        );

        match &result {
            Ok(()) => tracing::info!(
                run_id = %self.run.id,
                status = %self.run.status,
                applied = self.run.count(UnitStatus::Applied),
                skipped = self.run.count(UnitStatus::Skipped),
                warnings = self.run.warnings.len(),
                duration_ms = elapsed,
                "migration run finished"
            ),
            Err(e) => tracing::error!(
                run_id = %self.run.id,
                status = %self.run.status,
                error = %e,
                "migration run halted"
            ),
        }

        result.and(saved)
    }

    fn stages(&mut self, catalog: &Catalog) -> Result<()> {
        if !self.options.dry_run {
            history::ensure_table(&self.ctx.conn)?;
        }
        self.save()?;
        self.apply_all(catalog)?;
        self.validate_integrity(catalog)
    }

    fn save(&self) -> Result<()> {
        if self.options.dry_run {
            return Ok(());
        }
        self.ctx.store.save_run(&self.run)
    }

    fn apply_all(&mut self, catalog: &Catalog) -> Result<()> {
        let applied = history::applied(&self.ctx.conn)?;
        self.previously_applied = applied
            .values()
            .max_by_key(|e| e.ordinal)
            .map(|e| e.name.clone());

        // Simulated schema: live objects, advanced by each unit's declarations.
        let mut schema: BTreeSet<String> =
            sql::schema_objects(&self.ctx.conn)?.into_keys().collect();

        for unit in catalog.units() {
            if self.ctx.is_cancelled() {
                let after = self.run.outcomes.last().map(|o| o.name.clone());
                tracing::warn!(after = ?after, "cancellation requested, halting at unit boundary");
                return Err(Error::Cancelled { after });
            }

            match applied.get(unit.name()) {
                Some(entry) => self.skip(unit, entry)?,
                None => self.apply_unit(unit, &mut schema)?,
            }
        }
        Ok(())
    }

    fn skip(&mut self, unit: &MigrationUnit, entry: &HistoryEntry) -> Result<()> {
        let mut outcome = UnitOutcome::new(unit.ordinal(), unit.name(), UnitStatus::Skipped);
        outcome.message = Some(format!(
            "applied at {} by run {}",
            entry.applied_at, entry.run_id
        ));
        self.run.outcomes.push(outcome);
        tracing::debug!(unit = %unit.name(), "already applied, skipping");

        let current = unit.checksum();
        if entry.checksum != current {
            let finding = format!(
                "unit {} changed since it was applied (checksum {} is now {})",
                unit.name(),
                short(&entry.checksum),
                short(&current)
            );
            self.check_findings(unit, vec![finding])?;
        }
        Ok(())
    }

    fn apply_unit(&mut self, unit: &MigrationUnit, schema: &mut BTreeSet<String>) -> Result<()> {
        let started = Instant::now();
        transition(unit, UnitState::Pending);
        self.ctx
            .emit(EventRecord::new(&self.run.id, EventKind::UnitStart).unit(unit.name()));

        let mut outcome = UnitOutcome::new(unit.ordinal(), unit.name(), UnitStatus::Failed);
        let result = self.drive(unit, schema, &mut outcome);
        outcome.duration_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = &result {
            transition(unit, UnitState::Failed);
            outcome.message = Some(e.to_string());
        }

        self.ctx.emit(
            EventRecord::new(&self.run.id, EventKind::UnitEnd)
                .unit(unit.name())
                .duration_ms(outcome.duration_ms)
                .outcome(outcome.status.to_string()),
        );
        tracing::info!(
            unit = %unit.name(),
            status = %outcome.status,
            duration_ms = outcome.duration_ms,
            "unit finished"
        );
        self.run.outcomes.push(outcome);

        let saved = self.save();
        result.and(saved)
    }

    fn drive(
        &mut self,
        unit: &MigrationUnit,
        schema: &mut BTreeSet<String>,
        outcome: &mut UnitOutcome,
    ) -> Result<()> {
        transition(unit, UnitState::Validating);
        let findings = precondition_findings(unit, schema);
        self.check_findings(unit, findings)?;

        if self.options.dry_run {
            for op in unit.operations() {
                tracing::info!(unit = %unit.name(), operation = %op.describe(), "would apply");
            }
            simulate(unit, schema);
            outcome.status = UnitStatus::Planned;
            return Ok(());
        }

        transition(unit, UnitState::Checkpointing);
        let pre = self.checkpoint(Phase::Pre, unit)?;
        outcome.pre_checkpoint = Some(pre.id);

        transition(unit, UnitState::Applying);
        if let Err(message) = self.apply_transaction(unit) {
            let (last_applied, last_checkpoint) = self.halt_context();
            return Err(Error::Transaction {
                unit: unit.name().to_string(),
                message,
                last_applied,
                last_checkpoint,
            });
        }
        outcome.status = UnitStatus::Applied;
        simulate(unit, schema);

        transition(unit, UnitState::Checkpointing);
        let post = self.checkpoint(Phase::Post, unit)?;
        outcome.post_checkpoint = Some(post.id);

        transition(unit, UnitState::Applied);
        Ok(())
    }

    /// Last applied unit and newest post checkpoint, for reporting a halt.
    fn halt_context(&self) -> (Option<String>, Option<CheckpointId>) {
        let last_applied = self
            .run
            .last_applied()
            .map(|o| o.name.clone())
            .or_else(|| self.previously_applied.clone());
        let last_checkpoint = match self.run.last_checkpoint() {
            Some(id) => Some(id),
            None => match self.ctx.store.latest_post() {
                Ok(latest) => latest.map(|c| c.id),
                Err(e) => {
                    tracing::warn!(error = %e, "could not read the latest checkpoint");
                    None
                }
            },
        };
        (last_applied, last_checkpoint)
    }

    fn check_findings(&mut self, unit: &MigrationUnit, findings: Vec<String>) -> Result<()> {
        if findings.is_empty() {
            return Ok(());
        }
        self.ctx.emit(
            EventRecord::new(&self.run.id, EventKind::ValidationResult)
                .unit(unit.name())
                .outcome(findings.join("; ")),
        );

        if !self.options.force {
            return Err(Error::Validation { findings });
        }
        for finding in &findings {
            tracing::warn!(unit = %unit.name(), finding = %finding, "validation warning ignored (force)");
        }
        self.run.warnings.extend(findings);
        Ok(())
    }

    fn checkpoint(&self, phase: Phase, unit: &MigrationUnit) -> Result<Checkpoint> {
        let checkpoint = self
            .ctx
            .store
            .capture(phase, unit, &self.run.id, &self.ctx.conn)?;
        self.ctx.store.persist(&checkpoint)?;
        self.ctx.emit(
            EventRecord::new(&self.run.id, EventKind::CheckpointCreated)
                .unit(unit.name())
                .outcome(format!("{} {}", checkpoint.id, phase)),
        );
        Ok(checkpoint)
    }

    /// Run the unit's statements and history row in one transaction.
    fn apply_transaction(&mut self, unit: &MigrationUnit) -> std::result::Result<(), String> {
        let watchdog = self.ctx.config.statement_timeout.map(|timeout| {
            (
                watchdog::Watchdog::arm(self.ctx.conn.get_interrupt_handle(), timeout),
                timeout,
            )
        });

        let result = apply_in_transaction(&mut self.ctx.conn, unit, &self.run.id);

        let timed_out = watchdog.and_then(|(w, timeout)| w.disarm().then_some(timeout));
        match (result, timed_out) {
            (Ok(()), _) => Ok(()),
            (Err(message), Some(timeout)) => Err(format!(
                "statement timeout of {} ms exceeded: {}",
                timeout.as_millis(),
                message
            )),
            (Err(message), None) => Err(message),
        }
    }

    fn validate_integrity(&mut self, catalog: &Catalog) -> Result<()> {
        if self.options.dry_run {
            tracing::debug!("dry run, integrity pass not applicable");
            return Ok(());
        }
        if self.options.skip_validation {
            tracing::warn!("integrity validation skipped");
            return Ok(());
        }

        let expected = expected_objects(catalog, &self.run);
        let report = integrity::check(&self.ctx.conn, &expected)?;
        let messages = report.messages();
        self.ctx.emit(
            EventRecord::new(&self.run.id, EventKind::ValidationResult).outcome(
                if messages.is_empty() {
                    "clean".to_string()
                } else {
                    messages.join("; ")
                },
            ),
        );
        self.integrity = Some(report);

        if messages.is_empty() {
            return Ok(());
        }
        if self.options.strict || self.ctx.config.strict {
            return Err(Error::Validation { findings: messages });
        }
        for message in &messages {
            tracing::warn!(finding = %message, "integrity warning");
        }
        self.run.warnings.extend(messages);
        Ok(())
    }

    fn write_rollback_script(&mut self) {
        let latest = match self.run.last_checkpoint() {
            Some(id) => self.ctx.store.get(id).map(Some),
            None => self.ctx.store.latest_post(),
        };
        let checkpoint = match latest {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "cannot load checkpoint for emergency rollback script");
                return;
            }
        };

        match rollback::write_emergency_script(&self.ctx.config.rollback_dir(), &checkpoint) {
            Ok(path) => {
                tracing::info!(path = %path.display(), checkpoint = %checkpoint.id, "emergency rollback script written");
                self.run.rollback_script = Some(path.display().to_string());
            }
            Err(e) => tracing::error!(error = %e, "failed to write emergency rollback script"),
        }
    }
}

fn apply_in_transaction(
    conn: &mut Connection,
    unit: &MigrationUnit,
    run_id: &str,
) -> std::result::Result<(), String> {
    let tx = conn.transaction().map_err(|e| e.to_string())?;
    for op in unit.operations() {
        tracing::debug!(unit = %unit.name(), operation = %op.describe(), "executing");
        tx.execute_batch(&op.sql)
            .map_err(|e| format!("{}: {}", op.describe(), e))?;
    }
    history::record(&tx, unit, run_id).map_err(|e| e.to_string())?;
    tx.commit().map_err(|e| e.to_string())
}

fn transition(unit: &MigrationUnit, state: UnitState) {
    tracing::debug!(unit = %unit.name(), state = %state, "unit state");
}

fn precondition_findings(unit: &MigrationUnit, schema: &BTreeSet<String>) -> Vec<String> {
    let mut findings = Vec::new();
    for required in unit.required_objects() {
        if !schema.contains(&object_key(required)) {
            findings.push(format!(
                "unit {} requires '{}' which does not exist",
                unit.name(),
                required
            ));
        }
    }
    for created in unit.created_objects() {
        if schema.contains(&object_key(created)) {
            findings.push(format!(
                "unit {} creates '{}' which already exists",
                unit.name(),
                created
            ));
        }
    }
    findings
}

/// Advance the simulated schema by a unit's declared effects.
fn simulate(unit: &MigrationUnit, schema: &mut BTreeSet<String>) {
    for op in unit.operations() {
        if let OperationKind::RenameTable { from, .. } = &op.kind {
            schema.remove(&object_key(from));
        }
    }
    for created in unit.created_objects() {
        schema.insert(object_key(created));
    }
}

/// Objects that units applied (now or earlier) declare, net of renames.
fn expected_objects(catalog: &Catalog, run: &MigrationRun) -> Vec<String> {
    let mut objects = BTreeSet::new();
    for unit in catalog.units() {
        let in_place = run.outcome(unit.name()).is_some_and(|o| {
            matches!(o.status, UnitStatus::Applied | UnitStatus::Skipped)
        });
        if in_place {
            simulate(unit, &mut objects);
        }
    }
    objects.into_iter().collect()
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}
