//! Integration tests for running and rolling back migrations.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use sqlshift_core::sql::{schema_objects, table_exists};
use sqlshift_core::{
    rollback, run, Catalog, CheckpointId, EngineConfig, Environment, Error, EventKind,
    FindingKind, MemorySink, MigrationUnit, Operation, Phase, RunContext, RunLock, RunOptions,
    RunStatus, UnitStatus,
};

struct TestContext {
    config: EngineConfig,
    _dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::new(Environment::Test)
            .with_database(dir.path().join("app.db"))
            .with_state_dir(dir.path().join("state"));
        Self { config, _dir: dir }
    }

    fn with_config(mut self, f: impl FnOnce(EngineConfig) -> EngineConfig) -> Self {
        self.config = f(self.config);
        self
    }

    fn open(&self) -> RunContext {
        RunContext::open(self.config.clone()).unwrap()
    }

    fn database(&self) -> &PathBuf {
        &self.config.database_path
    }

    /// Raw connection for seeding or inspecting the database.
    fn raw(&self) -> Connection {
        Connection::open(self.database()).unwrap()
    }
}

fn table_unit(ordinal: u32, table: &str) -> MigrationUnit {
    MigrationUnit::new(ordinal, format!("{:04}_create_{}", ordinal, table)).with_operation(
        Operation::create_table(
            table,
            format!("CREATE TABLE {} (id INTEGER PRIMARY KEY, label TEXT)", table),
        ),
    )
}

fn five_tables() -> Catalog {
    Catalog::from_units(
        ["t1", "t2", "t3", "t4", "t5"]
            .iter()
            .enumerate()
            .map(|(i, t)| table_unit(i as u32 + 1, t))
            .collect(),
    )
}

fn post_checkpoint(report: &sqlshift_core::RunReport, unit: &str) -> CheckpointId {
    report.run.outcome(unit).unwrap().post_checkpoint.unwrap()
}

// ============== Catalog ==============

#[test]
fn test_order_error_before_any_change() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();

    let catalog = Catalog::from_units(vec![
        MigrationUnit::new(1, "0001_sessions")
            .requires("users")
            .with_operation(Operation::create_table(
                "sessions",
                "CREATE TABLE sessions (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id))",
            )),
        table_unit(2, "users"),
    ]);

    let err = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap_err();
    match err {
        Error::Order {
            unit,
            object,
            provider,
            ..
        } => {
            assert_eq!(unit, "0001_sessions");
            assert_eq!(object, "users");
            assert_eq!(provider, "0002_create_users");
        }
        other => panic!("expected order error, got {other:?}"),
    }
    assert!(schema_objects(run_ctx.connection()).unwrap().is_empty());
    assert_eq!(run_ctx.store().all().count(), 0);
}

#[test]
fn test_catalog_loaded_from_directory() {
    let ctx = TestContext::new();
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("0001_users.sql"),
        "-- description: accounts\n\
         -- @op create-table users\n\
         CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT NOT NULL);\n\
         -- @op create-index idx_users_email\n\
         CREATE UNIQUE INDEX idx_users_email ON users(email);\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("0002_sessions.sql"),
        "-- requires: users\n\
         -- @op create-table sessions\n\
         CREATE TABLE sessions (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL REFERENCES users(id));\n",
    )
    .unwrap();
    fs::write(dir.path().join("README.md"), "not a migration").unwrap();

    let catalog = Catalog::load(dir.path()).unwrap();
    assert_eq!(catalog.len(), 2);
    assert_eq!(catalog.units()[0].description(), Some("accounts"));

    let mut run_ctx = ctx.open();
    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    assert_eq!(report.run.status, RunStatus::Applied, "{:?}", report.error);

    let objects = schema_objects(run_ctx.connection()).unwrap();
    assert!(objects.contains_key("users"));
    assert!(objects.contains_key("idx_users_email"));
    assert!(objects.contains_key("sessions"));
}

// ============== Execution ==============

#[test]
fn test_failed_unit_halts_run() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();

    let catalog = Catalog::from_units(vec![
        table_unit(1, "users"),
        MigrationUnit::new(2, "0002_seed_teams")
            .with_operation(Operation::create_table(
                "teams",
                "CREATE TABLE teams (id INTEGER PRIMARY KEY, slug TEXT NOT NULL UNIQUE)",
            ))
            .with_operation(Operation::insert_rows(
                "teams",
                "slug",
                ["core", "core"],
                "INSERT INTO teams (slug) VALUES ('core'), ('core')",
            )),
        table_unit(3, "projects"),
    ]);

    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    assert_eq!(report.run.status, RunStatus::Failed);
    assert_eq!(report.run.outcomes.len(), 2);
    assert_eq!(report.run.outcomes[0].status, UnitStatus::Applied);
    assert_eq!(report.run.outcomes[1].status, UnitStatus::Failed);

    let unit1_post = post_checkpoint(&report, "0001_create_users");
    match report.error {
        Some(Error::Transaction {
            unit,
            message,
            last_applied,
            last_checkpoint,
        }) => {
            assert_eq!(unit, "0002_seed_teams");
            assert!(message.contains("UNIQUE"), "{message}");
            assert_eq!(last_applied.as_deref(), Some("0001_create_users"));
            assert_eq!(last_checkpoint, Some(unit1_post));
        }
        other => panic!("expected transaction error, got {other:?}"),
    }
    assert_eq!(report.last_applied.as_deref(), Some("0001_create_users"));
    assert_eq!(report.last_checkpoint, Some(unit1_post));

    let conn = run_ctx.connection();
    assert!(table_exists(conn, "users").unwrap());
    assert!(!table_exists(conn, "teams").unwrap());
    assert!(!table_exists(conn, "projects").unwrap());

    // The failed unit keeps its pre checkpoint only.
    let phases: Vec<(String, Phase)> = run_ctx
        .store()
        .list(&report.run.id)
        .map(|c| {
            let c = c.unwrap();
            (c.unit_name, c.phase)
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            ("0001_create_users".to_string(), Phase::Pre),
            ("0001_create_users".to_string(), Phase::Post),
            ("0002_seed_teams".to_string(), Phase::Pre),
        ]
    );
    assert!(RunLock::current(conn).unwrap().is_none());
}

#[test]
fn test_validation_halt_reports_last_applied_and_checkpoint() {
    let ctx = TestContext::new().with_config(|c| c.with_existing_objects(["accounts"]));
    let first = Catalog::from_units(vec![table_unit(1, "users")]);
    let report = {
        let mut run_ctx = ctx.open();
        run(&first, &mut run_ctx, &RunOptions::new()).unwrap()
    };
    let users_post = post_checkpoint(&report, "0001_create_users");
    assert!(report.last_applied.is_none());
    assert!(report.last_checkpoint.is_none());

    let catalog = Catalog::from_units(vec![
        table_unit(1, "users"),
        table_unit(2, "teams"),
        MigrationUnit::new(3, "0003_sessions")
            .requires("accounts")
            .with_operation(Operation::create_table(
                "sessions",
                "CREATE TABLE sessions (id INTEGER PRIMARY KEY)",
            )),
    ]);
    let mut run_ctx = ctx.open();
    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    assert!(matches!(report.error, Some(Error::Validation { .. })));
    assert_eq!(report.last_applied.as_deref(), Some("0002_create_teams"));
    assert_eq!(
        report.last_checkpoint,
        Some(post_checkpoint(&report, "0002_create_teams"))
    );

    // Nothing applied by this run: fall back to what earlier runs left.
    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    assert!(report.error.is_some());
    assert_eq!(report.run.count(UnitStatus::Applied), 0);
    assert_eq!(report.last_applied.as_deref(), Some("0002_create_teams"));
    assert!(report.last_checkpoint.unwrap() > users_post);
}

#[test]
fn test_run_is_persisted_and_resumable() {
    let ctx = TestContext::new();
    let catalog = Catalog::from_units(vec![table_unit(1, "users"), table_unit(2, "teams")]);

    let first_id = {
        let mut run_ctx = ctx.open();
        run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap().run.id
    };

    let mut run_ctx = ctx.open();
    let stored = run_ctx.store().load_run(&first_id).unwrap();
    assert_eq!(stored.status, RunStatus::Applied);
    assert_eq!(stored.count(UnitStatus::Applied), 2);

    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    assert_eq!(report.run.count(UnitStatus::Skipped), 2);
    assert_eq!(run_ctx.store().list_runs().unwrap().len(), 2);
}

#[test]
fn test_emergency_rollback_script_written() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();
    let report = run(&five_tables(), &mut run_ctx, &RunOptions::new()).unwrap();

    let path = report.run.rollback_script.clone().unwrap();
    assert!(path.starts_with(&ctx.config.rollback_dir().display().to_string()));
    let script = fs::read_to_string(&path).unwrap();
    assert!(script.contains("DROP TABLE IF EXISTS \"t5\""));
    assert!(script.contains("BEGIN"));
    assert!(script.contains("COMMIT"));
}

#[test]
fn test_statement_timeout_aborts_unit() {
    let ctx = TestContext::new()
        .with_config(|c| c.with_statement_timeout(Duration::from_millis(100)));
    let mut run_ctx = ctx.open();

    let catalog = Catalog::from_units(vec![
        table_unit(1, "users"),
        MigrationUnit::new(2, "0002_backfill")
            .with_operation(Operation::create_table(
                "counters",
                "CREATE TABLE counters (x INTEGER)",
            ))
            .with_operation(Operation::raw(
                "INSERT INTO counters
                 WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c)
                 SELECT x FROM c WHERE x < 0",
                Some("DELETE FROM counters".to_string()),
            )),
    ]);

    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    match report.error {
        Some(Error::Transaction { unit, message, .. }) => {
            assert_eq!(unit, "0002_backfill");
            assert!(message.contains("statement timeout"), "{message}");
        }
        other => panic!("expected transaction error, got {other:?}"),
    }
    assert!(!table_exists(run_ctx.connection(), "counters").unwrap());
    assert!(table_exists(run_ctx.connection(), "users").unwrap());
}

#[test]
fn test_lock_held_by_other_process() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();

    let mut other = ctx.raw();
    let lock = RunLock::acquire(&mut other, "pid 4242 (other)").unwrap();

    let err = run(&five_tables(), &mut run_ctx, &RunOptions::new()).unwrap_err();
    match &err {
        Error::Lock { holder, .. } => assert_eq!(holder, "pid 4242 (other)"),
        other => panic!("expected lock error, got {other:?}"),
    }
    assert!(!table_exists(run_ctx.connection(), "t1").unwrap());

    lock.release(&other).unwrap();
    let report = run(&five_tables(), &mut run_ctx, &RunOptions::new()).unwrap();
    assert!(report.is_success());
}

// ============== Integrity ==============

fn seed_orphans(ctx: &TestContext) {
    ctx.raw()
        .execute_batch(
            "PRAGMA foreign_keys = OFF;
             CREATE TABLE users (id INTEGER PRIMARY KEY);
             CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id));
             INSERT INTO users (id) VALUES (1);
             INSERT INTO posts (id, user_id) VALUES (1, 1), (2, 77);",
        )
        .unwrap();
}

fn index_posts() -> Catalog {
    Catalog::from_units(vec![MigrationUnit::new(1, "0001_index_posts")
        .requires("posts")
        .with_operation(Operation::create_index(
            "idx_posts_user_id",
            "CREATE INDEX idx_posts_user_id ON posts(user_id)",
        ))])
}

#[test]
fn test_orphan_is_warning_when_not_strict() {
    let ctx = TestContext::new().with_config(|c| c.with_existing_objects(["users", "posts"]));
    seed_orphans(&ctx);
    let mut run_ctx = ctx.open();

    let report = run(&index_posts(), &mut run_ctx, &RunOptions::new()).unwrap();
    assert!(report.is_success(), "{:?}", report.error);
    assert_eq!(report.run.status, RunStatus::AppliedWithWarnings);

    let integrity = report.integrity.unwrap();
    let orphans: Vec<_> = integrity.of_kind(FindingKind::OrphanedReference).collect();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].object, "posts");
    assert_eq!(report.run.warnings.len(), 1);
}

#[test]
fn test_orphan_fails_strict_run() {
    let ctx = TestContext::new().with_config(|c| c.with_existing_objects(["users", "posts"]));
    seed_orphans(&ctx);
    let mut run_ctx = ctx.open();

    let report = run(&index_posts(), &mut run_ctx, &RunOptions::new().strict()).unwrap();
    assert_eq!(report.run.status, RunStatus::Failed);
    assert!(matches!(report.error, Some(Error::Validation { .. })));
    // The unit itself committed; strict mode only changes the verdict.
    assert_eq!(report.run.outcomes[0].status, UnitStatus::Applied);
}

#[test]
fn test_skip_validation_bypasses_integrity() {
    let ctx = TestContext::new().with_config(|c| c.with_existing_objects(["users", "posts"]));
    seed_orphans(&ctx);
    let mut run_ctx = ctx.open();

    let options = RunOptions::new().strict().skip_validation();
    let report = run(&index_posts(), &mut run_ctx, &options).unwrap();
    assert_eq!(report.run.status, RunStatus::Applied);
    assert!(report.integrity.is_none());
}

// ============== Dry run ==============

#[test]
fn test_dry_run_leaves_database_untouched() {
    let ctx = TestContext::new();
    {
        let mut run_ctx = ctx.open();
        let catalog = Catalog::from_units(vec![table_unit(1, "t1")]);
        run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    }
    let before = fs::read(ctx.database()).unwrap();

    let sink = MemorySink::new();
    let mut run_ctx = RunContext::open_read_only(ctx.config.clone())
        .unwrap()
        .with_sink(sink.clone());
    let report = run(&five_tables(), &mut run_ctx, &RunOptions::new().dry_run()).unwrap();
    drop(run_ctx);

    assert_eq!(report.run.status, RunStatus::Planned);
    assert_eq!(report.run.outcomes[0].status, UnitStatus::Skipped);
    assert_eq!(report.run.count(UnitStatus::Planned), 4);
    assert!(sink.of_kind(EventKind::CheckpointCreated).is_empty());
    assert_eq!(fs::read(ctx.database()).unwrap(), before);
}

#[test]
fn test_dry_run_reports_same_findings_as_real_run() {
    let catalog = Catalog::from_units(vec![
        table_unit(1, "users"),
        MigrationUnit::new(2, "0002_sessions")
            .requires("accounts")
            .with_operation(Operation::create_table(
                "sessions",
                "CREATE TABLE sessions (id INTEGER PRIMARY KEY)",
            )),
    ]);
    let ctx = TestContext::new().with_config(|c| c.with_existing_objects(["accounts"]));

    let mut dry_ctx = RunContext::open_read_only(ctx.config.clone()).unwrap();
    let dry = run(&catalog, &mut dry_ctx, &RunOptions::new().dry_run()).unwrap();
    drop(dry_ctx);

    let mut real_ctx = ctx.open();
    let real = run(&catalog, &mut real_ctx, &RunOptions::new()).unwrap();

    let findings = |report: &sqlshift_core::RunReport| match &report.error {
        Some(Error::Validation { findings }) => findings.clone(),
        other => panic!("expected validation error, got {other:?}"),
    };
    assert_eq!(findings(&dry), findings(&real));
    assert_eq!(dry.run.outcomes.len(), real.run.outcomes.len());
}

// ============== Rollback ==============

#[test]
fn test_rollback_to_checkpoint() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();
    let report = run(&five_tables(), &mut run_ctx, &RunOptions::new()).unwrap();
    assert_eq!(report.run.count(UnitStatus::Applied), 5);

    let target = post_checkpoint(&report, "0002_create_t2");
    let outcome = rollback(&mut run_ctx, target, false).unwrap();
    let undone: Vec<&str> = outcome.undone.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(
        undone,
        vec!["0005_create_t5", "0004_create_t4", "0003_create_t3"]
    );

    let conn = run_ctx.connection();
    assert!(table_exists(conn, "t1").unwrap());
    assert!(table_exists(conn, "t2").unwrap());
    for table in ["t3", "t4", "t5"] {
        assert!(!table_exists(conn, table).unwrap(), "{table} still exists");
    }

    // Undone checkpoints are marked, never deleted.
    let t5_post = post_checkpoint(&report, "0005_create_t5");
    let marker = run_ctx.store().rollback_marker(t5_post).unwrap().unwrap();
    assert_eq!(marker.target, target);
    assert!(run_ctx.store().get(t5_post).is_ok());

    let stored = run_ctx.store().load_run(&report.run.id).unwrap();
    assert_eq!(stored.outcome("0004_create_t4").unwrap().status, UnitStatus::RolledBack);
    assert_eq!(stored.outcome("0002_create_t2").unwrap().status, UnitStatus::Applied);
}

#[test]
fn test_rollback_then_rerun_restores_schema() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();
    let catalog = five_tables();
    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    let applied = schema_objects(run_ctx.connection()).unwrap();

    let target = post_checkpoint(&report, "0001_create_t1");
    rollback(&mut run_ctx, target, false).unwrap();
    assert_eq!(schema_objects(run_ctx.connection()).unwrap().len(), 1);

    let rerun = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    assert_eq!(rerun.run.status, RunStatus::Applied);
    assert_eq!(rerun.run.count(UnitStatus::Skipped), 1);
    assert_eq!(rerun.run.count(UnitStatus::Applied), 4);
    assert_eq!(schema_objects(run_ctx.connection()).unwrap(), applied);

    // A second rollback to the same target only undoes the re-applied units.
    let outcome = rollback(&mut run_ctx, target, false).unwrap();
    assert_eq!(outcome.undone.len(), 4);
}

#[test]
fn test_rollback_refuses_irreversible_unit() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();
    let catalog = Catalog::from_units(vec![
        table_unit(1, "t1"),
        table_unit(2, "t2"),
        table_unit(3, "t3").irreversible(),
        table_unit(4, "t4"),
    ]);
    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    let target = post_checkpoint(&report, "0001_create_t1");

    let err = rollback(&mut run_ctx, target, false).unwrap_err();
    match err {
        Error::Irreversible { unit, .. } => assert_eq!(unit, "0003_create_t3"),
        other => panic!("expected irreversible error, got {other:?}"),
    }
    assert!(table_exists(run_ctx.connection(), "t4").unwrap());

    let outcome = rollback(&mut run_ctx, target, true).unwrap();
    assert_eq!(outcome.passed_over, vec!["0003_create_t3".to_string()]);
    let conn = run_ctx.connection();
    assert!(table_exists(conn, "t3").unwrap());
    assert!(!table_exists(conn, "t2").unwrap());
    assert!(!table_exists(conn, "t4").unwrap());
}

#[test]
fn test_rollback_without_inverse_is_plan_error() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();
    let catalog = Catalog::from_units(vec![
        table_unit(1, "users"),
        MigrationUnit::new(2, "0002_backfill")
            .requires("users")
            .with_operation(Operation::raw("UPDATE users SET label = 'member'", None)),
    ]);
    let report = run(&catalog, &mut run_ctx, &RunOptions::new()).unwrap();
    let target = post_checkpoint(&report, "0001_create_users");

    let err = rollback(&mut run_ctx, target, false).unwrap_err();
    assert!(matches!(err, Error::Plan { .. }), "{err:?}");
    assert_eq!(err.class(), sqlshift_core::ErrorClass::Rollback);
}

#[test]
fn test_rollback_to_unknown_checkpoint() {
    let ctx = TestContext::new();
    let mut run_ctx = ctx.open();
    let err = rollback(&mut run_ctx, CheckpointId(999), false).unwrap_err();
    assert!(matches!(err, Error::NotFound { kind: "checkpoint", .. }), "{err:?}");
}

#[test]
fn test_rollback_events() {
    let ctx = TestContext::new();
    let sink = MemorySink::new();
    let mut run_ctx = ctx.open().with_sink(sink.clone());
    let report = run(&five_tables(), &mut run_ctx, &RunOptions::new()).unwrap();

    let target = post_checkpoint(&report, "0004_create_t4");
    rollback(&mut run_ctx, target, false).unwrap();

    assert_eq!(sink.of_kind(EventKind::RollbackStart).len(), 1);
    assert_eq!(sink.of_kind(EventKind::RollbackEnd).len(), 1);
    let undone = sink
        .of_kind(EventKind::UnitEnd)
        .into_iter()
        .filter(|r| r.outcome.as_deref() == Some("rolled-back"))
        .count();
    assert_eq!(undone, 1);
}
