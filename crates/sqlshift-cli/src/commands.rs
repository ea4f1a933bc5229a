//! Subcommand handlers.

use std::sync::atomic::Ordering;

use sqlshift_core::{
    rollback, run, Catalog, CheckpointStore, EngineConfig, ErrorClass, RollbackPlan, RunContext,
    RunLock,
};
use thiserror::Error;

use crate::config::{Cli, Command};
use crate::output::{Formatter, OutputFormat};

/// Exit status for usage and IO errors.
pub const EXIT_USAGE: i32 = 1;
/// Exit status for validation failures.
pub const EXIT_VALIDATION: i32 = 2;
/// Exit status for execution failures.
pub const EXIT_EXECUTION: i32 = 3;
/// Exit status for rollback failures.
pub const EXIT_ROLLBACK: i32 = 4;
/// Exit status for precondition failures.
pub const EXIT_PRECONDITION: i32 = 5;

/// CLI errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Engine(#[from] sqlshift_core::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl CliError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Engine(e) => exit_code(e),
            CliError::Task(_) => EXIT_USAGE,
        }
    }
}

/// Process exit status for an engine error.
pub fn exit_code(error: &sqlshift_core::Error) -> i32 {
    if matches!(error, sqlshift_core::Error::Io(_)) {
        return EXIT_USAGE;
    }
    match error.class() {
        ErrorClass::Validation => EXIT_VALIDATION,
        ErrorClass::Execution => EXIT_EXECUTION,
        ErrorClass::Rollback => EXIT_ROLLBACK,
        ErrorClass::Precondition => EXIT_PRECONDITION,
    }
}

/// Rendered command output and its exit status.
#[derive(Debug)]
pub struct CommandOutput {
    pub text: String,
    pub code: i32,
}

impl CommandOutput {
    fn ok(text: String) -> Self {
        Self { text, code: 0 }
    }
}

/// Execute the parsed command.
pub async fn execute(cli: Cli, formatter: &dyn Formatter) -> Result<CommandOutput, CliError> {
    let config = cli.to_config();
    tracing::debug!(
        environment = %config.environment,
        database = %config.database_path.display(),
        command = ?cli.command,
        "executing command"
    );

    match cli.command.clone() {
        Command::Validate => validate(&cli, &config, formatter),
        Command::Run { .. } => {
            let options = cli.command.run_options().unwrap_or_default();
            let catalog = Catalog::load(&cli.migrations)?;
            let mut ctx = if options.dry_run {
                RunContext::open_read_only(config)?
            } else {
                RunContext::open(config)?
            };

            let cancel = ctx.cancel_handle();
            let signal = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, stopping after the current migration");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let report =
                tokio::task::spawn_blocking(move || run(&catalog, &mut ctx, &options)).await?;
            signal.abort();

            let report = report?;
            let code = report.error.as_ref().map(exit_code).unwrap_or(0);
            Ok(CommandOutput {
                text: formatter.format_run(&report),
                code,
            })
        }
        Command::Rollback {
            checkpoint,
            allow_irreversible,
        } => {
            let mut ctx = RunContext::open(config)?;
            let outcome = tokio::task::spawn_blocking(move || {
                rollback(&mut ctx, checkpoint, allow_irreversible)
            })
            .await??;
            Ok(CommandOutput::ok(formatter.format_rollback(&outcome)))
        }
        Command::Checkpoints { run: run_id } => {
            let store = CheckpointStore::open(config.checkpoint_path())?;
            let checkpoints = match &run_id {
                Some(run_id) => store.list(run_id),
                None => store.all(),
            };
            let mut rows = Vec::new();
            for checkpoint in checkpoints {
                let checkpoint = checkpoint?;
                let rolled_back = store.is_rolled_back(checkpoint.id)?;
                rows.push((checkpoint, rolled_back));
            }
            Ok(CommandOutput::ok(formatter.format_checkpoints(&rows)))
        }
        Command::Runs => {
            let store = CheckpointStore::open(config.checkpoint_path())?;
            let runs = store.list_runs()?;
            Ok(CommandOutput::ok(formatter.format_runs(&runs)))
        }
        Command::Script {
            checkpoint,
            allow_irreversible,
        } => {
            let plan = RollbackPlan::for_config(&config, checkpoint, allow_irreversible)?;
            let text = match cli.format {
                OutputFormat::Table => plan.render_script(),
                OutputFormat::Json => formatter.format_plan(&plan),
            };
            Ok(CommandOutput::ok(text))
        }
        Command::Unlock => {
            let ctx = RunContext::open(config)?;
            let text = match RunLock::force_unlock(ctx.connection())? {
                Some(info) => {
                    tracing::warn!(holder = %info.holder, acquired_at = %info.acquired_at, "run lock removed");
                    format!("Removed lock held by {} since {}", info.holder, info.acquired_at)
                }
                None => "No lock held".to_string(),
            };
            Ok(CommandOutput::ok(formatter.format_message(&text)))
        }
    }
}

fn validate(
    cli: &Cli,
    config: &EngineConfig,
    formatter: &dyn Formatter,
) -> Result<CommandOutput, CliError> {
    let catalog = Catalog::load(&cli.migrations)?;
    let graph = catalog.validate(&config.existing_objects)?;
    tracing::info!(
        migrations = catalog.len(),
        dependencies = graph.len(),
        "catalog is valid"
    );
    Ok(CommandOutput::ok(formatter.format_catalog(&catalog)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;

    fn cli(dir: &std::path::Path, args: &[&str]) -> Cli {
        let migrations = dir.join("migrations");
        let database = dir.join("app.db");
        let state = dir.join("state");
        let mut argv = vec![
            "sqlshift".to_string(),
            "--migrations".to_string(),
            migrations.display().to_string(),
            "--database".to_string(),
            database.display().to_string(),
            "--state-dir".to_string(),
            state.display().to_string(),
            "--format".to_string(),
            "json".to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    fn write_migrations(dir: &std::path::Path) {
        let migrations = dir.join("migrations");
        fs::create_dir_all(&migrations).unwrap();
        fs::write(
            migrations.join("0001_users.sql"),
            "-- @op create-table users\nCREATE TABLE users (id INTEGER PRIMARY KEY);\n",
        )
        .unwrap();
    }

    #[test]
    fn test_exit_codes() {
        let validation = sqlshift_core::Error::Validation { findings: vec![] };
        assert_eq!(exit_code(&validation), EXIT_VALIDATION);
        let lock = sqlshift_core::Error::Lock {
            holder: "pid 1".to_string(),
            acquired_at: "now".to_string(),
        };
        assert_eq!(exit_code(&lock), EXIT_PRECONDITION);
        let cancelled = sqlshift_core::Error::Cancelled { after: None };
        assert_eq!(exit_code(&cancelled), EXIT_EXECUTION);
        let io = sqlshift_core::Error::Io(std::io::Error::other("disk"));
        assert_eq!(exit_code(&io), EXIT_USAGE);
    }

    #[tokio::test]
    async fn test_run_then_list_runs() {
        let dir = tempfile::tempdir().unwrap();
        write_migrations(dir.path());
        let formatter = crate::output::JsonFormatter;

        let output = execute(cli(dir.path(), &["run"]), &formatter).await.unwrap();
        assert_eq!(output.code, 0, "{}", output.text);
        let value: serde_json::Value = serde_json::from_str(&output.text).unwrap();
        assert_eq!(value["status"], "applied");

        let output = execute(cli(dir.path(), &["runs"]), &formatter).await.unwrap();
        let runs: serde_json::Value = serde_json::from_str(&output.text).unwrap();
        assert_eq!(runs.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_create_database() {
        let dir = tempfile::tempdir().unwrap();
        write_migrations(dir.path());
        let formatter = crate::output::JsonFormatter;

        let output = execute(cli(dir.path(), &["run", "--dry-run"]), &formatter)
            .await
            .unwrap();
        assert_eq!(output.code, 0, "{}", output.text);
        let value: serde_json::Value = serde_json::from_str(&output.text).unwrap();
        assert_eq!(value["status"], "planned");
        assert!(!dir.path().join("app.db").exists());
    }

    #[tokio::test]
    async fn test_missing_migrations_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let formatter = crate::output::JsonFormatter;
        let err = execute(cli(dir.path(), &["validate"]), &formatter)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), EXIT_VALIDATION);
    }
}
