//! Command-line arguments and their conversion into engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use sqlshift_core::config::DEFAULT_BUSY_TIMEOUT_MS;
use sqlshift_core::{CheckpointId, EngineConfig, Environment, RunOptions};

use crate::output::OutputFormat;

/// Default migrations directory.
pub const DEFAULT_MIGRATIONS_DIR: &str = "migrations";

/// Environment variable overriding the default database path.
pub const DATABASE_ENV: &str = "SQLSHIFT_DATABASE";

/// Target environment as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EnvArg {
    Development,
    Test,
    Production,
}

impl From<EnvArg> for Environment {
    fn from(env: EnvArg) -> Self {
        match env {
            EnvArg::Development => Environment::Development,
            EnvArg::Test => Environment::Test,
            EnvArg::Production => Environment::Production,
        }
    }
}

/// Checkpointed schema migrations for SQLite
#[derive(Parser, Debug)]
#[command(name = "sqlshift")]
#[command(version, about = "Checkpointed schema migrations for SQLite", long_about = None)]
pub struct Cli {
    /// Target environment
    #[arg(short, long, global = true, value_enum, default_value = "development")]
    pub env: EnvArg,

    /// Database file (defaults to sqlshift-<env>.db)
    #[arg(short, long, global = true, env = DATABASE_ENV)]
    pub database: Option<PathBuf>,

    /// Directory holding migration files
    #[arg(short, long, global = true, default_value = DEFAULT_MIGRATIONS_DIR)]
    pub migrations: PathBuf,

    /// Directory for checkpoints and rollback scripts
    #[arg(long, global = true, default_value = sqlshift_core::config::DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Objects that exist before the first migration (repeatable)
    #[arg(long = "existing", global = true, value_name = "OBJECT")]
    pub existing: Vec<String>,

    /// Per-migration statement timeout in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    pub statement_timeout: Option<u64>,

    /// How long to wait on a locked database file, in milliseconds
    #[arg(long, global = true, value_name = "MS", default_value_t = DEFAULT_BUSY_TIMEOUT_MS)]
    pub busy_timeout: u64,

    /// Output format
    #[arg(long, global = true, default_value = "table", value_enum)]
    pub format: OutputFormat,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Load the catalog and check ordering and dependencies
    Validate,

    /// Apply pending migrations
    Run {
        /// Validate and log intended operations without writing anything
        #[arg(long)]
        dry_run: bool,

        /// Continue past validation warnings
        #[arg(long)]
        force: bool,

        /// Skip the post-run integrity pass
        #[arg(long)]
        skip_validation: bool,

        /// Fail the run on any integrity finding
        #[arg(long)]
        strict: bool,
    },

    /// Roll the database back to a checkpoint
    Rollback {
        /// Target checkpoint (e.g. ckpt-12 or 12)
        checkpoint: CheckpointId,

        /// Leave irreversible migrations in place instead of refusing
        #[arg(long)]
        allow_irreversible: bool,
    },

    /// List checkpoints
    Checkpoints {
        /// Only show checkpoints of this run
        #[arg(long)]
        run: Option<String>,
    },

    /// List recorded runs
    Runs,

    /// Print the rollback script for a checkpoint without executing it
    Script {
        /// Target checkpoint
        checkpoint: CheckpointId,

        /// Leave irreversible migrations in place instead of refusing
        #[arg(long)]
        allow_irreversible: bool,
    },

    /// Remove a stale run lock
    Unlock,
}

impl Cli {
    /// Convert arguments into engine configuration.
    pub fn to_config(&self) -> EngineConfig {
        let environment = Environment::from(self.env);
        let mut config = EngineConfig::new(environment)
            .with_state_dir(&self.state_dir)
            .with_busy_timeout(Duration::from_millis(self.busy_timeout))
            .with_existing_objects(self.existing.iter().cloned());

        if let Some(database) = &self.database {
            config = config.with_database(database);
        }
        if let Some(ms) = self.statement_timeout {
            config = config.with_statement_timeout(Duration::from_millis(ms));
        }
        config
    }

    /// Default log filter directive.
    pub fn log_directive(&self) -> &'static str {
        if self.verbose {
            "sqlshift=debug,sqlshift_core=debug"
        } else {
            "sqlshift=info,sqlshift_core=info"
        }
    }
}

impl Command {
    /// Run options for the `run` subcommand.
    pub fn run_options(&self) -> Option<RunOptions> {
        match self {
            Command::Run {
                dry_run,
                force,
                skip_validation,
                strict,
            } => Some(RunOptions {
                dry_run: *dry_run,
                force: *force,
                skip_validation: *skip_validation,
                strict: *strict,
            }),
            _ => None,
        }
    }
}
