//! Engine configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default state directory, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".sqlshift";

/// Default SQLite busy timeout in milliseconds.
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Subdirectory of the state directory holding the checkpoint store.
pub const CHECKPOINT_DIR: &str = "checkpoints";

/// Subdirectory of the state directory holding emergency rollback scripts.
pub const ROLLBACK_DIR: &str = "rollback";

/// Target environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Environment {
    /// Local development.
    #[default]
    Development,
    /// Shared test environment.
    Test,
    /// Production.
    Production,
}

impl Environment {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Test => "test",
            Environment::Production => "production",
        }
    }

    /// Database file used when none is configured.
    pub fn default_database(&self) -> PathBuf {
        PathBuf::from(format!("sqlshift-{}.db", self.as_str()))
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{}'", other)),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Target environment tag.
    pub environment: Environment,

    /// Path of the target SQLite database.
    pub database_path: PathBuf,

    /// Directory for the checkpoint store and rollback scripts.
    pub state_dir: PathBuf,

    /// How long to wait on a locked database file.
    pub busy_timeout: Duration,

    /// Ceiling on a unit's transaction. None means no limit.
    pub statement_timeout: Option<Duration>,

    /// Enforce foreign keys on the connection.
    pub foreign_keys: bool,

    /// Treat integrity findings as fatal by default.
    pub strict: bool,

    /// Objects that exist before the first unit runs.
    pub existing_objects: Vec<String>,
}

impl EngineConfig {
    /// Configuration for an environment with its default database path.
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            database_path: environment.default_database(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            statement_timeout: None,
            foreign_keys: true,
            strict: false,
            existing_objects: Vec::new(),
        }
    }

    /// Set the database path.
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = path.into();
        self
    }

    /// Set the state directory.
    pub fn with_state_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_dir = path.into();
        self
    }

    /// Set the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Set the per-unit statement timeout.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Disable foreign key enforcement on the connection.
    pub fn without_foreign_keys(mut self) -> Self {
        self.foreign_keys = false;
        self
    }

    /// Make integrity findings fatal by default.
    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Declare objects that exist before the first unit.
    pub fn with_existing_objects<I, S>(mut self, objects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.existing_objects
            .extend(objects.into_iter().map(Into::into));
        self
    }

    /// Path of the checkpoint store.
    pub fn checkpoint_path(&self) -> PathBuf {
        self.state_dir.join(CHECKPOINT_DIR)
    }

    /// Directory for emergency rollback scripts.
    pub fn rollback_dir(&self) -> PathBuf {
        self.state_dir.join(ROLLBACK_DIR)
    }

    /// Whether the database path refers to an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.database_path == Path::new(":memory:")
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(Environment::default())
    }
}
