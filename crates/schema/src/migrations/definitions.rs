//! Migration Definitions - Core types shared by the scanner, graph and applier

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use pgfast_core::{DatabaseConfig, DEFAULT_MIGRATIONS_DIR};

use super::checksum;
use crate::error::DiscoveryError;

pub use pgfast_core::DEFAULT_MIGRATIONS_TABLE;

/// Number of leading lines shown in a plan preview
pub const PREVIEW_LINES: usize = 10;

/// Timestamp-derived migration identifier, stored as BIGINT in the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Version for a migration created at `at`, formatted `%Y%m%d%H%M%S`
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        let stamp = at.format("%Y%m%d%H%M%S").to_string();
        // Fourteen ASCII digits always fit in an i64
        Self(stamp.parse().unwrap_or_default())
    }
}

impl FromStr for Version {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DiscoveryError::InvalidVersion {
                value: s.to_string(),
            });
        }
        s.parse::<i64>()
            .map(Version)
            .map_err(|_| DiscoveryError::InvalidVersion {
                value: s.to_string(),
            })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Apply the migration (run the up source)
    Up,
    /// Revert the migration (run the down source)
    Down,
}

impl Direction {
    /// Filename suffix before the `.sql` extension
    pub fn suffix(&self) -> &'static str {
        match self {
            Direction::Up => "_up",
            Direction::Down => "_down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

/// One versioned change discovered on disk
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: Version,
    pub name: String,
    pub up_path: Option<PathBuf>,
    pub down_path: Option<PathBuf>,
    pub up_sql: Option<String>,
    pub down_sql: Option<String>,
    /// Declared dependencies, deduplicated in declaration order
    pub depends_on: Vec<Version>,
    checksum: OnceLock<String>,
}

impl Migration {
    pub fn new(version: Version, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            up_path: None,
            down_path: None,
            up_sql: None,
            down_sql: None,
            depends_on: Vec::new(),
            checksum: OnceLock::new(),
        }
    }

    pub fn with_up(mut self, path: impl Into<PathBuf>, sql: impl Into<String>) -> Self {
        self.up_path = Some(path.into());
        self.up_sql = Some(sql.into());
        self.checksum = OnceLock::new();
        self
    }

    pub fn with_down(mut self, path: impl Into<PathBuf>, sql: impl Into<String>) -> Self {
        self.down_path = Some(path.into());
        self.down_sql = Some(sql.into());
        self
    }

    pub fn with_dependencies(mut self, depends_on: Vec<Version>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Both the up and the down source are present
    pub fn is_complete(&self) -> bool {
        self.up_sql.is_some() && self.down_sql.is_some()
    }

    /// The direction whose file is absent, if any
    pub fn missing_direction(&self) -> Option<Direction> {
        if self.up_sql.is_none() {
            Some(Direction::Up)
        } else if self.down_sql.is_none() {
            Some(Direction::Down)
        } else {
            None
        }
    }

    pub fn source(&self, direction: Direction) -> Option<&str> {
        match direction {
            Direction::Up => self.up_sql.as_deref(),
            Direction::Down => self.down_sql.as_deref(),
        }
    }

    /// SHA-256 of the up source, computed on first use
    pub fn checksum(&self) -> Option<&str> {
        let sql = self.up_sql.as_deref()?;
        Some(self.checksum.get_or_init(|| checksum::compute(sql)).as_str())
    }
}

/// Row persisted in the ledger table for every applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub version: Version,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

/// Configuration for the migration engine
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Roots scanned (recursively) for migration files
    pub migrations_dirs: Vec<PathBuf>,
    /// Ledger table name
    pub migrations_table: String,
    /// Treat incomplete migrations and missing roots as errors
    pub strict: bool,
    /// Upper bound for every statement the engine runs
    pub command_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dirs: vec![PathBuf::from(DEFAULT_MIGRATIONS_DIR)],
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            strict: false,
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl MigrationConfig {
    pub fn with_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.migrations_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }
}

impl From<&DatabaseConfig> for MigrationConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            migrations_dirs: config.migrations_dirs.clone(),
            migrations_table: config.migrations_table.clone(),
            strict: config.strict,
            command_timeout: config.command_timeout(),
        }
    }
}

/// Preview of one migration as it would run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub version: Version,
    pub name: String,
    pub direction: Direction,
    pub depends_on: Vec<Version>,
    pub checksum: String,
    pub sql_preview: String,
    pub total_lines: usize,
}

impl MigrationPlan {
    pub fn new(migration: &Migration, direction: Direction) -> Self {
        let sql = migration.source(direction).unwrap_or_default();
        let sql_preview = sql.lines().take(PREVIEW_LINES).collect::<Vec<_>>().join("\n");

        Self {
            version: migration.version,
            name: migration.name.clone(),
            direction,
            depends_on: migration.depends_on.clone(),
            checksum: migration.checksum().unwrap_or_default().to_string(),
            sql_preview,
            total_lines: sql.lines().count(),
        }
    }
}

/// The migration that stopped an apply or rollback run
#[derive(Debug)]
pub struct FailedMigration {
    pub version: Version,
    pub name: String,
    pub error: crate::error::SchemaError,
}

/// Options for [`MigrationEngine::up`](super::runner::MigrationEngine::up)
#[derive(Debug, Clone, Copy, Default)]
pub struct UpOptions {
    /// Apply only versions up to and including this one
    pub target: Option<Version>,
    pub dry_run: bool,
    /// Skip checksum validation of applied migrations
    pub force: bool,
}

/// Outcome of an apply run
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub planned: Vec<MigrationPlan>,
    pub applied: Vec<Version>,
    pub failed: Option<FailedMigration>,
    pub dry_run: bool,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    /// Nothing was pending
    pub fn is_noop(&self) -> bool {
        self.planned.is_empty()
    }
}

/// Which applied migrations a rollback selects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownTarget {
    /// The most recent `n` applied migrations in reverse dependency order
    Steps(usize),
    /// Every applied migration with a version strictly greater than this one
    To(Version),
    /// Exactly one applied migration
    Only(Version),
}

impl Default for DownTarget {
    fn default() -> Self {
        DownTarget::Steps(1)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DownOptions {
    pub target: DownTarget,
    pub dry_run: bool,
    pub force: bool,
}

/// Outcome of a rollback run
#[derive(Debug, Default)]
pub struct RollbackReport {
    pub planned: Vec<MigrationPlan>,
    pub reverted: Vec<Version>,
    pub failed: Option<FailedMigration>,
    pub dry_run: bool,
}

impl RollbackReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }

    pub fn is_noop(&self) -> bool {
        self.planned.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    #[serde(flatten)]
    pub entry: LedgerEntry,
    /// A discovered record with this version exists
    pub on_disk: bool,
    /// `None` when the up source is not on disk
    pub checksum_valid: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingMigration {
    pub version: Version,
    pub name: String,
    pub is_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatusReport {
    pub current_version: Option<Version>,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<PendingMigration>,
}

impl MigrationStatusReport {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DependencyNode {
    pub version: Version,
    pub name: String,
    pub depends_on: Vec<Version>,
    pub dependents: Vec<Version>,
    pub applied: bool,
}

/// Graph dump returned by `deps()`
#[derive(Debug, Clone, Serialize)]
pub struct DependencyReport {
    pub nodes: Vec<DependencyNode>,
    pub cycles: Vec<Vec<Version>>,
    /// Forward apply order, present only when the graph is acyclic
    pub order: Option<Vec<Version>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyOutcome {
    Valid,
    Mismatch { stored: String, computed: String },
    MissingOnDisk,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyEntry {
    pub version: Version,
    pub name: String,
    #[serde(flatten)]
    pub outcome: VerifyOutcome,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub entries: Vec<VerifyEntry>,
}

impl VerifyReport {
    /// No applied migration has drifted
    pub fn is_valid(&self) -> bool {
        self.mismatches().next().is_none()
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &VerifyEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.outcome, VerifyOutcome::Mismatch { .. }))
    }
}

/// Paths written by `create_migration`
#[derive(Debug, Clone)]
pub struct CreatedMigration {
    pub version: Version,
    pub name: String,
    pub up_path: PathBuf,
    pub down_path: PathBuf,
    pub depends_on: Option<Version>,
}
