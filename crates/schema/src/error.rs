//! Error types for migration discovery, ordering and execution.

use std::path::PathBuf;
use thiserror::Error;

use crate::migrations::definitions::{Direction, Version};

/// Result alias used throughout the crate
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Coarse classification of a [`SchemaError`], stable across variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Discovery,
    Dependency,
    Checksum,
    Execution,
    Ledger,
}

/// Problems found while reading migration sources from disk
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Migrations directory does not exist: {}", path.display())]
    MissingDirectory { path: PathBuf },

    #[error("Invalid migration filename {}: {reason}", path.display())]
    InvalidFilename { path: PathBuf, reason: String },

    #[error("Invalid version '{value}': expected a non-empty string of digits")]
    InvalidVersion { value: String },

    #[error(
        "Duplicate migration version {version}: {} and {}",
        first.display(),
        second.display()
    )]
    DuplicateVersion {
        version: Version,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Malformed depends_on declaration in {}: '{token}'", path.display())]
    MalformedDependency { path: PathBuf, token: String },

    #[error("Migration {version} ({name}) is incomplete: missing {missing} file")]
    Incomplete {
        version: Version,
        name: String,
        missing: Direction,
    },

    #[error("Migration {version} has no {direction} source on disk")]
    MissingSource { version: Version, direction: Direction },

    #[error("Fixtures not found: {}", names.join(", "))]
    MissingFixture { names: Vec<String> },
}

/// Problems with the dependency graph or with the ledger relative to it
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("Migration {migration} depends on unknown migration {missing}")]
    Unknown { migration: Version, missing: Version },

    #[error("Circular dependency detected: {}", format_chain(cycle))]
    Cycle { cycle: Vec<Version> },

    #[error(
        "Migration {migration} depends on {dependency}, which is neither applied nor scheduled before it"
    )]
    Unmet {
        migration: Version,
        dependency: Version,
    },

    #[error(
        "Cannot roll back {migration}: still required by applied migration(s) {}",
        format_list(dependents)
    )]
    StillRequired {
        migration: Version,
        dependents: Vec<Version>,
    },
}

/// A ledger entry whose stored checksum no longer matches the file on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub version: Version,
    pub name: String,
    pub stored: String,
    pub computed: String,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error("Checksum validation failed: {}", describe_mismatches(mismatches))]
    Checksum { mismatches: Vec<ChecksumMismatch> },

    #[error("Migration {version} failed: {message}")]
    Execution { version: Version, message: String },

    #[error("Statement failed: {0}")]
    Statement(String),

    #[error("Ledger error: {0}")]
    Ledger(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Statement timed out after {seconds:.1}s")]
    Timeout { seconds: f64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] pgfast_core::ConfigError),
}

impl SchemaError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchemaError::Discovery(_) | SchemaError::Io(_) | SchemaError::Config(_) => {
                ErrorKind::Discovery
            }
            SchemaError::Dependency(_) => ErrorKind::Dependency,
            SchemaError::Checksum { .. } => ErrorKind::Checksum,
            SchemaError::Ledger(_) => ErrorKind::Ledger,
            SchemaError::Execution { .. }
            | SchemaError::Statement(_)
            | SchemaError::Connection(_)
            | SchemaError::Timeout { .. }
            | SchemaError::Database(_) => ErrorKind::Execution,
        }
    }

    /// Attach a migration version to a statement-level failure
    pub fn for_migration(self, version: Version) -> Self {
        match self {
            SchemaError::Statement(message) => SchemaError::Execution { version, message },
            SchemaError::Timeout { seconds } => SchemaError::Execution {
                version,
                message: format!("statement timed out after {:.1}s", seconds),
            },
            SchemaError::Database(e) => SchemaError::Execution {
                version,
                message: e.to_string(),
            },
            other => other,
        }
    }
}

fn format_list(versions: &[Version]) -> String {
    versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_chain(versions: &[Version]) -> String {
    versions
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn describe_mismatches(mismatches: &[ChecksumMismatch]) -> String {
    mismatches
        .iter()
        .map(|m| format!("migration {} ({}) has been modified", m.version, m.name))
        .collect::<Vec<_>>()
        .join("; ")
}
