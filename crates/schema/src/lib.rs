//! # pgfast-schema: versioned SQL migrations for PostgreSQL
//!
//! Migrations are pairs of `{version}_{name}_up.sql` / `_down.sql` files.
//! An up file may declare `-- depends_on: <version>, ...` near its top; the
//! engine applies migrations in dependency order, breaking ties by version,
//! and records each one in a ledger table inside the same transaction.
//!
//! ```no_run
//! use std::sync::Arc;
//! use pgfast_schema::prelude::*;
//!
//! # async fn run(config: pgfast_core::DatabaseConfig) -> SchemaResult<()> {
//! let pool = PostgresPool::connect(&config).await?;
//! let engine = MigrationEngine::new(Arc::new(pool), MigrationConfig::from(&config))?;
//! let report = engine.up(UpOptions::default()).await?;
//! println!("applied {} migration(s)", report.applied.len());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod error;
pub mod fixtures;
pub mod migrations;

pub use error::*;
pub use fixtures::{Fixture, FixtureLoader};
pub use migrations::*;

pub mod prelude {
    pub use crate::backends::{DatabasePool, DatabaseTransaction, PostgresPool};
    pub use crate::error::{SchemaError, SchemaResult};
    pub use crate::fixtures::FixtureLoader;
    pub use crate::migrations::{
        DownOptions, DownTarget, MigrationConfig, MigrationEngine, MigrationRollback, UpOptions,
        Version,
    };
}
