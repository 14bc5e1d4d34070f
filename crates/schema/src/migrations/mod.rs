//! Versioned, dependency-ordered schema migrations
//!
//! Discovery, graph ordering, checksum validation, the ledger, and the
//! transactional apply/rollback engine.

pub mod checksum;
pub mod definitions;
pub mod graph;
pub mod ledger;
pub mod rollback;
pub mod runner;
pub mod scanner;


pub use definitions::*;
pub use graph::DependencyGraph;
pub use ledger::Ledger;
pub use rollback::MigrationRollback;
pub use runner::{create_migration, normalize_name, MigrationEngine};
pub use scanner::{parse_dependencies, scan, Discovery};
