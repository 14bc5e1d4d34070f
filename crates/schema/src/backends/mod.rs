//! Database Backend Abstractions
//!
//! The engine talks to the database only through the traits in [`core`].
//! PostgreSQL is the production implementation.

pub mod core;
pub mod postgres;

#[cfg(test)]
pub(crate) mod memory;

pub use self::core::*;
pub use postgres::{create_pool, PostgresPool, PostgresTransaction};
