//! Core Database Backend Traits
//!
//! The engine only needs a narrow slice of a database: open a transaction,
//! run opaque SQL inside it, run a few parameterized ledger statements, and
//! read ledger rows back. These traits describe that slice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{SchemaError, SchemaResult};

/// Connection pool handed to the engine
#[async_trait]
pub trait DatabasePool: Send + Sync {
    /// Begin a transaction on a pooled connection
    async fn begin_transaction(&self) -> SchemaResult<Box<dyn DatabaseTransaction>>;

    /// Execute a parameterized statement outside any transaction
    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> SchemaResult<u64>;

    /// Execute a query and return the result rows
    async fn fetch_all(&self, sql: &str, params: &[DatabaseValue]) -> SchemaResult<Vec<Box<dyn DatabaseRow>>>;

    /// Close the pool
    async fn close(&self) -> SchemaResult<()>;
}

/// An open transaction.
///
/// Dropping it without calling `commit` must roll it back.
#[async_trait]
pub trait DatabaseTransaction: Send {
    /// Run a script of one or more statements verbatim, without parameters
    async fn execute_script(&mut self, sql: &str) -> SchemaResult<()>;

    /// Execute a parameterized statement within the transaction
    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> SchemaResult<u64>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> SchemaResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> SchemaResult<()>;
}

/// Column access for rows returned by [`DatabasePool::fetch_all`]
pub trait DatabaseRow: Send + Sync {
    fn get_by_name(&self, name: &str) -> SchemaResult<DatabaseValue>;
}

/// Values bound to, or read from, ledger statements
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl DatabaseValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DatabaseValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DatabaseValue::Int32(i) => Some(i64::from(*i)),
            DatabaseValue::Int64(i) => Some(*i),
            DatabaseValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DatabaseValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            DatabaseValue::DateTime(dt) => Some(*dt),
            DatabaseValue::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            _ => None,
        }
    }
}

impl From<bool> for DatabaseValue {
    fn from(value: bool) -> Self {
        DatabaseValue::Bool(value)
    }
}

impl From<i32> for DatabaseValue {
    fn from(value: i32) -> Self {
        DatabaseValue::Int32(value)
    }
}

impl From<i64> for DatabaseValue {
    fn from(value: i64) -> Self {
        DatabaseValue::Int64(value)
    }
}

impl From<String> for DatabaseValue {
    fn from(value: String) -> Self {
        DatabaseValue::String(value)
    }
}

impl From<&str> for DatabaseValue {
    fn from(value: &str) -> Self {
        DatabaseValue::String(value.to_string())
    }
}

impl From<DateTime<Utc>> for DatabaseValue {
    fn from(value: DateTime<Utc>) -> Self {
        DatabaseValue::DateTime(value)
    }
}

impl<T: Into<DatabaseValue>> From<Option<T>> for DatabaseValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(DatabaseValue::Null)
    }
}

/// Typed column access on top of [`DatabaseRow`]
pub trait DatabaseRowExt {
    fn get_i64(&self, column: &str) -> SchemaResult<i64>;
    fn get_string(&self, column: &str) -> SchemaResult<String>;
    fn get_datetime(&self, column: &str) -> SchemaResult<DateTime<Utc>>;
}

impl<R: DatabaseRow + ?Sized> DatabaseRowExt for R {
    fn get_i64(&self, column: &str) -> SchemaResult<i64> {
        self.get_by_name(column)?
            .as_i64()
            .ok_or_else(|| column_type_error(column, "integer"))
    }

    fn get_string(&self, column: &str) -> SchemaResult<String> {
        match self.get_by_name(column)? {
            DatabaseValue::String(s) => Ok(s),
            _ => Err(column_type_error(column, "text")),
        }
    }

    fn get_datetime(&self, column: &str) -> SchemaResult<DateTime<Utc>> {
        self.get_by_name(column)?
            .as_datetime()
            .ok_or_else(|| column_type_error(column, "timestamp"))
    }
}

fn column_type_error(column: &str, expected: &str) -> SchemaError {
    SchemaError::Ledger(format!("Column '{}' is not a {} value", column, expected))
}
