//! PostgreSQL Backend Implementation
//!
//! Implements the backend traits on top of sqlx. Scripts are sent through the
//! simple query protocol so a migration file may hold several statements.

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, PgPool, Postgres, Row, TypeInfo, ValueRef};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use pgfast_core::DatabaseConfig;

use super::core::*;
use crate::error::{SchemaError, SchemaResult};

/// Build a sqlx pool from the database configuration
pub async fn create_pool(config: &DatabaseConfig) -> SchemaResult<PgPool> {
    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .connect(&config.url)
        .await
        .map_err(|e| SchemaError::Connection(format!("Failed to create PostgreSQL pool: {}", e)))
}

/// PostgreSQL connection pool implementation
#[derive(Clone)]
pub struct PostgresPool {
    pool: Arc<PgPool>,
    statement_timeout: Option<Duration>,
}

impl PostgresPool {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            statement_timeout: None,
        }
    }

    /// Connect using `config`, applying its command timeout server-side too
    pub async fn connect(config: &DatabaseConfig) -> SchemaResult<Self> {
        let pool = create_pool(config).await?;
        Ok(Self::new(pool).with_statement_timeout(config.command_timeout()))
    }

    /// Set `statement_timeout` on every transaction this pool opens
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    pub fn inner(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl DatabasePool for PostgresPool {
    async fn begin_transaction(&self) -> SchemaResult<Box<dyn DatabaseTransaction>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| SchemaError::Connection(format!("Failed to start transaction: {}", e)))?;

        if let Some(timeout) = self.statement_timeout {
            let sql = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
            (&mut *tx)
                .execute(sql.as_str())
                .await
                .map_err(statement_error)?;
        }

        Ok(Box::new(PostgresTransaction::new(tx)))
    }

    async fn execute(&self, sql: &str, params: &[DatabaseValue]) -> SchemaResult<u64> {
        let result = bind_all(sqlx::query(sql), params)
            .execute(&*self.pool)
            .await
            .map_err(statement_error)?;

        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, sql: &str, params: &[DatabaseValue]) -> SchemaResult<Vec<Box<dyn DatabaseRow>>> {
        let rows = bind_all(sqlx::query(sql), params)
            .fetch_all(&*self.pool)
            .await
            .map_err(statement_error)?;

        Ok(rows
            .into_iter()
            .map(|row| Box::new(PostgresRow::new(row)) as Box<dyn DatabaseRow>)
            .collect())
    }

    async fn close(&self) -> SchemaResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// PostgreSQL transaction implementation
pub struct PostgresTransaction {
    tx: Option<sqlx::Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    pub fn new(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    fn active(&mut self) -> SchemaResult<&mut sqlx::Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| SchemaError::Statement("Transaction already completed".to_string()))
    }
}

#[async_trait]
impl DatabaseTransaction for PostgresTransaction {
    async fn execute_script(&mut self, sql: &str) -> SchemaResult<()> {
        let tx = self.active()?;
        let result = (&mut **tx).execute(sql).await.map_err(statement_error)?;
        debug!("Script affected {} rows", result.rows_affected());
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[DatabaseValue]) -> SchemaResult<u64> {
        let tx = self.active()?;
        let result = bind_all(sqlx::query(sql), params)
            .execute(&mut **tx)
            .await
            .map_err(statement_error)?;

        Ok(result.rows_affected())
    }

    async fn commit(mut self: Box<Self>) -> SchemaResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SchemaError::Statement("Transaction already completed".to_string()))?;

        tx.commit()
            .await
            .map_err(|e| SchemaError::Statement(format!("Transaction commit failed: {}", e)))
    }

    async fn rollback(mut self: Box<Self>) -> SchemaResult<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SchemaError::Statement("Transaction already completed".to_string()))?;

        tx.rollback()
            .await
            .map_err(|e| SchemaError::Statement(format!("Transaction rollback failed: {}", e)))
    }
}

/// PostgreSQL row implementation
pub struct PostgresRow {
    row: PgRow,
}

impl PostgresRow {
    pub fn new(row: PgRow) -> Self {
        Self { row }
    }
}

impl DatabaseRow for PostgresRow {
    fn get_by_name(&self, name: &str) -> SchemaResult<DatabaseValue> {
        let index = self
            .row
            .columns()
            .iter()
            .position(|col| col.name() == name)
            .ok_or_else(|| SchemaError::Ledger(format!("Column '{}' not found", name)))?;

        postgres_value_to_database_value(&self.row, index)
    }
}

fn statement_error(e: sqlx::Error) -> SchemaError {
    match e {
        sqlx::Error::Database(db) => SchemaError::Statement(db.message().to_string()),
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            SchemaError::Connection(e.to_string())
        }
        other => SchemaError::Database(other),
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &[DatabaseValue],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            DatabaseValue::Null => query.bind(Option::<String>::None),
            DatabaseValue::Bool(b) => query.bind(*b),
            DatabaseValue::Int32(i) => query.bind(*i),
            DatabaseValue::Int64(i) => query.bind(*i),
            DatabaseValue::String(s) => query.bind(s.clone()),
            DatabaseValue::DateTime(dt) => query.bind(*dt),
        };
    }
    query
}

fn postgres_value_to_database_value(row: &PgRow, index: usize) -> SchemaResult<DatabaseValue> {
    let raw = row
        .try_get_raw(index)
        .map_err(|e| SchemaError::Ledger(format!("Failed to read column {}: {}", index, e)))?;
    if raw.is_null() {
        return Ok(DatabaseValue::Null);
    }

    let type_name = row.columns()[index].type_info().name().to_string();
    let read_error =
        |e: sqlx::Error| SchemaError::Ledger(format!("Failed to read {} column: {}", type_name, e));

    match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(index).map(DatabaseValue::Bool).map_err(read_error),
        "INT2" => row
            .try_get::<i16, _>(index)
            .map(|v| DatabaseValue::Int32(i32::from(v)))
            .map_err(read_error),
        "INT4" => row.try_get::<i32, _>(index).map(DatabaseValue::Int32).map_err(read_error),
        "INT8" => row.try_get::<i64, _>(index).map(DatabaseValue::Int64).map_err(read_error),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(index)
            .map(DatabaseValue::DateTime)
            .map_err(read_error),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(index)
            .map(|naive| DatabaseValue::DateTime(naive.and_utc()))
            .map_err(read_error),
        _ => row.try_get::<String, _>(index).map(DatabaseValue::String).map_err(read_error),
    }
}
