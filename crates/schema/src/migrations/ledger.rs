//! Ledger - the table recording which migrations are applied.
//!
//! Rows are written and deleted inside the same transaction as the schema
//! change they describe.

use chrono::Utc;
use tracing::debug;

use super::definitions::{LedgerEntry, Migration, Version};
use crate::backends::{DatabasePool, DatabaseRowExt, DatabaseTransaction, DatabaseValue};
use crate::error::{SchemaError, SchemaResult};

#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    /// `table` must be a plain identifier; it is interpolated into SQL.
    pub fn new(table: impl Into<String>) -> SchemaResult<Self> {
        let table = table.into();
        if !pgfast_core::is_valid_identifier(&table) {
            return Err(SchemaError::Ledger(format!(
                "Invalid ledger table name '{}'",
                table
            )));
        }
        Ok(Self { table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
             version BIGINT PRIMARY KEY,\n    \
             name VARCHAR(255) NOT NULL,\n    \
             checksum VARCHAR(64) NOT NULL,\n    \
             applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()\n)",
            self.table
        )
    }

    pub fn select_sql(&self) -> String {
        format!(
            "SELECT version, name, checksum, applied_at FROM {} ORDER BY version",
            self.table
        )
    }

    pub fn record_sql(&self, migration: &Migration) -> (String, Vec<DatabaseValue>) {
        let sql = format!(
            "INSERT INTO {} (version, name, checksum, applied_at) VALUES ($1, $2, $3, $4)",
            self.table
        );
        let params = vec![
            DatabaseValue::Int64(migration.version.as_i64()),
            DatabaseValue::String(migration.name.clone()),
            DatabaseValue::String(migration.checksum().unwrap_or_default().to_string()),
            DatabaseValue::DateTime(Utc::now()),
        ];
        (sql, params)
    }

    pub fn remove_sql(&self, version: Version) -> (String, Vec<DatabaseValue>) {
        let sql = format!("DELETE FROM {} WHERE version = $1", self.table);
        (sql, vec![DatabaseValue::Int64(version.as_i64())])
    }

    /// Create the table if it does not exist yet
    pub async fn ensure(&self, pool: &dyn DatabasePool) -> SchemaResult<()> {
        pool.execute(&self.create_table_sql(), &[])
            .await
            .map_err(|e| SchemaError::Ledger(format!("Failed to create ledger table {}: {}", self.table, e)))?;
        debug!("Ledger table {} is ready", self.table);
        Ok(())
    }

    /// All applied migrations, ascending by version
    pub async fn entries(&self, pool: &dyn DatabasePool) -> SchemaResult<Vec<LedgerEntry>> {
        let rows = pool
            .fetch_all(&self.select_sql(), &[])
            .await
            .map_err(|e| SchemaError::Ledger(format!("Failed to read ledger table {}: {}", self.table, e)))?;

        rows.iter()
            .map(|row| {
                Ok(LedgerEntry {
                    version: Version::new(row.get_i64("version")?),
                    name: row.get_string("name")?,
                    checksum: row.get_string("checksum")?,
                    applied_at: row.get_datetime("applied_at")?,
                })
            })
            .collect()
    }

    pub async fn record(&self, tx: &mut dyn DatabaseTransaction, migration: &Migration) -> SchemaResult<()> {
        let (sql, params) = self.record_sql(migration);
        tx.execute(&sql, &params).await.map_err(|e| {
            SchemaError::Ledger(format!("Failed to record migration {}: {}", migration.version, e))
        })?;
        Ok(())
    }

    pub async fn remove(&self, tx: &mut dyn DatabaseTransaction, version: Version) -> SchemaResult<()> {
        let (sql, params) = self.remove_sql(version);
        let removed = tx.execute(&sql, &params).await.map_err(|e| {
            SchemaError::Ledger(format!("Failed to remove migration {}: {}", version, e))
        })?;
        if removed != 1 {
            return Err(SchemaError::Ledger(format!(
                "Expected to remove one ledger row for {}, removed {}",
                version, removed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryPool;

    #[test]
    fn test_rejects_unsafe_table_names() {
        assert!(Ledger::new("_pgfast_migrations").is_ok());
        assert!(Ledger::new("schema_history2").is_ok());
        assert!(Ledger::new("x; DROP TABLE users").is_err());
        assert!(Ledger::new("").is_err());
        assert!(Ledger::new("1abc").is_err());
    }

    #[test]
    fn test_create_table_sql_shape() {
        let sql = Ledger::new("_pgfast_migrations").unwrap().create_table_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS _pgfast_migrations"));
        assert!(sql.contains("version BIGINT PRIMARY KEY"));
        assert!(sql.contains("checksum VARCHAR(64) NOT NULL"));
        assert!(sql.contains("applied_at TIMESTAMPTZ"));
    }

    #[tokio::test]
    async fn test_record_and_remove_round_trip() {
        let pool = MemoryPool::new();
        let ledger = Ledger::new("_pgfast_migrations").unwrap();
        ledger.ensure(&pool).await.unwrap();
        ledger.ensure(&pool).await.unwrap();
        assert!(ledger.entries(&pool).await.unwrap().is_empty());

        let migration = Migration::new(Version::new(20250101000000), "create_users")
            .with_up("up", "CREATE TABLE users (id INT);")
            .with_down("down", "DROP TABLE users;");

        let mut tx = pool.begin_transaction().await.unwrap();
        ledger.record(tx.as_mut(), &migration).await.unwrap();
        tx.commit().await.unwrap();

        let entries = ledger.entries(&pool).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].version, migration.version);
        assert_eq!(entries[0].name, "create_users");
        assert_eq!(Some(entries[0].checksum.as_str()), migration.checksum());

        let mut tx = pool.begin_transaction().await.unwrap();
        ledger.remove(tx.as_mut(), migration.version).await.unwrap();
        tx.commit().await.unwrap();
        assert!(ledger.entries(&pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unreadable_ledger_is_ledger_error() {
        let pool = MemoryPool::new();
        let ledger = Ledger::new("_pgfast_migrations").unwrap();
        let err = ledger.entries(&pool).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Ledger);
    }
}
