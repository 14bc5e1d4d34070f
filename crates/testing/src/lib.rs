//! # pgfast-testing
//!
//! Throwaway databases for integration tests. A template database is
//! migrated once; every test then clones it, falling back to a fresh
//! database plus a full migration run when the template stays busy.
//!
//! ```no_run
//! use pgfast_testing::prelude::*;
//!
//! # async fn run(config: pgfast_core::DatabaseConfig) -> TestResult<()> {
//! let manager = TestDatabaseManager::new(config)?;
//! let template = manager.create_template_db().await?;
//! let outcome = manager.clone_from_template(&template, RetryPolicy::default()).await?;
//! // ... exercise outcome.database.pool() ...
//! outcome.database.cleanup().await?;
//! template.destroy().await?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod retry;

pub use database::{TemplateDatabase, TestDatabase, TestDatabaseManager, TEST_DATABASE_PREFIX};
pub use retry::{is_contention, CloneOutcome, CloneStrategy, RetryOutcome, RetryPolicy};

pub mod prelude {
    pub use crate::{
        database::{TemplateDatabase, TestDatabase, TestDatabaseManager},
        retry::{CloneOutcome, CloneStrategy, RetryPolicy},
        utils, TestError, TestResult,
    };
}

#[derive(thiserror::Error, Debug)]
pub enum TestError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Schema(#[from] pgfast_schema::SchemaError),

    #[error("Configuration error: {0}")]
    Config(#[from] pgfast_core::ConfigError),

    #[error("Template database {template} is busy: {message}")]
    TemplateBusy { template: String, message: String },

    #[error("Invalid database name: {0}")]
    InvalidName(String),
}

pub type TestResult<T> = Result<T, TestError>;

pub mod utils {
    use crate::database::TEST_DATABASE_PREFIX;

    /// `pgfast_test_` followed by 8 hex chars of a v4 uuid
    pub fn test_database_name() -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}{}", TEST_DATABASE_PREFIX, &id[..8])
    }

    pub fn is_test_database_name(name: &str) -> bool {
        name.strip_prefix(TEST_DATABASE_PREFIX)
            .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
    }
}

#[cfg(test)]
mod tests {
    use super::utils::*;

    #[test]
    fn test_database_names() {
        let name = test_database_name();
        assert!(name.starts_with("pgfast_test_"));
        let suffix = &name["pgfast_test_".len()..];
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(is_test_database_name(&name));
        assert_ne!(name, test_database_name());
    }

    #[test]
    fn test_recognizes_foreign_names() {
        assert!(!is_test_database_name("postgres"));
        assert!(!is_test_database_name("pgfast_test_"));
        assert!(!is_test_database_name("pgfast_test_x; DROP"));
    }
}
