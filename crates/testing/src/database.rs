//! Test database lifecycle
//!
//! Databases are created through the server's `postgres` maintenance database
//! and named `pgfast_test_{8 hex}` so stray ones can be listed and dropped.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use pgfast_core::{is_valid_identifier, DatabaseConfig, EnvConfig};
use pgfast_schema::backends::PostgresPool;
use pgfast_schema::{FixtureLoader, MigrationConfig, MigrationEngine, UpOptions};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info, warn};

use crate::retry::{is_contention_error, retry_on_contention, CloneOutcome, CloneStrategy, RetryOutcome, RetryPolicy};
use crate::{utils, TestError, TestResult};

pub const TEST_DATABASE_PREFIX: &str = "pgfast_test_";

/// Creates, clones and drops test databases on the server `config.url` points at
#[derive(Debug, Clone)]
pub struct TestDatabaseManager {
    config: DatabaseConfig,
    admin_url: String,
}

/// A live test database. Dropping the handle leaves the database behind;
/// call [`TestDatabase::cleanup`].
#[derive(Debug)]
pub struct TestDatabase {
    name: String,
    config: DatabaseConfig,
    admin_url: String,
    pool: PgPool,
}

/// A migrated database marked `IS_TEMPLATE`
#[derive(Debug)]
pub struct TemplateDatabase {
    name: String,
    admin_url: String,
    config: DatabaseConfig,
}

impl TestDatabaseManager {
    pub fn new(config: DatabaseConfig) -> TestResult<Self> {
        config.validate()?;
        let admin_url = config.admin_url()?;
        Ok(Self { config, admin_url })
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    async fn admin(&self) -> TestResult<PgPool> {
        connect_admin(&self.admin_url, &self.config).await
    }

    /// Create an empty database, or a copy of `template`
    pub async fn create_test_db(&self, template: Option<&str>) -> TestResult<TestDatabase> {
        if let Some(template) = template {
            if !is_valid_identifier(template) {
                return Err(TestError::InvalidName(template.to_string()));
            }
        }

        let name = utils::test_database_name();
        let sql = match template {
            Some(template) => format!("CREATE DATABASE \"{}\" TEMPLATE \"{}\"", name, template),
            None => format!("CREATE DATABASE \"{}\"", name),
        };

        let admin = self.admin().await?;
        let created = sqlx::query(&sql).execute(&admin).await;
        admin.close().await;

        if let Err(e) = created {
            return Err(match template {
                Some(template) if is_contention_error(&e) => TestError::TemplateBusy {
                    template: template.to_string(),
                    message: e.to_string(),
                },
                _ => TestError::Database(e),
            });
        }

        let config = self.config.clone().with_url(self.config.url_for_database(&name)?);
        let pool = self.connect_or_drop(&name, &config.url).await?;

        match template {
            Some(template) => info!("Created test database {} from template {}", name, template),
            None => info!("Created test database {}", name),
        }

        Ok(TestDatabase {
            name,
            config,
            admin_url: self.admin_url.clone(),
            pool,
        })
    }

    /// Connect to a freshly created database, dropping it again if that fails
    async fn connect_or_drop(&self, name: &str, url: &str) -> TestResult<PgPool> {
        let connected = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(self.config.max_connections)
            .acquire_timeout(self.config.acquire_timeout())
            .connect(url)
            .await;

        match connected {
            Ok(pool) => Ok(pool),
            Err(e) => {
                warn!("Could not connect to new database {}, dropping it: {}", name, e);
                let admin = self.admin().await?;
                if let Err(drop_error) = drop_database(&admin, name, false).await {
                    warn!("Failed to drop {}: {}", name, drop_error);
                }
                admin.close().await;
                Err(TestError::Database(e))
            }
        }
    }

    /// Create a database, migrate it fully and mark it as a template
    pub async fn create_template_db(&self) -> TestResult<TemplateDatabase> {
        let database = self.create_test_db(None).await?;
        if let Err(e) = database.migrate().await {
            database.cleanup().await?;
            return Err(e);
        }

        let name = database.name.clone();
        let config = database.config.clone();
        database.pool.close().await;

        let admin = self.admin().await?;
        terminate_connections(&admin, &name).await?;
        sqlx::query(&format!("ALTER DATABASE \"{}\" IS_TEMPLATE true", name))
            .execute(&admin)
            .await?;
        admin.close().await;

        info!("Template database {} is ready", name);
        Ok(TemplateDatabase {
            name,
            admin_url: self.admin_url.clone(),
            config,
        })
    }

    /// Clone `template`, retrying while it is busy. Once the policy is
    /// exhausted a fresh database is created and migrated from scratch.
    pub async fn clone_from_template(
        &self,
        template: &TemplateDatabase,
        policy: RetryPolicy,
    ) -> TestResult<CloneOutcome> {
        let start = Instant::now();
        let outcome = retry_on_contention(&policy, |_| self.create_test_db(Some(&template.name))).await?;

        match outcome {
            RetryOutcome::Succeeded { value, attempts } => {
                debug!(
                    "Cloned {} from {} in {}ms ({} attempt(s))",
                    value.name,
                    template.name,
                    start.elapsed().as_millis(),
                    attempts
                );
                Ok(CloneOutcome {
                    database: value,
                    strategy: CloneStrategy::Template { attempts },
                })
            }
            RetryOutcome::Exhausted { attempts } => {
                warn!(
                    "Template {} still busy after {} attempt(s), migrating a fresh database",
                    template.name, attempts
                );
                let database = self.create_test_db(None).await?;
                if let Err(e) = database.migrate().await {
                    database.cleanup().await?;
                    return Err(e);
                }
                Ok(CloneOutcome {
                    database,
                    strategy: CloneStrategy::Fallback { attempts },
                })
            }
        }
    }

    /// Every `pgfast_test_*` database on the server
    pub async fn list_test_dbs(&self) -> TestResult<Vec<String>> {
        let admin = self.admin().await?;
        let rows = sqlx::query(r"SELECT datname FROM pg_database WHERE datname LIKE 'pgfast\_test\_%' ORDER BY datname")
            .fetch_all(&admin)
            .await;
        admin.close().await;

        rows?
            .iter()
            .map(|row| row.try_get::<String, _>("datname").map_err(TestError::from))
            .collect()
    }

    /// Drop every test database, templates included. Returns the dropped names.
    pub async fn cleanup_all(&self) -> TestResult<Vec<String>> {
        let names = self.list_test_dbs().await?;
        if names.is_empty() {
            return Ok(names);
        }

        let admin = self.admin().await?;
        let mut dropped = Vec::with_capacity(names.len());
        for name in names {
            if !utils::is_test_database_name(&name) {
                warn!("Skipping unexpected database name {}", name);
                continue;
            }
            drop_database(&admin, &name, true).await?;
            dropped.push(name);
        }
        admin.close().await;

        info!("Dropped {} test database(s)", dropped.len());
        Ok(dropped)
    }

    /// Load fixtures into `database`; `None` loads everything under the configured fixture dirs
    pub async fn load_fixtures(
        &self,
        database: &TestDatabase,
        paths: Option<&[PathBuf]>,
    ) -> TestResult<Vec<PathBuf>> {
        database.load_fixtures(paths).await
    }
}

impl TestDatabase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Migration engine bound to this database
    pub fn engine(&self) -> TestResult<MigrationEngine> {
        let pool = PostgresPool::new(self.pool.clone()).with_statement_timeout(self.config.command_timeout());
        Ok(MigrationEngine::new(
            Arc::new(pool),
            MigrationConfig::from(&self.config),
        )?)
    }

    /// Apply every pending migration; a partial apply is an error
    pub async fn migrate(&self) -> TestResult<()> {
        let mut report = self.engine()?.up(UpOptions::default()).await?;
        match report.failed.take() {
            Some(failed) => Err(TestError::Schema(failed.error)),
            None => {
                debug!("Applied {} migration(s) to {}", report.applied.len(), self.name);
                Ok(())
            }
        }
    }

    pub async fn load_fixtures(&self, paths: Option<&[PathBuf]>) -> TestResult<Vec<PathBuf>> {
        let engine = self.engine()?;
        let loader = FixtureLoader::for_engine(&engine, self.config.fixtures_dirs.clone())?;
        Ok(loader.load(paths.unwrap_or(&[])).await?)
    }

    /// Close the pool, kick out remaining sessions and drop the database
    pub async fn cleanup(self) -> TestResult<()> {
        self.pool.close().await;
        let admin = connect_admin(&self.admin_url, &self.config).await?;
        drop_database(&admin, &self.name, false).await?;
        admin.close().await;
        info!("Dropped test database {}", self.name);
        Ok(())
    }
}

impl TemplateDatabase {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    /// Unmark and drop the template
    pub async fn destroy(self) -> TestResult<()> {
        let admin = connect_admin(&self.admin_url, &self.config).await?;
        drop_database(&admin, &self.name, true).await?;
        admin.close().await;
        info!("Dropped template database {}", self.name);
        Ok(())
    }
}

async fn connect_admin(admin_url: &str, config: &DatabaseConfig) -> TestResult<PgPool> {
    Ok(PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(config.acquire_timeout())
        .connect(admin_url)
        .await?)
}

async fn terminate_connections(admin: &PgPool, name: &str) -> TestResult<()> {
    sqlx::query("SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = $1 AND pid <> pg_backend_pid()")
        .bind(name)
        .execute(admin)
        .await?;
    Ok(())
}

async fn drop_database(admin: &PgPool, name: &str, unmark_template: bool) -> TestResult<()> {
    if unmark_template {
        sqlx::query(&format!("ALTER DATABASE \"{}\" IS_TEMPLATE false", name))
            .execute(admin)
            .await?;
    }
    terminate_connections(admin, name).await?;
    sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\"", name))
        .execute(admin)
        .await?;
    Ok(())
}
