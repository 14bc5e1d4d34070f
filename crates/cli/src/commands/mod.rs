pub mod fixtures;
pub mod init;
pub mod schema;
pub mod test_db;

use anyhow::Context;
use pgfast_core::{DatabaseConfig, EnvConfig};
use pgfast_schema::backends::PostgresPool;
use pgfast_schema::{MigrationConfig, MigrationEngine};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Settings shared by every subcommand, taken from the global flags
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub database_url: Option<String>,
    pub migrations_dirs: Vec<PathBuf>,
    pub config: Option<PathBuf>,
}

impl GlobalOptions {
    /// Resolve configuration: flags, then environment, then the YAML file, then defaults.
    /// Not validated, since `init` and `schema create` never connect.
    pub fn resolve(&self) -> anyhow::Result<DatabaseConfig> {
        let mut config = match &self.config {
            Some(path) => DatabaseConfig::read_yaml_file(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?,
            None => DatabaseConfig::default(),
        };
        config.apply_env_overrides()?;

        if let Some(url) = &self.database_url {
            config.url = url.clone();
            config.mark_set_by_flag("url", "--database-url");
        }
        if !self.migrations_dirs.is_empty() {
            config.migrations_dirs = self.migrations_dirs.clone();
            config.mark_set_by_flag("migrations_dirs", "--migrations-dir");
        }

        for (field, source) in config.config_sources() {
            debug!("{} <- {}", field, source);
        }
        Ok(config)
    }

    /// Validated configuration for commands that talk to the database
    pub fn database_config(&self) -> anyhow::Result<DatabaseConfig> {
        let config = self.resolve()?;
        config.validate()?;
        Ok(config)
    }

    pub async fn engine(&self) -> anyhow::Result<MigrationEngine> {
        let config = self.database_config()?;
        engine_for(&config).await
    }
}

/// Close the engine's pool, then surface the command's own error first
pub async fn close_after(engine: MigrationEngine, result: anyhow::Result<()>) -> anyhow::Result<()> {
    let closed = engine.close().await;
    result?;
    closed?;
    Ok(())
}

pub async fn engine_for(config: &DatabaseConfig) -> anyhow::Result<MigrationEngine> {
    let pool = PostgresPool::connect(config)
        .await
        .with_context(|| format!("failed to connect to {}", crate::utils::mask_url(&config.url)))?;
    Ok(MigrationEngine::new(Arc::new(pool), MigrationConfig::from(config))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial]
    fn test_flags_override_file_and_env() {
        std::env::remove_var("PGFAST_MIGRATIONS_DIR");
        std::env::set_var("DATABASE_URL", "postgresql://env-host/app");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "url: postgresql://file-host/app\nmigrations_table: schema_history").unwrap();

        let options = GlobalOptions {
            database_url: None,
            migrations_dirs: vec![PathBuf::from("sql/a"), PathBuf::from("sql/b")],
            config: Some(file.path().to_path_buf()),
        };
        let config = options.database_config().unwrap();
        assert_eq!(config.url, "postgresql://env-host/app");
        assert_eq!(config.migrations_table, "schema_history");
        assert_eq!(config.migrations_dirs.len(), 2);

        let sources = config.config_sources();
        assert!(sources["url"].is_env_var());
        assert!(sources["migrations_dirs"].is_flag());
        assert!(sources["migrations_table"].is_file());

        let options = GlobalOptions {
            database_url: Some("postgresql://flag-host/app".to_string()),
            ..options
        };
        let config = options.database_config().unwrap();
        assert_eq!(config.url, "postgresql://flag-host/app");
        assert_eq!(
            config.config_sources()["url"],
            pgfast_core::ConfigSource::Flag("--database-url".to_string())
        );

        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn test_resolve_without_url_is_allowed() {
        std::env::remove_var("DATABASE_URL");
        let options = GlobalOptions::default();
        assert!(options.resolve().is_ok());
        assert!(options.database_config().is_err());
    }
}
