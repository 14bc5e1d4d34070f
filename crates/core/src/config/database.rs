use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::sources::ConfigSource;
use super::validation::{ConfigError, ConfigValidator, IdentifierValidator, UrlValidator};

pub const DEFAULT_MIGRATIONS_DIR: &str = "db/migrations";
pub const DEFAULT_FIXTURES_DIR: &str = "db/fixtures";
pub const DEFAULT_MIGRATIONS_TABLE: &str = "_pgfast_migrations";

/// Environment-driven configuration
pub trait EnvConfig: Sized {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self, ConfigError>;

    /// Validate the configuration
    fn validate(&self) -> Result<(), ConfigError>;

    /// Get configuration source information for debugging
    fn config_sources(&self) -> HashMap<String, ConfigSource>;
}

/// Connection and migration settings shared by every pgfast component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    /// Pool acquire timeout in seconds
    pub timeout: f64,
    /// Per-statement timeout in seconds
    pub command_timeout: f64,
    pub migrations_dirs: Vec<PathBuf>,
    pub fixtures_dirs: Vec<PathBuf>,
    pub migrations_table: String,
    pub strict: bool,
    #[serde(skip)]
    source_file: Option<PathBuf>,
    /// field name -> flag that set it
    #[serde(skip)]
    flag_fields: BTreeMap<String, String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            min_connections: 5,
            max_connections: 20,
            timeout: 10.0,
            command_timeout: 60.0,
            migrations_dirs: vec![PathBuf::from(DEFAULT_MIGRATIONS_DIR)],
            fixtures_dirs: vec![PathBuf::from(DEFAULT_FIXTURES_DIR)],
            migrations_table: DEFAULT_MIGRATIONS_TABLE.to_string(),
            strict: false,
            source_file: None,
            flag_fields: BTreeMap::new(),
        }
    }
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_migrations_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.migrations_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fixtures_dirs<I, P>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.fixtures_dirs = dirs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_migrations_table(mut self, table: impl Into<String>) -> Self {
        self.migrations_table = table.into();
        self
    }

    pub fn with_pool_size(mut self, min: u32, max: u32) -> Self {
        self.min_connections = min;
        self.max_connections = max;
        self
    }

    pub fn with_command_timeout(mut self, seconds: f64) -> Self {
        self.command_timeout = seconds;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Record that `field` was last set from the command-line `flag`
    pub fn mark_set_by_flag(&mut self, field: &str, flag: &str) {
        self.flag_fields.insert(field.to_string(), flag.to_string());
    }

    /// Parse a YAML file without validating it. Missing fields keep their defaults.
    pub fn read_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut config: DatabaseConfig = serde_yaml::from_str(&contents)?;
        config.source_file = Some(path.to_path_buf());
        Ok(config)
    }

    /// Load and validate a YAML file; `DATABASE_URL` fills in `url` when the
    /// file leaves it out.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut config = Self::read_yaml_file(path)?;

        if config.url.is_empty() {
            if let Ok(url) = env::var("DATABASE_URL") {
                config.url = url;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Overwrite fields with any `DATABASE_URL` / `PGFAST_*` variables that are set
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("DATABASE_URL") {
            self.url = url;
        }
        if let Ok(dirs) = env::var("PGFAST_MIGRATIONS_DIR") {
            self.migrations_dirs = split_paths(&dirs);
        }
        if let Ok(dirs) = env::var("PGFAST_FIXTURES_DIR") {
            self.fixtures_dirs = split_paths(&dirs);
        }
        if let Ok(value) = env::var("PGFAST_MIN_CONNECTIONS") {
            self.min_connections = parse_var("min_connections", value, "positive integer")?;
        }
        if let Ok(value) = env::var("PGFAST_MAX_CONNECTIONS") {
            self.max_connections = parse_var("max_connections", value, "positive integer")?;
        }
        if let Ok(value) = env::var("PGFAST_TIMEOUT") {
            self.timeout = parse_var("timeout", value, "seconds as a number")?;
        }
        if let Ok(value) = env::var("PGFAST_COMMAND_TIMEOUT") {
            self.command_timeout = parse_var("command_timeout", value, "seconds as a number")?;
        }
        if let Ok(table) = env::var("PGFAST_MIGRATIONS_TABLE") {
            self.migrations_table = table;
        }
        if let Ok(value) = env::var("PGFAST_STRICT") {
            self.strict = parse_bool("strict", &value)?;
        }
        Ok(())
    }

    /// Saturates instead of panicking on values `validate` would reject
    pub fn command_timeout(&self) -> Duration {
        seconds_to_duration(self.command_timeout)
    }

    pub fn acquire_timeout(&self) -> Duration {
        seconds_to_duration(self.timeout)
    }

    /// Same server, `postgres` maintenance database
    pub fn admin_url(&self) -> Result<String, ConfigError> {
        self.url_for_database("postgres")
    }

    /// Same server and credentials, different database
    pub fn url_for_database(&self, database: &str) -> Result<String, ConfigError> {
        let mut url = url::Url::parse(&self.url).map_err(|_| {
            ConfigError::invalid_value("url", &self.url, "valid PostgreSQL connection URL")
        })?;
        url.set_path(&format!("/{}", database));
        Ok(url.to_string())
    }

    /// Database name from the URL path, if any
    pub fn database_name(&self) -> Option<String> {
        let url = url::Url::parse(&self.url).ok()?;
        let name = url.path().trim_start_matches('/');
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

impl EnvConfig for DatabaseConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::missing_required(
                "url",
                "Set DATABASE_URL or pass --database-url",
            ));
        }
        UrlValidator::postgres("url").validate(self.url.as_str())?;

        if self.min_connections == 0 {
            return Err(ConfigError::invalid_value(
                "min_connections",
                self.min_connections.to_string(),
                "value greater than 0",
            ));
        }
        if self.max_connections < self.min_connections {
            return Err(ConfigError::invalid_value(
                "max_connections",
                self.max_connections.to_string(),
                format!("value >= min_connections ({})", self.min_connections),
            ));
        }
        validate_seconds("timeout", self.timeout)?;
        validate_seconds("command_timeout", self.command_timeout)?;

        IdentifierValidator {
            field: "migrations_table",
        }
        .validate(self.migrations_table.as_str())
    }

    fn config_sources(&self) -> HashMap<String, ConfigSource> {
        let defaults = Self::default();
        let fields: [(&str, &str, String, String); 9] = [
            ("url", "DATABASE_URL", self.url.clone(), defaults.url.clone()),
            (
                "migrations_dirs",
                "PGFAST_MIGRATIONS_DIR",
                join_paths(&self.migrations_dirs),
                join_paths(&defaults.migrations_dirs),
            ),
            (
                "fixtures_dirs",
                "PGFAST_FIXTURES_DIR",
                join_paths(&self.fixtures_dirs),
                join_paths(&defaults.fixtures_dirs),
            ),
            (
                "min_connections",
                "PGFAST_MIN_CONNECTIONS",
                self.min_connections.to_string(),
                defaults.min_connections.to_string(),
            ),
            (
                "max_connections",
                "PGFAST_MAX_CONNECTIONS",
                self.max_connections.to_string(),
                defaults.max_connections.to_string(),
            ),
            (
                "timeout",
                "PGFAST_TIMEOUT",
                self.timeout.to_string(),
                defaults.timeout.to_string(),
            ),
            (
                "command_timeout",
                "PGFAST_COMMAND_TIMEOUT",
                self.command_timeout.to_string(),
                defaults.command_timeout.to_string(),
            ),
            (
                "migrations_table",
                "PGFAST_MIGRATIONS_TABLE",
                self.migrations_table.clone(),
                defaults.migrations_table.clone(),
            ),
            (
                "strict",
                "PGFAST_STRICT",
                self.strict.to_string(),
                defaults.strict.to_string(),
            ),
        ];

        fields
            .into_iter()
            .map(|(field, var, current, default)| {
                let source = if let Some(flag) = self.flag_fields.get(field) {
                    ConfigSource::Flag(flag.clone())
                } else if env::var(var).is_ok() {
                    ConfigSource::EnvVar(var.to_string())
                } else if current == default {
                    ConfigSource::Default(default)
                } else if let Some(path) = &self.source_file {
                    ConfigSource::File(path.display().to_string())
                } else {
                    ConfigSource::Programmatic
                };
                (field.to_string(), source)
            })
            .collect()
    }
}

fn validate_seconds(field: &str, seconds: f64) -> Result<(), ConfigError> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if !duration.is_zero() => Ok(()),
        _ => Err(ConfigError::invalid_value(
            field,
            seconds.to_string(),
            "positive number of seconds that fits a duration",
        )),
    }
}

fn seconds_to_duration(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds).unwrap_or(if seconds > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

fn split_paths(value: &str) -> Vec<PathBuf> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_var<T: std::str::FromStr>(field: &str, value: String, expected: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::invalid_value(field, value, expected))
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::invalid_value(field, value, "true or false")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const VARS: [&str; 9] = [
        "DATABASE_URL",
        "PGFAST_MIGRATIONS_DIR",
        "PGFAST_FIXTURES_DIR",
        "PGFAST_MIN_CONNECTIONS",
        "PGFAST_MAX_CONNECTIONS",
        "PGFAST_TIMEOUT",
        "PGFAST_COMMAND_TIMEOUT",
        "PGFAST_MIGRATIONS_TABLE",
        "PGFAST_STRICT",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::new("postgresql://localhost/app");
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.command_timeout(), Duration::from_secs(60));
        assert_eq!(config.acquire_timeout(), Duration::from_secs(10));
        assert_eq!(config.migrations_dirs, vec![PathBuf::from("db/migrations")]);
        assert_eq!(config.migrations_table, "_pgfast_migrations");
        assert!(!config.strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rules() {
        let base = DatabaseConfig::new("postgres://localhost/app");

        assert!(matches!(
            DatabaseConfig::default().validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
        assert!(DatabaseConfig::new("mysql://localhost/app").validate().is_err());
        assert!(base.clone().with_pool_size(0, 5).validate().is_err());
        assert!(base.clone().with_pool_size(10, 5).validate().is_err());
        assert!(base.clone().with_command_timeout(0.0).validate().is_err());
        assert!(base.clone().with_command_timeout(1e-12).validate().is_err());
        assert!(base.clone().with_migrations_table("bad-name").validate().is_err());
        assert!(base.with_pool_size(1, 1).validate().is_ok());
    }

    #[test]
    fn test_out_of_range_timeouts_are_rejected_not_panicking() {
        let base = DatabaseConfig::new("postgresql://localhost/app");

        for seconds in [1e20, f64::MAX, f64::INFINITY, f64::NAN, -1.0] {
            let config = base.clone().with_command_timeout(seconds);
            let err = config.validate().unwrap_err();
            assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "command_timeout"));

            let mut config = base.clone();
            config.timeout = seconds;
            assert!(config.validate().is_err());
        }

        assert_eq!(base.clone().with_command_timeout(1e20).command_timeout(), Duration::MAX);
        assert_eq!(base.clone().with_command_timeout(-1.0).command_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_admin_url_and_database_name() {
        let config = DatabaseConfig::new("postgresql://user:pw@db:5432/app?sslmode=disable");
        assert_eq!(config.database_name().as_deref(), Some("app"));
        assert_eq!(
            config.admin_url().unwrap(),
            "postgresql://user:pw@db:5432/postgres?sslmode=disable"
        );
        assert_eq!(
            config.url_for_database("pgfast_test_0a1b2c3d").unwrap(),
            "postgresql://user:pw@db:5432/pgfast_test_0a1b2c3d?sslmode=disable"
        );
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var("DATABASE_URL", "postgresql://localhost/app");
        env::set_var("PGFAST_MIGRATIONS_DIR", "db/migrations, vendor/migrations");
        env::set_var("PGFAST_COMMAND_TIMEOUT", "2.5");
        env::set_var("PGFAST_STRICT", "true");

        let config = DatabaseConfig::from_env().unwrap();
        assert_eq!(
            config.migrations_dirs,
            vec![PathBuf::from("db/migrations"), PathBuf::from("vendor/migrations")]
        );
        assert_eq!(config.command_timeout(), Duration::from_millis(2500));
        assert!(config.strict);

        let sources = config.config_sources();
        assert!(sources["url"].is_env_var());
        assert!(sources["strict"].is_env_var());
        assert!(sources["migrations_table"].is_default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_flag_source_beats_env() {
        clear_env();
        env::set_var("DATABASE_URL", "postgresql://env-host/app");

        let mut config = DatabaseConfig::from_env().unwrap();
        config.url = "postgresql://flag-host/app".to_string();
        config.mark_set_by_flag("url", "--database-url");

        let sources = config.config_sources();
        assert_eq!(sources["url"], ConfigSource::Flag("--database-url".to_string()));
        assert!(sources["migrations_dirs"].is_default());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_numbers() {
        clear_env();
        env::set_var("DATABASE_URL", "postgresql://localhost/app");
        env::set_var("PGFAST_MAX_CONNECTIONS", "lots");

        let err = DatabaseConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "max_connections"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_yaml_file() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "url: postgresql://localhost/app\nmax_connections: 8\nmigrations_dirs:\n  - schema/a\n  - schema/b\nstrict: true"
        )
        .unwrap();

        let config = DatabaseConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.migrations_dirs.len(), 2);
        assert!(config.strict);

        let sources = config.config_sources();
        assert!(sources["max_connections"].is_file());
        assert!(sources["timeout"].is_default());
    }

    #[test]
    #[serial]
    fn test_from_yaml_file_requires_url() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "strict: false").unwrap();
        assert!(matches!(
            DatabaseConfig::from_yaml_file(file.path()),
            Err(ConfigError::MissingRequired { .. })
        ));
    }
}
