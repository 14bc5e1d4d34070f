//! # pgfast-core
//!
//! Configuration and logging shared by the pgfast crates.

pub mod config;
pub mod logging;

pub use config::{
    is_valid_identifier, ConfigError, ConfigSource, ConfigValidator, DatabaseConfig, EnvConfig,
    IdentifierValidator, UrlValidator, DEFAULT_FIXTURES_DIR, DEFAULT_MIGRATIONS_DIR,
    DEFAULT_MIGRATIONS_TABLE,
};
pub use logging::{init_logging, LoggingConfig};
