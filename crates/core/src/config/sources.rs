//! Provenance of resolved settings, reported by `--log-level debug`

use std::fmt;

/// Where a resolved setting came from, highest precedence first
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Command-line flag such as `--database-url`
    Flag(String),
    /// `DATABASE_URL` or one of the `PGFAST_*` variables
    EnvVar(String),
    /// YAML file passed with `--config`
    File(String),
    /// Builder call in code
    Programmatic,
    /// Built-in default, rendered as text
    Default(String),
}

impl ConfigSource {
    pub fn is_flag(&self) -> bool {
        matches!(self, ConfigSource::Flag(_))
    }

    pub fn is_env_var(&self) -> bool {
        matches!(self, ConfigSource::EnvVar(_))
    }

    pub fn is_file(&self) -> bool {
        matches!(self, ConfigSource::File(_))
    }

    pub fn is_default(&self) -> bool {
        matches!(self, ConfigSource::Default(_))
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::Flag(flag) => write!(f, "flag {}", flag),
            ConfigSource::EnvVar(var) => write!(f, "env {}", var),
            ConfigSource::File(path) => write!(f, "file {}", path),
            ConfigSource::Programmatic => f.write_str("set in code"),
            ConfigSource::Default(value) => write!(f, "default ({})", value),
        }
    }
}
