//! Structured logging setup for pgfast binaries.
//!
//! Library code only emits `tracing` events; installing a subscriber is left
//! to whoever owns `main`.

use serde_json::{json, Value};
use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "warn")
    pub level: String,
    /// JSON lines instead of text
    pub json_format: bool,
    /// Multi-line human readable output
    pub pretty_print: bool,
    /// Include file and line number information
    pub include_location: bool,
    /// Environment filter (e.g. "pgfast_schema=debug,sqlx=warn")
    pub env_filter: Option<String>,
    /// Fields attached to the initialization event
    pub global_fields: serde_json::Map<String, Value>,
    pub service_name: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            pretty_print: false,
            include_location: false,
            env_filter: None,
            global_fields: serde_json::Map::new(),
            service_name: None,
        }
    }
}

impl LoggingConfig {
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            env_filter: Some("pgfast=info,pgfast_schema=info,pgfast_testing=info,sqlx=warn".to_string()),
            ..Self::default()
        }
        .with_global_field("env", "production")
    }

    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            pretty_print: true,
            include_location: true,
            env_filter: Some("pgfast=debug,pgfast_schema=debug,pgfast_testing=debug,sqlx=warn".to_string()),
            ..Self::default()
        }
        .with_global_field("env", "development")
    }

    /// Minimal output
    pub fn test() -> Self {
        Self {
            level: "error".to_string(),
            env_filter: Some("pgfast_schema=error".to_string()),
            ..Self::default()
        }
        .with_global_field("env", "test")
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self.env_filter = None;
        self
    }

    pub fn with_json(mut self, json_format: bool) -> Self {
        self.json_format = json_format;
        self
    }

    pub fn with_global_field<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.global_fields.insert(key.into(), value.into());
        self
    }

    pub fn with_service(mut self, name: &str) -> Self {
        self.service_name = Some(name.to_string());
        self
    }

    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Filter directive used when `RUST_LOG` is not set
    pub fn filter_directive(&self) -> &str {
        self.env_filter.as_deref().unwrap_or(&self.level)
    }
}

/// Install the global subscriber. Logs go to stderr so command output on
/// stdout stays machine readable.
pub fn init_logging(config: LoggingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(config.filter_directive()))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_format {
        registry
            .with(
                Layer::new()
                    .with_writer(io::stderr)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .json(),
            )
            .try_init()?;
    } else if config.pretty_print {
        registry
            .with(
                Layer::new()
                    .with_writer(io::stderr)
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .pretty(),
            )
            .try_init()?;
    } else {
        registry
            .with(Layer::new().with_writer(io::stderr).with_target(false).without_time())
            .try_init()?;
    }

    let mut init_msg = json!({
        "message": "Structured logging initialized",
        "level": config.level,
        "json_format": config.json_format,
    });
    if let Some(name) = &config.service_name {
        init_msg["service_name"] = json!(name);
    }
    for (key, value) in config.global_fields {
        init_msg[key] = value;
    }
    tracing::debug!(target: "pgfast::logging", "{}", init_msg);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        let production = LoggingConfig::production();
        assert!(production.json_format);
        assert_eq!(production.global_fields.get("env"), Some(&json!("production")));

        let development = LoggingConfig::development();
        assert!(development.pretty_print);
        assert!(development.include_location);

        assert_eq!(LoggingConfig::test().level, "error");
    }

    #[test]
    fn test_with_level_overrides_filter() {
        let config = LoggingConfig::production().with_level("trace");
        assert_eq!(config.filter_directive(), "trace");

        let config = LoggingConfig::default().with_env_filter("pgfast_schema=debug");
        assert_eq!(config.filter_directive(), "pgfast_schema=debug");
    }
}
