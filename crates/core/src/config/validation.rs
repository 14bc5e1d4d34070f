use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required field: {field}. {hint}")]
    MissingRequired { field: String, hint: String },

    #[error("Invalid value for field '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub fn missing_required(field: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingRequired {
            field: field.into(),
            hint: hint.into(),
        }
    }

    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }
}

/// Trait for validating configuration values
pub trait ConfigValidator<T: ?Sized> {
    fn validate(&self, value: &T) -> Result<(), ConfigError>;
}

/// Database URL validator
pub struct UrlValidator {
    pub field: &'static str,
    pub schemes: Vec<String>,
}

impl UrlValidator {
    /// Accepts `postgres://` and `postgresql://`
    pub fn postgres(field: &'static str) -> Self {
        Self {
            field,
            schemes: vec!["postgres".to_string(), "postgresql".to_string()],
        }
    }
}

impl ConfigValidator<str> for UrlValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        let expected = || format!("URL with scheme: {}", self.schemes.join(", "));

        let parsed = url::Url::parse(value)
            .map_err(|_| ConfigError::invalid_value(self.field, value, expected()))?;

        if !self.schemes.iter().any(|s| s == parsed.scheme()) {
            return Err(ConfigError::invalid_value(self.field, value, expected()));
        }

        Ok(())
    }
}

/// Plain SQL identifier: `[A-Za-z_][A-Za-z0-9_]*`, at most 63 bytes
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Identifier validator for table names interpolated into SQL
pub struct IdentifierValidator {
    pub field: &'static str,
}

impl ConfigValidator<str> for IdentifierValidator {
    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        if is_valid_identifier(value) {
            Ok(())
        } else {
            Err(ConfigError::invalid_value(
                self.field,
                value,
                "identifier matching [A-Za-z_][A-Za-z0-9_]*",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_url_validator() {
        let validator = UrlValidator::postgres("url");
        assert!(validator.validate("postgresql://localhost/db").is_ok());
        assert!(validator.validate("postgres://user:pw@db:5432/app").is_ok());
        assert!(validator.validate("mysql://localhost/db").is_err());
        assert!(validator.validate("not a url").is_err());
    }

    #[test]
    fn test_identifiers() {
        assert!(is_valid_identifier("_pgfast_migrations"));
        assert!(is_valid_identifier("Schema2"));
        assert!(!is_valid_identifier("2schema"));
        assert!(!is_valid_identifier("a-b"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(64)));
    }
}
