//! Configuration, scoped to what this crate actually configures, in
//! the familiar `Config::load()`/`from_file()`/
//! `apply_env_overrides()`/`validate()` shape.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration, loaded via [`Config::load`] or
/// [`Config::from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Schema-catalog behavior.
    pub schema: SchemaConfig,
    /// Migration behavior.
    pub migration: MigrationConfig,
    /// Logging behavior.
    pub logging: LoggingConfig,
}

/// Schema-catalog configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Whether a newly-registered schema is checked for compatibility
    /// against every other recorded version before being accepted.
    /// Disabling this is only meant for trusted bulk loads that have
    /// already validated compatibility out of band.
    pub validate_on_register: bool,
}

/// Migration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Reserved for a future bulk-migration tool; the core itself
    /// always migrates lazily, one object at a time on access (spec
    /// §4.7). `Config::validate` rejects `true` until that tool
    /// exists.
    pub eager: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self { schema: SchemaConfig::default(), migration: MigrationConfig::default(), logging: LoggingConfig::default() }
    }
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self { validate_on_register: true }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { eager: false }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl Config {
    /// Load configuration from `structdb.toml` if present, then apply
    /// environment-variable overrides, then validate.
    pub fn load() -> Result<Self> {
        let mut config = Self::from_file("structdb.toml").unwrap_or_default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::config(format!("failed to read config file: {e}")))?;
        toml::from_str(&contents).map_err(|e| Error::config(format!("failed to parse config file: {e}")))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        use std::env;

        if let Ok(v) = env::var("STRUCTDB_VALIDATE_ON_REGISTER") {
            self.schema.validate_on_register = v.parse().map_err(|e| Error::config(format!("invalid STRUCTDB_VALIDATE_ON_REGISTER: {e}")))?;
        }
        if let Ok(v) = env::var("STRUCTDB_MIGRATION_EAGER") {
            self.migration.eager = v.parse().map_err(|e| Error::config(format!("invalid STRUCTDB_MIGRATION_EAGER: {e}")))?;
        }
        if let Ok(level) = env::var("STRUCTDB_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.migration.eager {
            return Err(Error::config("eager migration is not implemented yet; the engine always migrates lazily"));
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(Error::config(format!("invalid log level: {other}"))),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn eager_migration_is_rejected() {
        let mut config = Config::default();
        config.migration.eager = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = Config::from_file("/nonexistent/structdb.toml");
        assert!(config.is_err());
    }
}
