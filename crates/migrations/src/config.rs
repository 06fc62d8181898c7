//! Configuration for the migration engine and its database connection

use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::definitions::Target;

/// Environment variables, in lookup order, that may hold the database URL
pub const DATABASE_URL_VARS: [&str; 3] = ["DATABASE_URL", "DB_URI", "DB"];

/// Migration engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct MigrationConfig {
    /// Directory (or object-store prefix) holding the `.sql` files
    #[builder(default = "PathBuf::from(\"./sql\")", getter)]
    pub migrations_dir: PathBuf,

    /// Revision to converge to
    #[builder(default = "Target::Latest", getter)]
    pub target: Target,

    /// Snapshot down SQL at apply time and converge using the snapshots
    #[builder(default = "true", getter)]
    pub embedded_rollbacks: bool,

    /// Run synchronous migrations one statement at a time
    #[builder(default = "false", getter)]
    pub isolate_statements: bool,

    /// Upgrade a legacy single-table layout on first use
    #[builder(default = "true", getter)]
    pub auto_upgrade: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("./sql"),
            target: Target::Latest,
            embedded_rollbacks: true,
            isolate_statements: false,
            auto_upgrade: true,
        }
    }
}

impl MigrationConfig {
    /// Load configuration from `MIGRATIONS`, `MIGRATIONS_REVISION` and
    /// `MIGRATIONS_NO_ROLLBACK`, defaulting anything unset
    pub fn from_env() -> Result<Self, ConfigError> {
        let migrations_dir = PathBuf::from(get_env_or_default("MIGRATIONS", "./sql"));

        let target = match get_env_optional("MIGRATIONS_REVISION") {
            Some(value) => value.parse::<Target>().map_err(|_| ConfigError::InvalidValue {
                field: "target".to_string(),
                value,
                expected: "a non-negative revision or 'latest'".to_string(),
            })?,
            None => Target::Latest,
        };

        let no_rollback = get_env_bool("MIGRATIONS_NO_ROLLBACK", false)?;

        let config = Self {
            migrations_dir,
            target,
            embedded_rollbacks: !no_rollback,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.migrations_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_target(mut self, target: impl Into<Target>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_embedded_rollbacks(mut self, enabled: bool) -> Self {
        self.embedded_rollbacks = enabled;
        self
    }

    pub fn with_isolated_statements(mut self, enabled: bool) -> Self {
        self.isolate_statements = enabled;
        self
    }

    pub fn with_auto_upgrade(mut self, enabled: bool) -> Self {
        self.auto_upgrade = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.migrations_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed {
                field: "migrations_dir".to_string(),
                reason: "Migrations directory cannot be empty".to_string(),
            });
        }

        Ok(())
    }
}

/// Connection pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Seconds to wait for a connection
    pub acquire_timeout: u64,
    pub idle_timeout: Option<u64>,
    pub max_lifetime: Option<u64>,
    pub test_before_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            // One synchronous migration plus the background worker
            max_connections: 4,
            min_connections: 1,
            acquire_timeout: 30,
            idle_timeout: Some(600),
            max_lifetime: Some(1800),
            test_before_acquire: true,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout)
    }
}

/// Where and how to connect
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool: PoolConfig,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            pool: PoolConfig::default(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let url = DATABASE_URL_VARS
            .iter()
            .find_map(|var| get_env_optional(var).filter(|value| !value.trim().is_empty()))
            .ok_or_else(|| ConfigError::MissingEnvVar {
                var: DATABASE_URL_VARS.join(" | "),
            })?;

        let mut pool = PoolConfig::default();
        if let Some(value) = get_env_optional("DB_MAX_CONNECTIONS") {
            pool.max_connections = value.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                field: "max_connections".to_string(),
                value,
                expected: "valid number".to_string(),
            })?;
        }

        let config = Self { url, pool };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed {
                field: "url".to_string(),
                reason: "Database URL cannot be empty".to_string(),
            });
        }

        if self.pool.max_connections < 2 {
            return Err(ConfigError::ValidationFailed {
                field: "max_connections".to_string(),
                reason: "At least two connections are needed to run background migrations"
                    .to_string(),
            });
        }

        if self.pool.min_connections > self.pool.max_connections {
            return Err(ConfigError::ValidationFailed {
                field: "min_connections".to_string(),
                reason: "Cannot exceed max_connections".to_string(),
            });
        }

        Ok(())
    }
}

fn get_env_optional(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match get_env_optional(key) {
        None => Ok(default),
        Some(value) => match value.trim().to_lowercase().as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                field: key.to_string(),
                value,
                expected: "true or false".to_string(),
            }),
        },
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid value for {field}: '{value}', expected {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Validation failed for {field}: {reason}")]
    ValidationFailed { field: String, reason: String },
}
