//! Error types for the migration engine
//!
//! Every synchronous failure leaves the database with an already-committed
//! prefix of migrations applied, so the errors carry enough context (the
//! migration path and direction) to find where a run stopped.

use thiserror::Error;

use crate::config::ConfigError;
use crate::definitions::Direction;

/// Result type alias for migration operations
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Errors raised by the SQL statement tokenizer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unterminated {quote} quoted string starting at offset {offset}")]
    UnterminatedQuote { quote: char, offset: usize },
}

/// Error types for migration operations
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Missing or blank input, unreadable migration location, unusable state layout
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The filename has no parseable `<revision>-` prefix
    #[error("invalid migration filename: {0}")]
    InvalidFilename(String),

    /// The SQL body of a migration could not be split into statements
    #[error("Failed to parse SQL in {migration}: {source}")]
    Parse {
        migration: String,
        #[source]
        source: ParseError,
    },

    /// A statement failed; the migration's transaction was rolled back
    #[error("Migration {migration} failed running {direction}: {message}")]
    Execution {
        migration: String,
        direction: Direction,
        statement: Option<String>,
        message: String,
    },

    /// Downward convergence reached a rollback marked `/stop`
    #[error("Stopped rollback at {migration} due to /stop modifier; manual intervention required")]
    Stopped { migration: String },

    /// Failure talking to the database outside of a migration body
    #[error("Database error: {0}")]
    Database(String),

    /// Failure reading migration sources
    #[error("Failed to read {location}: {message}")]
    Io { location: String, message: String },
}

impl MigrationError {
    /// True when the run halted at a `/stop` rollback boundary
    pub fn is_stopped(&self) -> bool {
        matches!(self, MigrationError::Stopped { .. })
    }

    /// The statement that failed, when the migration ran statement by statement
    pub fn failed_statement(&self) -> Option<&str> {
        match self {
            MigrationError::Execution { statement, .. } => statement.as_deref(),
            _ => None,
        }
    }

    pub(crate) fn execution(
        migration: impl Into<String>,
        direction: Direction,
        statement: Option<String>,
        message: impl ToString,
    ) -> Self {
        MigrationError::Execution {
            migration: migration.into(),
            direction,
            statement,
            message: message.to_string(),
        }
    }

    pub(crate) fn io(location: impl Into<String>, err: impl ToString) -> Self {
        MigrationError::Io {
            location: location.into(),
            message: err.to_string(),
        }
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database(err.to_string())
    }
}

impl From<ConfigError> for MigrationError {
    fn from(err: ConfigError) -> Self {
        MigrationError::Configuration(err.to_string())
    }
}
