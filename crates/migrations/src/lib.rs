//! # elif-migrations: Revision-ordered SQL migrations for elif.rs
//!
//! Applies `<revision>-<name>.sql` files to a PostgreSQL database, converging
//! to a target revision in either direction. Applied migrations and a frozen
//! copy of their down SQL are tracked inside the database, so rollbacks keep
//! working after a file is renamed or removed. Sections marked `/async` can
//! run on a background worker while the rest of the run continues.
//!
//! ```no_run
//! use std::sync::Arc;
//! use elif_migrations::{
//!     DatabaseConfig, DiskReader, MigrationConfig, MigrationRunner, PostgresBackend,
//! };
//!
//! # async fn run() -> elif_migrations::MigrationResult<()> {
//! let backend = PostgresBackend::connect(&DatabaseConfig::from_env()?).await?;
//! let runner = MigrationRunner::new(
//!     MigrationConfig::from_env()?,
//!     Arc::new(backend),
//!     Arc::new(DiskReader::new()),
//! );
//! let report = runner.apply().await?;
//! println!("applied {} migrations", report.applied.len());
//! # Ok(())
//! # }
//! ```

pub mod backends;
pub mod config;
pub mod definitions;
pub mod error;
pub mod manager;
pub mod reader;
pub mod revision;
pub mod rollback;
pub mod runner;
pub mod sql;
pub mod state;
pub mod worker;

// Re-export the public surface
pub use backends::{BackendTransaction, MemoryBackend, MigrationBackend, PostgresBackend};
pub use config::{ConfigError, DatabaseConfig, MigrationConfig, MigrationConfigBuilder, PoolConfig};
pub use definitions::*;
pub use error::{MigrationError, MigrationResult, ParseError};
pub use manager::MigrationManager;
pub use reader::{DiskReader, MemoryReader, MigrationReader};
pub use rollback::RollbackStore;
pub use runner::MigrationRunner;
pub use sql::{split_statements, Modifier, Modifiers, Section, StatementTokenizer};
pub use state::{Generation, PersistedState};
pub use worker::{AsyncCoordinator, AsyncRequest, AsyncResult, AsyncResults};
