//! Database Backend Traits
//!
//! The engine talks to the database through these two traits only: a backend
//! hands out one transaction per migration, and the transaction knows how to
//! run SQL and read or write the applied and rollback records.

use async_trait::async_trait;

use crate::definitions::RollbackEntry;
use crate::error::MigrationResult;
use crate::state::PersistedState;

pub mod memory;
pub mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

/// A database the engine can migrate
#[async_trait]
pub trait MigrationBackend: Send + Sync + 'static {
    /// Begin a transaction scoped to a single migration
    async fn begin(&self) -> MigrationResult<Box<dyn BackendTransaction>>;

    /// Execute SQL outside of any transaction
    async fn execute_unmanaged(&self, sql: &str) -> MigrationResult<()>;

    /// Applied migration filenames, sorted by filename
    async fn applied(&self) -> MigrationResult<Vec<String>> {
        let mut tx = self.begin().await?;
        let state = tx.load_state().await?;
        tx.rollback().await?;
        Ok(state.applied().into_iter().collect())
    }
}

/// One transaction against the migration state
#[async_trait]
pub trait BackendTransaction: Send {
    /// Execute raw SQL, possibly holding several statements
    async fn execute(&mut self, sql: &str) -> MigrationResult<()>;

    /// Locking read of the applied record; holds the row lock until commit
    async fn is_applied(&mut self, migration: &str) -> MigrationResult<bool>;

    async fn mark_applied(&mut self, migration: &str) -> MigrationResult<()>;

    async fn mark_unapplied(&mut self, migration: &str) -> MigrationResult<()>;

    async fn stored_rollback(&mut self, migration: &str) -> MigrationResult<Option<RollbackEntry>>;

    /// Store a rollback snapshot unless one already exists
    async fn store_rollback(&mut self, migration: &str, entry: &RollbackEntry)
        -> MigrationResult<()>;

    async fn delete_rollback(&mut self, migration: &str) -> MigrationResult<()>;

    /// Read whichever state layout the database carries
    async fn load_state(&mut self) -> MigrationResult<PersistedState>;

    /// Materialize `to`, removing structures of `from` that `to` does not use
    async fn store_state(&mut self, from: &PersistedState, to: &PersistedState)
        -> MigrationResult<()>;

    async fn commit(self: Box<Self>) -> MigrationResult<()>;

    async fn rollback(self: Box<Self>) -> MigrationResult<()>;
}
