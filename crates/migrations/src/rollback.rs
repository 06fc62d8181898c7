//! Embedded rollbacks
//!
//! When a migration is applied its down section is frozen into the database.
//! Downward convergence then only needs database state, so migrations whose
//! files were renamed or deleted can still be retired. A down section marked
//! `/stop` is frozen as a sentinel that halts convergence.

use std::sync::Arc;
use tracing::{info, warn};

use crate::backends::{BackendTransaction, MigrationBackend};
use crate::definitions::{ApplyReport, Direction, RollbackEntry};
use crate::error::{MigrationError, MigrationResult};
use crate::revision;
use crate::sql::{split_statements, Section};

/// The entry to freeze for a down section
pub fn entry_for(down: &Section) -> RollbackEntry {
    if down.modifiers.is_stop() {
        RollbackEntry::Stop
    } else if down.modifiers.is_notx() {
        RollbackEntry::NoTx(down.sql.clone())
    } else {
        RollbackEntry::Sql(down.sql.clone())
    }
}

/// Snapshots and replays rollbacks held in the database
#[derive(Clone)]
pub struct RollbackStore {
    backend: Arc<dyn MigrationBackend>,
}

impl RollbackStore {
    pub fn new(backend: Arc<dyn MigrationBackend>) -> Self {
        Self { backend }
    }

    /// Freeze the down section unless a snapshot already exists
    ///
    /// Returns whether a new snapshot was written.
    pub async fn snapshot(
        &self,
        tx: &mut dyn BackendTransaction,
        migration: &str,
        down: &Section,
    ) -> MigrationResult<bool> {
        if tx.stored_rollback(migration).await?.is_some() {
            return Ok(false);
        }

        let entry = entry_for(down);
        tx.store_rollback(migration, &entry).await?;

        if entry.is_stop() {
            info!("Stored rollback for {} as a stop boundary", migration);
        } else {
            info!("Stored rollback for {}", migration);
        }
        Ok(true)
    }

    /// Roll back every applied migration above `target` using only stored
    /// snapshots, newest first
    pub async fn converge_down(&self, target: u64, report: &mut ApplyReport) -> MigrationResult<()> {
        let mut pending: Vec<(u64, String)> = Vec::new();
        for migration in self.backend.applied().await? {
            match revision::revision(&migration) {
                Ok(revision) if revision > target => pending.push((revision, migration)),
                Ok(_) => {}
                Err(err) => warn!("Ignoring applied record {}: {}", migration, err),
            }
        }
        pending.sort_by(|a, b| b.cmp(a));

        for (_, migration) in pending {
            if report.skipped.contains(&migration) {
                continue;
            }
            self.retire(&migration, report).await?;
        }

        Ok(())
    }

    /// Roll back one applied migration from its stored snapshot
    ///
    /// A migration without a snapshot is left applied and noted in the report.
    pub async fn retire(&self, migration: &str, report: &mut ApplyReport) -> MigrationResult<()> {
        let mut tx = self.backend.begin().await?;

        // Another run may have retired it since the listing
        if !tx.is_applied(migration).await? {
            return tx.commit().await;
        }

        let (sql, notx) = match tx.stored_rollback(migration).await? {
            None => {
                warn!("No rollback stored for {}, leaving it applied", migration);
                tx.rollback().await?;
                report.skipped.push(migration.to_string());
                return Ok(());
            }
            Some(RollbackEntry::Stop) => {
                tx.rollback().await?;
                warn!("Stopped rollback at {} due to /stop modifier", migration);
                return Err(MigrationError::Stopped {
                    migration: migration.to_string(),
                });
            }
            Some(RollbackEntry::Sql(sql)) => (sql, false),
            Some(RollbackEntry::NoTx(sql)) => (sql, true),
        };

        let mut tx = if sql.trim().is_empty() {
            info!("Skipped empty rollback for {}", migration);
            tx
        } else if notx {
            info!(
                "Running migration {} {} from stored rollback outside a transaction",
                migration,
                Direction::Down
            );
            tx.commit().await?;
            self.execute_unmanaged(migration, &sql).await?;
            self.backend.begin().await?
        } else {
            info!("Running migration {} {} from stored rollback", migration, Direction::Down);
            if let Err(err) = tx.execute(&sql).await {
                discard(tx).await;
                return Err(MigrationError::execution(migration, Direction::Down, None, err));
            }
            tx
        };

        tx.mark_unapplied(migration).await?;
        tx.delete_rollback(migration).await?;
        tx.commit().await?;
        report.rolled_back.push(migration.to_string());
        Ok(())
    }

    /// Replay a `/notx` snapshot statement by statement
    async fn execute_unmanaged(&self, migration: &str, sql: &str) -> MigrationResult<()> {
        let statements = split_statements(sql).map_err(|source| MigrationError::Parse {
            migration: migration.to_string(),
            source,
        })?;

        for statement in statements {
            if let Err(err) = self.backend.execute_unmanaged(&statement).await {
                return Err(MigrationError::execution(
                    migration,
                    Direction::Down,
                    Some(statement),
                    err,
                ));
            }
        }
        Ok(())
    }
}

/// Roll back after a failure, keeping the original error
pub(crate) async fn discard(tx: Box<dyn BackendTransaction>) {
    if let Err(err) = tx.rollback().await {
        warn!("Failed to roll back transaction: {}", err);
    }
}
