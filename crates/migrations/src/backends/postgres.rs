//! PostgreSQL Backend Implementation

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use super::{BackendTransaction, MigrationBackend};
use crate::config::DatabaseConfig;
use crate::definitions::RollbackEntry;
use crate::error::{MigrationError, MigrationResult};
use crate::state::PersistedState;

const CREATE_EMBEDDED: &str = r#"
create schema if not exists migrations;

create table if not exists migrations.applied (
    migration varchar(1024) not null primary key
);

create table if not exists migrations.rollbacks (
    migration varchar(1024) not null primary key,
    down text
);
"#;

const CREATE_LEGACY: &str = r#"
create table if not exists public.schema_migrations (
    migration varchar(1024) not null primary key
);
"#;

const DROP_EMBEDDED: &str = "drop schema if exists migrations cascade";

const DROP_LEGACY: &str = "drop table if exists public.schema_migrations";

/// Migration backend over a sqlx PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool sized for one synchronous and one background migration
    pub async fn connect(config: &DatabaseConfig) -> MigrationResult<Self> {
        config.validate()?;

        let pool = PgPoolOptions::new()
            .max_connections(config.pool.max_connections)
            .min_connections(config.pool.min_connections)
            .acquire_timeout(config.pool.acquire_timeout())
            .idle_timeout(config.pool.idle_timeout.map(Duration::from_secs))
            .max_lifetime(config.pool.max_lifetime.map(Duration::from_secs))
            .test_before_acquire(config.pool.test_before_acquire)
            .connect(&config.url)
            .await
            .map_err(|e| MigrationError::Database(format!("Failed to connect to database: {}", e)))?;

        tracing::debug!(
            "Database pool created with {} max connections",
            config.pool.max_connections
        );

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MigrationBackend for PostgresBackend {
    async fn begin(&self) -> MigrationResult<Box<dyn BackendTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction::new(tx)))
    }

    async fn execute_unmanaged(&self, sql: &str) -> MigrationResult<()> {
        (&self.pool).execute(sql).await?;
        Ok(())
    }
}

/// A single migration's transaction
pub struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    pub fn new(tx: Transaction<'static, Postgres>) -> Self {
        Self { tx: Some(tx) }
    }

    fn tx(&mut self) -> MigrationResult<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| MigrationError::Database("Transaction already completed".to_string()))
    }

    async fn relation_exists(&mut self, relation: &str) -> MigrationResult<bool> {
        let tx = self.tx()?;
        let exists = sqlx::query_scalar::<_, bool>("select to_regclass($1) is not null")
            .bind(relation)
            .fetch_one(&mut **tx)
            .await?;
        Ok(exists)
    }
}

#[async_trait]
impl BackendTransaction for PostgresTransaction {
    async fn execute(&mut self, sql: &str) -> MigrationResult<()> {
        let tx = self.tx()?;
        (&mut **tx).execute(sql).await?;
        Ok(())
    }

    async fn is_applied(&mut self, migration: &str) -> MigrationResult<bool> {
        let tx = self.tx()?;
        let row = sqlx::query_scalar::<_, String>(
            "select migration from migrations.applied where migration = $1 limit 1 for update",
        )
        .bind(migration)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(row.is_some())
    }

    async fn mark_applied(&mut self, migration: &str) -> MigrationResult<()> {
        let tx = self.tx()?;
        sqlx::query("insert into migrations.applied (migration) values ($1) on conflict do nothing")
            .bind(migration)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn mark_unapplied(&mut self, migration: &str) -> MigrationResult<()> {
        let tx = self.tx()?;
        sqlx::query("delete from migrations.applied where migration = $1")
            .bind(migration)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn stored_rollback(&mut self, migration: &str) -> MigrationResult<Option<RollbackEntry>> {
        let tx = self.tx()?;
        let down = sqlx::query_scalar::<_, Option<String>>(
            "select down from migrations.rollbacks where migration = $1",
        )
        .bind(migration)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(down.map(|down| RollbackEntry::from_stored(down.unwrap_or_default())))
    }

    async fn store_rollback(
        &mut self,
        migration: &str,
        entry: &RollbackEntry,
    ) -> MigrationResult<()> {
        let tx = self.tx()?;
        sqlx::query(
            "insert into migrations.rollbacks (migration, down) values ($1, $2) on conflict do nothing",
        )
        .bind(migration)
        .bind(entry.to_stored())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete_rollback(&mut self, migration: &str) -> MigrationResult<()> {
        let tx = self.tx()?;
        sqlx::query("delete from migrations.rollbacks where migration = $1")
            .bind(migration)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn load_state(&mut self) -> MigrationResult<PersistedState> {
        let legacy = if self.relation_exists("public.schema_migrations").await? {
            let tx = self.tx()?;
            let applied: BTreeSet<String> =
                sqlx::query_scalar::<_, String>("select migration from public.schema_migrations")
                    .fetch_all(&mut **tx)
                    .await?
                    .into_iter()
                    .collect();
            Some(applied)
        } else {
            None
        };

        if !self.relation_exists("migrations.applied").await? {
            return Ok(match legacy {
                Some(applied) => PersistedState::Legacy { applied },
                None => PersistedState::Uninitialized,
            });
        }

        let tx = self.tx()?;
        let mut applied: BTreeSet<String> =
            sqlx::query_scalar::<_, String>("select migration from migrations.applied")
                .fetch_all(&mut **tx)
                .await?
                .into_iter()
                .collect();

        // An interrupted upgrade leaves both tables behind. Report it as legacy
        // so the next upgrade merges the rows and drops schema_migrations.
        if let Some(legacy) = legacy {
            tracing::warn!(
                "Found both public.schema_migrations and migrations.applied; {} legacy rows still to merge",
                legacy.difference(&applied).count()
            );
            applied.extend(legacy);
            return Ok(PersistedState::Legacy { applied });
        }

        let rollbacks: BTreeMap<String, RollbackEntry> =
            if self.relation_exists("migrations.rollbacks").await? {
                let tx = self.tx()?;
                sqlx::query_as::<_, (String, Option<String>)>(
                    "select migration, down from migrations.rollbacks",
                )
                .fetch_all(&mut **tx)
                .await?
                .into_iter()
                .map(|(migration, down)| {
                    (migration, RollbackEntry::from_stored(down.unwrap_or_default()))
                })
                .collect()
            } else {
                BTreeMap::new()
            };

        Ok(PersistedState::Embedded { applied, rollbacks })
    }

    async fn store_state(
        &mut self,
        from: &PersistedState,
        to: &PersistedState,
    ) -> MigrationResult<()> {
        let tx = self.tx()?;

        match to {
            PersistedState::Embedded { applied, rollbacks } => {
                (&mut **tx).execute(CREATE_EMBEDDED).await?;

                for migration in applied {
                    sqlx::query(
                        "insert into migrations.applied (migration) values ($1) on conflict do nothing",
                    )
                    .bind(migration)
                    .execute(&mut **tx)
                    .await?;
                }

                for (migration, entry) in rollbacks {
                    sqlx::query(
                        "insert into migrations.rollbacks (migration, down) values ($1, $2) on conflict do nothing",
                    )
                    .bind(migration)
                    .bind(entry.to_stored())
                    .execute(&mut **tx)
                    .await?;
                }

                if matches!(from, PersistedState::Legacy { .. }) {
                    (&mut **tx).execute(DROP_LEGACY).await?;
                }
            }
            PersistedState::Legacy { applied } => {
                (&mut **tx).execute(CREATE_LEGACY).await?;

                for migration in applied {
                    sqlx::query(
                        "insert into public.schema_migrations (migration) values ($1) on conflict do nothing",
                    )
                    .bind(migration)
                    .execute(&mut **tx)
                    .await?;
                }

                if matches!(from, PersistedState::Embedded { .. }) {
                    (&mut **tx).execute(DROP_EMBEDDED).await?;
                }
            }
            PersistedState::Uninitialized => {
                (&mut **tx).execute(DROP_EMBEDDED).await?;
                (&mut **tx).execute(DROP_LEGACY).await?;
            }
        }

        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> MigrationResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> MigrationResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
