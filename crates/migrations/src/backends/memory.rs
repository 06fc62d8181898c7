//! In-process backend for tests and dry runs
//!
//! Transactions work on a private copy of the store and keep a log of their
//! writes; commit replays the log against the shared store, so concurrent
//! transactions (the background worker and the apply loop) never clobber
//! each other. Executed SQL is recorded and `create table`, `drop table` and
//! `alter table ... add/drop column` statements are tracked so tests can
//! assert on schema effects.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use super::{BackendTransaction, MigrationBackend};
use crate::definitions::RollbackEntry;
use crate::error::{MigrationError, MigrationResult};
use crate::sql::split_statements;
use crate::state::{Generation, PersistedState};

static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^create\s+table\s+(?:if\s+not\s+exists\s+)?([\w."]+)"#)
        .expect("create table pattern is valid")
});

static DROP_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^drop\s+table\s+(?:if\s+exists\s+)?([\w."]+)"#)
        .expect("drop table pattern is valid")
});

static ADD_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^alter\s+table\s+([\w."]+)\s+add\s+(?:column\s+)?(?:if\s+not\s+exists\s+)?([\w"]+)"#)
        .expect("add column pattern is valid")
});

static DROP_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)^alter\s+table\s+([\w."]+)\s+drop\s+(?:column\s+)?(?:if\s+exists\s+)?([\w"]+)"#)
        .expect("drop column pattern is valid")
});

static CONCURRENTLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:create|drop|reindex)\b.*\bconcurrently\b")
        .expect("concurrently pattern is valid")
});

fn identifier(raw: &str) -> String {
    raw.replace('"', "").to_lowercase()
}

#[derive(Debug, Clone, Default)]
struct Store {
    state: PersistedState,
    tables: BTreeSet<String>,
    columns: BTreeSet<(String, String)>,
    executed: Vec<String>,
}

impl Store {
    fn record_statement(&mut self, statement: &str) {
        if let Some(caps) = CREATE_TABLE.captures(statement) {
            self.tables.insert(identifier(&caps[1]));
        } else if let Some(caps) = DROP_TABLE.captures(statement) {
            let table = identifier(&caps[1]);
            self.columns.retain(|(t, _)| t != &table);
            self.tables.remove(&table);
        } else if let Some(caps) = ADD_COLUMN.captures(statement) {
            self.columns
                .insert((identifier(&caps[1]), identifier(&caps[2])));
        } else if let Some(caps) = DROP_COLUMN.captures(statement) {
            self.columns
                .remove(&(identifier(&caps[1]), identifier(&caps[2])));
        }
    }

    fn apply(&mut self, op: &Op) -> MigrationResult<()> {
        match op {
            Op::Execute(statements) => {
                for statement in statements {
                    self.record_statement(statement);
                    self.executed.push(statement.clone());
                }
            }
            Op::MarkApplied(migration) => {
                self.embedded()?.0.insert(migration.clone());
            }
            Op::MarkUnapplied(migration) => {
                self.embedded()?.0.remove(migration);
            }
            Op::StoreRollback(migration, entry) => {
                self.embedded()?
                    .1
                    .entry(migration.clone())
                    .or_insert_with(|| entry.clone());
            }
            Op::DeleteRollback(migration) => {
                self.embedded()?.1.remove(migration);
            }
            Op::StoreState(state) => {
                self.state = state.clone();
            }
        }
        Ok(())
    }

    fn embedded(
        &mut self,
    ) -> MigrationResult<(&mut BTreeSet<String>, &mut BTreeMap<String, RollbackEntry>)> {
        match &mut self.state {
            PersistedState::Embedded { applied, rollbacks } => Ok((applied, rollbacks)),
            _ => Err(MigrationError::Database(
                "relation \"migrations.applied\" does not exist".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    Execute(Vec<String>),
    MarkApplied(String),
    MarkUnapplied(String),
    StoreRollback(String, RollbackEntry),
    DeleteRollback(String),
    StoreState(PersistedState),
}

#[derive(Debug, Default)]
struct Faults {
    fail_on: Vec<String>,
    delay_on: Vec<(String, Duration)>,
}

impl Faults {
    /// Sleep for any matching delay, then fail on any matching pattern
    async fn check(faults: &RwLock<Faults>, sql: &str) -> MigrationResult<()> {
        let delay = faults
            .read()
            .delay_on
            .iter()
            .filter(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, delay)| *delay)
            .max();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = faults
            .read()
            .fail_on
            .iter()
            .find(|pattern| sql.contains(pattern.as_str()))
            .cloned();
        match failing {
            Some(pattern) => Err(MigrationError::Database(format!(
                "simulated failure on '{}'",
                pattern
            ))),
            None => Ok(()),
        }
    }
}

fn statements(sql: &str) -> MigrationResult<Vec<String>> {
    split_statements(sql).map_err(|e| MigrationError::Database(format!("syntax error: {}", e)))
}

/// Migration backend held entirely in memory
///
/// Clones share the same store, so a test can keep a handle for assertions
/// while the runner owns another.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    store: Arc<Mutex<Store>>,
    faults: Arc<RwLock<Faults>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing persisted state, such as a legacy layout
    pub fn with_state(state: PersistedState) -> Self {
        let backend = Self::default();
        backend.store.lock().state = state;
        backend
    }

    /// Fail any SQL containing `pattern`
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.faults.write().fail_on.push(pattern.into());
    }

    /// Delay any SQL containing `pattern` before it runs
    pub fn delay_on(&self, pattern: impl Into<String>, delay: Duration) {
        self.faults.write().delay_on.push((pattern.into(), delay));
    }

    pub fn clear_faults(&self) {
        let mut faults = self.faults.write();
        faults.fail_on.clear();
        faults.delay_on.clear();
    }

    pub fn state(&self) -> PersistedState {
        self.store.lock().state.clone()
    }

    pub fn generation(&self) -> Generation {
        self.store.lock().state.generation()
    }

    /// Committed applied records, sorted by filename
    pub fn applied_migrations(&self) -> Vec<String> {
        self.store.lock().state.applied().into_iter().collect()
    }

    pub fn is_applied(&self, migration: &str) -> bool {
        self.store.lock().state.applied().contains(migration)
    }

    pub fn rollback_for(&self, migration: &str) -> Option<RollbackEntry> {
        match &self.store.lock().state {
            PersistedState::Embedded { rollbacks, .. } => rollbacks.get(migration).cloned(),
            _ => None,
        }
    }

    /// Every committed statement, in execution order
    pub fn executed(&self) -> Vec<String> {
        self.store.lock().executed.clone()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.store.lock().tables.contains(&identifier(table))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.store
            .lock()
            .columns
            .contains(&(identifier(table), identifier(column)))
    }
}

#[async_trait]
impl MigrationBackend for MemoryBackend {
    async fn begin(&self) -> MigrationResult<Box<dyn BackendTransaction>> {
        let working = self.store.lock().clone();
        tracing::debug!("Began in-memory transaction");
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.store),
            faults: Arc::clone(&self.faults),
            working,
            ops: Vec::new(),
        }))
    }

    async fn execute_unmanaged(&self, sql: &str) -> MigrationResult<()> {
        Faults::check(&self.faults, sql).await?;
        let op = Op::Execute(statements(sql)?);
        self.store.lock().apply(&op)
    }
}

/// Transaction over a private copy of the store
pub struct MemoryTransaction {
    shared: Arc<Mutex<Store>>,
    faults: Arc<RwLock<Faults>>,
    working: Store,
    ops: Vec<Op>,
}

impl MemoryTransaction {
    fn push(&mut self, op: Op) -> MigrationResult<()> {
        self.working.apply(&op)?;
        self.ops.push(op);
        Ok(())
    }
}

#[async_trait]
impl BackendTransaction for MemoryTransaction {
    async fn execute(&mut self, sql: &str) -> MigrationResult<()> {
        Faults::check(&self.faults, sql).await?;
        let statements = statements(sql)?;
        if let Some(statement) = statements.iter().find(|s| CONCURRENTLY.is_match(s)) {
            return Err(MigrationError::Database(format!(
                "{} cannot run inside a transaction block",
                statement
            )));
        }
        self.push(Op::Execute(statements))
    }

    async fn is_applied(&mut self, migration: &str) -> MigrationResult<bool> {
        Ok(self.working.embedded()?.0.contains(migration))
    }

    async fn mark_applied(&mut self, migration: &str) -> MigrationResult<()> {
        self.push(Op::MarkApplied(migration.to_string()))
    }

    async fn mark_unapplied(&mut self, migration: &str) -> MigrationResult<()> {
        self.push(Op::MarkUnapplied(migration.to_string()))
    }

    async fn stored_rollback(&mut self, migration: &str) -> MigrationResult<Option<RollbackEntry>> {
        Ok(self.working.embedded()?.1.get(migration).cloned())
    }

    async fn store_rollback(
        &mut self,
        migration: &str,
        entry: &RollbackEntry,
    ) -> MigrationResult<()> {
        self.push(Op::StoreRollback(migration.to_string(), entry.clone()))
    }

    async fn delete_rollback(&mut self, migration: &str) -> MigrationResult<()> {
        self.push(Op::DeleteRollback(migration.to_string()))
    }

    async fn load_state(&mut self) -> MigrationResult<PersistedState> {
        Ok(self.working.state.clone())
    }

    async fn store_state(
        &mut self,
        _from: &PersistedState,
        to: &PersistedState,
    ) -> MigrationResult<()> {
        self.push(Op::StoreState(to.clone()))
    }

    async fn commit(self: Box<Self>) -> MigrationResult<()> {
        let mut shared = self.shared.lock();
        let mut next = shared.clone();
        for op in &self.ops {
            next.apply(op)?;
        }
        *shared = next;
        tracing::debug!("Committed in-memory transaction with {} writes", self.ops.len());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> MigrationResult<()> {
        tracing::debug!("Rolled back in-memory transaction");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::upgrade;

    async fn embedded_backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        let embedded = upgrade(PersistedState::Uninitialized, &BTreeMap::new());
        tx.store_state(&PersistedState::Uninitialized, &embedded)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn test_writes_visible_only_after_commit() {
        let backend = embedded_backend().await;

        let mut tx = backend.begin().await.unwrap();
        tx.execute("create table samples (id int)").await.unwrap();
        tx.mark_applied("1-samples.sql").await.unwrap();
        assert!(tx.is_applied("1-samples.sql").await.unwrap());
        assert!(!backend.is_applied("1-samples.sql"));
        assert!(!backend.has_table("samples"));

        tx.commit().await.unwrap();
        assert!(backend.is_applied("1-samples.sql"));
        assert!(backend.has_table("samples"));
        assert_eq!(backend.executed(), vec!["create table samples (id int)"]);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let backend = embedded_backend().await;

        let mut tx = backend.begin().await.unwrap();
        tx.execute("create table samples (id int)").await.unwrap();
        tx.mark_applied("1-samples.sql").await.unwrap();
        tx.rollback().await.unwrap();

        assert!(!backend.is_applied("1-samples.sql"));
        assert!(backend.executed().is_empty());
    }

    #[tokio::test]
    async fn test_schema_tracking() {
        let backend = embedded_backend().await;
        backend
            .execute_unmanaged(
                "create table \"Users\" (id int); alter table users add column email text; \
                 alter table users add nickname text;",
            )
            .await
            .unwrap();

        assert!(backend.has_table("users"));
        assert!(backend.has_column("users", "email"));
        assert!(backend.has_column("users", "nickname"));

        backend
            .execute_unmanaged("alter table users drop column email; drop table if exists users")
            .await
            .unwrap();
        assert!(!backend.has_column("users", "email"));
        assert!(!backend.has_column("users", "nickname"));
        assert!(!backend.has_table("users"));
    }

    #[tokio::test]
    async fn test_store_rollback_never_overwrites() {
        let backend = embedded_backend().await;

        let mut tx = backend.begin().await.unwrap();
        tx.store_rollback("1-a.sql", &RollbackEntry::Sql("drop table a".into()))
            .await
            .unwrap();
        tx.store_rollback("1-a.sql", &RollbackEntry::Stop).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            backend.rollback_for("1-a.sql"),
            Some(RollbackEntry::Sql("drop table a".into()))
        );
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let backend = embedded_backend().await;
        backend.fail_on("explode");

        let mut tx = backend.begin().await.unwrap();
        let err = tx.execute("select explode()").await.unwrap_err();
        assert!(matches!(err, MigrationError::Database(_)));

        backend.clear_faults();
        assert!(tx.execute("select explode()").await.is_ok());
    }

    #[tokio::test]
    async fn test_applied_records_require_embedded_layout() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        assert!(tx.mark_applied("1-a.sql").await.is_err());
        assert_eq!(backend.applied().await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_concurrent_transactions_merge_on_commit() {
        let backend = embedded_backend().await;

        let mut first = backend.begin().await.unwrap();
        let mut second = backend.begin().await.unwrap();
        first.mark_applied("1-a.sql").await.unwrap();
        second.mark_applied("2-b.sql").await.unwrap();
        first.commit().await.unwrap();
        second.commit().await.unwrap();

        assert_eq!(backend.applied_migrations(), vec!["1-a.sql", "2-b.sql"]);
    }

    #[tokio::test]
    async fn test_concurrently_refused_inside_transaction() {
        let backend = embedded_backend().await;

        let mut tx = backend.begin().await.unwrap();
        let err = tx
            .execute("drop index concurrently idx_a")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("transaction block"));
        tx.rollback().await.unwrap();

        backend
            .execute_unmanaged("drop index concurrently idx_a")
            .await
            .unwrap();
        assert_eq!(backend.executed(), vec!["drop index concurrently idx_a"]);
    }

    #[tokio::test]
    async fn test_failed_commit_publishes_nothing() {
        let backend = embedded_backend().await;

        let mut tx = backend.begin().await.unwrap();
        tx.execute("create table samples (id int)").await.unwrap();
        tx.mark_applied("1-samples.sql").await.unwrap();

        // The layout goes away underneath the open transaction
        let mut other = backend.begin().await.unwrap();
        let current = other.load_state().await.unwrap();
        other
            .store_state(&current, &PersistedState::Uninitialized)
            .await
            .unwrap();
        other.commit().await.unwrap();

        assert!(tx.commit().await.is_err());
        assert!(!backend.has_table("samples"));
        assert!(backend.executed().is_empty());
    }
}
