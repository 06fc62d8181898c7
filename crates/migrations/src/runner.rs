//! Migration Runner - Converges a database to a target revision
//!
//! Each migration file runs in its own transaction. A failure rolls back the
//! current file and stops the run, leaving every earlier file committed, so
//! re-running after a fix picks up where the last run stopped.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::backends::{BackendTransaction, MigrationBackend};
use crate::config::MigrationConfig;
use crate::definitions::{
    ApplyReport, Direction, MigrationFile, MigrationStatus, RollbackEntry, Target,
};
use crate::error::{MigrationError, MigrationResult};
use crate::manager::MigrationManager;
use crate::reader::MigrationReader;
use crate::revision;
use crate::rollback::{self, RollbackStore};
use crate::sql::{directive, split_statements, Section};
use crate::state::{self, Generation, PersistedState};
use crate::worker::{AsyncCoordinator, AsyncRequest, AsyncResults};

/// How `/async` sections are treated during a run
#[derive(Clone, Copy)]
enum Mode<'a> {
    /// Everything runs inline
    Sync,
    /// `/async` sections go to the background worker
    Background(&'a AsyncCoordinator),
}

/// One migration to walk while converging down
enum DownStep {
    /// Roll back using the file's down section
    File(MigrationFile),
    /// The file is gone; roll back from the stored snapshot
    Stored(String),
}

/// Migration runner that executes migrations against a database
pub struct MigrationRunner {
    config: MigrationConfig,
    backend: Arc<dyn MigrationBackend>,
    manager: MigrationManager,
    rollbacks: RollbackStore,
}

impl MigrationRunner {
    pub fn new(
        config: MigrationConfig,
        backend: Arc<dyn MigrationBackend>,
        reader: Arc<dyn MigrationReader>,
    ) -> Self {
        let manager = MigrationManager::new(&config, reader);
        let rollbacks = RollbackStore::new(Arc::clone(&backend));
        Self {
            config,
            backend,
            manager,
            rollbacks,
        }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    pub fn manager(&self) -> &MigrationManager {
        &self.manager
    }

    /// Make sure the embedded layout exists, upgrading a legacy one if allowed
    pub async fn initialize(&self) -> MigrationResult<Generation> {
        let mut tx = self.backend.begin().await?;
        let current = tx.load_state().await?;

        match current.generation() {
            Generation::Embedded => {
                tx.commit().await?;
            }
            Generation::Uninitialized => {
                let next = state::upgrade(current.clone(), &BTreeMap::new());
                tx.store_state(&current, &next).await?;
                tx.commit().await?;
                info!("Created migrations.applied and migrations.rollbacks tables");
            }
            Generation::Legacy => {
                tx.rollback().await?;
                if !*self.config.get_auto_upgrade() {
                    return Err(MigrationError::Configuration(
                        "database uses the legacy schema_migrations table; run upgrade first"
                            .to_string(),
                    ));
                }
                self.upgrade().await?;
            }
        }

        Ok(Generation::Embedded)
    }

    /// Converge to the configured target
    pub async fn apply(&self) -> MigrationResult<ApplyReport> {
        self.apply_to(*self.config.get_target()).await
    }

    /// Converge to `target`, running `/async` sections inline
    pub async fn apply_to(&self, target: Target) -> MigrationResult<ApplyReport> {
        self.initialize().await?;
        self.run(target, Mode::Sync).await
    }

    /// Converge to the configured target, handing `/async` sections to the
    /// background worker
    ///
    /// Returns once every migration has been run or queued. Deferred
    /// migrations are already recorded; their outcome is only reported on the
    /// returned stream, which closes after the last one finishes.
    pub async fn apply_async(&self) -> MigrationResult<(ApplyReport, AsyncResults)> {
        self.initialize().await?;

        let capacity = self.manager.available(Direction::Up).await?.len();
        let (coordinator, results) = AsyncCoordinator::spawn(Arc::clone(&self.backend), capacity);

        let outcome = self
            .run(*self.config.get_target(), Mode::Background(&coordinator))
            .await;
        coordinator.finish();

        outcome.map(|report| (report, results))
    }

    /// Roll back the last `steps` applied migrations (at least one)
    pub async fn rollback(&self, steps: u64) -> MigrationResult<ApplyReport> {
        self.initialize().await?;

        let latest = match self.latest_applied().await? {
            Some(latest) => latest,
            None => {
                info!("No applied migrations to roll back");
                return Ok(ApplyReport::default());
            }
        };

        let target = latest.saturating_sub(steps.max(1));
        self.run(Target::Revision(target), Mode::Sync).await
    }

    /// Files and applied records side by side, ordered by revision
    pub async fn status(&self) -> MigrationResult<Vec<MigrationStatus>> {
        let applied = self.backend.applied().await?;
        let files = self.manager.available(Direction::Up).await?;

        let mut rows: Vec<MigrationStatus> = files
            .iter()
            .map(|file| MigrationStatus {
                migration: file.filename.clone(),
                revision: file.revision,
                applied: applied.contains(&file.filename),
                file_present: true,
            })
            .collect();

        for migration in applied {
            if files.iter().all(|file| file.filename != migration) {
                rows.push(MigrationStatus {
                    revision: revision::revision(&migration).unwrap_or(0),
                    migration,
                    applied: true,
                    file_present: false,
                });
            }
        }

        rows.sort_by(|a, b| {
            a.revision
                .cmp(&b.revision)
                .then_with(|| a.migration.cmp(&b.migration))
        });
        Ok(rows)
    }

    /// Create an empty migration after the latest revision
    pub async fn create(&self, name: &str) -> MigrationResult<String> {
        self.manager.create(name).await
    }

    /// Highest revision among the available files
    pub async fn latest_revision(&self) -> MigrationResult<u64> {
        self.manager.latest_revision().await
    }

    /// Move to the embedded layout, backfilling snapshots from present files
    pub async fn upgrade(&self) -> MigrationResult<Generation> {
        let mut tx = self.backend.begin().await?;
        let current = tx.load_state().await?;

        if current.generation() == Generation::Embedded {
            tx.commit().await?;
            return Ok(Generation::Embedded);
        }

        let snapshots = self.snapshots(&current).await?;
        let next = state::upgrade(current.clone(), &snapshots);
        tx.store_state(&current, &next).await?;
        tx.commit().await?;

        info!(
            "Upgraded migration state from {} to {} with {} stored rollbacks",
            current.generation(),
            next.generation(),
            snapshots.len()
        );
        Ok(next.generation())
    }

    /// Move back to the legacy layout, discarding stored rollbacks
    pub async fn downgrade(&self) -> MigrationResult<Generation> {
        let mut tx = self.backend.begin().await?;
        let current = tx.load_state().await?;

        if current.generation() == Generation::Legacy {
            tx.commit().await?;
            return Ok(Generation::Legacy);
        }

        let next = state::downgrade(current.clone());
        tx.store_state(&current, &next).await?;
        tx.commit().await?;

        info!(
            "Downgraded migration state from {} to {}",
            current.generation(),
            next.generation()
        );
        Ok(next.generation())
    }

    /// Direction and effective target revision for a run
    pub async fn resolve(&self, target: Target) -> MigrationResult<(Direction, u64)> {
        match target {
            Target::Latest => Ok((Direction::Up, self.manager.latest_revision().await?)),
            Target::Revision(revision) => {
                let direction = match self.latest_applied().await? {
                    None => Direction::Up,
                    Some(latest) if revision > latest => Direction::Up,
                    Some(latest) if revision < latest => Direction::Down,
                    Some(_) => Direction::None,
                };
                Ok((direction, revision))
            }
        }
    }

    async fn latest_applied(&self) -> MigrationResult<Option<u64>> {
        Ok(self
            .backend
            .applied()
            .await?
            .iter()
            .filter_map(|migration| revision::revision(migration).ok())
            .max())
    }

    /// Rollback entries for the applied migrations whose files are present
    async fn snapshots(
        &self,
        current: &PersistedState,
    ) -> MigrationResult<BTreeMap<String, RollbackEntry>> {
        let applied = current.applied();
        let mut snapshots = BTreeMap::new();

        for file in self.manager.available(Direction::Up).await? {
            if !applied.contains(&file.filename) {
                continue;
            }
            let down = self
                .manager
                .read_section(&self.manager.path_for(&file), Direction::Down)
                .await?;
            snapshots.insert(file.filename, rollback::entry_for(&down));
        }

        Ok(snapshots)
    }

    async fn run(&self, target: Target, mode: Mode<'_>) -> MigrationResult<ApplyReport> {
        let start_time = Instant::now();
        let (direction, target) = self.resolve(target).await?;

        let mut report = ApplyReport {
            direction,
            target,
            ..ApplyReport::default()
        };

        match direction {
            Direction::None => debug!("Database is already at revision {}", target),
            Direction::Up => {
                for file in self.manager.available(direction).await? {
                    self.run_file(&file, direction, target, mode, &mut report)
                        .await?;
                }
            }
            Direction::Down => {
                for step in self.down_steps(target).await? {
                    match step {
                        DownStep::File(file) => {
                            self.run_file(&file, direction, target, mode, &mut report)
                                .await?
                        }
                        DownStep::Stored(migration) => {
                            self.rollbacks.retire(&migration, &mut report).await?
                        }
                    }
                }
            }
        }

        if *self.config.get_embedded_rollbacks() {
            self.rollbacks.converge_down(target, &mut report).await?;
        }

        report.execution_time_ms = start_time.elapsed().as_millis();
        Ok(report)
    }

    /// Files newest first, with applied migrations whose file is gone slotted
    /// in by revision so they are retired from their stored rollback in order
    async fn down_steps(&self, target: u64) -> MigrationResult<Vec<DownStep>> {
        let files = self.manager.available(Direction::Down).await?;

        let mut steps: Vec<(u64, String, DownStep)> = Vec::new();
        if *self.config.get_embedded_rollbacks() {
            for migration in self.backend.applied().await? {
                if files.iter().any(|file| file.filename == migration) {
                    continue;
                }
                if let Ok(revision) = revision::revision(&migration) {
                    if revision > target {
                        steps.push((revision, migration.clone(), DownStep::Stored(migration)));
                    }
                }
            }
        }
        for file in files {
            steps.push((file.revision, file.filename.clone(), DownStep::File(file)));
        }

        steps.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(steps.into_iter().map(|(_, _, step)| step).collect())
    }

    async fn run_file(
        &self,
        file: &MigrationFile,
        direction: Direction,
        target: u64,
        mode: Mode<'_>,
        report: &mut ApplyReport,
    ) -> MigrationResult<()> {
        let path = self.manager.path_for(file);
        let mut tx = self.backend.begin().await?;

        let applied = match tx.is_applied(&file.filename).await {
            Ok(applied) => applied,
            Err(err) => return abort(tx, err).await,
        };

        let should_run = match direction {
            Direction::Up => file.revision <= target && !applied,
            Direction::Down => file.revision > target && applied,
            Direction::None => false,
        };
        if !should_run {
            return tx.commit().await;
        }

        let content = match self.manager.read(&path).await {
            Ok(content) => content,
            Err(err) => return abort(tx, err).await,
        };
        let section = directive::parse(&content, direction);

        if direction == Direction::Down {
            let stop = match tx.stored_rollback(&file.filename).await {
                Ok(Some(entry)) => entry.is_stop(),
                Ok(None) => section.modifiers.is_stop(),
                Err(err) => return abort(tx, err).await,
            };
            if stop {
                tx.rollback().await?;
                warn!("Stopped rollback at {} due to /stop modifier", path);
                return Err(MigrationError::Stopped { migration: path });
            }
        }

        if let Mode::Background(coordinator) = mode {
            if section.modifiers.is_async() {
                info!("Running migration {} {} (deferred)", path, direction);
                self.record(tx, file, direction, &content).await?;
                coordinator
                    .submit(AsyncRequest {
                        migration: file.filename.clone(),
                        direction,
                        sql: section.sql,
                    })
                    .await?;
                report.deferred.push(file.filename.clone());
                return Ok(());
            }
        }

        info!("Running migration {} {}", path, direction);

        let tx = if section.modifiers.is_notx() {
            tx.commit().await?;
            self.execute_unmanaged(&path, direction, &section).await?;
            self.backend.begin().await?
        } else {
            self.execute(tx, &path, direction, &section).await?
        };

        self.record(tx, file, direction, &content).await?;

        match direction {
            Direction::Up => report.applied.push(file.filename.clone()),
            Direction::Down => report.rolled_back.push(file.filename.clone()),
            Direction::None => {}
        }
        Ok(())
    }

    /// Run a section inside the migration's transaction, handing the
    /// transaction back on success
    async fn execute(
        &self,
        mut tx: Box<dyn BackendTransaction>,
        path: &str,
        direction: Direction,
        section: &Section,
    ) -> MigrationResult<Box<dyn BackendTransaction>> {
        if section.is_empty() {
            debug!("{} has no {} statements", path, direction);
            return Ok(tx);
        }

        if !*self.config.get_isolate_statements() {
            if let Err(err) = tx.execute(&section.sql).await {
                let err = MigrationError::execution(path, direction, None, err);
                return abort(tx, err).await;
            }
            return Ok(tx);
        }

        let statements = match split_statements(&section.sql) {
            Ok(statements) => statements,
            Err(source) => {
                let err = MigrationError::Parse {
                    migration: path.to_string(),
                    source,
                };
                return abort(tx, err).await;
            }
        };

        for statement in statements {
            if let Err(err) = tx.execute(&statement).await {
                let err = MigrationError::execution(path, direction, Some(statement), err);
                return abort(tx, err).await;
            }
        }

        Ok(tx)
    }

    /// Run a `/notx` section statement by statement outside any transaction
    async fn execute_unmanaged(
        &self,
        path: &str,
        direction: Direction,
        section: &Section,
    ) -> MigrationResult<()> {
        let statements = split_statements(&section.sql).map_err(|source| MigrationError::Parse {
            migration: path.to_string(),
            source,
        })?;

        for statement in statements {
            if let Err(err) = self.backend.execute_unmanaged(&statement).await {
                return Err(MigrationError::execution(
                    path,
                    direction,
                    Some(statement),
                    err,
                ));
            }
        }

        Ok(())
    }

    /// Update the applied and rollback records, then commit
    async fn record(
        &self,
        mut tx: Box<dyn BackendTransaction>,
        file: &MigrationFile,
        direction: Direction,
        content: &str,
    ) -> MigrationResult<()> {
        let outcome = match direction {
            Direction::Up => self.record_up(tx.as_mut(), file, content).await,
            Direction::Down => record_down(tx.as_mut(), file).await,
            Direction::None => Ok(()),
        };

        match outcome {
            Ok(()) => tx.commit().await,
            Err(err) => abort(tx, err).await,
        }
    }

    async fn record_up(
        &self,
        tx: &mut dyn BackendTransaction,
        file: &MigrationFile,
        content: &str,
    ) -> MigrationResult<()> {
        tx.mark_applied(&file.filename).await?;
        if *self.config.get_embedded_rollbacks() {
            let down = directive::parse(content, Direction::Down);
            self.rollbacks.snapshot(tx, &file.filename, &down).await?;
        }
        Ok(())
    }
}

async fn record_down(tx: &mut dyn BackendTransaction, file: &MigrationFile) -> MigrationResult<()> {
    tx.mark_unapplied(&file.filename).await?;
    tx.delete_rollback(&file.filename).await
}

/// Roll back and surface the original error
async fn abort<T>(tx: Box<dyn BackendTransaction>, err: MigrationError) -> MigrationResult<T> {
    if let Err(rollback_err) = tx.rollback().await {
        warn!("Failed to roll back transaction: {}", rollback_err);
    }
    Err(err)
}
