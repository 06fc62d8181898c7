//! Background worker for `/async` migrations
//!
//! A single consumer drains a bounded request queue in submission order. Each
//! request runs statement by statement inside one transaction and publishes
//! exactly one [`AsyncResult`]. The result channel closes once the request
//! queue has been closed and drained.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backends::MigrationBackend;
use crate::definitions::Direction;
use crate::error::{MigrationError, MigrationResult};
use crate::sql::split_statements;

/// A migration body handed to the background worker
#[derive(Debug, Clone)]
pub struct AsyncRequest {
    /// Filename of the migration, matching `ApplyReport::deferred`
    pub migration: String,
    pub direction: Direction,
    pub sql: String,
}

/// Outcome of one background migration
#[derive(Debug)]
pub struct AsyncResult {
    pub migration: String,
    pub error: Option<MigrationError>,
    /// The statement that failed, if one did
    pub statement: Option<String>,
}

impl AsyncResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn success(migration: String) -> Self {
        Self {
            migration,
            error: None,
            statement: None,
        }
    }

    fn failure(migration: String, error: MigrationError) -> Self {
        let statement = error.failed_statement().map(str::to_string);
        Self {
            migration,
            error: Some(error),
            statement,
        }
    }
}

/// Receiving end of the result stream
#[derive(Debug)]
pub struct AsyncResults {
    rx: mpsc::Receiver<AsyncResult>,
}

impl AsyncResults {
    /// A stream that is already closed
    pub fn closed() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx }
    }

    /// Next result, or `None` once every request has been processed
    pub async fn recv(&mut self) -> Option<AsyncResult> {
        self.rx.recv().await
    }

    /// Wait for the worker to finish and gather every result in order
    pub async fn collect(mut self) -> Vec<AsyncResult> {
        let mut results = Vec::new();
        while let Some(result) = self.rx.recv().await {
            results.push(result);
        }
        results
    }
}

/// Producer side of the background worker
pub struct AsyncCoordinator {
    requests: mpsc::Sender<AsyncRequest>,
    handle: JoinHandle<()>,
}

impl AsyncCoordinator {
    /// Spawn the consumer with room for `capacity` queued requests and results
    pub fn spawn(backend: Arc<dyn MigrationBackend>, capacity: usize) -> (Self, AsyncResults) {
        let capacity = capacity.max(1);
        let (requests, mut incoming) = mpsc::channel::<AsyncRequest>(capacity);
        let (results, rx) = mpsc::channel::<AsyncResult>(capacity);

        let handle = tokio::spawn(async move {
            while let Some(request) = incoming.recv().await {
                let result = run_isolated(backend.as_ref(), request).await;
                if results.send(result).await.is_err() {
                    debug!("Async result receiver dropped, continuing without reporting");
                }
            }
            debug!("Background migration worker finished");
        });

        (Self { requests, handle }, AsyncResults { rx })
    }

    /// Queue a migration; fails only if the worker is gone
    pub async fn submit(&self, request: AsyncRequest) -> MigrationResult<()> {
        debug!("Queued background migration {}", request.migration);
        self.requests.send(request).await.map_err(|err| {
            MigrationError::Database(format!(
                "background migration worker stopped before accepting {}",
                err.0.migration
            ))
        })
    }

    /// Close the request queue; the worker drains what was queued and exits
    pub fn finish(self) -> JoinHandle<()> {
        drop(self.requests);
        self.handle
    }
}

/// Run every statement of a request inside one transaction
async fn run_isolated(backend: &dyn MigrationBackend, request: AsyncRequest) -> AsyncResult {
    let AsyncRequest {
        migration,
        direction,
        sql,
    } = request;

    info!("Running migration {} {} in the background", migration, direction);

    let statements = match split_statements(&sql) {
        Ok(statements) => statements,
        Err(source) => {
            let err = MigrationError::Parse {
                migration: migration.clone(),
                source,
            };
            error!("Background migration {} failed: {}", migration, err);
            return AsyncResult::failure(migration, err);
        }
    };

    let mut tx = match backend.begin().await {
        Ok(tx) => tx,
        Err(err) => {
            error!("Background migration {} failed: {}", migration, err);
            return AsyncResult::failure(migration, err);
        }
    };

    for statement in statements {
        if let Err(err) = tx.execute(&statement).await {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Failed to roll back background migration {}: {}", migration, rollback_err);
            }
            let err = MigrationError::execution(migration.clone(), direction, Some(statement), err);
            error!("Background migration {} failed: {}", migration, err);
            return AsyncResult::failure(migration, err);
        }
    }

    if let Err(err) = tx.commit().await {
        error!("Background migration {} failed to commit: {}", migration, err);
        return AsyncResult::failure(migration, err);
    }

    info!("Completed background migration {}", migration);
    AsyncResult::success(migration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use std::time::Duration;

    fn request(migration: &str, sql: &str) -> AsyncRequest {
        AsyncRequest {
            migration: migration.to_string(),
            direction: Direction::Up,
            sql: sql.to_string(),
        }
    }

    #[tokio::test]
    async fn test_results_in_submission_order() {
        let backend = MemoryBackend::new();
        backend.delay_on("slow", Duration::from_millis(50));

        let (coordinator, results) = AsyncCoordinator::spawn(Arc::new(backend.clone()), 2);
        coordinator.submit(request("5-a.sql", "select slow()")).await.unwrap();
        coordinator.submit(request("6-b.sql", "select fast()")).await.unwrap();
        coordinator.finish();

        let results = results.collect().await;
        let order: Vec<&str> = results.iter().map(|r| r.migration.as_str()).collect();
        assert_eq!(order, vec!["5-a.sql", "6-b.sql"]);
        assert!(results.iter().all(AsyncResult::is_ok));
        assert_eq!(backend.executed(), vec!["select slow()", "select fast()"]);
    }

    #[tokio::test]
    async fn test_failure_reports_statement_and_rolls_back() {
        let backend = MemoryBackend::new();
        backend.fail_on("broken");

        let (coordinator, mut results) = AsyncCoordinator::spawn(Arc::new(backend.clone()), 1);
        coordinator
            .submit(request("7-c.sql", "create table c (id int); select broken();"))
            .await
            .unwrap();
        coordinator.finish().await.unwrap();

        let result = results.recv().await.unwrap();
        assert!(!result.is_ok());
        assert_eq!(result.statement.as_deref(), Some("select broken()"));
        assert!(results.recv().await.is_none());
        assert!(!backend.has_table("c"));
    }

    #[tokio::test]
    async fn test_parse_error_is_reported() {
        let (coordinator, results) = AsyncCoordinator::spawn(Arc::new(MemoryBackend::new()), 1);
        coordinator.submit(request("8-d.sql", "select 'unterminated")).await.unwrap();
        coordinator.finish();

        let results = results.collect().await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].error, Some(MigrationError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_channel_closes_without_requests() {
        let (coordinator, results) = AsyncCoordinator::spawn(Arc::new(MemoryBackend::new()), 0);
        coordinator.finish();
        assert!(results.collect().await.is_empty());
        assert!(AsyncResults::closed().collect().await.is_empty());
    }
}
