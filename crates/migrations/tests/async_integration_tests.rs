//! Integration tests for `/async` migrations handed to the background worker

mod common;

use common::{fixture, SAMPLES};
use std::time::Duration;

const BIG_A: &str = "# --- !Up /async\ncreate table big_a (id int);\n\n# --- !Down\ndrop table big_a;\n";
const BIG_B: &str = "# --- !Up /async\ncreate table big_b (id int);\n\n# --- !Down\ndrop table big_b;\n";

#[tokio::test]
async fn test_async_results_follow_submission_order() {
    let fx = fixture(&[("5-big-a.sql", BIG_A), ("6-big-b.sql", BIG_B)]);
    fx.backend.delay_on("big_a", Duration::from_millis(50));

    let (report, results) = fx.runner.apply_async().await.unwrap();
    assert_eq!(report.deferred, vec!["5-big-a.sql", "6-big-b.sql"]);
    assert!(report.applied.is_empty());

    let results = results.collect().await;
    let order: Vec<&str> = results.iter().map(|r| r.migration.as_str()).collect();
    assert_eq!(order, vec!["5-big-a.sql", "6-big-b.sql"]);
    assert_eq!(order, report.deferred);
    assert!(results.iter().all(|r| r.is_ok()));

    assert_eq!(
        fx.backend.executed(),
        vec!["create table big_a (id int)", "create table big_b (id int)"]
    );
}

#[tokio::test]
async fn test_async_migrations_are_recorded_before_they_finish() {
    let fx = fixture(&[("1-create-samples.sql", SAMPLES), ("5-big-a.sql", BIG_A)]);
    fx.backend.delay_on("big_a", Duration::from_millis(100));

    let (report, results) = fx.runner.apply_async().await.unwrap();

    assert_eq!(report.applied, vec!["1-create-samples.sql"]);
    assert_eq!(report.deferred, vec!["5-big-a.sql"]);
    assert!(fx.backend.is_applied("5-big-a.sql"));
    assert!(fx.backend.rollback_for("5-big-a.sql").is_some());
    assert!(fx.backend.has_table("samples"));

    let results = results.collect().await;
    assert_eq!(results.len(), 1);
    assert!(fx.backend.has_table("big_a"));
}

#[tokio::test]
async fn test_async_failure_is_reported_and_record_kept() {
    let fx = fixture(&[("5-big-a.sql", BIG_A), ("6-big-b.sql", BIG_B)]);
    fx.backend.fail_on("big_b");

    let (report, results) = fx.runner.apply_async().await.unwrap();
    assert_eq!(report.deferred.len(), 2);

    let results = results.collect().await;
    assert!(results[0].is_ok());
    assert!(!results[1].is_ok());
    assert_eq!(results[1].migration, "6-big-b.sql");
    assert_eq!(
        results[1].statement.as_deref(),
        Some("create table big_b (id int)")
    );

    // The record was written optimistically and stays
    assert!(fx.backend.is_applied("6-big-b.sql"));
    assert!(!fx.backend.has_table("big_b"));
    assert!(fx.backend.has_table("big_a"));
}

#[tokio::test]
async fn test_plain_apply_runs_async_sections_inline() {
    let fx = fixture(&[("5-big-a.sql", BIG_A), ("6-big-b.sql", BIG_B)]);

    let report = fx.runner.apply().await.unwrap();

    assert_eq!(report.applied, vec!["5-big-a.sql", "6-big-b.sql"]);
    assert!(report.deferred.is_empty());
    assert!(fx.backend.has_table("big_a"));
    assert!(fx.backend.has_table("big_b"));
}

#[tokio::test]
async fn test_apply_async_with_nothing_to_do_closes_results() {
    let fx = fixture(&[("1-create-samples.sql", SAMPLES)]);
    fx.runner.apply().await.unwrap();

    let (report, results) = fx.runner.apply_async().await.unwrap();

    assert!(report.is_noop());
    assert!(results.collect().await.is_empty());
}
