//! Crash recovery and failure handling across store reopens

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use predictor::engine::{CommitCoordinator, PredictionExecutor, StalenessEvaluator};
use predictor::model::Model;
use predictor::scheduler::{SchedulerConfig, SchedulingLoop};
use predictor::source::MemorySource;
use predictor::store::{SqliteStore, StoreOptions};
use predictor::types::{ModelOutput, SubjectStatus};
use predictor::{CommitOutcome, InputVersion, Subject, SubjectInput};
use serde_json::json;
use tempfile::tempdir;

struct ConstModel(f64);

#[async_trait]
impl Model for ConstModel {
    async fn compute(&self, _payload: &serde_json::Value) -> anyhow::Result<ModelOutput> {
        Ok(ModelOutput::new(self.0, 0.5))
    }

    fn name(&self) -> &'static str {
        "const"
    }
}

/// Fails for every payload marked `"fail": true`
struct PickyModel;

#[async_trait]
impl Model for PickyModel {
    async fn compute(&self, payload: &serde_json::Value) -> anyhow::Result<ModelOutput> {
        if payload["fail"].as_bool().unwrap_or(false) {
            anyhow::bail!("refusing payload");
        }
        Ok(ModelOutput::new(7.0, 0.5))
    }

    fn name(&self) -> &'static str {
        "picky"
    }
}

fn input(version: u64) -> SubjectInput {
    SubjectInput {
        subject: Subject::new("A"),
        version: InputVersion(version),
        payload: json!({}),
    }
}

#[tokio::test]
async fn test_crash_between_compute_and_commit() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("data").join("p.db");
    let a = Subject::new("A");

    let interrupted = {
        let store = SqliteStore::open(&path, &StoreOptions::default()).await?;
        let coordinator = CommitCoordinator::new(store.clone());

        let v1 = PredictionExecutor::new(store.clone(), Arc::new(ConstModel(10.0)), Duration::from_secs(1))
            .execute(&input(1))
            .await?;
        coordinator.commit(&v1).await?;

        // v2 is staged but the process dies before the commit
        PredictionExecutor::new(store.clone(), Arc::new(ConstModel(12.0)), Duration::from_secs(1))
            .execute(&input(2))
            .await?
    };

    let store = SqliteStore::open(&path, &StoreOptions::default()).await?;
    let current = store.current(&a).await?.expect("committed record survives restart");
    assert_eq!(current.value, 10.0);
    assert_eq!(current.input_version, InputVersion(1));

    let open = store.open_ledger_entries(None).await?;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].attempt_id, interrupted.attempt_id);

    let coordinator = CommitCoordinator::new(store.clone());
    let report = coordinator.recover(Duration::ZERO).await?;
    assert_eq!(report.aborted, 1);

    // The orphan can no longer be committed
    assert_eq!(coordinator.commit(&interrupted).await?, CommitOutcome::Aborted);
    assert_eq!(store.current(&a).await?.map(|r| r.value), Some(10.0));

    // v2 is still stale and is recomputed normally
    let evaluator = StalenessEvaluator::new(store.clone());
    assert!(evaluator.evaluate(&a, InputVersion(2)).await?.needs_compute());
    Ok(())
}

#[tokio::test]
async fn test_failed_subject_recovers_on_newer_version() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let store = SqliteStore::open(dir.path().join("p.db"), &StoreOptions::default()).await?;
    let source = MemorySource::new();
    source.publish("A", json!({ "fail": true })).await;

    let config = SchedulerConfig {
        max_attempts: 2,
        base_backoff_ms: 0,
        max_backoff_ms: 0,
        jitter_ms: 0,
        ..Default::default()
    };
    let scheduler = SchedulingLoop::new(
        Arc::new(source.clone()),
        store.clone(),
        StalenessEvaluator::new(store.clone()),
        PredictionExecutor::new(store.clone(), Arc::new(PickyModel), Duration::from_secs(1)),
        &config,
    )?;
    let mut reports = scheduler.failure_reports().await;

    // Both attempts happen off the first tick; the next one sees a failed subject
    assert_eq!(scheduler.tick().await?.dispatched, 1);
    scheduler.wait_idle().await;
    assert_eq!(scheduler.tick().await?.skipped_failed, 1);

    let report = reports.try_recv()?;
    assert_eq!(report.attempts, 2);
    assert!(report.last_error.contains("refusing payload"));

    let a = Subject::new("A");
    let state = store.get_subject(&a).await?.expect("subject registered");
    assert_eq!(state.status, SubjectStatus::Failed);
    assert_eq!(state.failed_version, Some(InputVersion(1)));

    source.publish("A", json!({ "fail": false })).await;
    let tick = scheduler.tick().await?;
    assert_eq!(tick.dispatched, 1);
    scheduler.wait_idle().await;

    let state = store.get_subject(&a).await?.expect("subject registered");
    assert_eq!(state.status, SubjectStatus::Active);
    assert_eq!(store.current(&a).await?.map(|r| r.input_version), Some(InputVersion(2)));
    Ok(())
}
