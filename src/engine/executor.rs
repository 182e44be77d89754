//! Prediction executor
//!
//! Runs the model for one subject under a timeout and stages the result as a
//! pending record. Every attempt is written to the ledger before the model
//! runs, so an interrupted attempt is always visible to recovery.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, error, warn};

use crate::error::{panic_message, PredictorError, Result};
use crate::model::Model;
use crate::store::SqliteStore;
use crate::types::{PredictionRecord, PredictionStatus, SubjectInput};

#[derive(Clone)]
pub struct PredictionExecutor {
    store: SqliteStore,
    model: Arc<dyn Model>,
    timeout: Duration,
}

impl PredictionExecutor {
    pub fn new(store: SqliteStore, model: Arc<dyn Model>, timeout: Duration) -> Self {
        Self { store, model, timeout }
    }

    pub fn model_name(&self) -> &'static str {
        self.model.name()
    }

    /// Compute a prediction for `input` and stage it as pending.
    ///
    /// On timeout, model failure or a panic inside the model the attempt is
    /// closed as aborted and the committed record is left untouched.
    pub async fn execute(&self, input: &SubjectInput) -> Result<PredictionRecord> {
        let entry = self.store.open_attempt(&input.subject, input.version).await?;

        let compute = AssertUnwindSafe(self.model.compute(&input.payload)).catch_unwind();
        let output = match tokio::time::timeout(self.timeout, compute).await {
            Ok(Ok(Ok(output))) => output,
            Ok(Err(payload)) => {
                let message = panic_message(payload.as_ref());
                error!("Model '{}' panicked for {}: {}", self.model.name(), input.subject, message);
                self.abort_quietly(&entry.attempt_id, "model panicked").await;
                return Err(PredictorError::ModelPanicked {
                    subject: input.subject.clone(),
                    message,
                });
            }
            Ok(Ok(Err(e))) => {
                let message = format!("{:#}", e);
                self.abort_quietly(&entry.attempt_id, &message).await;
                return Err(PredictorError::ModelFailure {
                    subject: input.subject.clone(),
                    message,
                });
            }
            Err(_) => {
                self.abort_quietly(&entry.attempt_id, "compute timed out").await;
                return Err(PredictorError::ComputeTimeout {
                    subject: input.subject.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.value.is_finite() {
            let message = format!("model '{}' returned a non-finite value", self.model.name());
            self.abort_quietly(&entry.attempt_id, &message).await;
            return Err(PredictorError::ModelFailure {
                subject: input.subject.clone(),
                message,
            });
        }

        let record = PredictionRecord {
            attempt_id: entry.attempt_id.clone(),
            subject: input.subject.clone(),
            value: output.value,
            confidence: output.confidence,
            input_version: input.version,
            computed_at: Utc::now(),
            status: PredictionStatus::Pending,
        };

        match self.store.insert_pending(&record).await {
            Ok(true) => {
                debug!(
                    "Staged {} at {} (value {:.4}, confidence {:.2})",
                    record.subject, record.input_version, record.value, record.confidence
                );
            }
            Ok(false) => {
                // Closed underneath us; the commit will report it as aborted
                warn!("Attempt {} for {} was closed before staging", entry.attempt_id, input.subject);
            }
            Err(e) => {
                self.abort_quietly(&entry.attempt_id, "failed to stage pending record").await;
                return Err(e);
            }
        }

        Ok(record)
    }

    async fn abort_quietly(&self, attempt_id: &str, reason: &str) {
        if let Err(e) = self.store.abort_pending(attempt_id, reason).await {
            warn!("Failed to close attempt {}: {}", attempt_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockModel;
    use crate::types::{InputVersion, ModelOutput, Subject};
    use async_trait::async_trait;
    use serde_json::json;

    struct SlowModel;

    #[async_trait]
    impl Model for SlowModel {
        async fn compute(&self, _payload: &serde_json::Value) -> anyhow::Result<ModelOutput> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ModelOutput::new(1.0, 1.0))
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn input(version: u64) -> SubjectInput {
        SubjectInput {
            subject: Subject::new("A"),
            version: InputVersion(version),
            payload: json!({ "series": [1.0, 2.0] }),
        }
    }

    #[tokio::test]
    async fn test_execute_stages_pending_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut model = MockModel::new();
        model
            .expect_compute()
            .times(1)
            .returning(|_| Ok(ModelOutput::new(10.0, 1.4)));
        model.expect_name().return_const("mock");

        let executor = PredictionExecutor::new(store.clone(), Arc::new(model), Duration::from_secs(1));
        let record = executor.execute(&input(1)).await.unwrap();

        assert_eq!(record.value, 10.0);
        assert_eq!(record.confidence, 1.0);
        assert_eq!(record.status, PredictionStatus::Pending);

        let pending = store.pending(&record.attempt_id).await.unwrap().unwrap();
        assert_eq!(pending.input_version, InputVersion(1));
        assert!(store.current(&Subject::new("A")).await.unwrap().is_none());

        let entry = store.ledger_entry(&record.attempt_id).await.unwrap().unwrap();
        assert!(entry.is_open());
    }

    #[tokio::test]
    async fn test_model_failure_aborts_attempt() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut model = MockModel::new();
        model
            .expect_compute()
            .returning(|_| Err(anyhow::anyhow!("bad payload")));
        model.expect_name().return_const("mock");

        let executor = PredictionExecutor::new(store.clone(), Arc::new(model), Duration::from_secs(1));
        let err = executor.execute(&input(1)).await.unwrap_err();
        assert!(matches!(err, PredictorError::ModelFailure { .. }));
        assert!(err.is_retryable());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.open_attempts, 0);
        assert_eq!(stats.ledger_entries, 1);

        let entries = store.open_ledger_entries(None).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_aborts_attempt() {
        let store = SqliteStore::open_in_memory().unwrap();
        let executor = PredictionExecutor::new(store.clone(), Arc::new(SlowModel), Duration::from_millis(20));

        let err = executor.execute(&input(1)).await.unwrap_err();
        assert!(matches!(err, PredictorError::ComputeTimeout { .. }));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.open_attempts, 0);
        assert_eq!(stats.pending, 0);
    }

    struct PanicModel;

    #[async_trait]
    impl Model for PanicModel {
        async fn compute(&self, _payload: &serde_json::Value) -> anyhow::Result<ModelOutput> {
            panic!("index out of range");
        }

        fn name(&self) -> &'static str {
            "panic"
        }
    }

    #[tokio::test]
    async fn test_model_panic_aborts_attempt() {
        let store = SqliteStore::open_in_memory().unwrap();
        let executor = PredictionExecutor::new(store.clone(), Arc::new(PanicModel), Duration::from_secs(1));

        let err = executor.execute(&input(1)).await.unwrap_err();
        match &err {
            PredictorError::ModelPanicked { message, .. } => assert_eq!(message, "index out of range"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.is_retryable());

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.open_attempts, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_failure_leaves_committed_record_alone() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut good = MockModel::new();
        good.expect_compute().returning(|_| Ok(ModelOutput::new(10.0, 0.5)));
        good.expect_name().return_const("mock");
        let executor = PredictionExecutor::new(store.clone(), Arc::new(good), Duration::from_secs(1));
        let record = executor.execute(&input(1)).await.unwrap();
        store.commit_pending(&record.attempt_id).await.unwrap();

        let mut bad = MockModel::new();
        bad.expect_compute().returning(|_| Err(anyhow::anyhow!("boom")));
        bad.expect_name().return_const("mock");
        let executor = PredictionExecutor::new(store.clone(), Arc::new(bad), Duration::from_secs(1));
        assert!(executor.execute(&input(2)).await.is_err());

        let current = store.current(&Subject::new("A")).await.unwrap().unwrap();
        assert_eq!(current.value, 10.0);
        assert_eq!(current.input_version, InputVersion(1));
    }
}
