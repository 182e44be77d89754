//! Predictor service
//!
//! Wires the store, engine and scheduler together from a [`Config`] and
//! exposes the read side (current prediction, history, failures, stats) to
//! the CLI and to library callers.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::engine::{CommitCoordinator, PredictionExecutor, StalenessEvaluator};
use crate::model::{self, Model};
use crate::scheduler::SchedulingLoop;
use crate::source::{self, InputSource};
use crate::store::{AccuracyReport, OutcomeRecord, PurgeReport, RecoveryReport, SqliteStore, StoreStats};
use crate::types::{InputVersion, PredictionRecord, Subject, SubjectState};

/// Store-wide counts plus accuracy, for `predictor stats`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub store: StoreStats,
    pub accuracy: AccuracyReport,
}

pub struct PredictorService {
    config: Config,
    store: SqliteStore,
}

impl PredictorService {
    /// Open the store at `db_path`, or at the configured location
    pub async fn open(config: Config, db_path: Option<&Path>) -> Result<Self> {
        let path = match db_path {
            Some(path) => path.to_path_buf(),
            None => config.db_path()?,
        };
        let store = SqliteStore::open(&path, &config.store.options()).await?;
        Ok(Self { config, store })
    }

    /// Wrap an already opened store
    pub fn with_store(config: Config, store: SqliteStore) -> Self {
        Self { config, store }
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the scheduling loop from config with the configured model and source
    pub fn scheduler(&self) -> Result<SchedulingLoop> {
        let model: Arc<dyn Model> = Arc::from(model::build(&self.config.model)?);
        let source: Arc<dyn InputSource> = Arc::from(source::build(&self.config.source));
        self.scheduler_with(source, model)
    }

    /// Build the scheduling loop around a caller-supplied source and model
    pub fn scheduler_with(&self, source: Arc<dyn InputSource>, model: Arc<dyn Model>) -> Result<SchedulingLoop> {
        let executor = PredictionExecutor::new(self.store.clone(), model, self.config.engine.compute_timeout());
        let evaluator = StalenessEvaluator::new(self.store.clone()).with_max_age(self.config.engine.max_age());

        let scheduler = SchedulingLoop::new(source, self.store.clone(), evaluator, executor, &self.config.scheduler)?
            .with_maintenance(self.config.retention.maintenance());
        Ok(scheduler)
    }

    /// Current committed prediction for a subject
    pub async fn query(&self, subject: &Subject) -> Result<Option<PredictionRecord>> {
        Ok(self.store.current(subject).await?)
    }

    /// Committed predictions for a subject, newest version first
    pub async fn history(&self, subject: &Subject, limit: usize) -> Result<Vec<PredictionRecord>> {
        Ok(self.store.history(subject, limit).await?)
    }

    pub async fn failed(&self) -> Result<Vec<SubjectState>> {
        Ok(self.store.list_failed().await?)
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        Ok(ServiceStats {
            store: self.store.stats().await?,
            accuracy: self.store.accuracy().await?,
        })
    }

    pub async fn accuracy(&self) -> Result<AccuracyReport> {
        Ok(self.store.accuracy().await?)
    }

    pub async fn record_outcome(&self, subject: &Subject, version: InputVersion, actual: f64) -> Result<OutcomeRecord> {
        let outcome = self.store.record_outcome(subject, version, actual).await?;
        info!(
            "Recorded outcome for {} at {}: predicted {:.4}, actual {:.4}",
            subject, version, outcome.predicted, outcome.actual
        );
        Ok(outcome)
    }

    /// Close orphaned attempts using the configured grace period
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let coordinator = CommitCoordinator::new(self.store.clone());
        Ok(coordinator.recover(self.config.retention.recovery_grace()).await?)
    }

    /// Purge closed ledger entries and history past the retention windows
    pub async fn gc(&self) -> Result<PurgeReport> {
        let maintenance = self.config.retention.maintenance();
        let now = chrono::Utc::now();
        let ledger_before = now - chrono::Duration::from_std(maintenance.ledger_retention)?;
        let history_before = now - chrono::Duration::from_std(maintenance.history_retention)?;
        Ok(self.store.purge_expired(ledger_before, history_before).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_end_to_end_with_momentum_model() {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.scheduler.jitter_ms = 0;

        let service = PredictorService::open(config, Some(dir.path().join("p.db").as_path())).await.unwrap();
        let source = MemorySource::new();
        let series: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let version = source.publish("BTC", json!({ "series": series })).await;

        let model: Arc<dyn Model> = Arc::from(model::build(&service.config().model).unwrap());
        let scheduler = service.scheduler_with(Arc::new(source), model).unwrap();
        scheduler.tick().await.unwrap();
        scheduler.wait_idle().await;

        let btc = Subject::new("BTC");
        let current = service.query(&btc).await.unwrap().unwrap();
        assert_eq!(current.input_version, version);
        assert!(current.value > 30.0);

        service.record_outcome(&btc, version, 31.0).await.unwrap();
        let stats = service.stats().await.unwrap();
        assert_eq!(stats.store.committed, 1);
        assert_eq!(stats.accuracy.total, 1);
        assert!(service.failed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_gc_and_recover_on_empty_store() {
        let service = PredictorService::with_store(Config::default(), SqliteStore::open_in_memory().unwrap());
        assert_eq!(service.recover().await.unwrap(), RecoveryReport::default());
        assert_eq!(service.gc().await.unwrap(), PurgeReport::default());
        assert!(service.query(&Subject::new("none")).await.unwrap().is_none());
    }
}
