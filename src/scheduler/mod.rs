//! Scheduling loop
//!
//! Periodically pulls a snapshot from the input source, asks the staleness
//! evaluator which subjects need work, and dispatches one attempt per stale
//! subject under a concurrency ceiling. Failed attempts are retried after a
//! backoff delay without waiting for the next tick; a subject that keeps
//! failing at the same version is marked failed and reported until a newer
//! version arrives.

pub mod backoff;
pub mod schedule;

use anyhow::{Context, Result};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::{CommitCoordinator, PredictionExecutor, StalenessEvaluator};
use crate::error::{panic_message, ErrorClass, PredictorError};
use crate::source::InputSource;
use crate::store::SqliteStore;
use crate::types::{CommitOutcome, FailureReport, InputVersion, Subject, SubjectInput, SubjectStatus};

pub use backoff::RetryPolicy;
pub use schedule::TickSchedule;

/// Scheduler section of config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between ticks when no cron expression is set
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Cron expression with a seconds field, e.g. "0 */5 * * * *"
    #[serde(default)]
    pub cron: Option<String>,
    /// Maximum attempts computing at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Attempts per subject and version before it is marked failed
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
    /// Committed predictions below this confidence are only logged at debug
    #[serde(default)]
    pub min_confidence: f64,
}

fn default_interval() -> u64 { 60 }
fn default_max_concurrency() -> usize { 4 }
fn default_max_attempts() -> u32 { 5 }
fn default_base_backoff() -> u64 { 1_000 }
fn default_max_backoff() -> u64 { 300_000 }
fn default_jitter() -> u64 { 250 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            cron: None,
            max_concurrency: default_max_concurrency(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter_ms: default_jitter(),
            min_confidence: 0.0,
        }
    }
}

impl SchedulerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base: Duration::from_millis(self.base_backoff_ms),
            max: Duration::from_millis(self.max_backoff_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }

    pub fn tick_schedule(&self) -> Result<TickSchedule> {
        match &self.cron {
            Some(expr) => TickSchedule::cron(expr),
            None => Ok(TickSchedule::Interval(Duration::from_secs(self.interval_secs.max(1)))),
        }
    }
}

/// Periodic housekeeping run alongside the tick schedule
#[derive(Debug, Clone)]
pub struct Maintenance {
    pub every: Duration,
    /// Open attempts older than this are treated as orphans
    pub recovery_grace: Duration,
    pub ledger_retention: Duration,
    pub history_retention: Duration,
}

/// What a single tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub observed: usize,
    pub dispatched: usize,
    pub current: usize,
    pub skipped_in_flight: usize,
    /// Waiting on a scheduled retry
    pub skipped_backoff: usize,
    pub skipped_failed: usize,
    /// Inputs that can never be stored (empty subject, version past i64::MAX)
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    version: InputVersion,
    failures: u32,
}

#[derive(Default)]
struct DispatchState {
    in_flight: HashSet<Subject>,
    retries: HashMap<Subject, RetryState>,
}

/// Everything a dispatched attempt needs, shared with the spawned tasks
struct Shared {
    store: SqliteStore,
    executor: PredictionExecutor,
    coordinator: CommitCoordinator,
    policy: RetryPolicy,
    min_confidence: f64,
    permits: Semaphore,
    state: Mutex<DispatchState>,
    failures: Mutex<Option<mpsc::UnboundedSender<FailureReport>>>,
    /// Flipped on shutdown so sleeping retries give up
    stop: watch::Sender<bool>,
}

pub struct SchedulingLoop {
    source: Arc<dyn InputSource>,
    evaluator: StalenessEvaluator,
    schedule: TickSchedule,
    maintenance: Option<Maintenance>,
    shared: Arc<Shared>,
    tasks: Mutex<JoinSet<()>>,
}

impl SchedulingLoop {
    pub fn new(
        source: Arc<dyn InputSource>,
        store: SqliteStore,
        evaluator: StalenessEvaluator,
        executor: PredictionExecutor,
        config: &SchedulerConfig,
    ) -> Result<Self> {
        let schedule = config.tick_schedule()?;
        let coordinator = CommitCoordinator::new(store.clone());

        Ok(Self {
            source,
            evaluator,
            schedule,
            maintenance: None,
            shared: Arc::new(Shared {
                store,
                executor,
                coordinator,
                policy: config.retry_policy(),
                min_confidence: config.min_confidence,
                permits: Semaphore::new(config.max_concurrency.max(1)),
                state: Mutex::new(DispatchState::default()),
                failures: Mutex::new(None),
                stop: watch::Sender::new(false),
            }),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    pub fn with_maintenance(mut self, maintenance: Maintenance) -> Self {
        self.maintenance = Some(maintenance);
        self
    }

    /// Receive a report each time a subject exhausts its attempts
    pub async fn failure_reports(&self) -> mpsc::UnboundedReceiver<FailureReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.failures.lock().await = Some(tx);
        rx
    }

    pub fn coordinator(&self) -> &CommitCoordinator {
        &self.shared.coordinator
    }

    /// Run one pass over the source and dispatch attempts for stale subjects.
    ///
    /// Returns once attempts are spawned; use [`wait_idle`](Self::wait_idle)
    /// to wait for them to finish.
    pub async fn tick(&self) -> Result<TickReport> {
        self.reap_finished().await;

        let inputs = self
            .source
            .snapshot()
            .await
            .with_context(|| format!("Failed to read from '{}' source", self.source.name()))?;

        let mut report = TickReport::default();
        for input in inputs {
            report.observed += 1;

            if let Err(e) = input.validate() {
                warn!("Ignoring input from '{}' source: {}", self.source.name(), e);
                report.rejected += 1;
                continue;
            }

            let state = self.shared.store.observe_subject(&input.subject, input.version).await?;
            if state.status == SubjectStatus::Failed
                && state.failed_version.is_some_and(|v| v >= input.version)
            {
                report.skipped_failed += 1;
                continue;
            }

            {
                let mut dispatch = self.shared.state.lock().await;
                if dispatch.in_flight.contains(&input.subject) {
                    report.skipped_in_flight += 1;
                    continue;
                }
                // A pending retry owns its version; only a newer one replaces it
                if let Some(retry) = dispatch.retries.get(&input.subject).copied() {
                    if retry.version < input.version {
                        dispatch.retries.remove(&input.subject);
                    } else {
                        report.skipped_backoff += 1;
                        continue;
                    }
                }
            }

            let staleness = self.evaluator.evaluate(&input.subject, input.version).await?;
            if !staleness.needs_compute() {
                report.current += 1;
                continue;
            }

            debug!("{} is {}, dispatching {}", input.subject, staleness, input.version);
            self.dispatch(input).await;
            report.dispatched += 1;
        }

        Ok(report)
    }

    async fn dispatch(&self, input: SubjectInput) {
        self.shared
            .state
            .lock()
            .await
            .in_flight
            .insert(input.subject.clone());

        let shared = Arc::clone(&self.shared);
        self.tasks.lock().await.spawn(shared.drive(input));
    }

    async fn reap_finished(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!("Prediction task panicked: {}", e);
            }
        }
    }

    /// Wait until every dispatched attempt has finished, including retries
    /// still waiting out their backoff
    pub async fn wait_idle(&self) {
        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Prediction task panicked: {}", e);
            }
        }
    }

    /// Close orphaned attempts and purge expired rows
    pub async fn maintain(&self) -> Result<()> {
        let Some(maintenance) = &self.maintenance else {
            return Ok(());
        };

        self.shared.coordinator.recover(maintenance.recovery_grace).await?;

        let now = chrono::Utc::now();
        let ledger_before = now - chrono::Duration::from_std(maintenance.ledger_retention)?;
        let history_before = now - chrono::Duration::from_std(maintenance.history_retention)?;
        let purged = self.shared.store.purge_expired(ledger_before, history_before).await?;
        if purged.ledger_removed > 0 || purged.history_removed > 0 {
            info!(
                "Retention: removed {} ledger entries and {} history rows",
                purged.ledger_removed, purged.history_removed
            );
        }
        Ok(())
    }

    /// Tick on schedule until shutdown, then drop pending retries and drain
    /// in-flight attempts
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!(
            "Scheduling loop started ({}, source: {}, model: {})",
            self.schedule,
            self.source.name(),
            self.shared.executor.model_name()
        );

        let maintenance_every = self
            .maintenance
            .as_ref()
            .map(|m| m.every.max(Duration::from_secs(1)))
            .unwrap_or(Duration::from_secs(3600));
        let mut maintenance = tokio::time::interval_at(Instant::now() + maintenance_every, maintenance_every);
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Created once; maintenance must not push the next tick back
        let mut deadline = Instant::now() + self.schedule.until_next();
        let tick_timer = tokio::time::sleep_until(deadline);
        tokio::pin!(tick_timer);

        loop {
            tokio::select! {
                () = &mut tick_timer => {
                    match self.tick().await {
                        Ok(report) if report.dispatched > 0 => info!(
                            "Tick: {} observed, {} dispatched, {} current",
                            report.observed, report.dispatched, report.current
                        ),
                        Ok(report) => debug!("Tick: {:?}", report),
                        Err(e) => warn!("Tick failed: {:#}", e),
                    }
                    deadline = self.schedule.next_deadline(deadline);
                    tick_timer.as_mut().reset(deadline);
                }
                _ = maintenance.tick() => {
                    if let Err(e) = self.maintain().await {
                        warn!("Maintenance failed: {:#}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Scheduling loop shutting down, waiting for in-flight attempts");
                    break;
                }
            }
        }

        self.shared.stop.send_replace(true);
        self.wait_idle().await;
        self.shared.store.checkpoint().await?;
        info!("Scheduling loop stopped");
        Ok(())
    }
}

impl Shared {
    /// Attempt `input` until it commits, is discarded or exhausts its
    /// retries. The subject is in flight only while an attempt runs.
    async fn drive(self: Arc<Self>, input: SubjectInput) {
        loop {
            let result = {
                let Ok(_permit) = self.permits.acquire().await else {
                    self.state.lock().await.in_flight.remove(&input.subject);
                    return;
                };
                AssertUnwindSafe(self.attempt(&input))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|payload| {
                        Err(PredictorError::ModelPanicked {
                            subject: input.subject.clone(),
                            message: panic_message(payload.as_ref()),
                        })
                    })
            };

            let Some(delay) = self.finish(&input, result).await else {
                return;
            };

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.stopping() => {
                    debug!("Dropping retry for {} at {} on shutdown", input.subject, input.version);
                    return;
                }
            }

            if !self.resume(&input).await {
                return;
            }
        }
    }

    /// Claim a due retry, unless a newer version replaced it meanwhile
    async fn resume(&self, input: &SubjectInput) -> bool {
        let mut dispatch = self.state.lock().await;
        let scheduled = dispatch
            .retries
            .get(&input.subject)
            .is_some_and(|retry| retry.version == input.version);
        if !scheduled || dispatch.in_flight.contains(&input.subject) {
            return false;
        }
        dispatch.in_flight.insert(input.subject.clone());
        true
    }

    async fn stopping(&self) {
        let mut stop = self.stop.subscribe();
        loop {
            let stopped = *stop.borrow_and_update();
            if stopped || stop.changed().await.is_err() {
                return;
            }
        }
    }

    /// Execute then commit. A commit that fails on storage aborts the attempt.
    async fn attempt(&self, input: &SubjectInput) -> Result<CommitOutcome, PredictorError> {
        let record = self.executor.execute(input).await?;

        match self.coordinator.commit(&record).await {
            Ok(outcome) => {
                if matches!(outcome, CommitOutcome::Committed { .. }) {
                    if record.confidence < self.min_confidence {
                        debug!(
                            "{} at {}: {:.4} below confidence floor ({:.2} < {:.2})",
                            record.subject, record.input_version, record.value,
                            record.confidence, self.min_confidence
                        );
                    } else {
                        info!(
                            "{} at {}: {:.4} (confidence {:.2})",
                            record.subject, record.input_version, record.value, record.confidence
                        );
                    }
                }
                Ok(outcome)
            }
            Err(e) => {
                if e.class() == ErrorClass::PersistenceFailure {
                    if let Err(abort_err) = self.coordinator.abort(&record, "commit failed").await {
                        warn!("Failed to abort {}: {}", record.attempt_id, abort_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// Record the outcome of an attempt. Returns the backoff before the next
    /// attempt when one is due.
    async fn finish(&self, input: &SubjectInput, result: Result<CommitOutcome, PredictorError>) -> Option<Duration> {
        let subject = &input.subject;
        let mut exhausted = None;
        let mut retry_in = None;

        {
            let mut dispatch = self.state.lock().await;
            dispatch.in_flight.remove(subject);

            match &result {
                Ok(_) => {
                    dispatch.retries.remove(subject);
                }
                Err(e) if e.is_retryable() => {
                    let failures = match dispatch.retries.get(subject) {
                        Some(retry) if retry.version == input.version => retry.failures + 1,
                        _ => 1,
                    };

                    if self.policy.exhausted(failures) {
                        dispatch.retries.remove(subject);
                        exhausted = Some(FailureReport {
                            subject: subject.clone(),
                            input_version: input.version,
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    } else {
                        let delay = self.policy.delay(failures);
                        warn!(
                            "Attempt {} for {} at {} failed, retrying in {:?}: {}",
                            failures, subject, input.version, delay, e
                        );
                        dispatch.retries.insert(
                            subject.clone(),
                            RetryState {
                                version: input.version,
                                failures,
                            },
                        );
                        retry_in = Some(delay);
                    }
                }
                Err(e) => {
                    // Rejected outright; a newer version will be picked up on its own
                    dispatch.retries.remove(subject);
                    warn!("Discarded attempt for {} at {}: {}", subject, input.version, e);
                }
            }
        }

        if let Some(report) = exhausted {
            error!(
                "{} failed {} times at {}, giving up until a newer version arrives: {}",
                report.subject, report.attempts, report.input_version, report.last_error
            );
            if let Err(e) = self
                .store
                .mark_failed(&report.subject, report.input_version, &report.last_error)
                .await
            {
                warn!("Failed to record failure for {}: {}", report.subject, e);
            }
            if let Some(tx) = self.failures.lock().await.as_ref() {
                let _ = tx.send(report);
            }
        }

        retry_in
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MockModel, Model};
    use crate::source::MemorySource;
    use crate::types::ModelOutput;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            base_backoff_ms: 0,
            max_backoff_ms: 0,
            jitter_ms: 0,
            max_attempts: 3,
            ..Default::default()
        }
    }

    fn build(source: MemorySource, store: SqliteStore, model: Arc<dyn Model>, config: &SchedulerConfig) -> SchedulingLoop {
        let executor = PredictionExecutor::new(store.clone(), model, Duration::from_secs(1));
        let evaluator = StalenessEvaluator::new(store.clone());
        SchedulingLoop::new(Arc::new(source), store, evaluator, executor, config).unwrap()
    }

    fn echo_model() -> Arc<dyn Model> {
        let mut model = MockModel::new();
        model.expect_compute().returning(|payload| {
            Ok(ModelOutput::new(payload["x"].as_f64().unwrap_or(0.0), 0.9))
        });
        model.expect_name().return_const("echo");
        Arc::new(model)
    }

    #[tokio::test]
    async fn test_tick_computes_only_stale_subjects() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({ "x": 10.0 })).await;
        source.publish("B", json!({ "x": 5.0 })).await;

        let scheduler = build(source.clone(), store.clone(), echo_model(), &config());

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.observed, 2);
        assert_eq!(report.dispatched, 2);
        scheduler.wait_idle().await;

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.current, 2);

        source.publish("A", json!({ "x": 12.0 })).await;
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        scheduler.wait_idle().await;

        let a = store.current(&Subject::new("A")).await.unwrap().unwrap();
        assert_eq!(a.value, 12.0);
        assert_eq!(a.input_version, InputVersion(2));
    }

    #[tokio::test]
    async fn test_repeated_failure_marks_subject_failed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({})).await;

        let mut model = MockModel::new();
        model
            .expect_compute()
            .times(3)
            .returning(|_| Err(anyhow::anyhow!("upstream unavailable")));
        model.expect_name().return_const("flaky");

        let scheduler = build(source.clone(), store.clone(), Arc::new(model), &config());
        let mut reports = scheduler.failure_reports().await;

        // Retries run on their own; one tick carries the subject to failure
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
        scheduler.wait_idle().await;

        let report = reports.try_recv().unwrap();
        assert_eq!(report.subject, Subject::new("A"));
        assert_eq!(report.attempts, 3);
        assert_eq!(report.input_version, InputVersion(1));

        let failed = store.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);

        // No further attempts at the failed version
        let tick = scheduler.tick().await.unwrap();
        assert_eq!(tick.skipped_failed, 1);
        assert_eq!(tick.dispatched, 0);
        assert!(store.current(&Subject::new("A")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backoff_defers_retry() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({})).await;

        let mut model = MockModel::new();
        model
            .expect_compute()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("nope")));
        model.expect_name().return_const("flaky");

        let cfg = SchedulerConfig {
            base_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            jitter_ms: 0,
            ..Default::default()
        };
        let scheduler = build(source.clone(), store.clone(), Arc::new(model), &cfg);

        scheduler.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.skipped_backoff, 1);
        assert_eq!(report.dispatched, 0);
        assert_eq!(store.stats().await.unwrap().ledger_entries, 1);
    }

    /// Fails the first `failures` calls, then echoes `payload.x`
    struct FlakyModel {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Model for FlakyModel {
        async fn compute(&self, payload: &serde_json::Value) -> anyhow::Result<ModelOutput> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("upstream unavailable");
            }
            Ok(ModelOutput::new(payload["x"].as_f64().unwrap_or(0.0), 0.9))
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_retry_fires_after_backoff_without_a_tick() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({ "x": 4.0 })).await;

        let model = Arc::new(FlakyModel {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        // Ticks are an hour apart; only the backoff can bring the retries
        let cfg = SchedulerConfig {
            interval_secs: 3600,
            base_backoff_ms: 50,
            max_backoff_ms: 1_000,
            jitter_ms: 0,
            max_attempts: 5,
            ..Default::default()
        };
        let scheduler = build(source, store.clone(), model.clone(), &cfg);

        let started = Instant::now();
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_idle())
            .await
            .expect("retries should not wait for a tick");
        let elapsed = started.elapsed();

        // 50ms then 100ms of backoff
        assert!(elapsed >= Duration::from_millis(150), "retried too early: {:?}", elapsed);
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);

        let a = store.current(&Subject::new("A")).await.unwrap().unwrap();
        assert_eq!(a.value, 4.0);
        assert_eq!(store.stats().await.unwrap().open_attempts, 0);
    }

    #[tokio::test]
    async fn test_newer_version_replaces_pending_retry() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({ "x": 1.0 })).await;

        let model = Arc::new(FlakyModel {
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let cfg = SchedulerConfig {
            base_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            jitter_ms: 0,
            ..Default::default()
        };
        let scheduler = build(source.clone(), store.clone(), model.clone(), &cfg);

        scheduler.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        source.publish("A", json!({ "x": 2.0 })).await;
        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.skipped_backoff, 0);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let a = store.current(&Subject::new("A")).await.unwrap().unwrap();
        assert_eq!(a.input_version, InputVersion(2));
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }

    struct PanicModel;

    #[async_trait::async_trait]
    impl Model for PanicModel {
        async fn compute(&self, _payload: &serde_json::Value) -> anyhow::Result<ModelOutput> {
            panic!("model bug");
        }

        fn name(&self) -> &'static str {
            "panic"
        }
    }

    #[tokio::test]
    async fn test_panicking_model_is_retried_then_marked_failed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({})).await;

        let cfg = SchedulerConfig {
            max_attempts: 2,
            ..config()
        };
        let scheduler = build(source, store.clone(), Arc::new(PanicModel), &cfg);
        let mut reports = scheduler.failure_reports().await;

        scheduler.tick().await.unwrap();
        scheduler.wait_idle().await;

        let report = reports.try_recv().unwrap();
        assert_eq!(report.attempts, 2);
        assert!(report.last_error.contains("model bug"));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed_subjects, 1);
        assert_eq!(stats.open_attempts, 0);

        let tick = scheduler.tick().await.unwrap();
        assert_eq!(tick.skipped_in_flight, 0);
        assert_eq!(tick.skipped_failed, 1);
    }

    #[tokio::test]
    async fn test_unstorable_inputs_are_rejected_every_tick() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source
            .set(SubjectInput {
                subject: Subject::new("A"),
                version: InputVersion(u64::MAX),
                payload: json!({ "x": 1.0 }),
            })
            .await;
        source.publish("", json!({ "x": 1.0 })).await;

        let scheduler = build(source, store.clone(), echo_model(), &config());

        for _ in 0..3 {
            let report = scheduler.tick().await.unwrap();
            assert_eq!(report.rejected, 2);
            assert_eq!(report.dispatched, 0);
            scheduler.wait_idle().await;
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.ledger_entries, 0);
        assert_eq!(stats.subjects, 0);
    }

    struct GaugeModel {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Model for GaugeModel {
        async fn compute(&self, _payload: &serde_json::Value) -> anyhow::Result<ModelOutput> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(ModelOutput::new(1.0, 1.0))
        }

        fn name(&self) -> &'static str {
            "gauge"
        }
    }

    #[tokio::test]
    async fn test_concurrency_ceiling() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        for i in 0..10 {
            source.publish(format!("S{}", i).as_str(), json!({})).await;
        }

        let model = Arc::new(GaugeModel {
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let cfg = SchedulerConfig {
            max_concurrency: 3,
            ..config()
        };
        let scheduler = build(source, store.clone(), model.clone(), &cfg);

        let report = scheduler.tick().await.unwrap();
        assert_eq!(report.dispatched, 10);
        scheduler.wait_idle().await;

        assert!(model.peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(store.stats().await.unwrap().committed, 10);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({ "x": 1.0 })).await;

        let cfg = SchedulerConfig {
            interval_secs: 1,
            ..config()
        };
        let scheduler = Arc::new(build(source, store.clone(), echo_model(), &cfg));
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert!(store.current(&Subject::new("A")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_run_ticks_when_maintenance_is_more_frequent() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({ "x": 1.0 })).await;

        let cfg = SchedulerConfig {
            interval_secs: 2,
            ..config()
        };
        let scheduler = Arc::new(build(source, store.clone(), echo_model(), &cfg).with_maintenance(Maintenance {
            every: Duration::from_secs(1),
            recovery_grace: Duration::from_secs(30),
            ledger_retention: Duration::from_secs(86_400),
            history_retention: Duration::from_secs(86_400),
        }));
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(3500)).await;
        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();

        assert!(
            store.current(&Subject::new("A")).await.unwrap().is_some(),
            "tick never fired between maintenance runs"
        );
    }

    #[tokio::test]
    async fn test_shutdown_drops_pending_retries() {
        let store = SqliteStore::open_in_memory().unwrap();
        let source = MemorySource::new();
        source.publish("A", json!({})).await;

        let mut model = MockModel::new();
        model
            .expect_compute()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("nope")));
        model.expect_name().return_const("flaky");

        let cfg = SchedulerConfig {
            interval_secs: 1,
            base_backoff_ms: 600_000,
            max_backoff_ms: 600_000,
            jitter_ms: 0,
            ..Default::default()
        };
        let scheduler = Arc::new(build(source, store, Arc::new(model), &cfg));
        let (tx, rx) = broadcast::channel(1);

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.run(rx).await })
        };

        tokio::time::sleep(Duration::from_millis(1500)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("shutdown waited on a retry backoff")
            .unwrap()
            .unwrap();
    }
}
