//! Commit coordination
//!
//! Promotes a pending record to the committed one when, and only when, its
//! input version is newer than what is stored. Also owns the abort path and
//! startup recovery of attempts left open by a crash.

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::store::{RecoveryReport, SqliteStore};
use crate::types::{CommitOutcome, PredictionRecord};

#[derive(Clone)]
pub struct CommitCoordinator {
    store: SqliteStore,
}

impl CommitCoordinator {
    pub fn new(store: SqliteStore) -> Self {
        Self { store }
    }

    /// Commit a staged record.
    ///
    /// Losing a same-version race is `Ok(Superseded)`. A record older than
    /// the committed one is rejected with `ValidationViolation` and never
    /// written.
    pub async fn commit(&self, record: &PredictionRecord) -> Result<CommitOutcome> {
        let outcome = self.store.commit_pending(&record.attempt_id).await?;

        match outcome {
            CommitOutcome::Committed { replaced } => {
                info!(
                    "Committed {} at {} (replaced {})",
                    record.subject,
                    record.input_version,
                    replaced.map(|v| v.to_string()).unwrap_or_else(|| "nothing".to_string())
                );
            }
            CommitOutcome::Superseded { committed_version } => {
                info!(
                    "Attempt for {} at {} superseded by {}",
                    record.subject, record.input_version, committed_version
                );
            }
            CommitOutcome::Aborted => {
                warn!(
                    "Attempt {} for {} was aborted before commit",
                    record.attempt_id, record.subject
                );
            }
            CommitOutcome::AlreadyCommitted => {}
        }

        Ok(outcome)
    }

    /// Discard a staged record; true if this call closed the attempt
    pub async fn abort(&self, record: &PredictionRecord, reason: &str) -> Result<bool> {
        let closed = self.store.abort_pending(&record.attempt_id, reason).await?;
        if closed {
            info!("Aborted attempt for {} at {}: {}", record.subject, record.input_version, reason);
        }
        Ok(closed)
    }

    /// Close attempts left open longer than `grace`.
    ///
    /// Run at startup before the first tick, and periodically afterwards.
    pub async fn recover(&self, grace: Duration) -> Result<RecoveryReport> {
        let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - grace;
        let report = self.store.recover_orphans(cutoff).await?;

        if report.scanned > 0 || report.stray_pending_removed > 0 {
            info!(
                "Recovery: {} stale attempts ({} aborted, {} reconciled), {} stray pending rows removed",
                report.scanned, report.aborted, report.reconciled, report.stray_pending_removed
            );
        }
        Ok(report)
    }
}
