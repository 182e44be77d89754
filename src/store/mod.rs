//! Durable store for predictions and the attempt ledger
//!
//! Provides:
//! - SQLite persistence (WAL mode) of current and superseded predictions
//! - A ledger of in-flight attempts for crash recovery
//! - Transactional read-validate-write commits
//! - Retention purging and realised-outcome tracking

pub mod schema;
pub mod sqlite;
pub mod outcomes;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use sqlite::SqliteStore;
pub use outcomes::{AccuracyReport, OutcomeRecord, SubjectAccuracy};

/// Options applied when opening a store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreOptions {
    /// How long SQLite waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreOptions {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// What a crash-recovery pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Open ledger entries older than the grace period
    pub scanned: usize,
    /// Entries closed as aborted, pending row discarded
    pub aborted: usize,
    /// Entries whose commit had landed but whose ledger row was still open
    pub reconciled: usize,
    /// Pending rows with no open ledger entry behind them
    pub stray_pending_removed: usize,
}

/// What a retention purge removed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    pub ledger_removed: usize,
    pub history_removed: usize,
}

/// Store-wide row counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub subjects: usize,
    pub failed_subjects: usize,
    pub committed: usize,
    pub superseded: usize,
    pub pending: usize,
    pub open_attempts: usize,
    pub ledger_entries: usize,
}

/// Version and commit time of a subject's current prediction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedMarker {
    pub input_version: crate::types::InputVersion,
    pub committed_at: chrono::DateTime<chrono::Utc>,
}
