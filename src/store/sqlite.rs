//! SQLite-backed prediction store

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::schema;
use super::{CommittedMarker, PurgeReport, RecoveryReport, StoreOptions, StoreStats};
use crate::error::{PredictorError, Result};
use crate::types::{
    CommitOutcome, InputVersion, LedgerEntry, LedgerOutcome, PredictionRecord, PredictionStatus,
    Subject, SubjectState, SubjectStatus,
};

/// SQLite-based prediction store.
///
/// The connection sits behind an async mutex, so every operation below is a
/// single serialized unit of work; multi-row mutations additionally run in a
/// `BEGIN IMMEDIATE` transaction so they are never partially applied.
#[derive(Clone)]
pub struct SqliteStore {
    pub(super) conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the store at the given path
    pub async fn open<P: AsRef<Path>>(path: P, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(&path)?;
        schema::configure(&conn, options)?;
        schema::init_schema(&conn)?;

        info!("Opened prediction store at {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open a private in-memory store (tests and dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    // ------------------------------------------------------------------
    // Subjects
    // ------------------------------------------------------------------

    /// Register a subject on first observation and record the latest version
    /// seen. A failed subject becomes active again once a newer version
    /// than the one it failed on arrives.
    pub async fn observe_subject(&self, subject: &Subject, version: InputVersion) -> Result<SubjectState> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = fmt_time(Utc::now());

        tx.execute(
            r#"INSERT INTO subjects (subject, first_seen, last_seen, latest_version, status)
               VALUES (?1, ?2, ?2, ?3, 'active')
               ON CONFLICT(subject) DO UPDATE SET
                   last_seen = excluded.last_seen,
                   latest_version = MAX(latest_version, excluded.latest_version)"#,
            params![subject.as_str(), now, version],
        )?;

        tx.execute(
            r#"UPDATE subjects
               SET status = 'active', failed_version = NULL, failure_reason = NULL
               WHERE subject = ?1 AND status = 'failed' AND failed_version < ?2"#,
            params![subject.as_str(), version],
        )?;

        let state = tx.query_row(
            &format!("{} WHERE subject = ?1", SUBJECT_SELECT),
            params![subject.as_str()],
            subject_from_row,
        )?;
        tx.commit()?;

        Ok(state)
    }

    pub async fn get_subject(&self, subject: &Subject) -> Result<Option<SubjectState>> {
        let conn = self.conn.lock().await;
        let state = conn
            .query_row(
                &format!("{} WHERE subject = ?1", SUBJECT_SELECT),
                params![subject.as_str()],
                subject_from_row,
            )
            .optional()?;
        Ok(state)
    }

    /// Mark a subject failed at a version after its attempt ceiling ran out
    pub async fn mark_failed(&self, subject: &Subject, version: InputVersion, reason: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let now = fmt_time(Utc::now());
        conn.execute(
            r#"INSERT INTO subjects (subject, first_seen, last_seen, latest_version, status, failed_version, failure_reason)
               VALUES (?1, ?2, ?2, ?3, 'failed', ?3, ?4)
               ON CONFLICT(subject) DO UPDATE SET
                   status = 'failed',
                   failed_version = excluded.failed_version,
                   failure_reason = excluded.failure_reason"#,
            params![subject.as_str(), now, version, reason],
        )?;
        Ok(())
    }

    pub async fn list_failed(&self) -> Result<Vec<SubjectState>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE status = 'failed' ORDER BY subject",
            SUBJECT_SELECT
        ))?;
        let rows = stmt
            .query_map([], subject_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Committed predictions
    // ------------------------------------------------------------------

    /// The subject's current committed prediction
    pub async fn current(&self, subject: &Subject) -> Result<Option<PredictionRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                r#"SELECT attempt_id, subject, value, confidence, input_version, computed_at
                   FROM predictions WHERE subject = ?1"#,
                params![subject.as_str()],
                |row| record_from_row(row, PredictionStatus::Committed),
            )
            .optional()?;
        Ok(record)
    }

    /// Version and commit time of the current prediction, read in one statement
    pub async fn committed_marker(&self, subject: &Subject) -> Result<Option<CommittedMarker>> {
        let conn = self.conn.lock().await;
        let marker = conn
            .query_row(
                "SELECT input_version, committed_at FROM predictions WHERE subject = ?1",
                params![subject.as_str()],
                |row| {
                    Ok(CommittedMarker {
                        input_version: InputVersion::from_sql(row.get(0)?),
                        committed_at: parse_time(1, row.get(1)?)?,
                    })
                },
            )
            .optional()?;
        Ok(marker)
    }

    /// Current plus superseded predictions, newest version first
    pub async fn history(&self, subject: &Subject, limit: usize) -> Result<Vec<PredictionRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT attempt_id, subject, value, confidence, input_version, computed_at
               FROM (
                   SELECT attempt_id, subject, value, confidence, input_version, computed_at
                   FROM predictions WHERE subject = ?1
                   UNION ALL
                   SELECT attempt_id, subject, value, confidence, input_version, computed_at
                   FROM prediction_history WHERE subject = ?1
               )
               ORDER BY input_version DESC
               LIMIT ?2"#,
        )?;
        let records = stmt
            .query_map(params![subject.as_str(), limit as i64], |row| {
                record_from_row(row, PredictionStatus::Committed)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Ledger and pending records
    // ------------------------------------------------------------------

    /// Append an open ledger entry for a new attempt
    pub async fn open_attempt(&self, subject: &Subject, version: InputVersion) -> Result<LedgerEntry> {
        let conn = self.conn.lock().await;
        let entry = LedgerEntry {
            attempt_id: Uuid::new_v4().to_string(),
            subject: subject.clone(),
            input_version: version,
            started_at: Utc::now(),
            closed_at: None,
            outcome: None,
            detail: None,
        };

        conn.execute(
            r#"INSERT INTO ledger (attempt_id, subject, input_version, started_at)
               VALUES (?1, ?2, ?3, ?4)"#,
            params![
                entry.attempt_id,
                subject.as_str(),
                version,
                fmt_time(entry.started_at),
            ],
        )?;

        debug!("Opened attempt {} for {} at {}", entry.attempt_id, subject, version);
        Ok(entry)
    }

    /// Write a pending record for an open attempt.
    ///
    /// Returns false when the attempt was closed in the meantime (for
    /// instance by recovery); nothing is written in that case.
    pub async fn insert_pending(&self, record: &PredictionRecord) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let outcome: Option<Option<String>> = tx
            .query_row(
                "SELECT outcome FROM ledger WHERE attempt_id = ?1",
                params![record.attempt_id],
                |row| row.get(0),
            )
            .optional()?;

        match outcome {
            None => return Err(PredictorError::UnknownAttempt(record.attempt_id.clone())),
            Some(Some(_)) => return Ok(false),
            Some(None) => {}
        }

        tx.execute(
            r#"INSERT INTO pending_predictions
               (attempt_id, subject, value, confidence, input_version, computed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                record.attempt_id,
                record.subject.as_str(),
                record.value,
                record.confidence,
                record.input_version,
                fmt_time(record.computed_at),
            ],
        )?;
        tx.commit()?;

        Ok(true)
    }

    pub async fn pending(&self, attempt_id: &str) -> Result<Option<PredictionRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                r#"SELECT attempt_id, subject, value, confidence, input_version, computed_at
                   FROM pending_predictions WHERE attempt_id = ?1"#,
                params![attempt_id],
                |row| record_from_row(row, PredictionStatus::Pending),
            )
            .optional()?;
        Ok(record)
    }

    pub async fn ledger_entry(&self, attempt_id: &str) -> Result<Option<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let entry = conn
            .query_row(
                &format!("{} WHERE attempt_id = ?1", LEDGER_SELECT),
                params![attempt_id],
                ledger_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Open ledger entries, optionally only those started at or before a cutoff
    pub async fn open_ledger_entries(&self, started_before: Option<DateTime<Utc>>) -> Result<Vec<LedgerEntry>> {
        let conn = self.conn.lock().await;
        let cutoff = started_before.map(fmt_time);
        let mut stmt = conn.prepare_cached(&format!(
            "{} WHERE outcome IS NULL AND (?1 IS NULL OR started_at <= ?1) ORDER BY started_at",
            LEDGER_SELECT
        ))?;
        let entries = stmt
            .query_map(params![cutoff], ledger_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// Move a pending record to committed, or explain why not.
    ///
    /// The ledger check, the version comparison against the current record
    /// and the swap all happen inside one immediate transaction, so two
    /// concurrent commits for the same subject cannot both observe the old
    /// state. Committing a strictly older version than the current one
    /// discards the pending row, closes the ledger as superseded and returns
    /// `ValidationViolation`.
    pub async fn commit_pending(&self, attempt_id: &str) -> Result<CommitOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = fmt_time(Utc::now());

        let entry = tx
            .query_row(
                &format!("{} WHERE attempt_id = ?1", LEDGER_SELECT),
                params![attempt_id],
                ledger_from_row,
            )
            .optional()?
            .ok_or_else(|| PredictorError::UnknownAttempt(attempt_id.to_string()))?;

        let current: Option<(String, InputVersion)> = tx
            .query_row(
                "SELECT attempt_id, input_version FROM predictions WHERE subject = ?1",
                params![entry.subject.as_str()],
                |row| Ok((row.get(0)?, InputVersion::from_sql(row.get(1)?))),
            )
            .optional()?;

        match entry.outcome {
            Some(LedgerOutcome::Committed) => return Ok(CommitOutcome::AlreadyCommitted),
            Some(LedgerOutcome::Aborted) => {
                tx.execute(
                    "DELETE FROM pending_predictions WHERE attempt_id = ?1",
                    params![attempt_id],
                )?;
                tx.commit()?;
                return Ok(CommitOutcome::Aborted);
            }
            Some(LedgerOutcome::Superseded) => {
                let committed_version = current
                    .map(|(_, v)| v)
                    .unwrap_or(entry.input_version);
                return Ok(CommitOutcome::Superseded { committed_version });
            }
            None => {}
        }

        let pending = tx
            .query_row(
                r#"SELECT attempt_id, subject, value, confidence, input_version, computed_at
                   FROM pending_predictions WHERE attempt_id = ?1"#,
                params![attempt_id],
                |row| record_from_row(row, PredictionStatus::Pending),
            )
            .optional()?;

        let Some(pending) = pending else {
            close_ledger(&tx, attempt_id, LedgerOutcome::Aborted, Some("pending record missing"), &now)?;
            tx.commit()?;
            return Ok(CommitOutcome::Aborted);
        };

        if let Some((_, committed)) = current {
            if committed >= pending.input_version {
                tx.execute(
                    "DELETE FROM pending_predictions WHERE attempt_id = ?1",
                    params![attempt_id],
                )?;

                if committed > pending.input_version {
                    let detail = format!("older than committed {}", committed);
                    close_ledger(&tx, attempt_id, LedgerOutcome::Superseded, Some(&detail), &now)?;
                    tx.commit()?;
                    return Err(PredictorError::ValidationViolation {
                        subject: pending.subject,
                        attempted: pending.input_version,
                        committed,
                    });
                }

                close_ledger(&tx, attempt_id, LedgerOutcome::Superseded, Some("version already committed"), &now)?;
                tx.commit()?;
                return Ok(CommitOutcome::Superseded { committed_version: committed });
            }

            tx.execute(
                r#"INSERT OR IGNORE INTO prediction_history
                   (attempt_id, subject, value, confidence, input_version, computed_at, committed_at, superseded_at)
                   SELECT attempt_id, subject, value, confidence, input_version, computed_at, committed_at, ?2
                   FROM predictions WHERE subject = ?1"#,
                params![pending.subject.as_str(), now],
            )?;
        }

        tx.execute(
            r#"INSERT INTO predictions
               (subject, attempt_id, value, confidence, input_version, computed_at, committed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
               ON CONFLICT(subject) DO UPDATE SET
                   attempt_id = excluded.attempt_id,
                   value = excluded.value,
                   confidence = excluded.confidence,
                   input_version = excluded.input_version,
                   computed_at = excluded.computed_at,
                   committed_at = excluded.committed_at"#,
            params![
                pending.subject.as_str(),
                pending.attempt_id,
                pending.value,
                pending.confidence,
                pending.input_version,
                fmt_time(pending.computed_at),
                now,
            ],
        )?;
        tx.execute(
            "DELETE FROM pending_predictions WHERE attempt_id = ?1",
            params![attempt_id],
        )?;
        close_ledger(&tx, attempt_id, LedgerOutcome::Committed, None, &now)?;
        tx.commit()?;

        Ok(CommitOutcome::Committed {
            replaced: current.map(|(_, v)| v),
        })
    }

    /// Drop the pending record and close the attempt as aborted.
    ///
    /// Returns false if the attempt was already closed; a committed attempt
    /// is never touched.
    pub async fn abort_pending(&self, attempt_id: &str, reason: &str) -> Result<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = fmt_time(Utc::now());

        let outcome: Option<Option<String>> = tx
            .query_row(
                "SELECT outcome FROM ledger WHERE attempt_id = ?1",
                params![attempt_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(outcome) = outcome else {
            return Err(PredictorError::UnknownAttempt(attempt_id.to_string()));
        };

        tx.execute(
            "DELETE FROM pending_predictions WHERE attempt_id = ?1",
            params![attempt_id],
        )?;

        let closed = outcome.is_none()
            && close_ledger(&tx, attempt_id, LedgerOutcome::Aborted, Some(reason), &now)?;
        tx.commit()?;

        Ok(closed)
    }

    /// Close every open attempt started at or before `cutoff`.
    ///
    /// An attempt whose record is the subject's current prediction is
    /// reconciled as committed; anything else is aborted and its pending row
    /// removed. Pending rows without an open ledger entry are swept too.
    pub async fn recover_orphans(&self, cutoff: DateTime<Utc>) -> Result<RecoveryReport> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = fmt_time(Utc::now());
        let mut report = RecoveryReport::default();

        let orphans = {
            let mut stmt = tx.prepare(&format!(
                "{} WHERE outcome IS NULL AND started_at <= ?1",
                LEDGER_SELECT
            ))?;
            let rows = stmt
                .query_map(params![fmt_time(cutoff)], ledger_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        report.scanned = orphans.len();

        for entry in &orphans {
            let landed: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM predictions WHERE subject = ?1 AND attempt_id = ?2)",
                    params![entry.subject.as_str(), entry.attempt_id],
                    |row| row.get(0),
                )?;

            if landed {
                close_ledger(&tx, &entry.attempt_id, LedgerOutcome::Committed, Some("reconciled by recovery"), &now)?;
                report.reconciled += 1;
            } else {
                tx.execute(
                    "DELETE FROM pending_predictions WHERE attempt_id = ?1",
                    params![entry.attempt_id],
                )?;
                close_ledger(&tx, &entry.attempt_id, LedgerOutcome::Aborted, Some("orphaned by unclean shutdown"), &now)?;
                report.aborted += 1;
            }
        }

        report.stray_pending_removed = tx.execute(
            r#"DELETE FROM pending_predictions WHERE attempt_id NOT IN (
                   SELECT attempt_id FROM ledger WHERE outcome IS NULL
               )"#,
            [],
        )?;

        tx.commit()?;
        Ok(report)
    }

    /// Delete closed ledger entries and superseded history past their windows
    pub async fn purge_expired(
        &self,
        ledger_before: DateTime<Utc>,
        history_before: DateTime<Utc>,
    ) -> Result<PurgeReport> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let ledger_removed = tx.execute(
            "DELETE FROM ledger WHERE outcome IS NOT NULL AND closed_at < ?1",
            params![fmt_time(ledger_before)],
        )?;
        let history_removed = tx.execute(
            "DELETE FROM prediction_history WHERE superseded_at < ?1",
            params![fmt_time(history_before)],
        )?;
        tx.commit()?;

        Ok(PurgeReport {
            ledger_removed,
            history_removed,
        })
    }

    /// Row counts across all tables
    pub async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;
        let count = |sql: &str| -> rusqlite::Result<usize> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as usize)
        };

        Ok(StoreStats {
            subjects: count("SELECT COUNT(*) FROM subjects")?,
            failed_subjects: count("SELECT COUNT(*) FROM subjects WHERE status = 'failed'")?,
            committed: count("SELECT COUNT(*) FROM predictions")?,
            superseded: count("SELECT COUNT(*) FROM prediction_history")?,
            pending: count("SELECT COUNT(*) FROM pending_predictions")?,
            open_attempts: count("SELECT COUNT(*) FROM ledger WHERE outcome IS NULL")?,
            ledger_entries: count("SELECT COUNT(*) FROM ledger")?,
        })
    }

    /// Flush the WAL into the main database file
    pub async fn checkpoint(&self) -> Result<()> {
        if self.path.is_none() {
            return Ok(());
        }
        let conn = self.conn.lock().await;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        Ok(())
    }
}

const SUBJECT_SELECT: &str = "SELECT subject, first_seen, last_seen, latest_version, status, failed_version, failure_reason FROM subjects";

const LEDGER_SELECT: &str = "SELECT attempt_id, subject, input_version, started_at, closed_at, outcome, detail FROM ledger";

/// Close an open ledger entry; returns whether a row changed
fn close_ledger(
    conn: &Connection,
    attempt_id: &str,
    outcome: LedgerOutcome,
    detail: Option<&str>,
    now: &str,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        r#"UPDATE ledger SET outcome = ?2, closed_at = ?3, detail = ?4
           WHERE attempt_id = ?1 AND outcome IS NULL"#,
        params![attempt_id, outcome.as_str(), now, detail],
    )?;
    Ok(changed > 0)
}

/// Fixed-width RFC 3339 so timestamps compare correctly as text
pub(crate) fn fmt_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn record_from_row(row: &Row<'_>, status: PredictionStatus) -> rusqlite::Result<PredictionRecord> {
    Ok(PredictionRecord {
        attempt_id: row.get(0)?,
        subject: Subject::new(row.get::<_, String>(1)?),
        value: row.get(2)?,
        confidence: row.get(3)?,
        input_version: InputVersion::from_sql(row.get(4)?),
        computed_at: parse_time(5, row.get(5)?)?,
        status,
    })
}

fn ledger_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let closed_at: Option<String> = row.get(4)?;
    let outcome: Option<String> = row.get(5)?;

    let outcome = match outcome {
        Some(raw) => Some(LedgerOutcome::parse(&raw).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                format!("unknown ledger outcome '{}'", raw).into(),
            )
        })?),
        None => None,
    };

    Ok(LedgerEntry {
        attempt_id: row.get(0)?,
        subject: Subject::new(row.get::<_, String>(1)?),
        input_version: InputVersion::from_sql(row.get(2)?),
        started_at: parse_time(3, row.get(3)?)?,
        closed_at: closed_at.map(|raw| parse_time(4, raw)).transpose()?,
        outcome,
        detail: row.get(6)?,
    })
}

fn subject_from_row(row: &Row<'_>) -> rusqlite::Result<SubjectState> {
    let status: String = row.get(4)?;
    Ok(SubjectState {
        subject: Subject::new(row.get::<_, String>(0)?),
        first_seen: parse_time(1, row.get(1)?)?,
        last_seen: parse_time(2, row.get(2)?)?,
        latest_version: InputVersion::from_sql(row.get(3)?),
        status: if status == SubjectStatus::Failed.as_str() {
            SubjectStatus::Failed
        } else {
            SubjectStatus::Active
        },
        failed_version: row.get::<_, Option<i64>>(5)?.map(InputVersion::from_sql),
        failure_reason: row.get(6)?,
    })
}
