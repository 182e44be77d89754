//! Realised outcomes and accuracy statistics
//!
//! Once the thing a prediction was about has actually happened, the realised
//! value can be recorded against the committed prediction for that version.
//! Accuracy is reported as mean absolute error, overall and per subject.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use super::sqlite::{fmt_time, parse_time};
use super::SqliteStore;
use crate::error::{PredictorError, Result};
use crate::types::{InputVersion, Subject};

/// A realised value paired with what was predicted for it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeRecord {
    pub subject: Subject,
    pub input_version: InputVersion,
    pub predicted: f64,
    pub actual: f64,
    pub recorded_at: DateTime<Utc>,
}

impl OutcomeRecord {
    pub fn abs_error(&self) -> f64 {
        (self.actual - self.predicted).abs()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubjectAccuracy {
    pub subject: Subject,
    pub total: usize,
    pub mean_abs_error: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccuracyReport {
    pub total: usize,
    pub mean_abs_error: Option<f64>,
    pub subjects: Vec<SubjectAccuracy>,
}

impl SqliteStore {
    /// Record the realised value for a committed prediction.
    ///
    /// The version must have been committed, either as the current record
    /// or one that was later superseded. Recording again overwrites.
    pub async fn record_outcome(
        &self,
        subject: &Subject,
        version: InputVersion,
        actual: f64,
    ) -> Result<OutcomeRecord> {
        let conn = self.conn.lock().await;

        let predicted: Option<f64> = conn
            .query_row(
                r#"SELECT value FROM predictions WHERE subject = ?1 AND input_version = ?2
                   UNION ALL
                   SELECT value FROM prediction_history WHERE subject = ?1 AND input_version = ?2
                   LIMIT 1"#,
                params![subject.as_str(), version],
                |row| row.get(0),
            )
            .optional()?;

        let predicted = predicted.ok_or_else(|| PredictorError::NotCommitted {
            subject: subject.clone(),
            version,
        })?;

        let recorded_at = Utc::now();
        conn.execute(
            r#"INSERT INTO outcomes (subject, input_version, predicted, actual, recorded_at)
               VALUES (?1, ?2, ?3, ?4, ?5)
               ON CONFLICT(subject, input_version) DO UPDATE SET
                   actual = excluded.actual,
                   recorded_at = excluded.recorded_at"#,
            params![subject.as_str(), version, predicted, actual, fmt_time(recorded_at)],
        )?;

        Ok(OutcomeRecord {
            subject: subject.clone(),
            input_version: version,
            predicted,
            actual,
            recorded_at,
        })
    }

    pub async fn outcomes(&self, subject: &Subject) -> Result<Vec<OutcomeRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            r#"SELECT subject, input_version, predicted, actual, recorded_at
               FROM outcomes WHERE subject = ?1
               ORDER BY input_version DESC"#,
        )?;
        let rows = stmt
            .query_map(params![subject.as_str()], |row| {
                Ok(OutcomeRecord {
                    subject: Subject::new(row.get::<_, String>(0)?),
                    input_version: InputVersion::from_sql(row.get(1)?),
                    predicted: row.get(2)?,
                    actual: row.get(3)?,
                    recorded_at: parse_time(4, row.get(4)?)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub async fn accuracy(&self) -> Result<AccuracyReport> {
        let conn = self.conn.lock().await;

        let (total, mean_abs_error): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(ABS(actual - predicted)) FROM outcomes",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut stmt = conn.prepare_cached(
            r#"SELECT subject, COUNT(*), AVG(ABS(actual - predicted))
               FROM outcomes GROUP BY subject ORDER BY subject"#,
        )?;
        let subjects = stmt
            .query_map([], |row| {
                Ok(SubjectAccuracy {
                    subject: Subject::new(row.get::<_, String>(0)?),
                    total: row.get::<_, i64>(1)? as usize,
                    mean_abs_error: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(AccuracyReport {
            total: total as usize,
            mean_abs_error,
            subjects,
        })
    }
}
