//! Shared types used across modules
//!
//! Subjects, input versions, prediction records and ledger entries live here
//! so the store, engine and scheduler can all name them without depending on
//! each other.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSql, ToSqlOutput};
use serde::{Deserialize, Serialize};

use crate::error::PredictorError;

/// The entity a prediction is computed for
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subject(String);

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Validate an identifier from outside the process. Surrounding
    /// whitespace is dropped and an empty name is rejected.
    pub fn parse(id: &str) -> Result<Self, PredictorError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(PredictorError::InvalidSubject(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl TryFrom<String> for Subject {
    type Error = PredictorError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Subject> for String {
    fn from(subject: Subject) -> Self {
        subject.0
    }
}

/// Monotonic token describing the input state a prediction was computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct InputVersion(pub u64);

impl InputVersion {
    /// Largest version SQLite can hold in an INTEGER column
    pub const MAX_STORABLE: InputVersion = InputVersion(i64::MAX as u64);

    pub fn is_storable(self) -> bool {
        self <= Self::MAX_STORABLE
    }

    pub fn from_sql(raw: i64) -> Self {
        Self(raw.max(0) as u64)
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl TryFrom<u64> for InputVersion {
    type Error = String;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        let version = Self(raw);
        if !version.is_storable() {
            return Err(format!("input version {} exceeds the storable maximum {}", raw, Self::MAX_STORABLE.0));
        }
        Ok(version)
    }
}

impl From<InputVersion> for u64 {
    fn from(version: InputVersion) -> Self {
        version.0
    }
}

/// Versions are written as SQLite integers; anything past i64::MAX is refused
impl ToSql for InputVersion {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let raw = i64::try_from(self.0).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(raw))
    }
}

impl std::fmt::Display for InputVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One observation from the input source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectInput {
    pub subject: Subject,
    pub version: InputVersion,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl SubjectInput {
    /// Check an input before any of it is written to the store
    pub fn validate(&self) -> Result<(), PredictorError> {
        if !self.subject.is_valid() {
            return Err(PredictorError::InvalidSubject(self.subject.to_string()));
        }
        if !self.version.is_storable() {
            return Err(PredictorError::VersionOutOfRange {
                subject: self.subject.clone(),
                version: self.version,
            });
        }
        Ok(())
    }
}

/// What the model returns for a single input payload
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelOutput {
    pub value: f64,
    /// Clamped to [0, 1] before it is stored
    pub confidence: f64,
}

impl ModelOutput {
    pub fn new(value: f64, confidence: f64) -> Self {
        Self {
            value,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Lifecycle state of a prediction record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Pending,
    Committed,
}

impl std::fmt::Display for PredictionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PredictionStatus::Pending => write!(f, "pending"),
            PredictionStatus::Committed => write!(f, "committed"),
        }
    }
}

/// A computed prediction, either pending or the committed current one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// Ledger attempt that produced this record
    pub attempt_id: String,
    pub subject: Subject,
    pub value: f64,
    pub confidence: f64,
    pub input_version: InputVersion,
    pub computed_at: DateTime<Utc>,
    pub status: PredictionStatus,
}

/// Terminal outcome of a ledger entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerOutcome {
    Committed,
    Superseded,
    Aborted,
}

impl LedgerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerOutcome::Committed => "committed",
            LedgerOutcome::Superseded => "superseded",
            LedgerOutcome::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "committed" => Some(LedgerOutcome::Committed),
            "superseded" => Some(LedgerOutcome::Superseded),
            "aborted" => Some(LedgerOutcome::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for LedgerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Crash-recovery record for one prediction attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub attempt_id: String,
    pub subject: Subject,
    pub input_version: InputVersion,
    pub started_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    /// None while the attempt is still in flight
    pub outcome: Option<LedgerOutcome>,
    pub detail: Option<String>,
}

impl LedgerEntry {
    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Result of a staleness check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Staleness {
    /// A committed record covers the supplied version
    Current,
    /// A committed record exists but was computed from older inputs
    Stale { committed: InputVersion },
    /// Nothing has been committed for this subject yet
    Unknown,
}

impl Staleness {
    pub fn needs_compute(&self) -> bool {
        !matches!(self, Staleness::Current)
    }
}

impl std::fmt::Display for Staleness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Staleness::Current => write!(f, "current"),
            Staleness::Stale { committed } => write!(f, "stale (committed {})", committed),
            Staleness::Unknown => write!(f, "unknown"),
        }
    }
}

/// Tagged outcome of a commit; losing a race is an ordinary result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    /// The pending record became the current one
    Committed { replaced: Option<InputVersion> },
    /// This attempt had already been committed; nothing changed
    AlreadyCommitted,
    /// Another attempt committed the same version first
    Superseded { committed_version: InputVersion },
    /// The attempt was aborted (e.g. by recovery) before it could commit
    Aborted,
}

impl std::fmt::Display for CommitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitOutcome::Committed { replaced: Some(v) } => write!(f, "committed (replaced {})", v),
            CommitOutcome::Committed { replaced: None } => write!(f, "committed"),
            CommitOutcome::AlreadyCommitted => write!(f, "already committed"),
            CommitOutcome::Superseded { committed_version } => {
                write!(f, "superseded by {}", committed_version)
            }
            CommitOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Registry status of a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubjectStatus {
    Active,
    Failed,
}

impl SubjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectStatus::Active => "active",
            SubjectStatus::Failed => "failed",
        }
    }
}

/// Registry row for a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectState {
    pub subject: Subject,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub latest_version: InputVersion,
    pub status: SubjectStatus,
    /// Version at which the subject was marked failed
    pub failed_version: Option<InputVersion>,
    pub failure_reason: Option<String>,
}

/// Reported when a subject exhausts its attempt ceiling
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureReport {
    pub subject: Subject,
    pub input_version: InputVersion,
    pub attempts: u32,
    pub last_error: String,
}
