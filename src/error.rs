//! Error taxonomy for the prediction engine

use std::time::Duration;

use crate::types::{InputVersion, Subject};

/// Errors raised by the store, executor and commit coordinator
#[derive(Debug, thiserror::Error)]
pub enum PredictorError {
    #[error("model timed out for {subject} after {timeout:?}")]
    ComputeTimeout { subject: Subject, timeout: Duration },

    #[error("model failed for {subject}: {message}")]
    ModelFailure { subject: Subject, message: String },

    #[error("model panicked for {subject}: {message}")]
    ModelPanicked { subject: Subject, message: String },

    #[error("storage failure: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("store I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt stored record: {0}")]
    CorruptRecord(String),

    #[error("commit for {subject} at {attempted} rejected: {committed} is already committed")]
    ValidationViolation {
        subject: Subject,
        attempted: InputVersion,
        committed: InputVersion,
    },

    #[error("input version {version} for {subject} exceeds the storable maximum v{max}", max = InputVersion::MAX_STORABLE.0)]
    VersionOutOfRange { subject: Subject, version: InputVersion },

    #[error("invalid subject {0:?}: must not be empty")]
    InvalidSubject(String),

    #[error("unknown attempt: {0}")]
    UnknownAttempt(String),

    #[error("no committed prediction for {subject} at {version}")]
    NotCommitted { subject: Subject, version: InputVersion },
}

/// Coarse classification used by the scheduling loop to pick a recovery path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Model timeout or recoverable model failure; retried with backoff
    TransientCompute,
    /// Storage unreachable or corrupt; the attempt is retried from scratch
    PersistenceFailure,
    /// Commit would move the stored version backwards; discarded
    ValidationViolation,
    /// Caller asked for something that does not exist
    NotFound,
}

impl PredictorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PredictorError::ComputeTimeout { .. }
            | PredictorError::ModelFailure { .. }
            | PredictorError::ModelPanicked { .. } => ErrorClass::TransientCompute,
            PredictorError::Persistence(_)
            | PredictorError::Io(_)
            | PredictorError::CorruptRecord(_) => {
                ErrorClass::PersistenceFailure
            }
            PredictorError::ValidationViolation { .. }
            | PredictorError::VersionOutOfRange { .. }
            | PredictorError::InvalidSubject(_) => ErrorClass::ValidationViolation,
            PredictorError::UnknownAttempt(_) | PredictorError::NotCommitted { .. } => {
                ErrorClass::NotFound
            }
        }
    }

    /// Whether a fresh attempt may succeed where this one failed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::TransientCompute | ErrorClass::PersistenceFailure
        )
    }
}

pub type Result<T> = std::result::Result<T, PredictorError>;

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
