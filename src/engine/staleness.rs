//! Staleness evaluation
//!
//! A subject is current when its committed prediction was computed from the
//! supplied input version or a newer one. An optional maximum age also marks
//! old records stale even when the version has not moved.

use std::time::Duration;

use chrono::Utc;

use crate::error::Result;
use crate::store::SqliteStore;
use crate::types::{InputVersion, Staleness, Subject};

#[derive(Clone)]
pub struct StalenessEvaluator {
    store: SqliteStore,
    max_age: Option<Duration>,
}

impl StalenessEvaluator {
    pub fn new(store: SqliteStore) -> Self {
        Self { store, max_age: None }
    }

    /// Also treat committed records older than `max_age` as stale
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    /// Compare the committed record against `version`. Read-only.
    pub async fn evaluate(&self, subject: &Subject, version: InputVersion) -> Result<Staleness> {
        let Some(marker) = self.store.committed_marker(subject).await? else {
            return Ok(Staleness::Unknown);
        };

        if marker.input_version < version {
            return Ok(Staleness::Stale {
                committed: marker.input_version,
            });
        }

        if let Some(max_age) = self.max_age {
            let age = Utc::now()
                .signed_duration_since(marker.committed_at)
                .to_std()
                .unwrap_or_default();
            if age > max_age {
                return Ok(Staleness::Stale {
                    committed: marker.input_version,
                });
            }
        }

        Ok(Staleness::Current)
    }
}
