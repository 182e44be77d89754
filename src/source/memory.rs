//! In-process input source

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use super::InputSource;
use crate::types::{InputVersion, Subject, SubjectInput};

/// Inputs published programmatically; each publish bumps the subject's version
#[derive(Clone, Default)]
pub struct MemorySource {
    inputs: Arc<Mutex<BTreeMap<Subject, SubjectInput>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new payload and return the version assigned to it
    pub async fn publish(&self, subject: impl Into<Subject>, payload: serde_json::Value) -> InputVersion {
        let subject = subject.into();
        let mut inputs = self.inputs.lock().await;
        let version = inputs
            .get(&subject)
            .map(|input| input.version.next())
            .unwrap_or(InputVersion(1));

        inputs.insert(
            subject.clone(),
            SubjectInput {
                subject,
                version,
                payload,
            },
        );
        version
    }

    /// Replace a subject's input with an explicit version
    pub async fn set(&self, input: SubjectInput) {
        self.inputs.lock().await.insert(input.subject.clone(), input);
    }

    pub async fn remove(&self, subject: &Subject) -> Option<SubjectInput> {
        self.inputs.lock().await.remove(subject)
    }
}

#[async_trait]
impl InputSource for MemorySource {
    async fn snapshot(&self) -> Result<Vec<SubjectInput>> {
        Ok(self.inputs.lock().await.values().cloned().collect())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_increments_versions() {
        let source = MemorySource::new();
        assert_eq!(source.publish("A", json!({ "series": [1.0] })).await, InputVersion(1));
        assert_eq!(source.publish("A", json!({ "series": [2.0] })).await, InputVersion(2));
        assert_eq!(source.publish("B", json!({})).await, InputVersion(1));

        let snapshot = source.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].subject, Subject::new("A"));
        assert_eq!(snapshot[0].version, InputVersion(2));
        assert_eq!(snapshot[0].payload, json!({ "series": [2.0] }));
    }

    #[tokio::test]
    async fn test_set_and_remove() {
        let source = MemorySource::new();
        source
            .set(SubjectInput {
                subject: Subject::new("A"),
                version: InputVersion(40),
                payload: json!(null),
            })
            .await;
        assert_eq!(source.publish("A", json!(null)).await, InputVersion(41));

        assert!(source.remove(&Subject::new("A")).await.is_some());
        assert!(source.snapshot().await.unwrap().is_empty());
    }
}
