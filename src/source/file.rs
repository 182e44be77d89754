//! JSON file input source
//!
//! Reads a file of `[{ "subject": "A", "version": 3, "payload": {...} }]`
//! on every snapshot, so an external process can rewrite it between ticks.
//! A missing file is treated as no subjects yet.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::InputSource;
use crate::types::SubjectInput;

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl InputSource for FileSource {
    async fn snapshot(&self) -> Result<Vec<SubjectInput>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Input file {} not present yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };

        // Empty subjects and unstorable versions fail here, before anything reaches the store
        let inputs: Vec<SubjectInput> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse inputs in {}", self.path.display()))?;

        // Last entry wins when a subject is listed twice
        let mut latest = BTreeMap::new();
        for input in inputs {
            latest.insert(input.subject.clone(), input);
        }
        Ok(latest.into_values().collect())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
