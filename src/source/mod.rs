//! Input sources
//!
//! A source hands the scheduling loop a snapshot of every subject it knows
//! about, each with its current input version and payload.

pub mod file;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::SubjectInput;

pub use file::FileSource;
pub use memory::MemorySource;

/// Where subject inputs come from
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Latest known input for every subject
    async fn snapshot(&self) -> Result<Vec<SubjectInput>>;

    fn name(&self) -> &'static str;
}

/// Source section of config.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceSettings {
    /// JSON file of `[{ "subject", "version", "payload" }]`
    #[serde(default)]
    pub inputs_path: Option<PathBuf>,
}

/// Build the configured source; an empty in-memory one when no file is set
pub fn build(settings: &SourceSettings) -> Box<dyn InputSource> {
    match &settings.inputs_path {
        Some(path) => Box::new(FileSource::new(path.clone())),
        None => Box::new(MemorySource::new()),
    }
}
