//! Model capability
//!
//! The engine treats the model as an opaque function from an input payload
//! to a value plus confidence. Anything implementing [`Model`] can be
//! plugged in without touching the executor or the commit path.

pub mod momentum;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::ModelOutput;

pub use momentum::{MomentumConfig, MomentumModel};

/// A prediction model
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Model: Send + Sync {
    /// Compute a prediction from an input payload
    async fn compute(&self, payload: &serde_json::Value) -> Result<ModelOutput>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Which model the service runs, from config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub momentum: MomentumConfig,
}

fn default_kind() -> String {
    "momentum".to_string()
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            momentum: MomentumConfig::default(),
        }
    }
}

/// Build the configured model
pub fn build(settings: &ModelSettings) -> Result<Box<dyn Model>> {
    match settings.kind.to_lowercase().as_str() {
        "momentum" => Ok(Box::new(MomentumModel::new(settings.momentum.clone()))),
        other => anyhow::bail!("Unknown model '{}'. Available models: momentum", other),
    }
}
