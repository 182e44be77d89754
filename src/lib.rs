//! Predictor - prediction-and-persistence engine
//!
//! Keeps a durable, per-subject prediction current as inputs change:
//! - SQLite store (WAL mode) with an attempt ledger for crash recovery
//! - Staleness evaluation by input version, with an optional max age
//! - Model execution under a timeout, staged as pending records
//! - Transactional commits that never move a subject's version backwards
//! - A scheduling loop with a concurrency ceiling, retries and backoff
//!
//! # Example
//!
//! ```ignore
//! use predictor::{Config, PredictorService, Subject};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let service = PredictorService::open(Config::load()?, None).await?;
//!     if let Some(record) = service.query(&Subject::new("BTC")).await? {
//!         println!("{} at {}", record.value, record.input_version);
//!     }
//!     Ok(())
//! }
//! ```

pub mod types;
pub mod error;
pub mod store;
pub mod model;
pub mod source;
pub mod engine;
pub mod scheduler;
pub mod config;
pub mod service;
pub mod cli;

pub use config::Config;
pub use error::{ErrorClass, PredictorError};
pub use service::PredictorService;
pub use store::SqliteStore;
pub use types::{CommitOutcome, InputVersion, PredictionRecord, Staleness, Subject, SubjectInput};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
