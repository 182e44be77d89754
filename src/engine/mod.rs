//! Prediction engine
//!
//! Three stages sit between the scheduling loop and the store:
//! - [`StalenessEvaluator`] decides whether a subject needs a new prediction
//! - [`PredictionExecutor`] runs the model and stages a pending record
//! - [`CommitCoordinator`] promotes pending records and closes attempts

pub mod commit;
pub mod executor;
pub mod staleness;

pub use commit::CommitCoordinator;
pub use executor::PredictionExecutor;
pub use staleness::StalenessEvaluator;
