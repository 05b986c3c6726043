//! Exposure risk evaluation
//!
//! Two interchangeable scoring algorithms, chosen by `RiskConfig::v2_mode`:
//!
//! - **V1** (`v1`): weighted attenuation minutes from the legacy engine
//!   summary compared against a time threshold.
//! - **V2** (`v2`): daily summaries filtered by a minimum score, with
//!   exposure windows bucketed by attenuation to build the record.
//!
//! The pure `evaluate` functions take engine output and return a
//! `RiskOutcome`; they never touch storage. The calculators fetch engine data
//! under timeouts and run the evaluation on the blocking worker pool.

pub mod config;
pub mod simulation;
pub mod types;
pub mod v1;
pub mod v2;

pub use config::RiskConfig;
pub use types::{ExposureRecord, NoExposureReason, RiskOutcome};
pub use v1::RiskCalculatorV1;
pub use v2::RiskCalculatorV2;

use crate::error::{PipelineError, PipelineResult};

/// Run CPU-bound scoring off the async workers
pub(crate) async fn run_blocking<F>(score: F) -> PipelineResult<RiskOutcome>
where
    F: FnOnce() -> RiskOutcome + Send + 'static,
{
    tokio::task::spawn_blocking(score)
        .await
        .map_err(|e| PipelineError::Worker(format!("scoring task failed: {}", e)))
}
