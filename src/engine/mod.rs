//! Matching engine capability interface
//!
//! The platform exposure notification engine does the cryptographic matching.
//! The pipeline only talks to it through `MatchingEngineClient`. Candidate
//! engines are probed once at startup and the first available one is kept
//! for the lifetime of the process.

pub mod replay;

use crate::error::{EngineError, PipelineError, PipelineResult};
use crate::risk::config::{DailySummariesConfig, DiagnosisKeysDataMapping, RiskConfig};
use crate::risk::types::{DailySummary, ExposureSummary, ExposureWindow};
use async_trait::async_trait;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use replay::{EngineFixture, ReplayEngine};

/// Short engine queries (enablement, summary lookup)
pub const API_TIMEOUT: Duration = Duration::from_secs(10);

/// Long-running engine work (submission, daily summaries, windows)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[async_trait]
pub trait MatchingEngineClient: Send + Sync {
    /// Human readable engine name for logs
    fn name(&self) -> &str;

    /// Whether this engine can run on the current device at all
    async fn is_available(&self) -> bool;

    /// Whether the user has authorised exposure matching
    async fn is_enabled(&self) -> Result<bool, EngineError>;

    /// Submit key files for legacy (V1) matching
    ///
    /// Returns the summary if the engine produces one synchronously. Engines
    /// that report asynchronously return `None` and answer later through
    /// `get_exposure_summary`.
    async fn submit_keys(
        &self,
        files: &[PathBuf],
        token: &str,
        config: &RiskConfig,
    ) -> Result<Option<ExposureSummary>, EngineError>;

    /// Submit key files for window-based (V2) matching
    async fn submit_keys_v2(
        &self,
        files: &[PathBuf],
        mapping: &DiagnosisKeysDataMapping,
    ) -> Result<(), EngineError>;

    async fn get_exposure_summary(
        &self,
        token: &str,
    ) -> Result<Option<ExposureSummary>, EngineError>;

    async fn get_daily_summaries(
        &self,
        config: &DailySummariesConfig,
    ) -> Result<Vec<DailySummary>, EngineError>;

    async fn get_exposure_windows(&self) -> Result<Vec<ExposureWindow>, EngineError>;
}

/// Timeouts applied to engine calls
#[derive(Debug, Clone, Copy)]
pub struct EngineTimeouts {
    pub api: Duration,
    pub default: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            api: API_TIMEOUT,
            default: DEFAULT_TIMEOUT,
        }
    }
}

/// Run an engine call under a deadline
///
/// A call that does not finish in time becomes `PipelineError::Timeout`. The
/// engine may still complete the work in the background; its late result is
/// dropped.
pub async fn with_timeout<T, F>(operation: &'static str, after: Duration, call: F) -> PipelineResult<T>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result.map_err(PipelineError::from),
        Err(_) => {
            log::warn!("⏱️  Engine call {} timed out after {:?}", operation, after);
            Err(PipelineError::Timeout { operation, after })
        }
    }
}

/// Pick the first available engine among the candidates
pub async fn select_engine(
    candidates: Vec<Arc<dyn MatchingEngineClient>>,
) -> Option<Arc<dyn MatchingEngineClient>> {
    for engine in candidates {
        if engine.is_available().await {
            log::info!("🔌 Using matching engine: {}", engine.name());
            return Some(engine);
        }
        log::debug!("   ├─ Engine {} not available", engine.name());
    }
    None
}
