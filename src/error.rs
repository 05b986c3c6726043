//! Error taxonomy for the exposure check pipeline
//!
//! Stage failures are typed so the orchestrator can tell benign early exits
//! (no configuration, paused, not authorised) from real faults (engine
//! timeouts, store or network failures). Real faults are still converted to a
//! successful run at the top of the pipeline.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by a matching engine implementation
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    #[error("engine api error {code}: {message}")]
    Api { code: i32, message: String },

    #[error("engine fixture error: {0}")]
    Fixture(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the exposure store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("invalid stored value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while talking to the key and metrics servers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("server not configured: {0}")]
    NotConfigured(&'static str),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while decoding the server risk configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("exposure config missing from settings document")]
    Missing,

    #[error("invalid exposure config json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid exposure config: {0}")]
    Invalid(String),
}

/// Stage failures of a single pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no server configuration present")]
    ConfigNotSet,

    #[error("exposure checks are paused")]
    Paused,

    #[error("exposure checks are disabled by server configuration")]
    ChecksDisabled,

    #[error("not authorised")]
    NotEnabled,

    #[error("no key files available to process")]
    NoFiles,

    #[error("run skipped: last run was too recent")]
    TooSoon,

    #[error("another run is in progress")]
    AlreadyRunning,

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("simulated exposure {0} days ago is out of range")]
    InvalidSimulation(i64),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// True for early exits that end a run without any fault
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            PipelineError::ConfigNotSet
                | PipelineError::Paused
                | PipelineError::ChecksDisabled
                | PipelineError::NotEnabled
                | PipelineError::NoFiles
                | PipelineError::TooSoon
                | PipelineError::AlreadyRunning
        )
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
