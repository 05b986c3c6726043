//! Persistent state for exposure checks
//!
//! Tables (see `sqlite::SCHEMA`):
//! - `exposures` - INSERT only, one row per accepted exposure
//! - `tokens` - UPSERT on token, one row per submission
//! - `run_state` - key/value bookkeeping (since index, chaff date, errors)
//!
//! Every write is atomic on its own. Nothing spans a whole pipeline run, so
//! a crash between stages leaves state that the next run tolerates.

pub mod sqlite;

use crate::error::StoreError;
use crate::risk::types::ExposureRecord;
use async_trait::async_trait;

pub use sqlite::SqliteExposureStore;

/// An exposure as read back from the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredExposure {
    pub id: i64,
    pub record: ExposureRecord,
}

/// Per-run submission token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub token: String,
    pub created_timestamp_ms: i64,
    pub responded: bool,
}

/// Keys of the `run_state` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKey {
    /// Highest key file index already processed
    Since,
    /// Epoch millis of the next decoy traffic burst
    NextChaffDate,
    /// Epoch millis of the last daily heartbeat metric
    DailyActiveTrace,
    /// Description of the last pipeline failure
    LastError,
    /// Description of the last failed server request
    LastApiError,
    /// JSON array of the last run timestamps
    LastRun,
    /// Last good server risk config (inner JSON document)
    ExposureConfig,
    /// "true" while exposure checks are paused
    ServicePaused,
}

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::Since => "since",
            StateKey::NextChaffDate => "nextChaffDate",
            StateKey::DailyActiveTrace => "dailyActiveTrace",
            StateKey::LastError => "lastError",
            StateKey::LastApiError => "lastApiError",
            StateKey::LastRun => "lastRun",
            StateKey::ExposureConfig => "exposureConfig",
            StateKey::ServicePaused => "servicePaused",
        }
    }
}

#[async_trait]
pub trait ExposureStore: Send + Sync {
    /// Append an exposure, returning its row id
    async fn insert_exposure(&self, record: &ExposureRecord) -> Result<i64, StoreError>;

    /// Exposure with the latest contact date, if any
    async fn most_recent_exposure(&self) -> Result<Option<StoredExposure>, StoreError>;

    /// All exposures, newest contact date first
    async fn list_exposures(&self) -> Result<Vec<StoredExposure>, StoreError>;

    /// Delete exposures created before the cutoff, returning the count
    async fn delete_exposures_before(&self, cutoff_ms: i64) -> Result<usize, StoreError>;

    async fn upsert_token(&self, token: &TokenRecord) -> Result<(), StoreError>;

    async fn get_token(&self, token: &str) -> Result<Option<TokenRecord>, StoreError>;

    async fn mark_token_responded(&self, token: &str) -> Result<(), StoreError>;

    async fn delete_token(&self, token: &str) -> Result<(), StoreError>;

    /// Delete tokens created before the cutoff, returning the count
    async fn delete_tokens_before(&self, cutoff_ms: i64) -> Result<usize, StoreError>;

    async fn get_state(&self, key: StateKey) -> Result<Option<String>, StoreError>;

    async fn set_state(&self, key: StateKey, value: &str) -> Result<(), StoreError>;

    async fn remove_state(&self, key: StateKey) -> Result<(), StoreError>;

    /// Typed read of a numeric state value
    async fn get_state_i64(&self, key: StateKey) -> Result<Option<i64>, StoreError> {
        match self.get_state(key).await? {
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| StoreError::InvalidValue {
                    key: key.as_str().to_string(),
                    value,
                }),
            None => Ok(None),
        }
    }

    async fn is_paused(&self) -> Result<bool, StoreError> {
        Ok(self.get_state(StateKey::ServicePaused).await?.as_deref() == Some("true"))
    }

    async fn set_paused(&self, paused: bool) -> Result<(), StoreError> {
        self.set_state(StateKey::ServicePaused, if paused { "true" } else { "false" })
            .await
    }
}
