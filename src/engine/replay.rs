use crate::error::EngineError;
use crate::risk::config::{DailySummariesConfig, DiagnosisKeysDataMapping, RiskConfig};
use crate::risk::types::{DailySummary, ExposureSummary, ExposureWindow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::MatchingEngineClient;

/// Recorded engine answers served by `ReplayEngine`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineFixture {
    #[serde(default = "default_true")]
    pub available: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub summary: Option<ExposureSummary>,
    #[serde(default)]
    pub daily_summaries: Vec<DailySummary>,
    #[serde(default)]
    pub exposure_windows: Vec<ExposureWindow>,
}

fn default_true() -> bool {
    true
}

impl Default for EngineFixture {
    fn default() -> Self {
        Self {
            available: true,
            enabled: true,
            summary: None,
            daily_summaries: Vec::new(),
            exposure_windows: Vec::new(),
        }
    }
}

/// File-backed engine that replays recorded results
///
/// Used on hosts without a platform matching engine. The summary is only
/// reported for tokens that were actually submitted, like a real engine.
pub struct ReplayEngine {
    name: String,
    fixture: EngineFixture,
    submitted_tokens: Mutex<VecDeque<String>>,
    submitted_files: Mutex<Vec<PathBuf>>,
}

/// Tokens remembered for `get_exposure_summary`; older ones are forgotten
pub const RECENT_TOKENS: usize = 32;

impl ReplayEngine {
    pub fn new(name: &str, fixture: EngineFixture) -> Self {
        Self {
            name: name.to_string(),
            fixture,
            submitted_tokens: Mutex::new(VecDeque::with_capacity(RECENT_TOKENS)),
            submitted_files: Mutex::new(Vec::new()),
        }
    }

    /// Load a fixture from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        if !path.exists() {
            return Err(EngineError::Fixture(format!(
                "fixture not found: {}",
                path.display()
            )));
        }

        let json = fs::read_to_string(path)?;
        let fixture: EngineFixture = serde_json::from_str(&json)?;

        log::info!(
            "📼 Loaded engine fixture {} ({} daily summaries, {} windows)",
            path.display(),
            fixture.daily_summaries.len(),
            fixture.exposure_windows.len()
        );
        Ok(Self::new("replay", fixture))
    }

    /// Files handed to the engine by the latest submission
    pub fn submitted_files(&self) -> Vec<PathBuf> {
        self.submitted_files
            .lock()
            .map(|files| files.clone())
            .unwrap_or_default()
    }

    fn record_submission(&self, files: &[PathBuf], token: Option<&str>) -> Result<(), EngineError> {
        let mut submitted = self
            .submitted_files
            .lock()
            .map_err(|_| EngineError::Unavailable("replay state poisoned".to_string()))?;
        *submitted = files.to_vec();

        if let Some(token) = token {
            let mut tokens = self
                .submitted_tokens
                .lock()
                .map_err(|_| EngineError::Unavailable("replay state poisoned".to_string()))?;
            if tokens.len() == RECENT_TOKENS {
                tokens.pop_front();
            }
            tokens.push_back(token.to_string());
        }
        Ok(())
    }

    fn check_enabled(&self) -> Result<(), EngineError> {
        if self.fixture.enabled {
            Ok(())
        } else {
            Err(EngineError::Api {
                code: 17,
                message: "exposure notification api not enabled".to_string(),
            })
        }
    }
}

#[async_trait]
impl MatchingEngineClient for ReplayEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_available(&self) -> bool {
        self.fixture.available
    }

    async fn is_enabled(&self) -> Result<bool, EngineError> {
        Ok(self.fixture.enabled)
    }

    async fn submit_keys(
        &self,
        files: &[PathBuf],
        token: &str,
        _config: &RiskConfig,
    ) -> Result<Option<ExposureSummary>, EngineError> {
        self.check_enabled()?;
        self.record_submission(files, Some(token))?;
        Ok(self.fixture.summary.clone())
    }

    async fn submit_keys_v2(
        &self,
        files: &[PathBuf],
        _mapping: &DiagnosisKeysDataMapping,
    ) -> Result<(), EngineError> {
        self.check_enabled()?;
        self.record_submission(files, None)
    }

    async fn get_exposure_summary(
        &self,
        token: &str,
    ) -> Result<Option<ExposureSummary>, EngineError> {
        let known = self
            .submitted_tokens
            .lock()
            .map_err(|_| EngineError::Unavailable("replay state poisoned".to_string()))?
            .iter()
            .any(|t| t == token);

        Ok(if known { self.fixture.summary.clone() } else { None })
    }

    async fn get_daily_summaries(
        &self,
        _config: &DailySummariesConfig,
    ) -> Result<Vec<DailySummary>, EngineError> {
        Ok(self.fixture.daily_summaries.clone())
    }

    async fn get_exposure_windows(&self) -> Result<Vec<ExposureWindow>, EngineError> {
        Ok(self.fixture.exposure_windows.clone())
    }
}
