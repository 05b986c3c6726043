//! Diagnosis key processing: the stage chain of one exposure check run

use super::dedup::is_new_exposure;
use super::housekeeping::{delete_key_files, delete_old_data, record_run, run_history, track_daily_active};
use super::{EngineCallback, RunOptions, RunOutcome, RunReport, Stage};
use crate::calendar::{Clock, MAX_CONTACT_DAYS};
use crate::chaff::{ChaffGenerator, ChaffSettings};
use crate::config::RuntimeConfig;
use crate::engine::{with_timeout, EngineTimeouts, MatchingEngineClient};
use crate::error::{PipelineError, PipelineResult};
use crate::metrics::{contact_payload, record_api_error, MetricEvent, MetricsReporter};
use crate::network::key_files::next_since;
use crate::network::{CallbackRequest, ServerApi};
use crate::notify::Notifier;
use crate::risk::types::ExposureRecord;
use crate::risk::{RiskCalculatorV1, RiskCalculatorV2, RiskConfig, RiskOutcome};
use crate::store::{ExposureStore, StateKey, TokenRecord};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Collaborators of the pipeline
pub struct PipelineDeps {
    pub engine: Arc<dyn MatchingEngineClient>,
    pub store: Arc<dyn ExposureStore>,
    pub api: Arc<dyn ServerApi>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Clock,
}

/// Device-side settings the pipeline needs
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub server_configured: bool,
    pub callback_number: Option<String>,
    pub analytics_opt_in: bool,
    pub app_version: String,
    pub check_interval: Duration,
    pub retention_days: i64,
    pub key_file_dir: PathBuf,
    pub timeouts: EngineTimeouts,
}

impl PipelineSettings {
    pub fn from_runtime(config: &RuntimeConfig) -> Self {
        Self {
            server_configured: config.server.is_configured(),
            callback_number: config.callback_number.clone(),
            analytics_opt_in: config.analytics_opt_in,
            app_version: config.server.app_version.clone(),
            check_interval: config.check_interval(),
            retention_days: config.store_exposures_for_days,
            key_file_dir: config.key_file_dir.clone(),
            timeouts: config.engine_timeouts,
        }
    }
}

/// Per-run state threaded through the stages
#[derive(Default)]
struct RunContext {
    stage: Option<Stage>,
    config: Option<RiskConfig>,
    files: Vec<PathBuf>,
}

impl RunContext {
    fn enter(&mut self, stage: Stage) {
        log::debug!("   ├─ Stage: {:?}", stage);
        self.stage = Some(stage);
    }

    fn stage(&self) -> Stage {
        self.stage.unwrap_or(Stage::Idle)
    }
}

/// Random 32-byte submission token, hex encoded
pub fn new_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub struct DiagnosisKeyPipeline {
    engine: Arc<dyn MatchingEngineClient>,
    store: Arc<dyn ExposureStore>,
    api: Arc<dyn ServerApi>,
    notifier: Arc<dyn Notifier>,
    clock: Clock,
    settings: PipelineSettings,
    metrics: MetricsReporter,
    chaff: ChaffGenerator,
    v1: RiskCalculatorV1,
    v2: RiskCalculatorV2,
    run_lock: Mutex<()>,
}

impl DiagnosisKeyPipeline {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        let metrics = MetricsReporter::new(
            deps.api.clone(),
            deps.store.clone(),
            settings.analytics_opt_in,
            &settings.app_version,
        );
        let chaff = ChaffGenerator::new(deps.api.clone(), deps.store.clone(), deps.clock.clone());
        let v1 = RiskCalculatorV1::new(deps.engine.clone(), settings.timeouts);
        let v2 = RiskCalculatorV2::new(deps.engine.clone(), settings.timeouts);

        Self {
            engine: deps.engine,
            store: deps.store,
            api: deps.api,
            notifier: deps.notifier,
            clock: deps.clock,
            settings,
            metrics,
            chaff,
            v1,
            v2,
            run_lock: Mutex::new(()),
        }
    }

    /// Run one exposure check
    ///
    /// Never fails: faults are reported and turned into
    /// `RunOutcome::Failed`. A run started while another is in progress is
    /// skipped.
    pub async fn run(&self, options: RunOptions) -> RunReport {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                log::info!("⏭️  Exposure check already running, skipping");
                return RunReport {
                    stage: Stage::Idle,
                    outcome: RunOutcome::Skipped(PipelineError::AlreadyRunning.to_string()),
                };
            }
        };

        log::info!("🚀 Starting exposure check");
        let mut ctx = RunContext::default();
        let result = self.run_stages(&options, &mut ctx).await;
        let report = self.finish(ctx.stage(), result).await;

        self.housekeeping(&ctx).await;

        if let Some(config) = &ctx.config {
            let chaff = ChaffSettings {
                enabled: config.chaff_enabled,
                window_days: config.chaff_window_days(),
            };
            if let Err(e) = self.chaff.run(chaff, options.force_chaff).await {
                log::warn!("⚠️  Chaff scheduling failed: {}", e);
            }
        }

        log::info!("✅ Exposure check finished");
        log::info!("   ├─ Stage: {:?}", report.stage);
        log::info!("   └─ Outcome: {:?}", report.outcome);
        report
    }

    /// Score a synthetic exposure `days` days ago through the normal path
    pub async fn simulate_exposure(&self, days: i64) -> RunReport {
        self.run(RunOptions::simulate(days)).await
    }

    /// Process a result notification delivered by the engine
    ///
    /// Uses the risk config cached by the last run. A token that was
    /// already answered is not processed again.
    pub async fn handle_engine_callback(&self, callback: EngineCallback) -> RunReport {
        let _guard = self.run_lock.lock().await;

        let mut ctx = RunContext::default();
        ctx.enter(Stage::AwaitingResult);

        let result = match self.cached_config().await {
            Ok(Some(config)) => self.process_callback(&callback, &config, None, &mut ctx).await,
            Ok(None) => Err(PipelineError::ConfigNotSet),
            Err(e) => Err(e),
        };
        self.finish(ctx.stage(), result).await
    }

    async fn run_stages(&self, options: &RunOptions, ctx: &mut RunContext) -> PipelineResult<RunOutcome> {
        ctx.enter(Stage::ConfigCheck);
        if !self.settings.server_configured {
            return Err(PipelineError::ConfigNotSet);
        }

        let now = (self.clock)();
        if !options.skip_time_check {
            let history = run_history(self.store.as_ref()).await?;
            if let Some(last) = history.last() {
                let elapsed = now.timestamp_millis() - last;
                if elapsed >= 0 && (elapsed as u128) < self.settings.check_interval.as_millis() {
                    return Err(PipelineError::TooSoon);
                }
            }
        }

        record_run(self.store.as_ref(), now).await?;
        self.store.remove_state(StateKey::LastError).await?;

        let config = self.load_config().await?;
        ctx.config = Some(config.clone());

        if self.store.is_paused().await? {
            return Err(PipelineError::Paused);
        }
        if config.disable_ens_checks {
            return Err(PipelineError::ChecksDisabled);
        }

        if let Some(days) = options.simulate_days {
            if days.unsigned_abs() > MAX_CONTACT_DAYS as u64 {
                return Err(PipelineError::InvalidSimulation(days));
            }
            log::info!("🧪 Simulating exposure {} days ago", days);
            ctx.enter(Stage::Scoring);
            return self.score(None, &config, Some(days), ctx).await;
        }

        ctx.enter(Stage::EnabledCheck);
        let enabled = with_timeout(
            "is_enabled",
            self.settings.timeouts.api,
            self.engine.is_enabled(),
        )
        .await?;
        if !enabled {
            return Err(PipelineError::NotEnabled);
        }

        ctx.enter(Stage::Downloading);
        let since = self.store.get_state_i64(StateKey::Since).await?.unwrap_or(0);
        let listed = self.api.list_key_files(since, config.num_files).await?;
        if listed.is_empty() {
            return Err(PipelineError::NoFiles);
        }

        tokio::fs::create_dir_all(&self.settings.key_file_dir).await?;
        let mut last_error = None;
        for file in &listed {
            match self.api.download_key_file(file, &self.settings.key_file_dir).await {
                Ok(path) => ctx.files.push(path),
                Err(e) => {
                    log::warn!("⚠️  Failed to download key file {}: {}", file.path, e);
                    last_error = Some(e);
                }
            }
        }
        if ctx.files.is_empty() {
            return Err(match last_error {
                Some(e) => e.into(),
                None => PipelineError::NoFiles,
            });
        }
        log::info!("📥 Downloaded {}/{} key files since {}", ctx.files.len(), listed.len(), since);

        ctx.enter(Stage::Submitting);
        let token = new_token();
        self.store
            .upsert_token(&TokenRecord {
                token: token.clone(),
                created_timestamp_ms: now.timestamp_millis(),
                responded: false,
            })
            .await?;

        let callback = if config.v2_mode {
            with_timeout(
                "submit_keys_v2",
                self.settings.timeouts.default,
                self.engine.submit_keys_v2(&ctx.files, &config.data_mapping()),
            )
            .await?;
            EngineCallback::StateUpdated { token }
        } else {
            let immediate = with_timeout(
                "submit_keys",
                self.settings.timeouts.default,
                self.engine.submit_keys(&ctx.files, &token, &config),
            )
            .await?;
            match immediate {
                Some(summary) if summary.matched_key_count == 0 => {
                    EngineCallback::ExposureNotFound { token }
                }
                _ => EngineCallback::StateUpdated { token },
            }
        };

        let submitted = std::mem::take(&mut ctx.files);
        delete_key_files(&submitted).await;

        let new_since = next_since(&listed, since);
        self.store
            .set_state(StateKey::Since, &new_since.to_string())
            .await?;

        ctx.enter(Stage::AwaitingResult);
        self.process_callback(&callback, &config, None, ctx).await
    }

    async fn process_callback(
        &self,
        callback: &EngineCallback,
        config: &RiskConfig,
        simulate_days: Option<i64>,
        ctx: &mut RunContext,
    ) -> PipelineResult<RunOutcome> {
        match callback {
            EngineCallback::ExposureNotFound { token } => {
                log::info!("🔍 Engine reported no matches");
                self.store.delete_token(token).await?;
                Ok(RunOutcome::NoMatch)
            }
            EngineCallback::StateUpdated { token } => {
                if let Some(existing) = self.store.get_token(token).await? {
                    if existing.responded {
                        log::info!("⏭️  Token already processed, ignoring callback");
                        return Ok(RunOutcome::AlreadyProcessed);
                    }
                }
                ctx.enter(Stage::Scoring);
                self.score(Some(token), config, simulate_days, ctx).await
            }
        }
    }

    async fn score(
        &self,
        token: Option<&str>,
        config: &RiskConfig,
        simulate_days: Option<i64>,
        ctx: &mut RunContext,
    ) -> PipelineResult<RunOutcome> {
        let now = (self.clock)();
        let outcome = if config.v2_mode {
            self.v2.process_keys(config, simulate_days, now).await?
        } else {
            self.v1
                .process_keys(token.unwrap_or_default(), config, simulate_days, now)
                .await?
        };

        let record = match outcome {
            RiskOutcome::NoExposure(reason) => {
                log::info!("🟢 No exposure ({:?})", reason);
                if let Some(token) = token {
                    self.store.delete_token(token).await?;
                }
                return Ok(RunOutcome::NoExposure(reason));
            }
            RiskOutcome::Exposure(record) => record,
        };

        ctx.enter(Stage::Deduplicating);
        let latest = self.store.most_recent_exposure().await?;
        if !is_new_exposure(latest.as_ref().map(|e| &e.record), &record) {
            log::info!("⏭️  Exposure not newer than the stored one, skipping");
            if let Some(token) = token {
                self.store.mark_token_responded(token).await?;
            }
            return Ok(RunOutcome::Duplicate);
        }

        ctx.enter(Stage::Persisting);
        let id = self.store.insert_exposure(&record).await?;
        if let Some(token) = token {
            self.store.mark_token_responded(token).await?;
        }
        log::info!(
            "🔴 Exposure stored (id {}, {} days ago)",
            id,
            record.days_since_last_exposure
        );

        ctx.enter(Stage::Notifying);
        self.notify(&record, simulate_days.is_some()).await;

        Ok(RunOutcome::Exposure {
            id,
            days_since_exposure: record.days_since_last_exposure,
        })
    }

    async fn notify(&self, record: &ExposureRecord, simulated: bool) {
        let payload = contact_payload(record, simulated, self.metrics.os(), self.metrics.version());
        self.metrics
            .report(MetricEvent::ContactNotification, Some(payload.clone()))
            .await;

        if let Some(mobile) = &self.settings.callback_number {
            let request = CallbackRequest {
                mobile: mobile.clone(),
                close_contact_date: record.exposure_contact_date,
                days_since_exposure: record.days_since_last_exposure,
                payload,
            };
            if let Err(e) = self.api.post_callback(&request).await {
                log::warn!("⚠️  Callback request failed: {}", e);
                record_api_error(self.store.as_ref(), &e.to_string()).await;
            }
        }

        if let Err(e) = self.notifier.notify_exposure(record).await {
            log::warn!("⚠️  Notifier failed: {}", e);
        }
    }

    /// Fetch the server config, falling back to the last good copy
    async fn load_config(&self) -> PipelineResult<RiskConfig> {
        let fetched = match self.api.fetch_settings().await {
            Ok(body) => RiskConfig::from_settings_json(&body).map_err(PipelineError::from),
            Err(e) => Err(PipelineError::from(e)),
        };

        match fetched {
            Ok(config) => {
                match config.to_json() {
                    Ok(json) => self.store.set_state(StateKey::ExposureConfig, &json).await?,
                    Err(e) => log::warn!("⚠️  Failed to cache exposure config: {}", e),
                }
                Ok(config)
            }
            Err(e) => match self.cached_config().await? {
                Some(cached) => {
                    log::warn!("⚠️  Using cached exposure config: {}", e);
                    Ok(cached)
                }
                None => Err(e),
            },
        }
    }

    async fn cached_config(&self) -> PipelineResult<Option<RiskConfig>> {
        match self.store.get_state(StateKey::ExposureConfig).await? {
            Some(json) => Ok(Some(RiskConfig::from_json(&json)?)),
            None => Ok(None),
        }
    }

    /// Map a stage result to a report, reporting faults
    async fn finish(&self, stage: Stage, result: PipelineResult<RunOutcome>) -> RunReport {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_benign() => {
                log::info!("⏭️  Exposure check ended early: {}", e);
                RunOutcome::Skipped(e.to_string())
            }
            Err(e) => {
                let description = e.to_string();
                log::error!("❌ Exposure check failed at {:?}: {}", stage, description);
                self.metrics.report_error(&description).await;
                if let Err(store_err) = self.store.set_state(StateKey::LastError, &description).await {
                    log::error!("❌ Failed to record last error: {}", store_err);
                }
                RunOutcome::Failed(description)
            }
        };
        RunReport { stage, outcome }
    }

    async fn housekeeping(&self, ctx: &RunContext) {
        delete_key_files(&ctx.files).await;

        let now = (self.clock)();
        if let Err(e) = delete_old_data(self.store.as_ref(), now, self.settings.retention_days).await {
            log::warn!("⚠️  Retention cleanup failed: {}", e);
        }

        if ctx.config.is_some() {
            if let Err(e) = track_daily_active(self.store.as_ref(), &self.metrics, now).await {
                log::warn!("⚠️  Daily active trace failed: {}", e);
            }
        }
    }
}
