//! Integration tests for the exposure check pipeline
//!
//! Each test wires a `DiagnosisKeyPipeline` to:
//! - a recording in-process key/settings server
//! - a `ReplayEngine` (or a deliberately slow engine)
//! - an in-memory SQLite store
//! - a fixed clock
//!
//! and checks the observable effects of complete runs: stored exposures,
//! tokens, metrics, callbacks and run state.

#[cfg(test)]
mod exposure_pipeline_tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone};
    use exposure_check::calendar::{contact_date_millis, fixed_clock, today_epoch_day, MILLIS_PER_DAY};
    use exposure_check::engine::{EngineFixture, EngineTimeouts, MatchingEngineClient, ReplayEngine};
    use exposure_check::error::{ApiError, EngineError};
    use exposure_check::metrics::Metric;
    use exposure_check::network::{CallbackRequest, ChaffEndpoint, KeyFile, KeyServerType, ServerApi};
    use exposure_check::notify::{Notifier, NotifyError};
    use exposure_check::pipeline::{
        DiagnosisKeyPipeline, EngineCallback, PipelineDeps, PipelineSettings, RunOptions,
        RunOutcome, Stage,
    };
    use exposure_check::risk::config::{DailySummariesConfig, DiagnosisKeysDataMapping};
    use exposure_check::risk::types::{
        CalibrationConfidence, DailySummary, ExposureRecord, ExposureSummary, ExposureWindow,
        Infectiousness, ReportType, ScanInstance,
    };
    use exposure_check::risk::{NoExposureReason, RiskConfig};
    use exposure_check::store::{ExposureStore, SqliteExposureStore, StateKey, TokenRecord};
    use serde_json::{json, Value};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Key, settings and analytics server that records everything it receives
    struct MockServer {
        settings: Mutex<Option<String>>,
        files: Mutex<Vec<KeyFile>>,
        metrics: Mutex<Vec<Metric>>,
        callbacks: Mutex<Vec<CallbackRequest>>,
        chaff: Mutex<Vec<ChaffEndpoint>>,
        settings_fetches: AtomicUsize,
        fail_metrics: AtomicBool,
        fail_callbacks: AtomicBool,
    }

    impl MockServer {
        fn new(settings: Option<String>, file_ids: &[i64]) -> Self {
            Self {
                settings: Mutex::new(settings),
                files: Mutex::new(file_ids.iter().map(|id| make_key_file(*id)).collect()),
                metrics: Mutex::new(Vec::new()),
                callbacks: Mutex::new(Vec::new()),
                chaff: Mutex::new(Vec::new()),
                settings_fetches: AtomicUsize::new(0),
                fail_metrics: AtomicBool::new(false),
                fail_callbacks: AtomicBool::new(false),
            }
        }

        fn publish(&self, id: i64) {
            self.files.lock().unwrap().push(make_key_file(id));
        }

        fn set_settings(&self, settings: Option<String>) {
            *self.settings.lock().unwrap() = settings;
        }

        fn events(&self) -> Vec<String> {
            self.metrics.lock().unwrap().iter().map(|m| m.event.clone()).collect()
        }

        fn metric(&self, event: &str) -> Option<Metric> {
            self.metrics.lock().unwrap().iter().find(|m| m.event == event).cloned()
        }

        fn callbacks(&self) -> Vec<CallbackRequest> {
            self.callbacks.lock().unwrap().clone()
        }

        fn chaff_sent(&self) -> Vec<ChaffEndpoint> {
            self.chaff.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServerApi for MockServer {
        fn key_server_type(&self) -> KeyServerType {
            KeyServerType::NearForm
        }

        async fn fetch_settings(&self) -> Result<String, ApiError> {
            self.settings_fetches.fetch_add(1, Ordering::SeqCst);
            self.settings.lock().unwrap().clone().ok_or(ApiError::Status {
                endpoint: "settings/exposures".to_string(),
                status: 503,
            })
        }

        async fn list_key_files(&self, since: i64, limit: usize) -> Result<Vec<KeyFile>, ApiError> {
            Ok(self
                .files
                .lock()
                .unwrap()
                .iter()
                .filter(|f| f.id > since)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn download_key_file(&self, file: &KeyFile, dir: &Path) -> Result<PathBuf, ApiError> {
            let path = dir.join(format!("keys_{}.zip", file.id));
            std::fs::write(&path, b"PK")?;
            Ok(path)
        }

        async fn post_metric(&self, metric: &Metric) -> Result<(), ApiError> {
            if self.fail_metrics.load(Ordering::SeqCst) {
                return Err(ApiError::Status {
                    endpoint: "metrics".to_string(),
                    status: 500,
                });
            }
            self.metrics.lock().unwrap().push(metric.clone());
            Ok(())
        }

        async fn post_callback(&self, request: &CallbackRequest) -> Result<(), ApiError> {
            if self.fail_callbacks.load(Ordering::SeqCst) {
                return Err(ApiError::Status {
                    endpoint: "callback".to_string(),
                    status: 502,
                });
            }
            self.callbacks.lock().unwrap().push(request.clone());
            Ok(())
        }

        async fn post_chaff(&self, endpoint: ChaffEndpoint, _body: &Value) -> Result<(), ApiError> {
            self.chaff.lock().unwrap().push(endpoint);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notified: Mutex<Vec<ExposureRecord>>,
    }

    impl RecordingNotifier {
        fn count(&self) -> usize {
            self.notified.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify_exposure(&self, record: &ExposureRecord) -> Result<(), NotifyError> {
            self.notified.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    /// Engine whose enablement check never answers in time
    struct StalledEngine;

    #[async_trait]
    impl MatchingEngineClient for StalledEngine {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn is_enabled(&self) -> Result<bool, EngineError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(true)
        }

        async fn submit_keys(
            &self,
            _files: &[PathBuf],
            _token: &str,
            _config: &RiskConfig,
        ) -> Result<Option<ExposureSummary>, EngineError> {
            Ok(None)
        }

        async fn submit_keys_v2(
            &self,
            _files: &[PathBuf],
            _mapping: &DiagnosisKeysDataMapping,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn get_exposure_summary(&self, _token: &str) -> Result<Option<ExposureSummary>, EngineError> {
            Ok(None)
        }

        async fn get_daily_summaries(
            &self,
            _config: &DailySummariesConfig,
        ) -> Result<Vec<DailySummary>, EngineError> {
            Ok(Vec::new())
        }

        async fn get_exposure_windows(&self) -> Result<Vec<ExposureWindow>, EngineError> {
            Ok(Vec::new())
        }
    }

    struct Harness {
        pipeline: DiagnosisKeyPipeline,
        store: Arc<SqliteExposureStore>,
        server: Arc<MockServer>,
        notifier: Arc<RecordingNotifier>,
        key_dir: TempDir,
    }

    impl Harness {
        fn key_dir_is_empty(&self) -> bool {
            std::fs::read_dir(self.key_dir.path()).unwrap().next().is_none()
        }

        async fn remaining_tokens(&self) -> usize {
            self.store.delete_tokens_before(i64::MAX).await.unwrap()
        }
    }

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2021, 6, 15, 11, 0, 0).unwrap()
    }

    fn make_key_file(id: i64) -> KeyFile {
        KeyFile {
            id,
            path: format!("exposures/{}.zip", id),
        }
    }

    fn settings_json(config: Value) -> String {
        json!({ "exposureConfig": config.to_string() }).to_string()
    }

    fn v1_config() -> Value {
        json!({
            "minimumRiskScore": 1,
            "thresholdWeightings": [1, 1, 0],
            "timeThreshold": 15,
            "numFiles": 3
        })
    }

    fn v2_config(contiguous: bool) -> Value {
        json!({
            "v2Mode": true,
            "contiguousMode": contiguous,
            "minimumRiskScoreFullRange": 20,
            "timeThreshold": 15,
            "attenuationDurationThresholds": [50, 70, 90]
        })
    }

    fn make_summary(durations: [u32; 3], matched: i32) -> ExposureSummary {
        ExposureSummary {
            matched_key_count: matched,
            maximum_risk_score: 10,
            summation_risk_score: 12,
            days_since_last_exposure: 2,
            attenuation_durations: durations,
        }
    }

    fn v1_fixture(durations: [u32; 3]) -> EngineFixture {
        EngineFixture {
            summary: Some(make_summary(durations, 1)),
            ..EngineFixture::default()
        }
    }

    fn make_day(days_ago: i64, max_score: f64) -> DailySummary {
        DailySummary {
            days_since_epoch: today_epoch_day(now()) - days_ago,
            maximum_score: max_score,
            score_sum: max_score,
            weighted_duration_sum: 0.0,
        }
    }

    /// Window `days_ago` days back with `scans` one-minute scans at 40 dB
    fn make_window(days_ago: i64, scans: usize) -> ExposureWindow {
        ExposureWindow {
            date_millis_since_epoch: (today_epoch_day(now()) - days_ago) * MILLIS_PER_DAY,
            calibration_confidence: CalibrationConfidence::High,
            report_type: ReportType::ConfirmedTest,
            infectiousness: Infectiousness::Standard,
            scan_instances: (0..scans)
                .map(|_| ScanInstance {
                    typical_attenuation_db: 40,
                    min_attenuation_db: 35,
                    seconds_since_last_scan: 60,
                })
                .collect(),
        }
    }

    fn make_settings(key_dir: &Path) -> PipelineSettings {
        PipelineSettings {
            server_configured: true,
            callback_number: None,
            analytics_opt_in: true,
            app_version: "1.0.0".to_string(),
            check_interval: Duration::from_secs(120 * 60),
            retention_days: 14,
            key_file_dir: key_dir.to_path_buf(),
            timeouts: EngineTimeouts::default(),
        }
    }

    fn make_harness_with(
        settings: Option<String>,
        engine: Arc<dyn MatchingEngineClient>,
        configure: impl FnOnce(&mut PipelineSettings),
    ) -> Harness {
        let key_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteExposureStore::open_in_memory().unwrap());
        let server = Arc::new(MockServer::new(settings, &[1, 2, 3]));
        let notifier = Arc::new(RecordingNotifier::default());

        let mut pipeline_settings = make_settings(key_dir.path());
        configure(&mut pipeline_settings);

        let pipeline = DiagnosisKeyPipeline::new(
            PipelineDeps {
                engine,
                store: store.clone(),
                api: server.clone(),
                notifier: notifier.clone(),
                clock: fixed_clock(now()),
            },
            pipeline_settings,
        );

        Harness {
            pipeline,
            store,
            server,
            notifier,
            key_dir,
        }
    }

    fn make_harness(config: Value, fixture: EngineFixture) -> Harness {
        make_harness_with(
            Some(settings_json(config)),
            Arc::new(ReplayEngine::new("replay", fixture)),
            |_| {},
        )
    }

    // Test: attenuation [10,10,10] with weightings [1,1,0] and threshold 15 notifies
    #[tokio::test]
    async fn test_v1_exposure_is_stored_and_notified() {
        let harness = make_harness(v1_config(), v1_fixture([10, 10, 10]));

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Exposure {
                id: 1,
                days_since_exposure: 2
            }
        );
        assert_eq!(report.stage, Stage::Notifying);
        assert!(report.is_success());

        let stored = harness.store.list_exposures().await.unwrap();
        assert_eq!(stored.len(), 1);
        let record = &stored[0].record;
        assert_eq!(record.attenuation_durations, "10,10,10");
        assert_eq!(record.window_data, "[]");
        assert_eq!(record.exposure_contact_date, contact_date_millis(now(), 2).unwrap());

        assert_eq!(harness.notifier.count(), 1);
        let metric = harness.server.metric("CONTACT_NOTIFICATION").unwrap();
        let payload = metric.payload.unwrap();
        assert_eq!(payload["matchedKeys"], 1);
        assert_eq!(payload["attenuations"], json!([10, 10, 10]));
        assert_eq!(payload["simulated"], false);
        assert_eq!(metric.version, "1.0.0");

        // Downloaded files are gone and the cursor moved to the newest file
        assert!(harness.key_dir_is_empty());
        assert_eq!(harness.store.get_state_i64(StateKey::Since).await.unwrap(), Some(3));

        // The answered token is kept until retention
        assert_eq!(harness.remaining_tokens().await, 1);
    }

    // Test: attenuation [5,5,0] totals 10 < 15, token is deleted
    #[tokio::test]
    async fn test_v1_below_threshold_deletes_token() {
        let harness = make_harness(v1_config(), v1_fixture([5, 5, 0]));

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(report.outcome, RunOutcome::NoExposure(NoExposureReason::BelowThreshold));
        assert!(harness.store.list_exposures().await.unwrap().is_empty());
        assert_eq!(harness.notifier.count(), 0);
        assert_eq!(harness.remaining_tokens().await, 0);
        assert!(harness.server.metric("CONTACT_NOTIFICATION").is_none());
    }

    #[tokio::test]
    async fn test_v1_no_matches_deletes_token() {
        let fixture = EngineFixture {
            summary: Some(make_summary([0, 0, 0], 0)),
            ..EngineFixture::default()
        };
        let harness = make_harness(v1_config(), fixture);

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(report.outcome, RunOutcome::NoMatch);
        assert_eq!(harness.remaining_tokens().await, 0);
    }

    // Test: a second run over the same contact day does not create a duplicate
    #[tokio::test]
    async fn test_repeated_match_is_deduplicated() {
        let harness = make_harness(v1_config(), v1_fixture([10, 10, 10]));

        let first = harness.pipeline.run(RunOptions::periodic()).await;
        assert!(matches!(first.outcome, RunOutcome::Exposure { .. }));

        harness.server.publish(4);
        let second = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(second.outcome, RunOutcome::Duplicate);
        assert_eq!(second.stage, Stage::Deduplicating);
        assert_eq!(harness.store.list_exposures().await.unwrap().len(), 1);
        assert_eq!(harness.notifier.count(), 1);
        assert_eq!(harness.store.get_state_i64(StateKey::Since).await.unwrap(), Some(4));
    }

    // Test: scores [40, 10] with minimum 20 select the day scored 40
    #[tokio::test]
    async fn test_v2_most_recent_qualifying_day() {
        let fixture = EngineFixture {
            daily_summaries: vec![make_day(1, 10.0), make_day(2, 40.0)],
            exposure_windows: vec![make_window(2, 20), make_window(1, 5)],
            ..EngineFixture::default()
        };
        let harness = make_harness(v2_config(false), fixture);

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Exposure {
                id: 1,
                days_since_exposure: 2
            }
        );

        let record = harness.store.most_recent_exposure().await.unwrap().unwrap().record;
        assert_eq!(record.matched_key_count, -1);
        assert_eq!(record.maximum_risk_score, 40);
        assert_eq!(record.attenuation_durations, "20,0,0,0");

        let windows = record.windows().unwrap();
        assert_eq!(windows.len(), 1);
        assert!(windows[0].scan_data.exceeds_threshold);
    }

    // Test: contiguous mode without an exceeding window reports nothing
    #[tokio::test]
    async fn test_v2_contiguous_without_exceeding_window() {
        let fixture = EngineFixture {
            daily_summaries: vec![make_day(1, 40.0), make_day(2, 40.0)],
            exposure_windows: vec![make_window(1, 5), make_window(2, 10)],
            ..EngineFixture::default()
        };
        let harness = make_harness(v2_config(true), fixture);

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::NoExposure(NoExposureReason::NoExceedingWindow)
        );
        assert!(harness.store.list_exposures().await.unwrap().is_empty());
        assert_eq!(harness.remaining_tokens().await, 0);
    }

    // Test: simulating 3 days stores a record for local midnight three days ago
    #[tokio::test]
    async fn test_simulated_exposure() {
        let engine = Arc::new(ReplayEngine::new("replay", EngineFixture::default()));
        let harness = make_harness_with(Some(settings_json(v1_config())), engine.clone(), |_| {});

        let report = harness.pipeline.simulate_exposure(3).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Exposure {
                id: 1,
                days_since_exposure: 3
            }
        );
        let record = harness.store.most_recent_exposure().await.unwrap().unwrap().record;
        assert_eq!(record.days_since_last_exposure, 3);
        assert_eq!(record.exposure_contact_date, contact_date_millis(now(), 3).unwrap());

        let payload = harness.server.metric("CONTACT_NOTIFICATION").unwrap().payload.unwrap();
        assert_eq!(payload["simulated"], true);
        assert!(engine.submitted_files().is_empty());
    }

    // Test: a billion-day simulation fails the run instead of panicking
    #[tokio::test]
    async fn test_simulated_exposure_out_of_range() {
        let harness = make_harness(v1_config(), EngineFixture::default());

        let report = harness.pipeline.simulate_exposure(1_000_000_000).await;

        assert!(report.is_failure());
        match &report.outcome {
            RunOutcome::Failed(description) => assert!(description.contains("out of range")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(harness.store.list_exposures().await.unwrap().is_empty());
        assert_eq!(harness.notifier.count(), 0);
    }

    #[tokio::test]
    async fn test_unconfigured_server_is_skipped() {
        let harness = make_harness_with(
            Some(settings_json(v1_config())),
            Arc::new(ReplayEngine::new("replay", v1_fixture([10, 10, 10]))),
            |settings| settings.server_configured = false,
        );

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Skipped("no server configuration present".to_string())
        );
        assert_eq!(report.stage, Stage::ConfigCheck);
        assert_eq!(harness.server.settings_fetches.load(Ordering::SeqCst), 0);
        assert!(harness.server.events().is_empty());
    }

    #[tokio::test]
    async fn test_paused_service_is_skipped() {
        let harness = make_harness(v1_config(), v1_fixture([10, 10, 10]));
        harness.store.set_paused(true).await.unwrap();

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(report.outcome, RunOutcome::Skipped("exposure checks are paused".to_string()));
        assert!(harness.store.list_exposures().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_can_disable_checks() {
        let mut config = v1_config();
        config["disableENSChecks"] = json!(true);
        let harness = make_harness(config, v1_fixture([10, 10, 10]));

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Skipped("exposure checks are disabled by server configuration".to_string())
        );
        assert_eq!(harness.store.get_state_i64(StateKey::Since).await.unwrap(), None);
    }

    // Test: a disabled engine ends the run as "not authorised"
    #[tokio::test]
    async fn test_disabled_engine_is_not_authorised() {
        let fixture = EngineFixture {
            enabled: false,
            ..v1_fixture([10, 10, 10])
        };
        let harness = make_harness(v1_config(), fixture);

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(report.outcome, RunOutcome::Skipped("not authorised".to_string()));
        assert_eq!(report.stage, Stage::EnabledCheck);
        assert!(harness.server.metric("LOG_ERROR").is_none());
    }

    #[tokio::test]
    async fn test_no_new_files_is_skipped() {
        let harness = make_harness(v1_config(), v1_fixture([10, 10, 10]));
        harness.store.set_state(StateKey::Since, "3").await.unwrap();

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Skipped("no key files available to process".to_string())
        );
        assert_eq!(report.stage, Stage::Downloading);
    }

    // Test: an engine timeout is reported and the run still succeeds
    #[tokio::test]
    async fn test_engine_timeout_fails_open() {
        let harness = make_harness_with(
            Some(settings_json(v1_config())),
            Arc::new(StalledEngine),
            |settings| {
                settings.timeouts = EngineTimeouts {
                    api: Duration::from_millis(50),
                    default: Duration::from_millis(50),
                }
            },
        );

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert!(report.is_success());
        assert!(report.is_failure());
        assert_eq!(report.stage, Stage::EnabledCheck);
        match &report.outcome {
            RunOutcome::Failed(description) => assert!(description.contains("is_enabled timed out")),
            other => panic!("expected failure, got {:?}", other),
        }

        let metric = harness.server.metric("LOG_ERROR").unwrap();
        assert!(metric.payload.unwrap()["description"]
            .as_str()
            .unwrap()
            .contains("timed out"));

        let last_error = harness.store.get_state(StateKey::LastError).await.unwrap();
        assert!(last_error.unwrap().contains("timed out"));
    }

    // Test: forced chaff still goes out after an engine timeout fails the run
    #[tokio::test(start_paused = true)]
    async fn test_forced_chaff_after_failed_run() {
        let harness = make_harness_with(
            Some(settings_json(v1_config())),
            Arc::new(StalledEngine),
            |settings| {
                settings.timeouts = EngineTimeouts {
                    api: Duration::from_millis(50),
                    default: Duration::from_millis(50),
                }
            },
        );

        let options = RunOptions {
            skip_time_check: true,
            force_chaff: true,
            simulate_days: None,
        };
        let report = harness.pipeline.run(options).await;

        assert!(report.is_failure());
        assert_eq!(
            harness.server.chaff_sent(),
            vec![ChaffEndpoint::Verify, ChaffEndpoint::Publish]
        );
    }

    // Test: chaff due from a past schedule is sent and rescheduled after the run
    #[tokio::test(start_paused = true)]
    async fn test_due_chaff_sent_by_run() {
        let mut config = v1_config();
        config["chaffEnabled"] = json!(true);
        config["chaffWindow"] = json!(3);
        let harness = make_harness(config, v1_fixture([10, 10, 10]));

        let past = (now() - ChronoDuration::days(1)).timestamp_millis();
        harness
            .store
            .set_state(StateKey::NextChaffDate, &past.to_string())
            .await
            .unwrap();
        harness.store.set_paused(true).await.unwrap();

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(report.outcome, RunOutcome::Skipped("exposure checks are paused".to_string()));
        assert_eq!(
            harness.server.chaff_sent(),
            vec![ChaffEndpoint::Verify, ChaffEndpoint::Publish]
        );

        let next = harness
            .store
            .get_state_i64(StateKey::NextChaffDate)
            .await
            .unwrap()
            .unwrap();
        assert!(next > now().timestamp_millis());
        assert!(next <= (now() + ChronoDuration::days(3)).timestamp_millis());
    }

    // Test: chaff is not sent when no server config could be loaded
    #[tokio::test]
    async fn test_no_chaff_without_config() {
        let harness = make_harness_with(
            Some(settings_json(v1_config())),
            Arc::new(ReplayEngine::new("replay", v1_fixture([10, 10, 10]))),
            |settings| settings.server_configured = false,
        );

        let options = RunOptions {
            skip_time_check: true,
            force_chaff: true,
            simulate_days: None,
        };
        harness.pipeline.run(options).await;

        assert!(harness.server.chaff_sent().is_empty());
    }

    // Test: a rejected metric post is recorded as the last API error
    #[tokio::test]
    async fn test_failed_metric_recorded_as_api_error() {
        let harness = make_harness(v1_config(), v1_fixture([10, 10, 10]));
        harness.server.fail_metrics.store(true, Ordering::SeqCst);

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert!(matches!(report.outcome, RunOutcome::Exposure { .. }));
        assert_eq!(harness.notifier.count(), 1);
        let last = harness.store.get_state(StateKey::LastApiError).await.unwrap();
        assert_eq!(last.as_deref(), Some("unexpected status 500 from metrics"));
    }

    // Test: a rejected callback request is recorded as the last API error
    #[tokio::test]
    async fn test_failed_callback_recorded_as_api_error() {
        let harness = make_harness_with(
            Some(settings_json(v1_config())),
            Arc::new(ReplayEngine::new("replay", v1_fixture([10, 10, 10]))),
            |settings| settings.callback_number = Some("+353871234567".to_string()),
        );
        harness.server.fail_callbacks.store(true, Ordering::SeqCst);

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert!(matches!(report.outcome, RunOutcome::Exposure { .. }));
        assert!(harness.server.callbacks().is_empty());
        assert_eq!(harness.notifier.count(), 1);
        let last = harness.store.get_state(StateKey::LastApiError).await.unwrap();
        assert_eq!(last.as_deref(), Some("unexpected status 502 from callback"));
    }

    // Test: a failed settings fetch falls back to the cached config
    #[tokio::test]
    async fn test_cached_config_used_when_fetch_fails() {
        let harness = make_harness(v1_config(), v1_fixture([10, 10, 10]));
        harness.pipeline.run(RunOptions::periodic()).await;

        harness.server.set_settings(None);
        harness.server.publish(4);
        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert_eq!(report.outcome, RunOutcome::Duplicate);
        assert_eq!(harness.server.settings_fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_config_without_cache_fails() {
        let harness = make_harness_with(
            None,
            Arc::new(ReplayEngine::new("replay", v1_fixture([10, 10, 10]))),
            |_| {},
        );

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert!(report.is_failure());
        assert_eq!(report.stage, Stage::ConfigCheck);
        assert!(harness.store.get_state(StateKey::LastError).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_callback_request_sent() {
        let harness = make_harness_with(
            Some(settings_json(v1_config())),
            Arc::new(ReplayEngine::new("replay", v1_fixture([10, 10, 10]))),
            |settings| settings.callback_number = Some("+353871234567".to_string()),
        );

        harness.pipeline.run(RunOptions::periodic()).await;

        let callbacks = harness.server.callbacks();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0].mobile, "+353871234567");
        assert_eq!(callbacks[0].days_since_exposure, 2);
        assert_eq!(callbacks[0].close_contact_date, contact_date_millis(now(), 2).unwrap());
    }

    #[tokio::test]
    async fn test_no_metrics_without_opt_in() {
        let harness = make_harness_with(
            Some(settings_json(v1_config())),
            Arc::new(ReplayEngine::new("replay", v1_fixture([10, 10, 10]))),
            |settings| settings.analytics_opt_in = false,
        );

        let report = harness.pipeline.run(RunOptions::periodic()).await;

        assert!(matches!(report.outcome, RunOutcome::Exposure { .. }));
        assert!(harness.server.events().is_empty());
        assert_eq!(harness.notifier.count(), 1);
    }

    // Test: the daily active trace is sent once per local day
    #[tokio::test]
    async fn test_daily_active_trace_once_per_day() {
        let harness = make_harness(v1_config(), v1_fixture([5, 5, 0]));

        harness.pipeline.run(RunOptions::periodic()).await;
        harness.server.publish(4);
        harness.pipeline.run(RunOptions::periodic()).await;

        let traces = harness
            .server
            .events()
            .into_iter()
            .filter(|e| e == "DAILY_ACTIVE_TRACE")
            .count();
        assert_eq!(traces, 1);
    }

    #[tokio::test]
    async fn test_manual_run_throttled_after_recent_run() {
        let harness = make_harness(v1_config(), v1_fixture([5, 5, 0]));

        harness.pipeline.run(RunOptions::default()).await;
        harness.server.publish(4);
        let report = harness.pipeline.run(RunOptions::default()).await;

        assert_eq!(
            report.outcome,
            RunOutcome::Skipped("run skipped: last run was too recent".to_string())
        );

        let forced = harness.pipeline.run(RunOptions::periodic()).await;
        assert_eq!(forced.outcome, RunOutcome::NoExposure(NoExposureReason::BelowThreshold));
    }

    #[tokio::test]
    async fn test_old_exposures_removed_by_retention() {
        let harness = make_harness(v1_config(), v1_fixture([5, 5, 0]));
        let old = (now() - ChronoDuration::days(20)).timestamp_millis();
        harness
            .store
            .insert_exposure(&ExposureRecord {
                days_since_last_exposure: 1,
                matched_key_count: 1,
                maximum_risk_score: 10,
                summation_risk_score: 10,
                attenuation_durations: "10,10,10".to_string(),
                exposure_contact_date: old,
                window_data: "[]".to_string(),
                created_timestamp_ms: old,
            })
            .await
            .unwrap();

        harness.pipeline.run(RunOptions::periodic()).await;

        assert!(harness.store.list_exposures().await.unwrap().is_empty());
    }

    // Test: an engine callback for an answered token is ignored
    #[tokio::test]
    async fn test_engine_callback_processed_at_most_once() {
        let harness = make_harness(v1_config(), v1_fixture([10, 10, 10]));
        harness.pipeline.run(RunOptions::periodic()).await;

        harness
            .store
            .upsert_token(&TokenRecord {
                token: "answered".to_string(),
                created_timestamp_ms: now().timestamp_millis(),
                responded: true,
            })
            .await
            .unwrap();

        let report = harness
            .pipeline
            .handle_engine_callback(EngineCallback::StateUpdated {
                token: "answered".to_string(),
            })
            .await;

        assert_eq!(report.outcome, RunOutcome::AlreadyProcessed);
        assert_eq!(harness.store.list_exposures().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_engine_callback_without_matches_deletes_token() {
        let harness = make_harness(v1_config(), v1_fixture([5, 5, 0]));
        harness.pipeline.run(RunOptions::periodic()).await;

        harness
            .store
            .upsert_token(&TokenRecord {
                token: "pending".to_string(),
                created_timestamp_ms: now().timestamp_millis(),
                responded: false,
            })
            .await
            .unwrap();

        let report = harness
            .pipeline
            .handle_engine_callback(EngineCallback::ExposureNotFound {
                token: "pending".to_string(),
            })
            .await;

        assert_eq!(report.outcome, RunOutcome::NoMatch);
        assert!(harness.store.get_token("pending").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_engine_callback_needs_cached_config() {
        let harness = make_harness(v1_config(), v1_fixture([10, 10, 10]));

        let report = harness
            .pipeline
            .handle_engine_callback(EngineCallback::StateUpdated {
                token: "unknown".to_string(),
            })
            .await;

        assert_eq!(
            report.outcome,
            RunOutcome::Skipped("no server configuration present".to_string())
        );
    }
}
