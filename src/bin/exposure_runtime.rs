//! Exposure Runtime
//!
//! Runs the exposure check pipeline on a fixed cadence:
//! - Opens the SQLite exposure store
//! - Connects the key, settings and metrics servers
//! - Picks a matching engine
//! - Schedules the periodic check and waits for CTRL+C
//!
//! Usage:
//!   cargo run --release --bin exposure_runtime
//!   cargo run --release --bin exposure_runtime -- --once
//!   cargo run --release --bin exposure_runtime -- --simulate 3
//!
//! Environment variables: see `RuntimeConfig::from_env`.

use dotenv::dotenv;
use exposure_check::calendar::system_clock;
use exposure_check::config::RuntimeConfig;
use exposure_check::engine::{select_engine, MatchingEngineClient, ReplayEngine};
use exposure_check::network::HttpServerApi;
use exposure_check::notify::LogNotifier;
use exposure_check::pipeline::{
    DiagnosisKeyPipeline, JobScheduler, PipelineDeps, PipelineSettings, RunOptions, PERIODIC_JOB,
};
use exposure_check::store::SqliteExposureStore;
use log::{error, info, warn};
use std::sync::Arc;

/// Run mode selected on the command line
enum Mode {
    Scheduled,
    Once,
    Simulate(i64),
}

fn parse_mode() -> Result<Mode, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if let Some(days) = args.windows(2).find(|w| w[0] == "--simulate").map(|w| w[1].clone()) {
        let days: i64 = days
            .parse()
            .map_err(|_| format!("Invalid --simulate value: {}", days))?;
        return Ok(Mode::Simulate(days));
    }
    if args.iter().any(|a| a == "--simulate") {
        return Err("Missing --simulate value. Usage: exposure_runtime --simulate <DAYS>".into());
    }
    if args.iter().any(|a| a == "--once") {
        return Ok(Mode::Once);
    }
    Ok(Mode::Scheduled)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mode = parse_mode()?;
    let config = RuntimeConfig::from_env();

    info!("🚀 Exposure Runtime");
    info!("   ├─ Version: {}", config.server.app_version);
    info!("   ├─ Database: {}", config.db_path);
    info!(
        "   ├─ Server: {}",
        config.server.server_url.as_deref().unwrap_or("(not configured)")
    );
    info!("   ├─ Key server: {:?}", config.server.key_server_type);
    info!("   ├─ Check every: {} min", config.check_frequency_minutes);
    info!("   └─ Analytics: {}", if config.analytics_opt_in { "opted in" } else { "off" });

    info!("🔧 Initializing exposure store...");
    let store = Arc::new(SqliteExposureStore::open(&config.db_path)?);
    info!("✅ Exposure store ready");

    let api = Arc::new(HttpServerApi::new(config.server.clone())?);

    let mut candidates: Vec<Arc<dyn MatchingEngineClient>> = Vec::new();
    if let Some(path) = &config.engine_fixture_path {
        match ReplayEngine::from_file(path) {
            Ok(engine) => candidates.push(Arc::new(engine)),
            Err(e) => warn!("⚠️  Failed to load engine fixture: {}", e),
        }
    }

    let engine = match select_engine(candidates).await {
        Some(engine) => engine,
        None => {
            info!("⚠️  No matching engine available (set ENGINE_FIXTURE_PATH)");
            info!("   └─ Exiting gracefully...");
            return Ok(());
        }
    };

    let pipeline = Arc::new(DiagnosisKeyPipeline::new(
        PipelineDeps {
            engine,
            store,
            api,
            notifier: Arc::new(LogNotifier),
            clock: system_clock(),
        },
        PipelineSettings::from_runtime(&config),
    ));
    info!("✅ Pipeline created");

    match mode {
        Mode::Once => {
            let report = pipeline.run(RunOptions::default()).await;
            info!("📊 Outcome: {:?}", report.outcome);
            return Ok(());
        }
        Mode::Simulate(days) => {
            let report = pipeline.simulate_exposure(days).await;
            info!("📊 Outcome: {:?}", report.outcome);
            return Ok(());
        }
        Mode::Scheduled => {}
    }

    let scheduler = JobScheduler::new();
    let job_pipeline = pipeline.clone();
    scheduler.schedule_periodic(
        PERIODIC_JOB,
        config.check_interval(),
        config.scheduler_jitter,
        move || {
            let pipeline = job_pipeline.clone();
            async move {
                pipeline.run(RunOptions::periodic()).await;
            }
        },
    );

    info!("");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    scheduler.cancel_all();
    info!("✅ Exposure runtime stopped");
    Ok(())
}
