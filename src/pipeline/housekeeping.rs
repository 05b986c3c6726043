//! Retention, key file cleanup and run bookkeeping

use crate::calendar::{local_date_from_millis, MILLIS_PER_DAY};
use crate::error::StoreError;
use crate::metrics::{MetricEvent, MetricsReporter};
use crate::store::{ExposureStore, StateKey};
use chrono::{DateTime, Local};
use std::io::ErrorKind;
use std::path::PathBuf;

/// Run timestamps kept in `StateKey::LastRun`
pub const RUN_HISTORY_LEN: usize = 10;

/// Delete exposures and tokens older than the retention horizon
pub async fn delete_old_data(
    store: &dyn ExposureStore,
    now: DateTime<Local>,
    retention_days: i64,
) -> Result<(usize, usize), StoreError> {
    let cutoff = now
        .timestamp_millis()
        .saturating_sub(retention_days.max(0).saturating_mul(MILLIS_PER_DAY));

    let exposures = store.delete_exposures_before(cutoff).await?;
    let tokens = store.delete_tokens_before(cutoff).await?;

    if exposures > 0 || tokens > 0 {
        log::info!(
            "🧹 Retention: deleted {} exposures, {} tokens older than {} days",
            exposures,
            tokens,
            retention_days
        );
    }
    Ok((exposures, tokens))
}

/// Remove downloaded key files; missing files are fine
pub async fn delete_key_files(files: &[PathBuf]) {
    for file in files {
        match tokio::fs::remove_file(file).await {
            Ok(()) => log::debug!("   ├─ Removed {}", file.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!("⚠️  Failed to remove key file {}: {}", file.display(), e),
        }
    }
}

/// Previous run timestamps, oldest first
pub async fn run_history(store: &dyn ExposureStore) -> Result<Vec<i64>, StoreError> {
    match store.get_state(StateKey::LastRun).await? {
        Some(json) => Ok(serde_json::from_str(&json)?),
        None => Ok(Vec::new()),
    }
}

/// Append a run timestamp, keeping the last `RUN_HISTORY_LEN`
pub async fn record_run(store: &dyn ExposureStore, now: DateTime<Local>) -> Result<(), StoreError> {
    let mut history = run_history(store).await.unwrap_or_default();
    history.push(now.timestamp_millis());

    let excess = history.len().saturating_sub(RUN_HISTORY_LEN);
    history.drain(..excess);

    store
        .set_state(StateKey::LastRun, &serde_json::to_string(&history)?)
        .await
}

/// Send `DAILY_ACTIVE_TRACE` at most once per local calendar day
pub async fn track_daily_active(
    store: &dyn ExposureStore,
    metrics: &MetricsReporter,
    now: DateTime<Local>,
) -> Result<bool, StoreError> {
    let last = store.get_state_i64(StateKey::DailyActiveTrace).await?;
    let already_today = last
        .and_then(local_date_from_millis)
        .map_or(false, |day| day == now.date_naive());

    if already_today {
        return Ok(false);
    }

    if metrics.report(MetricEvent::DailyActiveTrace, None).await {
        store
            .set_state(StateKey::DailyActiveTrace, &now.timestamp_millis().to_string())
            .await?;
        return Ok(true);
    }
    Ok(false)
}
