//! Window-based (V2) risk scoring
//!
//! Steps:
//! 1. Keep daily summaries whose maximum score reaches
//!    `minimumRiskScoreFullRange`, most recent day first.
//! 2. Bucket every window's scans by typical attenuation and weight the
//!    minutes per bucket.
//! 3. Non-contiguous mode: report the most recent qualifying day.
//!    Contiguous mode: report the day of the most recent window whose
//!    weighted minutes reach `timeThreshold`.

use super::config::{RiskConfig, BUCKET_COUNT};
use super::run_blocking;
use super::simulation::{simulated_daily_summaries, simulated_windows};
use super::types::{
    DailySummary, ExposureRecord, ExposureWindow, NoExposureReason, RiskOutcome, ScanData,
    WindowData,
};
use crate::calendar::{contact_date_millis, epoch_day_from_millis, today_epoch_day};
use crate::engine::{with_timeout, EngineTimeouts, MatchingEngineClient};
use crate::error::PipelineResult;
use chrono::{DateTime, Local};
use std::sync::Arc;

/// Bucket a window's scan minutes by attenuation
///
/// A scan lands in the first bucket `i` with `typical_attenuation_db <=
/// thresholds[i]`, or in the last ("other") bucket when no threshold matches.
pub fn bucket_scans(
    window: &ExposureWindow,
    thresholds: &[i32],
    weights: &[f64; BUCKET_COUNT],
    time_threshold: f64,
) -> ScanData {
    let mut buckets = [0.0; BUCKET_COUNT];

    for scan in &window.scan_instances {
        let index = thresholds
            .iter()
            .take(BUCKET_COUNT - 1)
            .position(|t| scan.typical_attenuation_db <= *t)
            .unwrap_or(BUCKET_COUNT - 1);
        buckets[index] += scan.seconds_since_last_scan as f64 / 60.0;
    }

    let mut weighted_buckets = [0.0; BUCKET_COUNT];
    for (i, minutes) in buckets.iter().enumerate() {
        weighted_buckets[i] = minutes * weights[i];
    }

    let weighted_total: f64 = weighted_buckets.iter().sum();

    ScanData {
        buckets,
        weighted_buckets,
        exceeds_threshold: weighted_total >= time_threshold,
    }
}

/// Decide whether V2 engine output is a notifiable exposure
///
/// # Arguments
/// * `summaries` - Daily summaries from the engine
/// * `windows` - Exposure windows from the engine
/// * `config` - Validated risk config (thresholds, weights, modes)
/// * `now` - Current local time, used for days-since and contact date
pub fn evaluate(
    summaries: &[DailySummary],
    windows: &[ExposureWindow],
    config: &RiskConfig,
    now: DateTime<Local>,
) -> RiskOutcome {
    if summaries.is_empty() || windows.is_empty() {
        return RiskOutcome::NoExposure(NoExposureReason::NoEngineData);
    }

    let mut days: Vec<&DailySummary> = summaries
        .iter()
        .filter(|day| day.maximum_score >= config.minimum_risk_score_full_range)
        .collect();

    if days.is_empty() {
        log::debug!(
            "No day reaches minimum score {}",
            config.minimum_risk_score_full_range
        );
        return RiskOutcome::NoExposure(NoExposureReason::NoQualifyingDays);
    }

    // Stable: equal days keep engine order
    days.sort_by(|a, b| b.days_since_epoch.cmp(&a.days_since_epoch));

    let weights = config.bucket_weights();
    let time_threshold = config.time_threshold as f64;
    let scored: Vec<(&ExposureWindow, ScanData)> = windows
        .iter()
        .map(|w| {
            let data = bucket_scans(w, &config.attenuation_duration_thresholds, &weights, time_threshold);
            (w, data)
        })
        .collect();

    let day = if config.contiguous_mode {
        let latest = scored
            .iter()
            .filter(|(_, data)| data.exceeds_threshold)
            .map(|(w, _)| w.date_millis_since_epoch)
            .max();

        let latest = match latest {
            Some(millis) => millis,
            None => return RiskOutcome::NoExposure(NoExposureReason::NoExceedingWindow),
        };

        let window_day = epoch_day_from_millis(latest);
        match days.iter().find(|d| d.days_since_epoch == window_day) {
            Some(day) => *day,
            None => {
                log::debug!("No qualifying daily summary for window day {}", window_day);
                return RiskOutcome::NoExposure(NoExposureReason::NoMatchingDay);
            }
        }
    } else {
        days[0]
    };

    summarize_day(day, &scored, now)
}

fn summarize_day(
    day: &DailySummary,
    scored: &[(&ExposureWindow, ScanData)],
    now: DateTime<Local>,
) -> RiskOutcome {
    // A day in the future (clock skew) counts as today
    let days_since = today_epoch_day(now).saturating_sub(day.days_since_epoch).max(0);
    let exposure_contact_date = match contact_date_millis(now, days_since) {
        Some(date) => date,
        None => {
            log::warn!("⚠️  Daily summary day {} out of range", day.days_since_epoch);
            return RiskOutcome::NoExposure(NoExposureReason::ContactDateOutOfRange);
        }
    };

    let window_data: Vec<WindowData> = scored
        .iter()
        .filter(|(w, _)| epoch_day_from_millis(w.date_millis_since_epoch) == day.days_since_epoch)
        .map(|(w, data)| WindowData {
            date: w.date_millis_since_epoch,
            calibration_confidence: w.calibration_confidence,
            diagnosis_report_type: w.report_type,
            infectiousness: w.infectiousness,
            scan_data: data.clone(),
        })
        .collect();

    let mut totals = [0.0; BUCKET_COUNT];
    for data in &window_data {
        for (total, minutes) in totals.iter_mut().zip(data.scan_data.weighted_buckets.iter()) {
            *total += minutes;
        }
    }

    let attenuation_durations = totals
        .iter()
        .map(|m| format!("{}", m.round() as i64))
        .collect::<Vec<_>>()
        .join(",");

    let serialized = serde_json::to_string(&window_data).unwrap_or_else(|e| {
        log::warn!("⚠️  Failed to serialize window data: {}", e);
        "[]".to_string()
    });

    RiskOutcome::Exposure(ExposureRecord {
        days_since_last_exposure: days_since,
        matched_key_count: -1,
        maximum_risk_score: day.maximum_score.round() as i32,
        summation_risk_score: day.score_sum.round() as i32,
        attenuation_durations,
        exposure_contact_date,
        window_data: serialized,
        created_timestamp_ms: now.timestamp_millis(),
    })
}

/// Fetches daily summaries and windows and scores them
pub struct RiskCalculatorV2 {
    engine: Arc<dyn MatchingEngineClient>,
    timeouts: EngineTimeouts,
}

impl RiskCalculatorV2 {
    pub fn new(engine: Arc<dyn MatchingEngineClient>, timeouts: EngineTimeouts) -> Self {
        Self { engine, timeouts }
    }

    /// Score the engine's current V2 state
    ///
    /// With `simulate_days` set, synthetic summaries and windows replace the
    /// engine output.
    pub async fn process_keys(
        &self,
        config: &RiskConfig,
        simulate_days: Option<i64>,
        now: DateTime<Local>,
    ) -> PipelineResult<RiskOutcome> {
        let (summaries, windows) = match simulate_days {
            Some(days) => (
                simulated_daily_summaries(now, days),
                simulated_windows(now, days),
            ),
            None => {
                let summaries_config = config.daily_summaries_config();
                let summaries = with_timeout(
                    "get_daily_summaries",
                    self.timeouts.default,
                    self.engine.get_daily_summaries(&summaries_config),
                )
                .await?;
                let windows = with_timeout(
                    "get_exposure_windows",
                    self.timeouts.default,
                    self.engine.get_exposure_windows(),
                )
                .await?;
                (summaries, windows)
            }
        };

        log::debug!(
            "V2 scoring {} daily summaries, {} windows",
            summaries.len(),
            windows.len()
        );

        let config = config.clone();
        run_blocking(move || evaluate(&summaries, &windows, &config, now)).await
    }
}
