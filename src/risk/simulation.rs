//! Synthetic engine output for simulated exposures
//!
//! Lets the whole scoring and notification path be exercised without real
//! matches. V1 gets a fixed summary; V2 gets five windows of fifteen scans
//! each, the newest `simulate_days` days ago, with matching daily summaries.

use super::types::{
    CalibrationConfidence, DailySummary, ExposureSummary, ExposureWindow, Infectiousness,
    ReportType, ScanInstance,
};
use crate::calendar::{today_epoch_day, MILLIS_PER_DAY};
use chrono::{DateTime, Local};

const SIMULATED_WINDOWS: i64 = 5;
const SCANS_PER_WINDOW: u32 = 15;

/// Legacy summary reported for a simulated exposure
pub fn simulated_summary(simulate_days: i64) -> ExposureSummary {
    ExposureSummary {
        matched_key_count: 1,
        maximum_risk_score: 10,
        summation_risk_score: 10,
        days_since_last_exposure: simulate_days,
        attenuation_durations: [30, 30, 30],
    }
}

pub fn simulated_windows(now: DateTime<Local>, simulate_days: i64) -> Vec<ExposureWindow> {
    let newest_day = today_epoch_day(now).saturating_sub(simulate_days);

    (0..SIMULATED_WINDOWS)
        .map(|i| {
            let scan_instances = (0..SCANS_PER_WINDOW)
                .map(|k| ScanInstance {
                    typical_attenuation_db: 30 + (k % 4) as i32 * 15,
                    min_attenuation_db: 25 + (k % 4) as i32 * 15,
                    seconds_since_last_scan: 60 * (k % 5).max(1),
                })
                .collect();

            ExposureWindow {
                date_millis_since_epoch: newest_day.saturating_sub(i).saturating_mul(MILLIS_PER_DAY),
                calibration_confidence: CalibrationConfidence::High,
                report_type: ReportType::ConfirmedTest,
                infectiousness: if i % 2 == 0 {
                    Infectiousness::High
                } else {
                    Infectiousness::Standard
                },
                scan_instances,
            }
        })
        .collect()
}

/// One daily summary per simulated window day
pub fn simulated_daily_summaries(now: DateTime<Local>, simulate_days: i64) -> Vec<DailySummary> {
    let newest_day = today_epoch_day(now).saturating_sub(simulate_days);

    (0..SIMULATED_WINDOWS)
        .map(|i| DailySummary {
            days_since_epoch: newest_day.saturating_sub(i),
            maximum_score: 10.0,
            score_sum: 10.0,
            weighted_duration_sum: 30.0 * 60.0,
        })
        .collect()
}
