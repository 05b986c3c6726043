//! Summary-based (V1) risk scoring
//!
//! `totalTime = Σ weighting[i] * attenuationMinutes[i]` over the three
//! attenuation buckets of the engine summary. A summary is notifiable when
//! `totalTime >= timeThreshold`.

use super::config::RiskConfig;
use super::simulation::simulated_summary;
use super::types::{ExposureRecord, ExposureSummary, NoExposureReason, RiskOutcome};
use super::run_blocking;
use crate::calendar::contact_date_millis;
use crate::engine::{with_timeout, EngineTimeouts, MatchingEngineClient};
use crate::error::PipelineResult;
use chrono::{DateTime, Local};
use std::sync::Arc;

/// Weightings used when simulating an exposure
pub const SIMULATED_WEIGHTINGS: [f64; 3] = [1.0, 1.0, 0.0];

/// Minutes threshold used when simulating an exposure
pub const SIMULATED_TIME_THRESHOLD: f64 = 15.0;

/// Threshold inputs for V1 scoring
#[derive(Debug, Clone, PartialEq)]
pub struct V1Thresholds {
    pub weightings: Vec<f64>,
    pub time_threshold: f64,
}

impl V1Thresholds {
    pub fn from_config(config: &RiskConfig) -> Self {
        Self {
            weightings: config.threshold_weightings.clone(),
            time_threshold: config.time_threshold as f64,
        }
    }

    pub fn simulated() -> Self {
        Self {
            weightings: SIMULATED_WEIGHTINGS.to_vec(),
            time_threshold: SIMULATED_TIME_THRESHOLD,
        }
    }

    fn is_well_formed(&self) -> bool {
        self.weightings.len() == 3 && self.time_threshold > 0.0
    }
}

/// Weighted attenuation minutes
pub fn total_time(weightings: &[f64], attenuation_durations: &[u32; 3]) -> f64 {
    weightings
        .iter()
        .zip(attenuation_durations.iter())
        .map(|(weight, minutes)| weight * *minutes as f64)
        .sum()
}

/// Decide whether a legacy summary is a notifiable exposure
///
/// # Arguments
/// * `summary` - Engine summary for the token, if the engine produced one
/// * `thresholds` - Weightings and time threshold (config or simulation)
/// * `now` - Current local time, used to derive the contact date
///
/// # Returns
/// `RiskOutcome::Exposure` with a new record, or the reason no exposure was found
pub fn evaluate(
    summary: Option<&ExposureSummary>,
    thresholds: &V1Thresholds,
    now: DateTime<Local>,
) -> RiskOutcome {
    let summary = match summary {
        Some(summary) => summary,
        None => return RiskOutcome::NoExposure(NoExposureReason::NoSummary),
    };

    if summary.matched_key_count == 0 {
        return RiskOutcome::NoExposure(NoExposureReason::NoMatches);
    }
    if summary.maximum_risk_score == 0 {
        return RiskOutcome::NoExposure(NoExposureReason::ZeroRiskScore);
    }

    if !thresholds.is_well_formed() {
        log::warn!(
            "⚠️  Malformed V1 thresholds: weightings={:?} threshold={}",
            thresholds.weightings,
            thresholds.time_threshold
        );
        return RiskOutcome::NoExposure(NoExposureReason::MalformedThresholds);
    }

    let total = total_time(&thresholds.weightings, &summary.attenuation_durations);
    log::debug!(
        "V1 total time {:.1} min (threshold {:.1})",
        total,
        thresholds.time_threshold
    );

    if total < thresholds.time_threshold {
        return RiskOutcome::NoExposure(NoExposureReason::BelowThreshold);
    }

    let exposure_contact_date = match contact_date_millis(now, summary.days_since_last_exposure) {
        Some(date) => date,
        None => {
            log::warn!(
                "⚠️  Days since last exposure out of range: {}",
                summary.days_since_last_exposure
            );
            return RiskOutcome::NoExposure(NoExposureReason::ContactDateOutOfRange);
        }
    };

    let attenuation_durations = summary
        .attenuation_durations
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(",");

    RiskOutcome::Exposure(ExposureRecord {
        days_since_last_exposure: summary.days_since_last_exposure,
        matched_key_count: summary.matched_key_count,
        maximum_risk_score: summary.maximum_risk_score,
        summation_risk_score: summary.summation_risk_score,
        attenuation_durations,
        exposure_contact_date,
        window_data: "[]".to_string(),
        created_timestamp_ms: now.timestamp_millis(),
    })
}

/// Fetches the legacy summary for a token and scores it
pub struct RiskCalculatorV1 {
    engine: Arc<dyn MatchingEngineClient>,
    timeouts: EngineTimeouts,
}

impl RiskCalculatorV1 {
    pub fn new(engine: Arc<dyn MatchingEngineClient>, timeouts: EngineTimeouts) -> Self {
        Self { engine, timeouts }
    }

    /// Score the engine result for `token`
    ///
    /// With `simulate_days` set, the engine is not consulted and a synthetic
    /// summary is scored against the simulation thresholds instead.
    pub async fn process_keys(
        &self,
        token: &str,
        config: &RiskConfig,
        simulate_days: Option<i64>,
        now: DateTime<Local>,
    ) -> PipelineResult<RiskOutcome> {
        let (summary, thresholds) = match simulate_days {
            Some(days) => (Some(simulated_summary(days)), V1Thresholds::simulated()),
            None => {
                let summary = with_timeout(
                    "get_exposure_summary",
                    self.timeouts.api,
                    self.engine.get_exposure_summary(token),
                )
                .await?;
                (summary, V1Thresholds::from_config(config))
            }
        };

        run_blocking(move || evaluate(summary.as_ref(), &thresholds, now)).await
    }
}
