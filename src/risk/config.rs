//! Server-supplied risk scoring configuration
//!
//! The settings endpoint returns `{"exposureConfig": "<stringified json>"}`.
//! The inner document is decoded into `RiskConfig` with the client defaults
//! applied for every optional field, then validated once. Scoring code only
//! ever sees a validated config.

use super::types::{Infectiousness, ReportType};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::convert::TryFrom;

/// Number of attenuation buckets (immediate, near, medium, other)
pub const BUCKET_COUNT: usize = 4;

/// Key files processed per run when the server does not say otherwise
pub const DEFAULT_NUM_FILES: usize = 6;

/// Days covered by `infectiousnessForDaysSinceOnsetOfSymptoms`
pub const DAYS_SINCE_ONSET_RANGE: std::ops::RangeInclusive<i32> = -14..=14;

/// Widest chaff window accepted from the server, in days
pub const MAX_CHAFF_WINDOW_DAYS: i64 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskConfig {
    // Engine-side V1 configuration, forwarded untouched
    #[serde(default)]
    pub minimum_risk_score: i32,
    #[serde(default)]
    pub attenuation_level_values: Vec<i32>,
    #[serde(default)]
    pub attenuation_weight: f64,
    #[serde(default)]
    pub days_since_last_exposure_level_values: Vec<i32>,
    #[serde(default)]
    pub days_since_last_exposure_weight: f64,
    #[serde(default)]
    pub duration_level_values: Vec<i32>,
    #[serde(default)]
    pub duration_weight: f64,
    #[serde(default)]
    pub transmission_risk_level_values: Vec<i32>,
    #[serde(default)]
    pub transmission_risk_weight: f64,
    #[serde(default)]
    pub duration_at_attenuation_thresholds: Vec<i32>,

    // V1 scoring
    #[serde(default)]
    pub threshold_weightings: Vec<f64>,
    /// Minutes; shared by the V1 total and the V2 per-window check
    #[serde(default)]
    pub time_threshold: i32,

    #[serde(rename = "numFilesiOS", alias = "numFiles", alias = "numFilesAndroid")]
    #[serde(default = "default_num_files")]
    pub num_files: usize,

    // V2 scoring, percentages 0-100
    #[serde(default = "default_weight")]
    pub immediate_duration_weight: f64,
    #[serde(default = "default_weight")]
    pub near_duration_weight: f64,
    #[serde(default = "default_weight")]
    pub medium_duration_weight: f64,
    #[serde(default = "default_weight")]
    pub other_duration_weight: f64,
    #[serde(default = "default_weight")]
    pub infectiousness_standard_weight: f64,
    #[serde(default = "default_weight")]
    pub infectiousness_high_weight: f64,
    #[serde(default = "default_weight")]
    pub report_type_confirmed_test_weight: f64,
    #[serde(default = "default_weight")]
    pub report_type_confirmed_clinical_diagnosis_weight: f64,
    #[serde(default = "default_weight")]
    pub report_type_self_reported_weight: f64,
    #[serde(default = "default_weight")]
    pub report_type_recursive_weight: f64,
    #[serde(default = "default_report_type_none_map")]
    pub report_type_none_map: i32,
    #[serde(default)]
    pub days_since_last_exposure_threshold: i32,
    #[serde(default = "default_minimum_risk_score_full_range")]
    pub minimum_risk_score_full_range: f64,
    #[serde(default)]
    pub infectiousness_for_days_since_onset_of_symptoms: Option<Vec<i32>>,
    #[serde(default = "default_attenuation_duration_thresholds")]
    pub attenuation_duration_thresholds: Vec<i32>,

    // Mode flags
    #[serde(default)]
    pub v2_mode: bool,
    #[serde(default)]
    pub contiguous_mode: bool,
    #[serde(default)]
    pub chaff_enabled: bool,
    #[serde(default = "default_chaff_window")]
    pub chaff_window: i64,
    #[serde(default, rename = "disableENSChecks")]
    pub disable_ens_checks: bool,
}

fn default_num_files() -> usize {
    DEFAULT_NUM_FILES
}

fn default_weight() -> f64 {
    100.0
}

fn default_report_type_none_map() -> i32 {
    i32::from(ReportType::ConfirmedTest)
}

fn default_minimum_risk_score_full_range() -> f64 {
    1.0
}

fn default_attenuation_duration_thresholds() -> Vec<i32> {
    vec![50, 70, 90]
}

fn default_chaff_window() -> i64 {
    6
}

/// Envelope returned by the settings endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettingsDocument {
    exposure_config: Option<String>,
}

impl RiskConfig {
    /// Decode the settings endpoint document
    pub fn from_settings_json(body: &str) -> Result<Self, ConfigError> {
        let settings: SettingsDocument = serde_json::from_str(body)?;
        let inner = settings.exposure_config.ok_or(ConfigError::Missing)?;
        Self::from_json(&inner)
    }

    /// Decode and validate the inner exposure config document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: RiskConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check the V2 weight and threshold invariants
    ///
    /// V1 threshold weightings are deliberately not checked here: a
    /// malformed V1 weighting is a "no exposure" outcome, not a config fault.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attenuation_duration_thresholds.len() != BUCKET_COUNT - 1 {
            return Err(ConfigError::Invalid(format!(
                "attenuationDurationThresholds must have {} values, got {}",
                BUCKET_COUNT - 1,
                self.attenuation_duration_thresholds.len()
            )));
        }

        let weights = [
            ("immediateDurationWeight", self.immediate_duration_weight),
            ("nearDurationWeight", self.near_duration_weight),
            ("mediumDurationWeight", self.medium_duration_weight),
            ("otherDurationWeight", self.other_duration_weight),
            ("infectiousnessStandardWeight", self.infectiousness_standard_weight),
            ("infectiousnessHighWeight", self.infectiousness_high_weight),
            ("reportTypeConfirmedTestWeight", self.report_type_confirmed_test_weight),
            (
                "reportTypeConfirmedClinicalDiagnosisWeight",
                self.report_type_confirmed_clinical_diagnosis_weight,
            ),
            ("reportTypeSelfReportedWeight", self.report_type_self_reported_weight),
            ("reportTypeRecursiveWeight", self.report_type_recursive_weight),
        ];
        for (name, weight) in weights {
            if !(0.0..=100.0).contains(&weight) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within 0-100, got {}",
                    name, weight
                )));
            }
        }

        if ReportType::try_from(self.report_type_none_map).is_err() {
            return Err(ConfigError::Invalid(format!(
                "reportTypeNoneMap {} is not a report type",
                self.report_type_none_map
            )));
        }

        if self.num_files == 0 {
            return Err(ConfigError::Invalid("numFiles must be positive".to_string()));
        }

        if self.chaff_window > MAX_CHAFF_WINDOW_DAYS {
            return Err(ConfigError::Invalid(format!(
                "chaffWindow must be at most {} days, got {}",
                MAX_CHAFF_WINDOW_DAYS, self.chaff_window
            )));
        }

        Ok(())
    }

    /// Duration weights per bucket, scaled to 0.0-1.0
    pub fn bucket_weights(&self) -> [f64; BUCKET_COUNT] {
        [
            self.immediate_duration_weight / 100.0,
            self.near_duration_weight / 100.0,
            self.medium_duration_weight / 100.0,
            self.other_duration_weight / 100.0,
        ]
    }

    /// Chaff window in days, between one day and `MAX_CHAFF_WINDOW_DAYS`
    pub fn chaff_window_days(&self) -> i64 {
        self.chaff_window.clamp(1, MAX_CHAFF_WINDOW_DAYS)
    }

    /// Configuration handed to a V2 engine when requesting daily summaries
    pub fn daily_summaries_config(&self) -> DailySummariesConfig {
        let mut report_type_weights = BTreeMap::new();
        report_type_weights.insert(
            i32::from(ReportType::ConfirmedTest),
            self.report_type_confirmed_test_weight / 100.0,
        );
        report_type_weights.insert(
            i32::from(ReportType::ConfirmedClinicalDiagnosis),
            self.report_type_confirmed_clinical_diagnosis_weight / 100.0,
        );
        report_type_weights.insert(
            i32::from(ReportType::SelfReport),
            self.report_type_self_reported_weight / 100.0,
        );
        report_type_weights.insert(
            i32::from(ReportType::Recursive),
            self.report_type_recursive_weight / 100.0,
        );

        let mut infectiousness_weights = BTreeMap::new();
        infectiousness_weights.insert(
            i32::from(Infectiousness::Standard),
            self.infectiousness_standard_weight / 100.0,
        );
        infectiousness_weights.insert(
            i32::from(Infectiousness::High),
            self.infectiousness_high_weight / 100.0,
        );

        DailySummariesConfig {
            attenuation_thresholds: self.attenuation_duration_thresholds.clone(),
            attenuation_weights: self.bucket_weights().to_vec(),
            days_since_exposure_threshold: self.days_since_last_exposure_threshold,
            minimum_window_score: self.minimum_risk_score_full_range,
            report_type_weights,
            infectiousness_weights,
        }
    }

    /// Days-since-onset to infectiousness mapping handed to a V2 engine
    ///
    /// The server sends a flat array covering -14..=14; missing trailing
    /// entries map to `Infectiousness::None`.
    pub fn data_mapping(&self) -> DiagnosisKeysDataMapping {
        let values = self
            .infectiousness_for_days_since_onset_of_symptoms
            .as_deref()
            .unwrap_or(&[]);

        let days_since_onset_to_infectiousness = DAYS_SINCE_ONSET_RANGE
            .zip(values.iter().map(Some).chain(std::iter::repeat(None)))
            .map(|(day, value)| {
                let infectiousness = value
                    .and_then(|code| Infectiousness::try_from(*code).ok())
                    .unwrap_or(Infectiousness::None);
                (day, infectiousness)
            })
            .collect();

        let report_type_when_missing =
            ReportType::try_from(self.report_type_none_map).unwrap_or(ReportType::ConfirmedTest);

        DiagnosisKeysDataMapping {
            days_since_onset_to_infectiousness,
            report_type_when_missing,
        }
    }
}

/// Daily summary weighting passed to the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummariesConfig {
    pub attenuation_thresholds: Vec<i32>,
    pub attenuation_weights: Vec<f64>,
    pub days_since_exposure_threshold: i32,
    pub minimum_window_score: f64,
    pub report_type_weights: BTreeMap<i32, f64>,
    pub infectiousness_weights: BTreeMap<i32, f64>,
}

/// Key metadata mapping passed to a V2 engine on submission
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosisKeysDataMapping {
    pub days_since_onset_to_infectiousness: BTreeMap<i32, Infectiousness>,
    pub report_type_when_missing: ReportType,
}
