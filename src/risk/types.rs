//! Engine output shapes and the persisted exposure record
//!
//! Enum codes follow the platform exposure notification API, which is also
//! the format engine fixtures and the stored window data use.

use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

/// Legacy (V1) exposure summary for one submission token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureSummary {
    pub matched_key_count: i32,
    pub maximum_risk_score: i32,
    pub summation_risk_score: i32,
    pub days_since_last_exposure: i64,
    /// Minutes spent below / between / above the attenuation thresholds
    pub attenuation_durations: [u32; 3],
}

/// Per-day aggregate produced by a V2 engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub days_since_epoch: i64,
    pub maximum_score: f64,
    pub score_sum: f64,
    #[serde(default)]
    pub weighted_duration_sum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ReportType {
    Unknown,
    ConfirmedTest,
    ConfirmedClinicalDiagnosis,
    SelfReport,
    Recursive,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum Infectiousness {
    None,
    Standard,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum CalibrationConfidence {
    Lowest,
    Low,
    Medium,
    High,
}

impl TryFrom<i32> for ReportType {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ReportType::Unknown),
            1 => Ok(ReportType::ConfirmedTest),
            2 => Ok(ReportType::ConfirmedClinicalDiagnosis),
            3 => Ok(ReportType::SelfReport),
            4 => Ok(ReportType::Recursive),
            5 => Ok(ReportType::Revoked),
            other => Err(format!("unknown report type {}", other)),
        }
    }
}

impl From<ReportType> for i32 {
    fn from(value: ReportType) -> Self {
        match value {
            ReportType::Unknown => 0,
            ReportType::ConfirmedTest => 1,
            ReportType::ConfirmedClinicalDiagnosis => 2,
            ReportType::SelfReport => 3,
            ReportType::Recursive => 4,
            ReportType::Revoked => 5,
        }
    }
}

impl TryFrom<i32> for Infectiousness {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Infectiousness::None),
            1 => Ok(Infectiousness::Standard),
            2 => Ok(Infectiousness::High),
            other => Err(format!("unknown infectiousness {}", other)),
        }
    }
}

impl From<Infectiousness> for i32 {
    fn from(value: Infectiousness) -> Self {
        match value {
            Infectiousness::None => 0,
            Infectiousness::Standard => 1,
            Infectiousness::High => 2,
        }
    }
}

impl TryFrom<i32> for CalibrationConfidence {
    type Error = String;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(CalibrationConfidence::Lowest),
            1 => Ok(CalibrationConfidence::Low),
            2 => Ok(CalibrationConfidence::Medium),
            3 => Ok(CalibrationConfidence::High),
            other => Err(format!("unknown calibration confidence {}", other)),
        }
    }
}

impl From<CalibrationConfidence> for i32 {
    fn from(value: CalibrationConfidence) -> Self {
        match value {
            CalibrationConfidence::Lowest => 0,
            CalibrationConfidence::Low => 1,
            CalibrationConfidence::Medium => 2,
            CalibrationConfidence::High => 3,
        }
    }
}

/// One Bluetooth scan inside an exposure window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanInstance {
    pub typical_attenuation_db: i32,
    pub min_attenuation_db: i32,
    pub seconds_since_last_scan: u32,
}

/// A V2 exposure window (at most 30 minutes of scans with one key)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureWindow {
    /// UTC midnight of the window's day, epoch millis
    pub date_millis_since_epoch: i64,
    pub calibration_confidence: CalibrationConfidence,
    pub report_type: ReportType,
    pub infectiousness: Infectiousness,
    pub scan_instances: Vec<ScanInstance>,
}

/// Bucketed scan minutes for one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanData {
    /// Raw minutes per attenuation bucket: immediate, near, medium, other
    pub buckets: [f64; 4],
    /// Minutes after applying the per-bucket duration weights
    pub weighted_buckets: [f64; 4],
    pub exceeds_threshold: bool,
}

/// Window details persisted alongside a V2 exposure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowData {
    pub date: i64,
    pub calibration_confidence: CalibrationConfidence,
    pub diagnosis_report_type: ReportType,
    pub infectiousness: Infectiousness,
    #[serde(flatten)]
    pub scan_data: ScanData,
}

/// A persisted, notifiable exposure
///
/// Created at most once per successful evaluation and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ExposureRecord {
    pub days_since_last_exposure: i64,
    /// -1 for window-based (V2) evaluations
    pub matched_key_count: i32,
    pub maximum_risk_score: i32,
    pub summation_risk_score: i32,
    /// Comma separated minutes per bucket
    pub attenuation_durations: String,
    /// Local midnight of the contact day, epoch millis
    pub exposure_contact_date: i64,
    /// JSON array of `WindowData`, `[]` for V1
    pub window_data: String,
    pub created_timestamp_ms: i64,
}

impl ExposureRecord {
    /// Parse the stored window data back into structured windows
    pub fn windows(&self) -> Result<Vec<WindowData>, serde_json::Error> {
        if self.window_data.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&self.window_data)
    }

    pub fn attenuation_values(&self) -> Vec<i64> {
        self.attenuation_durations
            .split(',')
            .filter_map(|v| v.trim().parse().ok())
            .collect()
    }
}

/// Result of a risk evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum RiskOutcome {
    Exposure(ExposureRecord),
    NoExposure(NoExposureReason),
}

/// Why an evaluation produced no record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoExposureReason {
    NoSummary,
    NoMatches,
    ZeroRiskScore,
    MalformedThresholds,
    BelowThreshold,
    NoEngineData,
    NoQualifyingDays,
    NoExceedingWindow,
    NoMatchingDay,
    /// Days since exposure too far from today to place on the calendar
    ContactDateOutOfRange,
}

impl RiskOutcome {
    pub fn record(&self) -> Option<&ExposureRecord> {
        match self {
            RiskOutcome::Exposure(record) => Some(record),
            RiskOutcome::NoExposure(_) => None,
        }
    }
}
