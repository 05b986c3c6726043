//! # Diagnosis Key Pipeline
//!
//! One run is a strictly sequential chain of stages:
//!
//! ```text
//! Idle → ConfigCheck → EnabledCheck → Downloading → Submitting
//!      → AwaitingResult → Scoring → Deduplicating → Persisting
//!      → Notifying → Housekeeping → Done
//! ```
//!
//! Any stage can end the run early:
//! - benign exits (no server configured, paused, checks disabled, not
//!   authorised, no files) end with `RunOutcome::Skipped`
//! - faults (engine timeouts, store or network failures) are reported as a
//!   `LOG_ERROR` metric, persisted as the last error, and end with
//!   `RunOutcome::Failed`
//!
//! Either way the scheduler sees a completed run. Housekeeping and chaff
//! traffic run after every run that got as far as loading the risk config.
//!
//! ## Module Organization
//!
//! - `processor` - `DiagnosisKeyPipeline`, the stage chain
//! - `dedup` - calendar-day exposure deduplication
//! - `housekeeping` - retention, key file cleanup, run bookkeeping
//! - `scheduler` - named periodic / one-time jobs with replace semantics

pub mod dedup;
pub mod housekeeping;
pub mod processor;
pub mod scheduler;

pub use processor::{DiagnosisKeyPipeline, PipelineDeps, PipelineSettings};
pub use scheduler::{JobScheduler, ONE_TIME_JOB, PERIODIC_JOB};

use crate::risk::NoExposureReason;

/// Pipeline stage, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Idle,
    ConfigCheck,
    EnabledCheck,
    Downloading,
    Submitting,
    AwaitingResult,
    Scoring,
    Deduplicating,
    Persisting,
    Notifying,
    Housekeeping,
    Done,
}

/// Trigger options for a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOptions {
    /// Ignore the minimum interval since the previous run
    pub skip_time_check: bool,
    /// Score a synthetic exposure this many days ago instead of engine data
    pub simulate_days: Option<i64>,
    /// Send chaff traffic even if it is not due
    pub force_chaff: bool,
}

impl RunOptions {
    /// Options used by the periodic job, whose cadence is the throttle
    pub fn periodic() -> Self {
        Self {
            skip_time_check: true,
            ..Self::default()
        }
    }

    pub fn simulate(days: i64) -> Self {
        Self {
            skip_time_check: true,
            simulate_days: Some(days),
            force_chaff: false,
        }
    }
}

/// Asynchronous result notification from a matching engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCallback {
    /// The engine finished matching for this token
    StateUpdated { token: String },
    /// The engine finished matching and found nothing
    ExposureNotFound { token: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// A new exposure was stored and notified
    Exposure { id: i64, days_since_exposure: i64 },
    /// Scoring found no notifiable exposure
    NoExposure(NoExposureReason),
    /// The engine reported no matches
    NoMatch,
    /// Exposure is not newer than the one already stored
    Duplicate,
    /// The token was already answered by an earlier callback
    AlreadyProcessed,
    /// Benign early exit
    Skipped(String),
    /// Fault, already reported; the run still counts as successful
    Failed(String),
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Stage at which the outcome was decided
    pub stage: Stage,
    pub outcome: RunOutcome,
}

impl RunReport {
    /// Scheduler-facing status: runs never fail
    pub fn is_success(&self) -> bool {
        true
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, RunOutcome::Failed(_))
    }
}
