//! # Exposure Check
//!
//! Background exposure checking for a contact tracing client: download
//! published diagnosis keys, hand them to the platform matching engine,
//! score the result, persist new exposures and notify.
//!
//! ## Module Organization
//!
//! - `pipeline` - the exposure check run and its scheduler
//! - `risk` - V1 summary and V2 window scoring, server risk config
//! - `engine` - matching engine interface and the replay engine
//! - `store` - SQLite persistence for exposures, tokens and run state
//! - `network` - key, settings, metrics, callback and chaff endpoints
//! - `chaff` - decoy upload traffic
//! - `metrics` - opt-in analytics events
//! - `notify` - exposure notification hand-off
//! - `config` - environment configuration
//! - `calendar` - local calendar day arithmetic and the injectable clock
//! - `error` - error types

pub mod calendar;
pub mod chaff;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod network;
pub mod notify;
pub mod pipeline;
pub mod risk;
pub mod store;
