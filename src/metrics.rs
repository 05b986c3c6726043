//! Analytics events posted to the metrics endpoint
//!
//! Metrics are fire-and-forget: a failed post is logged and recorded as the
//! last API error, never surfaced to the pipeline. Nothing is sent unless
//! the user opted in to analytics.

use crate::network::ServerApi;
use crate::risk::types::ExposureRecord;
use crate::store::{ExposureStore, StateKey};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    ContactNotification,
    LogError,
    DailyActiveTrace,
}

impl MetricEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricEvent::ContactNotification => "CONTACT_NOTIFICATION",
            MetricEvent::LogError => "LOG_ERROR",
            MetricEvent::DailyActiveTrace => "DAILY_ACTIVE_TRACE",
        }
    }
}

/// Body of `POST /metrics`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub os: String,
    pub event: String,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Payload of the `CONTACT_NOTIFICATION` event
pub fn contact_payload(record: &ExposureRecord, simulated: bool, os: &str, version: &str) -> Value {
    json!({
        "matchedKeys": record.matched_key_count,
        "attenuations": record.attenuation_values(),
        "maxRiskScore": record.maximum_risk_score,
        "daysSinceExposure": record.days_since_last_exposure,
        "windows": record.windows().unwrap_or_default(),
        "simulated": simulated,
        "os": os,
        "version": version,
    })
}

/// Store `description` as the last API error, logging if the store refuses
pub async fn record_api_error(store: &dyn ExposureStore, description: &str) {
    if let Err(e) = store.set_state(StateKey::LastApiError, description).await {
        log::error!("❌ Failed to record last API error: {}", e);
    }
}

pub struct MetricsReporter {
    api: Arc<dyn ServerApi>,
    store: Arc<dyn ExposureStore>,
    opted_in: bool,
    os: String,
    version: String,
}

impl MetricsReporter {
    pub fn new(
        api: Arc<dyn ServerApi>,
        store: Arc<dyn ExposureStore>,
        opted_in: bool,
        version: &str,
    ) -> Self {
        Self {
            api,
            store,
            opted_in,
            os: std::env::consts::OS.to_string(),
            version: version.to_string(),
        }
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Post an event, returning whether it was delivered
    pub async fn report(&self, event: MetricEvent, payload: Option<Value>) -> bool {
        if !self.opted_in {
            log::debug!("Analytics opt-out, skipping {}", event.as_str());
            return false;
        }

        let metric = Metric {
            os: self.os.clone(),
            event: event.as_str().to_string(),
            version: self.version.clone(),
            payload,
        };

        match self.api.post_metric(&metric).await {
            Ok(()) => {
                log::debug!("📈 Metric {} sent", event.as_str());
                true
            }
            Err(e) => {
                log::warn!("⚠️  Failed to send metric {}: {}", event.as_str(), e);
                record_api_error(self.store.as_ref(), &e.to_string()).await;
                false
            }
        }
    }

    pub async fn report_error(&self, description: &str) -> bool {
        self.report(
            MetricEvent::LogError,
            Some(json!({ "description": description })),
        )
        .await
    }
}
