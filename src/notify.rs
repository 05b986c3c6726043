//! Exposure notification hand-off
//!
//! Presenting the notification is the host application's job. The pipeline
//! only calls `Notifier::notify_exposure` once per accepted exposure.

use crate::calendar::local_date_from_millis;
use crate::risk::types::ExposureRecord;
use async_trait::async_trait;

pub type NotifyError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_exposure(&self, record: &ExposureRecord) -> Result<(), NotifyError>;
}

/// Notifier that only writes to the log, for headless deployments
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_exposure(&self, record: &ExposureRecord) -> Result<(), NotifyError> {
        let contact_day = local_date_from_millis(record.exposure_contact_date)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        log::info!("🔔 Exposure notification");
        log::info!("   ├─ Contact day: {}", contact_day);
        log::info!("   ├─ Days since exposure: {}", record.days_since_last_exposure);
        log::info!("   └─ Attenuation minutes: {}", record.attenuation_durations);
        Ok(())
    }
}
