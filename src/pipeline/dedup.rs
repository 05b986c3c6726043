//! Exposure deduplication by calendar day
//!
//! A new exposure is accepted only if its contact day is strictly later than
//! the contact day of the most recent stored exposure. Repeated runs over the
//! same matches therefore never notify twice.

use crate::calendar::local_date_from_millis;
use crate::risk::types::ExposureRecord;

/// Whether `candidate` should be stored given the latest existing record
pub fn is_new_exposure(existing: Option<&ExposureRecord>, candidate: &ExposureRecord) -> bool {
    let existing = match existing {
        Some(existing) => existing,
        None => return true,
    };

    let existing_day = local_date_from_millis(existing.exposure_contact_date);
    let candidate_day = local_date_from_millis(candidate.exposure_contact_date);

    match (existing_day, candidate_day) {
        (Some(existing_day), Some(candidate_day)) => candidate_day > existing_day,
        _ => candidate.exposure_contact_date > existing.exposure_contact_date,
    }
}
