//! Calendar-day arithmetic shared by scoring, dedup and housekeeping
//!
//! Contact dates are stored as epoch milliseconds at local midnight. Engine
//! day indices (daily summaries, window dates) are UTC days since the epoch.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveTime, TimeZone};
use std::sync::Arc;

/// Injectable wall clock, so tests can pin "now"
pub type Clock = Arc<dyn Fn() -> DateTime<Local> + Send + Sync>;

pub const MILLIS_PER_DAY: i64 = 86_400_000;

/// `NaiveDate::num_days_from_ce()` of 1970-01-01
const EPOCH_DAYS_FROM_CE: i32 = 719_163;

pub fn system_clock() -> Clock {
    Arc::new(Local::now)
}

/// Clock frozen at a fixed instant
pub fn fixed_clock(at: DateTime<Local>) -> Clock {
    Arc::new(move || at)
}

/// Local midnight of the given calendar date
pub fn local_midnight(date: NaiveDate) -> DateTime<Local> {
    let naive = date.and_time(NaiveTime::MIN);
    match Local.from_local_datetime(&naive).earliest() {
        Some(dt) => dt,
        // Midnight skipped by a DST jump: fall back to interpreting it as UTC
        None => Local.from_utc_datetime(&naive),
    }
}

pub fn start_of_day(now: DateTime<Local>) -> DateTime<Local> {
    local_midnight(now.date_naive())
}

/// Furthest a contact date may lie from today, in days
pub const MAX_CONTACT_DAYS: i64 = 3_650;

/// Local midnight `days_ago` days before today, as epoch millis
///
/// `None` when `days_ago` is further than `MAX_CONTACT_DAYS` from today.
pub fn contact_date_millis(now: DateTime<Local>, days_ago: i64) -> Option<i64> {
    if days_ago.unsigned_abs() > MAX_CONTACT_DAYS as u64 {
        return None;
    }
    let date = now.date_naive() - Duration::days(days_ago);
    Some(local_midnight(date).timestamp_millis())
}

/// Days since 1970-01-01 for a calendar date
pub fn epoch_day(date: NaiveDate) -> i64 {
    (date.num_days_from_ce() - EPOCH_DAYS_FROM_CE) as i64
}

/// Today's local date as days since the epoch
pub fn today_epoch_day(now: DateTime<Local>) -> i64 {
    epoch_day(now.date_naive())
}

/// Engine window timestamps are UTC midnight millis
pub fn epoch_day_from_millis(millis: i64) -> i64 {
    millis.div_euclid(MILLIS_PER_DAY)
}

/// Local calendar date of an epoch-millis timestamp
pub fn local_date_from_millis(millis: i64) -> Option<NaiveDate> {
    Local
        .timestamp_millis_opt(millis)
        .earliest()
        .map(|dt| dt.date_naive())
}
