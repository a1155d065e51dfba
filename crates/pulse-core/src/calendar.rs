//! Calendar window helpers for download analytics.
//!
//! All boundaries are derived from one captured anchor so the four counter
//! windows are mutually consistent even if the aggregation straddles midnight.
//! Each boundary is resolved in the [`CalendarZone`], so a window that spans
//! a daylight-saving change still starts at local midnight.

use chrono::{DateTime, Datelike, Days, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta};

use crate::zone::CalendarZone;

/// Number of trailing calendar days in the history series (today included).
pub const HISTORY_DAYS: u32 = 30;

/// Lower bounds for the point-in-time download counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterWindows {
    /// The shared "now" every other boundary was derived from.
    pub anchor: DateTime<FixedOffset>,
    /// Local midnight of the anchor's day.
    pub start_of_day: DateTime<FixedOffset>,
    /// Monday 00:00 of the anchor's ISO week.
    pub start_of_week: DateTime<FixedOffset>,
    /// 00:00 on the first of the anchor's month.
    pub start_of_month: DateTime<FixedOffset>,
}

/// Compute the day, ISO week and month boundaries for `anchor` in `zone`.
#[must_use]
pub fn counter_windows(anchor: DateTime<FixedOffset>, zone: &dyn CalendarZone) -> CounterWindows {
    let today = zone.date_of(&anchor);
    let week_start = today - Days::new(u64::from(today.weekday().num_days_from_monday()));
    let month_start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);

    CounterWindows {
        anchor,
        start_of_day: local_midnight(zone, anchor, today),
        start_of_week: local_midnight(zone, anchor, week_start),
        start_of_month: local_midnight(zone, anchor, month_start),
    }
}

/// Exclusive lower bound of the history query: exactly 30 days before `anchor`.
#[must_use]
pub fn history_since(anchor: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    anchor - TimeDelta::days(i64::from(HISTORY_DAYS))
}

/// The `count` calendar days ending at `today`, oldest first.
#[must_use]
pub fn trailing_days(today: NaiveDate, count: u32) -> Vec<NaiveDate> {
    (0..u64::from(count))
        .rev()
        .map(|back| today - Days::new(back))
        .collect()
}

/// Parse a platform timestamp.
///
/// Accepts RFC 3339 (`timestamptz` columns) and bare ISO date-times, which
/// are taken as UTC (`timestamp` columns).
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt);
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc().fixed_offset())
}

fn local_midnight(
    zone: &dyn CalendarZone,
    anchor: DateTime<FixedOffset>,
    date: NaiveDate,
) -> DateTime<FixedOffset> {
    zone.midnight(date)
        .or_else(|| anchor.offset().midnight(date))
        .unwrap_or(anchor)
}
