//! Time zones for resolving local calendar days.
//!
//! Counter windows and history buckets are defined in wall-clock terms
//! ("since midnight", "per day"). One UTC offset cannot express those across
//! a daylight-saving change, so every boundary is resolved against a
//! [`CalendarZone`] instead of the offset attached to "now".

use chrono::{
    DateTime, Datelike, Days, FixedOffset, MappedLocalTime, NaiveDate, NaiveDateTime, NaiveTime,
    Offset, TimeDelta, TimeZone,
};

/// Local midnights inside a forward transition are scanned in these steps.
const GAP_SCAN_STEP_MINUTES: i64 = 15;
const GAP_SCAN_STEPS: i64 = 24 * 60 / GAP_SCAN_STEP_MINUTES;

/// Maps instants to local calendar dates and local midnights back to instants.
pub trait CalendarZone: Send + Sync {
    /// Local calendar date of `instant`.
    fn date_of(&self, instant: &DateTime<FixedOffset>) -> NaiveDate;

    /// The instant at which local `date` begins.
    ///
    /// An ambiguous midnight resolves to the earlier instant. A midnight
    /// skipped by a forward transition resolves to the first local time that
    /// exists after it.
    fn midnight(&self, date: NaiveDate) -> Option<DateTime<FixedOffset>>;
}

impl<Tz> CalendarZone for Tz
where
    Tz: TimeZone + Send + Sync,
{
    fn date_of(&self, instant: &DateTime<FixedOffset>) -> NaiveDate {
        instant.with_timezone(self).date_naive()
    }

    fn midnight(&self, date: NaiveDate) -> Option<DateTime<FixedOffset>> {
        let start = date.and_time(NaiveTime::MIN);
        (0..GAP_SCAN_STEPS).find_map(|step| {
            let local = start.checked_add_signed(TimeDelta::minutes(step * GAP_SCAN_STEP_MINUTES))?;
            self.from_local_datetime(&local)
                .earliest()
                .map(|dt| dt.fixed_offset())
        })
    }
}

const fn hours(h: i32) -> FixedOffset {
    match FixedOffset::east_opt(h * 3600) {
        Some(offset) => offset,
        None => panic!("offset out of range"),
    }
}

/// A zone with one daylight-saving period per year, from the last Sunday of
/// March to the last Sunday of October, switching at 01:00 UTC.
///
/// This is the European Union rule. It gives deterministic DST behavior
/// without depending on the process `TZ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaylightZone {
    standard: FixedOffset,
    daylight: FixedOffset,
}

/// Central European Time: +01:00, +02:00 in summer.
pub const CENTRAL_EUROPEAN: DaylightZone = DaylightZone::new(hours(1), hours(2));

impl DaylightZone {
    #[must_use]
    pub const fn new(standard: FixedOffset, daylight: FixedOffset) -> Self {
        Self { standard, daylight }
    }

    /// Offset in effect at the UTC instant `utc`.
    #[must_use]
    pub fn offset_at(&self, utc: NaiveDateTime) -> FixedOffset {
        let year = utc.year();
        match (transition(year, 3), transition(year, 10)) {
            (Some(start), Some(end)) if start <= utc && utc < end => self.daylight,
            _ => self.standard,
        }
    }

    const fn wrap(self, offset: FixedOffset) -> DaylightOffset {
        DaylightOffset { zone: self, offset }
    }
}

/// 01:00 UTC on the last Sunday of `month`.
fn transition(year: i32, month: u32) -> Option<NaiveDateTime> {
    let last = NaiveDate::from_ymd_opt(year, month + 1, 1)?.pred_opt()?;
    let sunday = last - Days::new(u64::from(last.weekday().num_days_from_sunday()));
    sunday.and_hms_opt(1, 0, 0)
}

/// Offset type of [`DaylightZone`]; keeps the zone so it can be recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaylightOffset {
    zone: DaylightZone,
    offset: FixedOffset,
}

impl Offset for DaylightOffset {
    fn fix(&self) -> FixedOffset {
        self.offset
    }
}

impl TimeZone for DaylightZone {
    type Offset = DaylightOffset;

    fn from_offset(offset: &DaylightOffset) -> Self {
        offset.zone
    }

    fn offset_from_local_date(&self, local: &NaiveDate) -> MappedLocalTime<DaylightOffset> {
        self.offset_from_local_datetime(&local.and_time(NaiveTime::MIN))
    }

    fn offset_from_local_datetime(&self, local: &NaiveDateTime) -> MappedLocalTime<DaylightOffset> {
        let valid = |offset: FixedOffset| {
            local
                .checked_sub_signed(TimeDelta::seconds(i64::from(offset.local_minus_utc())))
                .is_some_and(|utc| self.offset_at(utc) == offset)
        };
        // The larger offset maps a local time to the earlier instant.
        let (early, late) = if self.daylight.local_minus_utc() >= self.standard.local_minus_utc() {
            (self.daylight, self.standard)
        } else {
            (self.standard, self.daylight)
        };
        match (valid(early), valid(late)) {
            (true, true) if early != late => {
                MappedLocalTime::Ambiguous(self.wrap(early), self.wrap(late))
            }
            (true, _) => MappedLocalTime::Single(self.wrap(early)),
            (false, true) => MappedLocalTime::Single(self.wrap(late)),
            (false, false) => MappedLocalTime::None,
        }
    }

    fn offset_from_utc_date(&self, utc: &NaiveDate) -> DaylightOffset {
        self.offset_from_utc_datetime(&utc.and_time(NaiveTime::MIN))
    }

    fn offset_from_utc_datetime(&self, utc: &NaiveDateTime) -> DaylightOffset {
        self.wrap(self.offset_at(*utc))
    }
}
