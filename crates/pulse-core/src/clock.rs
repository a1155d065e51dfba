//! Injectable wall clock.
//!
//! The analytics cache needs two things from "now": the freshness check
//! (`now - populated_at < ttl`) and the local calendar anchor for the counter
//! windows. Both read the same `Clock` so tests can move time explicitly.
//! The clock also names the zone that defines local calendar days.

use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, TimeDelta};

use crate::zone::CalendarZone;

/// Source of the current local time.
pub trait Clock: Send + Sync {
    /// Current time with the local UTC offset attached.
    fn now(&self) -> DateTime<FixedOffset>;

    /// Zone used for midnights and day buckets.
    fn zone(&self) -> &dyn CalendarZone;
}

/// The process wall clock in the local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }

    fn zone(&self) -> &dyn CalendarZone {
        &Local
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<FixedOffset>>,
    zone: Box<dyn CalendarZone>,
}

impl ManualClock {
    /// Starts at `start`, with calendar days in `start`'s fixed offset.
    #[must_use]
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self::with_zone(start, *start.offset())
    }

    /// Starts at `start`, with calendar days resolved in `zone`.
    #[must_use]
    pub fn with_zone<Z>(start: DateTime<FixedOffset>, zone: Z) -> Self
    where
        Z: CalendarZone + 'static,
    {
        Self {
            now: Mutex::new(start),
            zone: Box::new(zone),
        }
    }

    /// Replace the current time.
    pub fn set(&self, now: DateTime<FixedOffset>) {
        *self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = now;
    }

    /// Move the clock forward. Saturates instead of overflowing.
    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(next) = now.checked_add_signed(delta) {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn zone(&self) -> &dyn CalendarZone {
        &*self.zone
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &self.now())
            .finish_non_exhaustive()
    }
}
