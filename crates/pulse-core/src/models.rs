//! Analytics models shared by the cache and the CLI.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Point-in-time download counters over four nested windows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PointCounters {
    pub total: u64,
    pub today: u64,
    pub week: u64,
    pub month: u64,
}

/// Downloads recorded on one local calendar day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DailyCount {
    pub date: NaiveDate,
    pub count: u64,
}
