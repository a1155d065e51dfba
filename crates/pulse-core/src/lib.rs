//! Core types and configuration for Download Pulse
//!
//! This crate provides:
//! - Configuration management (`Config`, environment and `.env` parsing)
//! - An injectable wall clock (`Clock`, `SystemClock`, `ManualClock`)
//! - Calendar window helpers for the download counters and history buckets
//! - Calendar zones that resolve local midnights across daylight-saving changes
//! - Analytics models shared by the cache and the CLI
//! - Common error types

#![forbid(unsafe_code)]

pub mod calendar;
pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod zone;

pub use calendar::{
    CounterWindows, HISTORY_DAYS, counter_windows, history_since, parse_timestamp, trailing_days,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConnectionSettings};
pub use error::{ConfigError, ConfigResult};
pub use models::{DailyCount, PointCounters};
pub use zone::{CENTRAL_EUROPEAN, CalendarZone, DaylightOffset, DaylightZone};
