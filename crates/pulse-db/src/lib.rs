//! Data access layer for Download Pulse
//!
//! This crate provides:
//! - The backend operation contract (`Backend`) with a PostgREST
//!   implementation over HTTP and an in-memory implementation
//! - The change notification feed contract (`ChangeFeed`)
//! - The analytics cache (TTL, forced refresh, single-flight)
//! - Trailing-edge debounced cache invalidation
//! - Download tracking helpers
//!
//! # Timestamp Convention
//!
//! Timestamps travel as RFC 3339 strings, exactly as the platform stores them
//! in `timestamptz` columns. Filters compare them chronologically, so offsets
//! in the stored values and the filter bounds need not match.

#![forbid(unsafe_code)]

pub mod backend;
pub mod cache;
pub mod coalesce;
pub mod debounce;
pub mod error;
pub mod feed;
pub mod memory;
pub mod rest;
pub mod tracking;

pub use backend::{
    Backend, CREATED_AT, DOWNLOADS, Filter, FilterOp, OrderBy, RELEASE_ID, RELEASES, Row,
    SelectQuery, count_concurrently,
};
pub use cache::{
    AggregateMetrics, AnalyticsCache, CacheKey, CacheMetricsSnapshot, CacheSettings,
    CounterFailurePolicy,
};
pub use coalesce::{CoalesceError, CoalesceMap, CoalesceMetrics, CoalesceOutcome};
pub use debounce::{
    DebounceMetrics, Debouncer, ManualScheduler, RefreshTarget, Scheduler, ThreadScheduler,
    TimerHandle,
};
pub use error::{DbError, DbResult};
pub use feed::{
    ChangeCallback, ChangeEvent, ChangeFeed, ChangeKind, InvalidationSubscription, SubscriptionId,
};
pub use memory::{MemoryBackend, OpCounts};
pub use rest::RestBackend;
pub use tracking::{
    TrackOutcome, download_row, latest_release, latest_release_id, reset_downloads,
    spawn_track_download, track_download_best_effort,
};
