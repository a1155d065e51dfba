//! Client-side analytics cache for the download counters and 30-day history.
//!
//! ## Freshness
//!
//! Each aggregate carries its own TTL (30 s for counters, 5 min for history by
//! default). An entry is fresh while `now - populated_at < ttl`, where both
//! instants come from the injected [`Clock`]. A non-forced read of a fresh
//! entry never touches the backend; a forced read always re-aggregates.
//!
//! ## Refresh
//!
//! Refreshes of the same aggregate are single-flighted through a
//! [`CoalesceMap`]: one leader queries the backend and every concurrent caller
//! shares its outcome. A successful refresh replaces the whole entry (an `Arc`
//! swap under the write lock), so readers never observe a half-updated value.
//!
//! ## Failures
//!
//! - Counters follow [`CounterFailurePolicy`]. The cached entry is left
//!   untouched either way.
//! - History degrades to an empty series and is not cached.
//!
//! ## Metrics
//!
//! Lock-free atomic counters track hits, misses, refreshes and failures per
//! aggregate. Call [`AnalyticsCache::metrics`] for a snapshot.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, TimeDelta};
use serde::Serialize;

use pulse_core::{
    CalendarZone, Clock, Config, DailyCount, HISTORY_DAYS, PointCounters, counter_windows,
    history_since, parse_timestamp, trailing_days,
};

use crate::backend::{Backend, CREATED_AT, DOWNLOADS, Filter, SelectQuery, count_concurrently};
use crate::coalesce::{CoalesceError, CoalesceMap};
use crate::debounce::RefreshTarget;
use crate::error::{DbError, DbResult};

const STATS_TTL: Duration = Duration::from_secs(30);
const HISTORY_TTL: Duration = Duration::from_secs(300); // 5 min
/// Upper bound on rows fetched for one history aggregation.
const HISTORY_ROW_CAP: usize = 10_000;

/// What a failed counter refresh hands back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterFailurePolicy {
    /// Return the error. The previous entry stays cached.
    #[default]
    Propagate,
    /// Return the last good value when there is one, else the error.
    ServeStale,
}

/// Tunables of an [`AnalyticsCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub stats_ttl: Duration,
    pub history_ttl: Duration,
    pub history_row_cap: usize,
    pub counter_policy: CounterFailurePolicy,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            stats_ttl: STATS_TTL,
            history_ttl: HISTORY_TTL,
            history_row_cap: HISTORY_ROW_CAP,
            counter_policy: CounterFailurePolicy::default(),
        }
    }
}

impl CacheSettings {
    /// TTLs and row cap from the process configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            stats_ttl: config.stats_ttl,
            history_ttl: config.history_ttl,
            history_row_cap: config.history_row_cap,
            counter_policy: CounterFailurePolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_counter_policy(mut self, policy: CounterFailurePolicy) -> Self {
        self.counter_policy = policy;
        self
    }
}

/// The two cached aggregations, also used as single-flight keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Counters,
    History,
}

impl CacheKey {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counters => "counters",
            Self::History => "history",
        }
    }
}

struct CacheEntry<T> {
    value: T,
    populated_at: DateTime<FixedOffset>,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, now: DateTime<FixedOffset>, ttl: Duration) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.populated_at) < ttl
    }
}

/// Snapshot of one aggregate's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateMetrics {
    /// Non-forced reads served from a fresh entry.
    pub hits: u64,
    /// Non-forced reads that found no fresh entry.
    pub misses: u64,
    /// Backend aggregations that succeeded.
    pub refreshes: u64,
    /// Backend aggregations that failed.
    pub failures: u64,
    /// Callers that shared another caller's in-flight refresh.
    pub coalesced: u64,
}

/// Snapshot of cache metrics at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetricsSnapshot {
    pub counters: AggregateMetrics,
    pub history: AggregateMetrics,
}

impl CacheMetricsSnapshot {
    /// Counter cache hit rate (0.0–1.0). Returns 0.0 if no lookups yet.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn counters_hit_rate(&self) -> f64 {
        let total = self.counters.hits + self.counters.misses;
        if total == 0 {
            0.0
        } else {
            self.counters.hits as f64 / total as f64
        }
    }
}

/// One TTL-guarded, single-flighted aggregate.
struct CachedAggregate<T> {
    key: CacheKey,
    ttl: Duration,
    entry: RwLock<Option<Arc<CacheEntry<T>>>>,
    flight: CoalesceMap<CacheKey, Arc<CacheEntry<T>>, DbError>,
    hits: AtomicU64,
    misses: AtomicU64,
    refreshes: AtomicU64,
    failures: AtomicU64,
}

impl<T> CachedAggregate<T> {
    fn new(key: CacheKey, ttl: Duration) -> Self {
        Self {
            key,
            ttl,
            entry: RwLock::new(None),
            flight: CoalesceMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Option<Arc<CacheEntry<T>>> {
        self.entry
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn store(&self, entry: Option<Arc<CacheEntry<T>>>) {
        *self
            .entry
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = entry;
    }

    /// Serve a fresh entry, or run `aggregate` (single-flighted) and cache it.
    fn get<F>(&self, force: bool, clock: &dyn Clock, aggregate: F) -> DbResult<Arc<CacheEntry<T>>>
    where
        F: FnOnce(DateTime<FixedOffset>) -> DbResult<T>,
    {
        if !force {
            if let Some(entry) = self.current()
                && entry.is_fresh(clock.now(), self.ttl)
            {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
        }

        let outcome = self.flight.execute_or_join(self.key, || {
            let anchor = clock.now();
            match aggregate(anchor) {
                Ok(value) => {
                    let entry = Arc::new(CacheEntry {
                        value,
                        populated_at: anchor,
                    });
                    self.store(Some(Arc::clone(&entry)));
                    self.refreshes.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(key = self.key.as_str(), %anchor, "cache entry refreshed");
                    Ok(entry)
                }
                Err(err) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    Err(err)
                }
            }
        });
        outcome.map(|o| o.into_inner()).map_err(|err| match err {
            CoalesceError::Failed(err) => err,
            CoalesceError::LeaderPanicked(msg) => DbError::Internal(msg),
        })
    }

    fn metrics(&self) -> AggregateMetrics {
        AggregateMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            coalesced: self.flight.metrics().joined_count,
        }
    }
}

/// TTL cache in front of the counter and history aggregations.
pub struct AnalyticsCache {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
    settings: CacheSettings,
    counters: CachedAggregate<PointCounters>,
    history: CachedAggregate<Vec<DailyCount>>,
}

impl AnalyticsCache {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>, settings: CacheSettings) -> Self {
        Self {
            backend,
            clock,
            counters: CachedAggregate::new(CacheKey::Counters, settings.stats_ttl),
            history: CachedAggregate::new(CacheKey::History, settings.history_ttl),
            settings,
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Point counters: all-time, today, this ISO week, this month.
    ///
    /// # Errors
    ///
    /// Returns the backend error of a failed refresh, unless the policy is
    /// [`CounterFailurePolicy::ServeStale`] and a previous value exists.
    pub fn counters(&self, force_refresh: bool) -> DbResult<PointCounters> {
        let backend = &*self.backend;
        let zone = self.clock.zone();
        match self.counters.get(force_refresh, &*self.clock, |anchor| {
            aggregate_counters(backend, anchor, zone)
        }) {
            Ok(entry) => Ok(entry.value),
            Err(err) => match (self.settings.counter_policy, self.counters.current()) {
                (CounterFailurePolicy::ServeStale, Some(stale)) => {
                    tracing::warn!(error = %err, populated_at = %stale.populated_at, "counter refresh failed; serving stale value");
                    Ok(stale.value)
                }
                _ => {
                    tracing::warn!(error = %err, "counter refresh failed");
                    Err(err)
                }
            },
        }
    }

    /// Daily download counts for the trailing 30 local days, oldest first.
    ///
    /// A failed refresh yields an empty vector.
    #[must_use]
    pub fn history(&self, force_refresh: bool) -> Vec<DailyCount> {
        let backend = &*self.backend;
        let zone = self.clock.zone();
        let row_cap = self.settings.history_row_cap;
        match self.history.get(force_refresh, &*self.clock, |anchor| {
            aggregate_history(backend, anchor, zone, row_cap)
        }) {
            Ok(entry) => entry.value.clone(),
            Err(err) => {
                tracing::warn!(error = %err, "history refresh failed; returning empty series");
                Vec::new()
            }
        }
    }

    /// Drop both cached entries; the next read of each aggregates again.
    pub fn invalidate_all(&self) {
        self.counters.store(None);
        self.history.store(None);
        tracing::debug!("analytics cache invalidated");
    }

    /// When the given aggregate was last populated, if it is cached.
    #[must_use]
    pub fn populated_at(&self, key: CacheKey) -> Option<DateTime<FixedOffset>> {
        match key {
            CacheKey::Counters => self.counters.current().map(|e| e.populated_at),
            CacheKey::History => self.history.current().map(|e| e.populated_at),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            counters: self.counters.metrics(),
            history: self.history.metrics(),
        }
    }
}

impl RefreshTarget for AnalyticsCache {
    /// Force both aggregates in parallel. Failures are logged by the getters.
    fn force_refresh(&self) {
        std::thread::scope(|s| {
            s.spawn(|| {
                let _ = self.counters(true);
            });
            let _ = self.history(true);
        });
    }
}

impl fmt::Debug for AnalyticsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalyticsCache")
            .field("settings", &self.settings)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

/// Run the four counter queries concurrently against one captured anchor.
///
/// # Errors
///
/// The first failing count, in all-time/today/week/month order.
pub fn aggregate_counters(
    backend: &dyn Backend,
    anchor: DateTime<FixedOffset>,
    zone: &dyn CalendarZone,
) -> DbResult<PointCounters> {
    let windows = counter_windows(anchor, zone);
    let since = |start: DateTime<FixedOffset>| vec![Filter::gt(CREATED_AT, start.to_rfc3339())];
    let filter_sets = [
        Vec::new(),
        since(windows.start_of_day),
        since(windows.start_of_week),
        since(windows.start_of_month),
    ];
    let counts = count_concurrently(backend, DOWNLOADS, &filter_sets)?;
    let [total, today, week, month] = counts[..] else {
        return Err(DbError::Internal(format!(
            "expected 4 counts, got {}",
            counts.len()
        )));
    };
    Ok(PointCounters {
        total,
        today,
        week,
        month,
    })
}

/// Fetch the trailing 30 days of `created_at` values and bucket them.
///
/// # Errors
///
/// Propagates the select failure.
pub fn aggregate_history(
    backend: &dyn Backend,
    anchor: DateTime<FixedOffset>,
    zone: &dyn CalendarZone,
    row_cap: usize,
) -> DbResult<Vec<DailyCount>> {
    let query = SelectQuery::new()
        .columns([CREATED_AT])
        .filter(Filter::gt(CREATED_AT, history_since(anchor).to_rfc3339()))
        .order_by(CREATED_AT, true)
        .limit(row_cap);
    let rows = backend.select(DOWNLOADS, &query)?;
    if rows.len() >= row_cap {
        tracing::warn!(row_cap, "history query hit its row cap; newest days may be undercounted");
    }
    let timestamps = rows
        .iter()
        .filter_map(|row| row.get(CREATED_AT).and_then(serde_json::Value::as_str));
    Ok(bucket_by_day(timestamps, anchor, zone))
}

/// Count timestamps per local calendar day of `zone` over the 30 days ending
/// on the anchor's local date. Days without events are zero; dates outside
/// the window and unparseable values are ignored.
pub fn bucket_by_day<'a, I>(
    timestamps: I,
    anchor: DateTime<FixedOffset>,
    zone: &dyn CalendarZone,
) -> Vec<DailyCount>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut grouped: HashMap<NaiveDate, u64> = HashMap::new();
    for raw in timestamps {
        match parse_timestamp(raw) {
            Some(ts) => *grouped.entry(zone.date_of(&ts)).or_default() += 1,
            None => tracing::debug!(value = raw, "skipping unparseable created_at"),
        }
    }
    trailing_days(zone.date_of(&anchor), HISTORY_DAYS)
        .into_iter()
        .map(|date| DailyCount {
            date,
            count: grouped.get(&date).copied().unwrap_or(0),
        })
        .collect()
}
