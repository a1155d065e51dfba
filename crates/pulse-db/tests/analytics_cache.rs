//! Cache behavior against the in-memory backend with a manual clock.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::json;

use pulse_core::{CENTRAL_EUROPEAN, Clock, ManualClock, PointCounters};
use pulse_db::{
    AnalyticsCache, Backend, CREATED_AT, CacheSettings, CounterFailurePolicy, DOWNLOADS, DbError,
    MemoryBackend, Row,
};

fn at(rfc3339: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(rfc3339).unwrap()
}

fn download(created_at: &str) -> Row {
    json!({ CREATED_AT: created_at, "release_id": 1 })
        .as_object()
        .cloned()
        .unwrap()
}

struct Fixture {
    backend: Arc<MemoryBackend>,
    clock: Arc<ManualClock>,
    cache: AnalyticsCache,
}

/// 2026-03-11 is a Wednesday.
fn fixture(settings: CacheSettings) -> Fixture {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(
        DOWNLOADS,
        [
            download("2026-03-11T10:00:00Z"), // today
            download("2026-03-09T10:00:00Z"), // Monday, this week
            download("2026-03-02T10:00:00Z"), // this month, last week
            download("2026-02-20T10:00:00Z"), // last month
        ],
    );
    let clock = Arc::new(ManualClock::new(at("2026-03-11T15:00:00Z")));
    let cache = AnalyticsCache::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::clone(&clock) as Arc<dyn Clock>,
        settings,
    );
    Fixture {
        backend,
        clock,
        cache,
    }
}

const EXPECTED: PointCounters = PointCounters {
    total: 4,
    today: 1,
    week: 2,
    month: 3,
};

#[test]
fn counters_cover_nested_windows() {
    let f = fixture(CacheSettings::default());
    assert_eq!(f.cache.counters(false).unwrap(), EXPECTED);
    assert_eq!(f.backend.op_counts().count, 4, "four concurrent counts");
}

#[test]
fn windows_and_buckets_follow_the_clock_zone_across_dst() {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed(
        DOWNLOADS,
        [
            download("2026-02-28T22:30:00Z"), // 23:30 on Feb 28 in winter time
            download("2026-02-28T23:30:00Z"), // 00:30 on Mar 1
            download("2026-03-20T22:30:00Z"), // 23:30 on Mar 20, still winter time
            download("2026-03-30T21:30:00Z"), // 23:30 on Monday Mar 30 in summer time
        ],
    );
    // Two days after the spring-forward change.
    let clock = ManualClock::with_zone(at("2026-03-31T12:00:00+02:00"), CENTRAL_EUROPEAN);
    let cache = AnalyticsCache::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::new(clock),
        CacheSettings::default(),
    );

    let counters = cache.counters(false).unwrap();
    assert_eq!(
        counters,
        PointCounters {
            total: 4,
            today: 0,
            week: 1,
            month: 3,
        }
    );

    let history = cache.history(false);
    let count_on = |m, d| {
        history
            .iter()
            .find(|c| c.date == NaiveDate::from_ymd_opt(2026, m, d).unwrap())
            .map_or(0, |c| c.count)
    };
    assert_eq!(history.last().unwrap().date, NaiveDate::from_ymd_opt(2026, 3, 31).unwrap());
    assert_eq!(count_on(3, 20), 1);
    assert_eq!(count_on(3, 21), 0);
    assert_eq!(count_on(3, 30), 1);
    assert_eq!(count_on(3, 31), 0);
}

#[test]
fn fresh_entry_is_served_without_backend_calls() {
    let f = fixture(CacheSettings::default());
    f.cache.counters(false).unwrap();
    f.clock.advance(Duration::from_secs(29));
    assert_eq!(f.cache.counters(false).unwrap(), EXPECTED);
    assert_eq!(f.backend.op_counts().count, 4);

    let m = f.cache.metrics().counters;
    assert_eq!((m.hits, m.misses, m.refreshes), (1, 1, 1));
}

#[test]
fn entry_expires_at_ttl() {
    let f = fixture(CacheSettings::default());
    f.cache.counters(false).unwrap();
    f.clock.advance(Duration::from_secs(30));
    f.cache.counters(false).unwrap();
    assert_eq!(f.backend.op_counts().count, 8);
}

#[test]
fn forced_refresh_always_aggregates() {
    let f = fixture(CacheSettings::default());
    f.cache.counters(false).unwrap();
    f.cache.counters(true).unwrap();
    f.cache.counters(true).unwrap();
    assert_eq!(f.backend.op_counts().count, 12);
    assert_eq!(f.cache.metrics().counters.refreshes, 3);
}

#[test]
fn forced_refresh_sees_new_rows() {
    let f = fixture(CacheSettings::default());
    f.cache.counters(false).unwrap();
    f.backend.seed(DOWNLOADS, [download("2026-03-11T14:00:00Z")]);
    assert_eq!(f.cache.counters(false).unwrap().total, 4, "still cached");
    let refreshed = f.cache.counters(true).unwrap();
    assert_eq!(refreshed.total, 5);
    assert_eq!(refreshed.today, 2);
}

#[test]
fn propagate_policy_returns_error_and_keeps_old_entry() {
    let f = fixture(CacheSettings::default());
    f.cache.counters(false).unwrap();
    let populated = f.cache.populated_at(pulse_db::CacheKey::Counters);

    f.backend.fail_reads(true);
    assert!(matches!(f.cache.counters(true), Err(DbError::Injected(_))));
    assert_eq!(f.cache.populated_at(pulse_db::CacheKey::Counters), populated);

    // The old entry is still fresh and still served.
    assert_eq!(f.cache.counters(false).unwrap(), EXPECTED);
    assert_eq!(f.cache.metrics().counters.failures, 1);
}

#[test]
fn serve_stale_policy_returns_last_good_value() {
    let f = fixture(
        CacheSettings::default().with_counter_policy(CounterFailurePolicy::ServeStale),
    );
    f.backend.fail_reads(true);
    assert!(f.cache.counters(false).is_err(), "nothing stale to serve yet");

    f.backend.fail_reads(false);
    f.cache.counters(false).unwrap();
    f.backend.fail_reads(true);
    f.clock.advance(Duration::from_secs(3_600));
    assert_eq!(f.cache.counters(false).unwrap(), EXPECTED);
    assert_eq!(f.cache.counters(true).unwrap(), EXPECTED);
}

#[test]
fn history_is_thirty_zero_filled_days() {
    let f = fixture(CacheSettings::default());
    f.backend.seed(
        DOWNLOADS,
        [
            download("2026-03-11T12:00:00Z"),
            download("2026-02-10T09:00:00Z"), // oldest bucket
            download("2026-02-09T16:00:00Z"), // inside the 30x24h range, before the oldest bucket
            download("2026-02-01T00:00:00Z"), // outside the range
        ],
    );
    let history = f.cache.history(false);
    assert_eq!(history.len(), 30);
    assert_eq!(history[0].date, NaiveDate::from_ymd_opt(2026, 2, 10).unwrap());
    assert_eq!(history[29].date, NaiveDate::from_ymd_opt(2026, 3, 11).unwrap());
    assert_eq!(history[0].count, 1);
    assert_eq!(history[29].count, 2);
    assert!(history.windows(2).all(|w| w[0].date < w[1].date));
    assert_eq!(history.iter().map(|d| d.count).sum::<u64>(), 6);
}

#[test]
fn history_is_cached_for_its_own_ttl() {
    let f = fixture(CacheSettings::default());
    f.cache.history(false);
    f.clock.advance(Duration::from_secs(299));
    f.cache.history(false);
    assert_eq!(f.backend.op_counts().select, 1);
    f.clock.advance(Duration::from_secs(1));
    f.cache.history(false);
    assert_eq!(f.backend.op_counts().select, 2);
}

#[test]
fn history_row_cap_is_applied() {
    let f = fixture(CacheSettings {
        history_row_cap: 2,
        ..CacheSettings::default()
    });
    let history = f.cache.history(false);
    assert_eq!(history.iter().map(|d| d.count).sum::<u64>(), 2);
    // Rows come back oldest first, so the cap drops the newest days.
    let count_on = |m, d| {
        history
            .iter()
            .find(|c| c.date == NaiveDate::from_ymd_opt(2026, m, d).unwrap())
            .map_or(0, |c| c.count)
    };
    assert_eq!(count_on(2, 20), 1);
    assert_eq!(count_on(3, 2), 1);
    assert_eq!(count_on(3, 9), 0);
    assert_eq!(count_on(3, 11), 0);
}

#[test]
fn history_failure_returns_empty_and_is_not_cached() {
    let f = fixture(CacheSettings::default());
    f.backend.fail_reads(true);
    assert!(f.cache.history(false).is_empty());
    assert!(f.cache.populated_at(pulse_db::CacheKey::History).is_none());

    f.backend.fail_reads(false);
    assert_eq!(f.cache.history(false).len(), 30);
    assert_eq!(f.backend.op_counts().select, 2);
}

#[test]
fn invalidate_all_forces_next_read_to_aggregate() {
    let f = fixture(CacheSettings::default());
    f.cache.counters(false).unwrap();
    f.cache.history(false);
    f.cache.invalidate_all();
    f.cache.counters(false).unwrap();
    f.cache.history(false);
    let ops = f.backend.op_counts();
    assert_eq!((ops.count, ops.select), (8, 2));
}

#[test]
fn concurrent_forced_gets_share_one_aggregation() {
    let f = fixture(CacheSettings::default());
    f.backend.set_latency(Some(Duration::from_millis(200)));
    let cache = Arc::new(f.cache);
    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.counters(true)
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap().unwrap(), EXPECTED);
    }
    assert_eq!(f.backend.op_counts().count, 4);
    let m = cache.metrics().counters;
    assert_eq!(m.refreshes, 1);
    assert_eq!(m.coalesced, 7);
}

#[test]
fn different_keys_refresh_independently() {
    let f = fixture(CacheSettings::default());
    f.backend.set_latency(Some(Duration::from_millis(100)));
    let cache = &f.cache;
    thread::scope(|s| {
        let counters = s.spawn(|| cache.counters(true));
        let history = s.spawn(|| cache.history(true));
        assert!(counters.join().unwrap().is_ok());
        assert_eq!(history.join().unwrap().len(), 30);
    });
    let m = f.cache.metrics();
    assert_eq!((m.counters.refreshes, m.history.refreshes), (1, 1));
    assert_eq!((m.counters.coalesced, m.history.coalesced), (0, 0));
}
