//! Change feed -> debouncer -> forced cache refresh, on virtual time.

use std::sync::Arc;
use std::time::Duration;

use pulse_core::{Clock, SystemClock};
use pulse_db::{
    AnalyticsCache, Backend, CacheSettings, ChangeFeed, ChangeKind, DOWNLOADS, Debouncer,
    InvalidationSubscription, ManualScheduler, MemoryBackend, RELEASES, Row, Scheduler,
};

struct Wiring {
    backend: Arc<MemoryBackend>,
    scheduler: Arc<ManualScheduler>,
    cache: Arc<AnalyticsCache>,
    subscription: InvalidationSubscription,
}

fn wire() -> Wiring {
    let backend = Arc::new(MemoryBackend::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let cache = Arc::new(AnalyticsCache::new(
        Arc::clone(&backend) as Arc<dyn Backend>,
        Arc::new(SystemClock) as Arc<dyn Clock>,
        CacheSettings::default(),
    ));
    let debouncer = Arc::new(Debouncer::new(
        Duration::from_millis(500),
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        &cache,
    ));
    let subscription = InvalidationSubscription::start(
        Arc::clone(&backend) as Arc<dyn ChangeFeed>,
        DOWNLOADS,
        ChangeKind::Insert,
        debouncer,
    )
    .unwrap();
    Wiring {
        backend,
        scheduler,
        cache,
        subscription,
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

#[test]
fn insert_burst_triggers_one_refresh_after_quiescence() {
    let w = wire();
    w.backend.insert(DOWNLOADS, Row::new()).unwrap(); // t=0
    w.scheduler.advance(ms(100));
    w.backend.insert(DOWNLOADS, Row::new()).unwrap(); // t=100
    w.scheduler.advance(ms(100));
    w.backend.insert(DOWNLOADS, Row::new()).unwrap(); // t=200

    w.scheduler.advance(ms(499));
    assert_eq!(w.cache.metrics().counters.refreshes, 0);

    w.scheduler.advance(ms(1)); // t=700
    let m = w.cache.metrics();
    assert_eq!(m.counters.refreshes, 1);
    assert_eq!(m.history.refreshes, 1);
    assert_eq!(w.cache.counters(false).unwrap().total, 3);

    let d = w.subscription.debouncer().metrics();
    assert_eq!((d.notifications, d.refreshes), (3, 1));
}

#[test]
fn other_tables_do_not_notify() {
    let w = wire();
    w.backend.insert(RELEASES, Row::new()).unwrap();
    assert!(!w.subscription.debouncer().is_pending());
    w.scheduler.advance(ms(1_000));
    assert_eq!(w.cache.metrics().counters.refreshes, 0);
}

#[test]
fn teardown_cancels_pending_refresh() {
    let w = wire();
    w.backend.insert(DOWNLOADS, Row::new()).unwrap();
    assert!(w.subscription.debouncer().is_pending());

    drop(w.subscription);
    assert_eq!(w.backend.subscriber_count(), 0);
    assert_eq!(w.scheduler.pending(), 0);

    w.scheduler.advance(ms(1_000));
    w.backend.insert(DOWNLOADS, Row::new()).unwrap();
    w.scheduler.advance(ms(1_000));
    assert_eq!(w.cache.metrics().counters.refreshes, 0);
}

#[test]
fn dropped_cache_is_not_refreshed() {
    let w = wire();
    w.backend.insert(DOWNLOADS, Row::new()).unwrap();
    drop(w.cache);
    w.scheduler.advance(ms(500));
    assert_eq!(w.subscription.debouncer().metrics().refreshes, 0);
}

#[test]
fn explicit_close_unsubscribes() {
    let w = wire();
    w.subscription.close();
    assert_eq!(w.backend.subscriber_count(), 0);
}
