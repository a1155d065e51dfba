//! Trailing-edge debounce of change notifications into forced cache refreshes.
//!
//! A burst of `k` notifications closer together than the quiescence window
//! produces exactly one refresh, no earlier than one window after the last
//! notification of the burst.
//!
//! State machine:
//!
//! ```text
//!            on_notification                  timer fires (generation matches)
//!   Idle ───────────────────▶ Pending(gen) ─────────────────────────────▶ Idle + refresh
//!                              │    ▲
//!                              │    │ on_notification: cancel timer, gen += 1, re-arm
//!                              └────┘
//!   Pending ── cancel() ──▶ Idle (gen += 1, timer cancelled)
//! ```
//!
//! Timers come from an injected [`Scheduler`]: [`ThreadScheduler`] in
//! production, [`ManualScheduler`] (virtual time) in tests. A timer callback
//! that races with a cancel is discarded by the generation check, and the
//! refresh target is held weakly so a torn-down consumer is never called.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

/// Default quiescence window.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(500);

/// Work scheduled on a timer.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that can be force-refreshed.
pub trait RefreshTarget: Send + Sync {
    fn force_refresh(&self);
}

/// Runs a task once after a delay unless the returned handle is cancelled.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle;
}

// ---------------------------------------------------------------------------
// TimerHandle
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TimerState {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

/// Cancellation handle for one scheduled task. Cloning shares the timer.
#[derive(Clone, Default)]
pub struct TimerHandle {
    state: Arc<TimerState>,
}

impl TimerHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        let mut cancelled = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *cancelled = true;
        drop(cancelled);
        self.state.wake.notify_all();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Block until cancelled or `timeout` elapses; `true` if cancelled.
    fn wait_cancelled(&self, timeout: Duration) -> bool {
        let guard = self
            .state
            .cancelled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (guard, _) = self
            .state
            .wake
            .wait_timeout_while(guard, timeout, |cancelled| !*cancelled)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Schedulers
// ---------------------------------------------------------------------------

/// One short-lived thread per timer; cancellation wakes it immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let timer = handle.clone();
        let spawned = thread::Builder::new()
            .name("pulse-debounce".into())
            .spawn(move || {
                if !timer.wait_cancelled(delay) {
                    task();
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn debounce timer thread");
        }
        handle
    }
}

struct ScheduledTask {
    due: Duration,
    seq: u64,
    handle: TimerHandle,
    task: Task,
}

#[derive(Default)]
struct ManualInner {
    now: Duration,
    next_seq: u64,
    queue: Vec<ScheduledTask>,
}

/// Virtual-time scheduler. Nothing runs until [`advance`](Self::advance).
#[derive(Default)]
pub struct ManualScheduler {
    inner: Mutex<ManualInner>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Virtual time elapsed since construction.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.lock().now
    }

    /// Timers scheduled and not yet cancelled or run.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.lock()
            .queue
            .iter()
            .filter(|t| !t.handle.is_cancelled())
            .count()
    }

    /// Move virtual time forward by `by`, running every live task that comes
    /// due, in due order, on the calling thread. Tasks scheduled by a running
    /// task are eligible in the same call if they fall due before the target.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now.saturating_add(by);
        loop {
            let next = {
                let mut inner = self.lock();
                inner.queue.retain(|t| !t.handle.is_cancelled());
                let idx = inner
                    .queue
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due <= target)
                    .min_by_key(|(_, t)| (t.due, t.seq))
                    .map(|(i, _)| i);
                idx.map(|i| {
                    let task = inner.queue.swap_remove(i);
                    inner.now = task.due;
                    task
                })
            };
            let Some(task) = next else {
                break;
            };
            if !task.handle.is_cancelled() {
                (task.task)();
            }
        }
        self.lock().now = target;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) -> TimerHandle {
        let handle = TimerHandle::new();
        let mut inner = self.lock();
        let due = inner.now.saturating_add(delay);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.push(ScheduledTask {
            due,
            seq,
            handle: handle.clone(),
            task,
        });
        handle
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Debouncer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DebounceState {
    pending: Option<TimerHandle>,
    generation: u64,
}

struct Shared {
    state: Mutex<DebounceState>,
    target: Weak<dyn RefreshTarget>,
    notifications: AtomicU64,
    refreshes: AtomicU64,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, DebounceState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn fire(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation || state.pending.is_none() {
                return;
            }
            state.pending = None;
        }
        let Some(target) = self.target.upgrade() else {
            tracing::debug!("debounce target dropped; skipping refresh");
            return;
        };
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(generation, "debounce window elapsed; forcing refresh");
        target.force_refresh();
    }
}

/// Snapshot of debouncer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebounceMetrics {
    pub notifications: u64,
    pub refreshes: u64,
}

/// Coalesces notifications into at most one refresh per quiescence window.
pub struct Debouncer {
    window: Duration,
    scheduler: Arc<dyn Scheduler>,
    shared: Arc<Shared>,
}

impl Debouncer {
    /// Debounce refreshes of `target` over `window`.
    ///
    /// Only a weak reference to the target is kept.
    pub fn new<T>(window: Duration, scheduler: Arc<dyn Scheduler>, target: &Arc<T>) -> Self
    where
        T: RefreshTarget + 'static,
    {
        let target: Arc<dyn RefreshTarget> = Arc::clone(target) as Arc<dyn RefreshTarget>;
        Self {
            window,
            scheduler,
            shared: Arc::new(Shared {
                state: Mutex::new(DebounceState::default()),
                target: Arc::downgrade(&target),
                notifications: AtomicU64::new(0),
                refreshes: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    /// Record one change notification: cancel the pending timer, arm a new one.
    pub fn on_notification(&self) {
        self.shared.notifications.fetch_add(1, Ordering::Relaxed);
        let mut state = self.shared.lock();
        if let Some(previous) = state.pending.take() {
            previous.cancel();
        }
        state.generation += 1;
        let generation = state.generation;
        let shared = Arc::clone(&self.shared);
        let handle = self
            .scheduler
            .schedule(self.window, Box::new(move || shared.fire(generation)));
        state.pending = Some(handle);
    }

    /// Stop any pending timer. No-op when nothing is pending.
    pub fn cancel(&self) {
        let mut state = self.shared.lock();
        if let Some(pending) = state.pending.take() {
            pending.cancel();
            state.generation += 1;
            tracing::debug!("pending debounce timer cancelled");
        }
    }

    /// Whether a refresh is currently armed.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    #[must_use]
    pub fn metrics(&self) -> DebounceMetrics {
        DebounceMetrics {
            notifications: self.shared.notifications.load(Ordering::Relaxed),
            refreshes: self.shared.refreshes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("window", &self.window)
            .field("pending", &self.is_pending())
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Default)]
    struct CountingTarget {
        refreshes: AtomicU64,
    }

    impl RefreshTarget for CountingTarget {
        fn force_refresh(&self) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl CountingTarget {
        fn count(&self) -> u64 {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn manual_setup() -> (Arc<ManualScheduler>, Arc<CountingTarget>, Debouncer) {
        let scheduler = Arc::new(ManualScheduler::new());
        let target = Arc::new(CountingTarget::default());
        let debouncer = Debouncer::new(
            DEFAULT_WINDOW,
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
            &target,
        );
        (scheduler, target, debouncer)
    }

    #[test]
    fn burst_produces_one_trailing_refresh() {
        let (scheduler, target, debouncer) = manual_setup();

        debouncer.on_notification(); // t=0
        scheduler.advance(ms(100));
        debouncer.on_notification(); // t=100
        scheduler.advance(ms(100));
        debouncer.on_notification(); // t=200

        scheduler.advance(ms(499)); // t=699
        assert_eq!(target.count(), 0, "nothing may fire before t=700");
        assert!(debouncer.is_pending());

        scheduler.advance(ms(1)); // t=700
        assert_eq!(target.count(), 1);
        assert!(!debouncer.is_pending());

        scheduler.advance(ms(5_000));
        assert_eq!(target.count(), 1, "cancelled timers never fire");
        assert_eq!(
            debouncer.metrics(),
            DebounceMetrics {
                notifications: 3,
                refreshes: 1
            }
        );
    }

    #[test]
    fn separate_bursts_refresh_separately() {
        let (scheduler, target, debouncer) = manual_setup();
        debouncer.on_notification();
        scheduler.advance(ms(600));
        debouncer.on_notification();
        scheduler.advance(ms(600));
        assert_eq!(target.count(), 2);
    }

    #[test]
    fn cancel_without_pending_timer_is_noop() {
        let (scheduler, target, debouncer) = manual_setup();
        debouncer.cancel();
        debouncer.cancel();
        assert!(!debouncer.is_pending());
        scheduler.advance(ms(1_000));
        assert_eq!(target.count(), 0);
    }

    #[test]
    fn cancel_prevents_pending_refresh() {
        let (scheduler, target, debouncer) = manual_setup();
        debouncer.on_notification();
        scheduler.advance(ms(300));
        debouncer.cancel();
        assert_eq!(scheduler.pending(), 0);
        scheduler.advance(ms(1_000));
        assert_eq!(target.count(), 0);

        // The debouncer is reusable after a cancel.
        debouncer.on_notification();
        scheduler.advance(ms(500));
        assert_eq!(target.count(), 1);
    }

    #[test]
    fn stale_timer_callback_is_ignored() {
        // A timer whose handle was cancelled after it was already dequeued
        // must still be rejected by the generation check.
        let (_, target, debouncer) = manual_setup();
        debouncer.on_notification();
        let stale_generation = debouncer.shared.lock().generation;
        debouncer.on_notification();
        debouncer.shared.fire(stale_generation);
        assert_eq!(target.count(), 0);
        assert!(debouncer.is_pending());
    }

    #[test]
    fn dropped_target_is_skipped() {
        let (scheduler, target, debouncer) = manual_setup();
        debouncer.on_notification();
        drop(target);
        scheduler.advance(ms(500));
        assert_eq!(debouncer.metrics().refreshes, 0);
        assert!(!debouncer.is_pending());
    }

    #[test]
    fn dropping_debouncer_cancels_timer() {
        let (scheduler, target, debouncer) = manual_setup();
        debouncer.on_notification();
        drop(debouncer);
        scheduler.advance(ms(1_000));
        assert_eq!(target.count(), 0);
    }

    #[test]
    fn manual_scheduler_runs_in_due_order() {
        let scheduler = ManualScheduler::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(30, "c"), (10, "a"), (20, "b"), (10, "a2")] {
            let log = Arc::clone(&log);
            let _ = scheduler.schedule(
                ms(delay),
                Box::new(move || log.lock().unwrap().push(tag)),
            );
        }
        scheduler.advance(ms(25));
        assert_eq!(*log.lock().unwrap(), ["a", "a2", "b"]);
        assert_eq!(scheduler.now(), ms(25));
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn thread_scheduler_fires_after_window() {
        let target = Arc::new(CountingTarget::default());
        let debouncer = Debouncer::new(ms(50), Arc::new(ThreadScheduler), &target);
        let started = Instant::now();
        for _ in 0..5 {
            debouncer.on_notification();
            thread::sleep(ms(5));
        }
        let deadline = Instant::now() + Duration::from_secs(5);
        while target.count() == 0 && Instant::now() < deadline {
            thread::sleep(ms(5));
        }
        assert_eq!(target.count(), 1);
        assert!(started.elapsed() >= ms(50));
        thread::sleep(ms(120));
        assert_eq!(target.count(), 1);
    }

    #[test]
    fn thread_scheduler_cancel_wakes_timer_without_firing() {
        let fired = Arc::new(AtomicU64::new(0));
        let flag = Arc::clone(&fired);
        let handle = ThreadScheduler.schedule(
            ms(50),
            Box::new(move || {
                flag.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        assert!(handle.is_cancelled());
        thread::sleep(ms(150));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
