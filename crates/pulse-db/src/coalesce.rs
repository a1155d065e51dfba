//! Request coalescing (singleflight) for identical concurrent refreshes.
//!
//! When several threads ask for the same key while a computation is already
//! in flight, only the first ("leader") executes; the others ("joiners")
//! block until it finishes and share a clone of its outcome, success or
//! error. Once the leader completes, the key is free again, so a later call
//! always starts a fresh computation.
//!
//! Design:
//! - A single `Mutex<HashMap>` guards the in-flight map. The analytics cache
//!   coalesces a handful of fixed keys, so sharding buys nothing.
//! - Joiners wait without a timeout: a refresh that hangs is bounded by the
//!   backend's request timeout, not by the coalescer.
//! - A leader panic is reported to joiners as [`CoalesceError::LeaderPanicked`]
//!   and then resumed on the leader's own thread.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

fn panic_payload_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return format!("leader panicked: {msg}");
    }
    if let Some(msg) = payload.downcast_ref::<String>() {
        return format!("leader panicked: {msg}");
    }
    "leader panicked".to_string()
}

// ---------------------------------------------------------------------------
// Slot: shared state between leader and joiners
// ---------------------------------------------------------------------------

enum SlotState<V, E> {
    /// The leader is still executing.
    Pending,
    /// The leader finished; joiners clone this outcome.
    Done(Result<V, E>),
    /// The leader's closure panicked.
    Panicked(String),
}

struct Slot<V, E> {
    state: Mutex<SlotState<V, E>>,
    done: Condvar,
}

impl<V: Clone, E: Clone> Slot<V, E> {
    const fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: SlotState<V, E>) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *state = outcome;
        drop(state);
        self.done.notify_all();
    }

    #[allow(clippy::significant_drop_tightening)] // guard is consumed by wait_while
    fn wait(&self) -> Result<V, CoalesceError<E>> {
        let guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let guard = self
            .done
            .wait_while(guard, |s| matches!(s, SlotState::Pending))
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match &*guard {
            SlotState::Done(Ok(v)) => Ok(v.clone()),
            SlotState::Done(Err(e)) => Err(CoalesceError::Failed(e.clone())),
            SlotState::Panicked(msg) => Err(CoalesceError::LeaderPanicked(msg.clone())),
            SlotState::Pending => Err(CoalesceError::LeaderPanicked(
                "coalesce slot woke while pending".to_string(),
            )),
        }
    }
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Failure of a coalesced operation, as seen by leader or joiner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoalesceError<E> {
    /// The closure returned an error (the leader's own, or a shared clone).
    Failed(E),
    /// The leader panicked before producing a result.
    LeaderPanicked(String),
}

impl<E: fmt::Display> fmt::Display for CoalesceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::LeaderPanicked(msg) => write!(f, "coalesce {msg}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for CoalesceError<E> {}

/// Outcome of a coalesced operation.
#[derive(Debug)]
pub enum CoalesceOutcome<V> {
    /// This thread executed the operation (was the leader).
    Executed(V),
    /// This thread joined an in-flight operation and received a shared result.
    Joined(V),
}

impl<V> CoalesceOutcome<V> {
    /// Unwrap the inner value regardless of whether we were leader or joiner.
    pub fn into_inner(self) -> V {
        match self {
            Self::Executed(v) | Self::Joined(v) => v,
        }
    }

    /// Returns `true` if this result was obtained by joining another thread's
    /// in-flight operation.
    #[must_use]
    pub const fn was_joined(&self) -> bool {
        matches!(self, Self::Joined(_))
    }
}

/// Snapshot of coalescing metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoalesceMetrics {
    /// Number of times a thread became the leader (executed the closure).
    pub leader_count: u64,
    /// Number of times a thread joined an in-flight operation.
    pub joined_count: u64,
    /// Number of joins that received a leader failure or panic.
    pub leader_failed_count: u64,
}

// ---------------------------------------------------------------------------
// CoalesceMap
// ---------------------------------------------------------------------------

/// A concurrent map that deduplicates in-flight operations by key.
///
/// - `K`: the coalescing key. Must be `Hash + Eq + Clone`.
/// - `V`: the result value, cloned to joiners.
/// - `E`: the error value, also cloned to joiners.
pub struct CoalesceMap<K, V, E> {
    inflight: Mutex<HashMap<K, Arc<Slot<V, E>>>>,
    leader_count: AtomicU64,
    joined_count: AtomicU64,
    leader_failed_count: AtomicU64,
}

impl<K: Hash + Eq + Clone, V: Clone, E: Clone> Default for CoalesceMap<K, V, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone, V: Clone, E: Clone> CoalesceMap<K, V, E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            leader_count: AtomicU64::new(0),
            joined_count: AtomicU64::new(0),
            leader_failed_count: AtomicU64::new(0),
        }
    }

    /// Execute `f` or join an existing in-flight operation for the same key.
    ///
    /// Returns `Ok(CoalesceOutcome::Executed(v))` if this thread was the leader,
    /// or `Ok(CoalesceOutcome::Joined(v))` if it joined an existing operation.
    /// A leader error is returned to the leader and to every joiner.
    ///
    /// # Panics
    ///
    /// Re-raises a panic from `f` on the leader's thread after the joiners
    /// have been released.
    #[allow(clippy::needless_pass_by_value)] // key is cloned into the map; owned is correct
    pub fn execute_or_join<F>(&self, key: K, f: F) -> Result<CoalesceOutcome<V>, CoalesceError<E>>
    where
        F: FnOnce() -> Result<V, E>,
    {
        enum Role<V, E> {
            Leader(Arc<Slot<V, E>>),
            Joiner(Arc<Slot<V, E>>),
        }

        let role = {
            let mut map = self.lock();
            #[allow(clippy::option_if_let_else)] // else branch mutates map
            if let Some(slot) = map.get(&key).map(Arc::clone) {
                Role::Joiner(slot)
            } else {
                let slot = Arc::new(Slot::new());
                map.insert(key.clone(), Arc::clone(&slot));
                Role::Leader(slot)
            }
        };

        match role {
            Role::Joiner(slot) => {
                self.joined_count.fetch_add(1, Ordering::Relaxed);
                let shared = slot.wait();
                if shared.is_err() {
                    self.leader_failed_count.fetch_add(1, Ordering::Relaxed);
                }
                shared.map(CoalesceOutcome::Joined)
            }
            Role::Leader(slot) => {
                self.leader_count.fetch_add(1, Ordering::Relaxed);
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
                match result {
                    Ok(result) => {
                        slot.complete(SlotState::Done(result.clone()));
                        self.release(&key, &slot);
                        result
                            .map(CoalesceOutcome::Executed)
                            .map_err(CoalesceError::Failed)
                    }
                    Err(payload) => {
                        slot.complete(SlotState::Panicked(panic_payload_message(
                            payload.as_ref(),
                        )));
                        self.release(&key, &slot);
                        std::panic::resume_unwind(payload);
                    }
                }
            }
        }
    }

    /// Number of currently in-flight operations.
    #[must_use]
    pub fn inflight_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns a snapshot of coalescing metrics.
    #[must_use]
    pub fn metrics(&self) -> CoalesceMetrics {
        CoalesceMetrics {
            leader_count: self.leader_count.load(Ordering::Relaxed),
            joined_count: self.joined_count.load(Ordering::Relaxed),
            leader_failed_count: self.leader_failed_count.load(Ordering::Relaxed),
        }
    }

    /// Reset all metrics counters to zero.
    pub fn reset_metrics(&self) {
        self.leader_count.store(0, Ordering::Relaxed);
        self.joined_count.store(0, Ordering::Relaxed);
        self.leader_failed_count.store(0, Ordering::Relaxed);
    }

    /// Remove the leader's slot, unless it was already replaced.
    fn release(&self, key: &K, slot: &Arc<Slot<V, E>>) {
        let mut map = self.lock();
        if let Some(existing) = map.get(key)
            && Arc::ptr_eq(existing, slot)
        {
            map.remove(key);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Arc<Slot<V, E>>>> {
        self.inflight
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<K, V, E> fmt::Debug for CoalesceMap<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalesceMap")
            .field("leader_count", &self.leader_count.load(Ordering::Relaxed))
            .field("joined_count", &self.joined_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
