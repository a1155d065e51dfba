//! Change notification feed contract and the cache invalidation subscription.
//!
//! Delivery is treated as at-least-once and unordered: the subscription only
//! ever turns an event into "something changed", never into a delta.

use std::fmt;
use std::sync::Arc;

use crate::backend::Row;
use crate::debounce::Debouncer;
use crate::error::DbResult;

/// Kind of row change a subscriber is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Insert,
    Delete,
}

/// One delivered change.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub row: Row,
}

/// Callback invoked once per matching change.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Opaque handle returned by [`ChangeFeed::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Subscribe/unsubscribe pair keyed by table and change kind.
pub trait ChangeFeed: Send + Sync {
    fn subscribe(
        &self,
        table: &str,
        kind: ChangeKind,
        callback: ChangeCallback,
    ) -> DbResult<SubscriptionId>;

    /// Stop deliveries for `id`. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

/// Live wiring from a change feed to a [`Debouncer`].
///
/// Every delivered event calls [`Debouncer::on_notification`]. Dropping (or
/// [`close`](Self::close)-ing) the subscription unsubscribes from the feed and
/// cancels any pending refresh, so nothing fires after the consumer is gone.
pub struct InvalidationSubscription {
    feed: Arc<dyn ChangeFeed>,
    debouncer: Arc<Debouncer>,
    id: Option<SubscriptionId>,
}

impl InvalidationSubscription {
    /// Subscribe to `kind` events on `table`.
    pub fn start(
        feed: Arc<dyn ChangeFeed>,
        table: &str,
        kind: ChangeKind,
        debouncer: Arc<Debouncer>,
    ) -> DbResult<Self> {
        let sink = Arc::clone(&debouncer);
        let callback: ChangeCallback = Arc::new(move |event: &ChangeEvent| {
            tracing::trace!(table = %event.table, kind = ?event.kind, "change notification");
            sink.on_notification();
        });
        let id = feed.subscribe(table, kind, callback)?;
        tracing::debug!(table, ?kind, id = id.0, "invalidation subscription started");
        Ok(Self {
            feed,
            debouncer,
            id: Some(id),
        })
    }

    /// The debouncer notifications are routed to.
    #[must_use]
    pub fn debouncer(&self) -> &Arc<Debouncer> {
        &self.debouncer
    }

    /// Tear the subscription down explicitly.
    pub fn close(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(id) = self.id.take() {
            self.feed.unsubscribe(id);
            self.debouncer.cancel();
            tracing::debug!(id = id.0, "invalidation subscription closed");
        }
    }
}

impl fmt::Debug for InvalidationSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationSubscription")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for InvalidationSubscription {
    fn drop(&mut self) {
        self.teardown();
    }
}
