//! In-process backend with simulated latency and failure injection.
//!
//! Backs the test suites and `pulse --sandbox`. Semantics follow the hosted
//! platform closely enough for the cache and harness: inserts fill in `id`
//! and `created_at`, filters compare timestamps chronologically, and every
//! insert or delete is published on the change feed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::thread;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::backend::{Backend, CREATED_AT, Filter, Row, SelectQuery, compare_values};
use crate::error::{DbError, DbResult};
use crate::feed::{ChangeCallback, ChangeEvent, ChangeFeed, ChangeKind, SubscriptionId};

#[derive(Default)]
struct Table {
    next_id: u64,
    rows: Vec<Row>,
}

struct Subscriber {
    id: SubscriptionId,
    table: String,
    kind: ChangeKind,
    callback: ChangeCallback,
}

/// Per-operation call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub count: u64,
    pub select: u64,
    pub insert: u64,
    pub delete: u64,
}

/// A thread-safe in-memory store implementing [`Backend`] and [`ChangeFeed`].
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<String, Table>>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    latency: Mutex<Option<Duration>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    counts: AtomicU64,
    selects: AtomicU64,
    inserts: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every operation.
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *self
            .latency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = latency;
    }

    /// Make `count` and `select` fail with [`DbError::Injected`].
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make `insert` and `delete` fail with [`DbError::Injected`].
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Insert rows directly, bypassing latency, failure injection, counters
    /// and the change feed.
    pub fn seed<I>(&self, table: &str, rows: I)
    where
        I: IntoIterator<Item = Row>,
    {
        let mut tables = self.write_tables();
        let t = tables.entry(table.to_string()).or_default();
        for row in rows {
            Self::fill_defaults(t, row);
        }
    }

    /// Snapshot of every row currently in `table`.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.read_tables()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn op_counts(&self) -> OpCounts {
        OpCounts {
            count: self.counts.load(Ordering::SeqCst),
            select: self.selects.load(Ordering::SeqCst),
            insert: self.inserts.load(Ordering::SeqCst),
            delete: self.deletes.load(Ordering::SeqCst),
        }
    }

    pub fn reset_op_counts(&self) {
        for counter in [&self.counts, &self.selects, &self.inserts, &self.deletes] {
            counter.store(0, Ordering::SeqCst);
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock_subscribers().len()
    }

    fn simulate(&self, write: bool) -> DbResult<()> {
        let latency = *self
            .latency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(latency) = latency {
            thread::sleep(latency);
        }
        let (flag, what) = if write {
            (&self.fail_writes, "write")
        } else {
            (&self.fail_reads, "read")
        };
        if flag.load(Ordering::SeqCst) {
            return Err(DbError::Injected(format!("{what} failure")));
        }
        Ok(())
    }

    /// Assign `id` and `created_at` when absent. Explicit numeric ids advance
    /// the sequence so later generated ids never collide with them.
    fn fill_defaults(table: &mut Table, mut row: Row) -> Row {
        match row.get("id").filter(|id| !id.is_null()) {
            Some(explicit) => {
                if let Some(n) = explicit.as_u64() {
                    table.next_id = table.next_id.max(n);
                }
            }
            None => {
                table.next_id += 1;
                row.insert("id".to_string(), Value::from(table.next_id));
            }
        }
        row.entry(CREATED_AT).or_insert_with(|| {
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false))
        });
        table.rows.push(row.clone());
        row
    }

    /// Deliver `events` to matching subscribers. Runs without any lock held
    /// so callbacks may call back into the backend.
    fn publish(&self, events: Vec<ChangeEvent>) {
        if events.is_empty() {
            return;
        }
        let callbacks: Vec<(ChangeKind, String, ChangeCallback)> = self
            .lock_subscribers()
            .iter()
            .map(|s| (s.kind, s.table.clone(), ChangeCallback::clone(&s.callback)))
            .collect();
        for event in &events {
            for (kind, table, callback) in &callbacks {
                if *kind == event.kind && *table == event.table {
                    callback(event);
                }
            }
        }
    }

    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Table>> {
        self.tables
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Table>> {
        self.tables
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn matches_all(row: &Row, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(row))
}

fn validate_table(table: &str) -> DbResult<()> {
    if table.trim().is_empty() {
        return Err(DbError::invalid("table", "table name must not be empty"));
    }
    Ok(())
}

impl Backend for MemoryBackend {
    fn count(&self, table: &str, filters: &[Filter]) -> DbResult<u64> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        validate_table(table)?;
        self.simulate(false)?;
        let tables = self.read_tables();
        let n = tables.get(table).map_or(0, |t| {
            t.rows.iter().filter(|r| matches_all(r, filters)).count()
        });
        Ok(n as u64)
    }

    fn select(&self, table: &str, query: &SelectQuery) -> DbResult<Vec<Row>> {
        self.selects.fetch_add(1, Ordering::SeqCst);
        validate_table(table)?;
        self.simulate(false)?;
        let mut rows: Vec<Row> = self
            .read_tables()
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter(|r| matches_all(r, &query.filters))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if let Some(order) = &query.order {
            rows.sort_by(|a, b| {
                let ord = match (a.get(&order.column), b.get(&order.column)) {
                    (Some(x), Some(y)) => compare_values(x, y).unwrap_or(std::cmp::Ordering::Equal),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                };
                if order.ascending { ord } else { ord.reverse() }
            });
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        if let Some(columns) = &query.columns {
            for row in &mut rows {
                row.retain(|k, _| columns.iter().any(|c| c == k));
            }
        }
        Ok(rows)
    }

    fn insert(&self, table: &str, row: Row) -> DbResult<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        validate_table(table)?;
        self.simulate(true)?;
        let stored = {
            let mut tables = self.write_tables();
            let t = tables.entry(table.to_string()).or_default();
            Self::fill_defaults(t, row)
        };
        self.publish(vec![ChangeEvent {
            table: table.to_string(),
            kind: ChangeKind::Insert,
            row: stored,
        }]);
        Ok(())
    }

    fn delete(&self, table: &str, filters: &[Filter]) -> DbResult<u64> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        validate_table(table)?;
        self.simulate(true)?;
        let removed: Vec<Row> = {
            let mut tables = self.write_tables();
            let Some(t) = tables.get_mut(table) else {
                return Ok(0);
            };
            let (gone, kept): (Vec<Row>, Vec<Row>) = std::mem::take(&mut t.rows)
                .into_iter()
                .partition(|r| matches_all(r, filters));
            t.rows = kept;
            gone
        };
        let n = removed.len() as u64;
        self.publish(
            removed
                .into_iter()
                .map(|row| ChangeEvent {
                    table: table.to_string(),
                    kind: ChangeKind::Delete,
                    row,
                })
                .collect(),
        );
        Ok(n)
    }
}

impl ChangeFeed for MemoryBackend {
    fn subscribe(
        &self,
        table: &str,
        kind: ChangeKind,
        callback: ChangeCallback,
    ) -> DbResult<SubscriptionId> {
        validate_table(table)?;
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock_subscribers().push(Subscriber {
            id,
            table: table.to_string(),
            kind,
            callback,
        });
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.lock_subscribers().retain(|s| s.id != id);
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables: Vec<(String, usize)> = self
            .read_tables()
            .iter()
            .map(|(name, t)| (name.clone(), t.rows.len()))
            .collect();
        f.debug_struct("MemoryBackend")
            .field("tables", &tables)
            .field("ops", &self.op_counts())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DOWNLOADS, RELEASE_ID, RELEASES};
    use serde_json::json;
    use std::sync::Arc;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn insert_fills_id_and_created_at() {
        let backend = MemoryBackend::new();
        backend.insert(DOWNLOADS, row(json!({ RELEASE_ID: 3 }))).unwrap();
        backend.insert(DOWNLOADS, row(json!({ RELEASE_ID: null }))).unwrap();
        let rows = backend.rows(DOWNLOADS);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], 1);
        assert_eq!(rows[1]["id"], 2);
        assert!(pulse_core::parse_timestamp(rows[0][CREATED_AT].as_str().unwrap()).is_some());
    }

    #[test]
    fn generated_ids_skip_past_explicit_ones() {
        let backend = MemoryBackend::new();
        backend.seed(
            RELEASES,
            [
                row(json!({ "id": 1 })),
                row(json!({ "id": 5 })),
                row(json!({ "id": 3 })),
            ],
        );
        backend.insert(RELEASES, Row::new()).unwrap();
        backend.insert(RELEASES, Row::new()).unwrap();
        let ids: Vec<Value> = backend
            .rows(RELEASES)
            .into_iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, [json!(1), json!(5), json!(3), json!(6), json!(7)]);
    }

    #[test]
    fn select_orders_limits_and_projects() {
        let backend = MemoryBackend::new();
        backend.seed(
            RELEASES,
            [
                row(json!({ "id": 1, "version": "1.0", CREATED_AT: "2026-01-01T00:00:00Z" })),
                row(json!({ "id": 2, "version": "1.1", CREATED_AT: "2026-02-01T00:00:00Z" })),
                row(json!({ "id": 3, "version": "1.2", CREATED_AT: "2026-03-01T00:00:00Z" })),
            ],
        );
        let rows = backend
            .select(
                RELEASES,
                &SelectQuery::new()
                    .columns(["id"])
                    .order_by(CREATED_AT, false)
                    .limit(2),
            )
            .unwrap();
        assert_eq!(rows, vec![row(json!({ "id": 3 })), row(json!({ "id": 2 }))]);
    }

    #[test]
    fn count_applies_filters_and_missing_table_is_zero() {
        let backend = MemoryBackend::new();
        backend.seed(
            DOWNLOADS,
            [
                row(json!({ CREATED_AT: "2026-03-10T10:00:00Z" })),
                row(json!({ CREATED_AT: "2026-03-09T10:00:00Z" })),
            ],
        );
        let since = [Filter::gt(CREATED_AT, "2026-03-10T00:00:00Z")];
        assert_eq!(backend.count(DOWNLOADS, &since).unwrap(), 1);
        assert_eq!(backend.count(DOWNLOADS, &[]).unwrap(), 2);
        assert_eq!(backend.count("nothing_here", &[]).unwrap(), 0);
        assert_eq!(backend.op_counts().count, 3);
    }

    #[test]
    fn injected_failures_split_reads_and_writes() {
        let backend = MemoryBackend::new();
        backend.fail_reads(true);
        assert!(matches!(backend.count(DOWNLOADS, &[]), Err(DbError::Injected(_))));
        backend.insert(DOWNLOADS, Row::new()).unwrap();

        backend.fail_reads(false);
        backend.fail_writes(true);
        assert_eq!(backend.count(DOWNLOADS, &[]).unwrap(), 1);
        assert!(matches!(
            backend.insert(DOWNLOADS, Row::new()),
            Err(DbError::Injected(_))
        ));
        assert!(backend.delete(DOWNLOADS, &[]).is_err());
    }

    #[test]
    fn delete_removes_matching_rows() {
        let backend = MemoryBackend::new();
        for _ in 0..3 {
            backend.insert(DOWNLOADS, Row::new()).unwrap();
        }
        let removed = backend
            .delete(DOWNLOADS, &[Filter::gt(CREATED_AT, "1970-01-01T00:00:00Z")])
            .unwrap();
        assert_eq!(removed, 3);
        assert!(backend.rows(DOWNLOADS).is_empty());
    }

    #[test]
    fn feed_delivers_matching_events_until_unsubscribed() {
        let backend = MemoryBackend::new();
        let seen = Arc::new(AtomicU64::new(0));
        let sink = Arc::clone(&seen);
        let id = backend
            .subscribe(
                DOWNLOADS,
                ChangeKind::Insert,
                Arc::new(move |_: &ChangeEvent| {
                    sink.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        backend.insert(DOWNLOADS, Row::new()).unwrap();
        backend.insert(RELEASES, Row::new()).unwrap();
        backend.delete(DOWNLOADS, &[]).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        backend.unsubscribe(id);
        assert_eq!(backend.subscriber_count(), 0);
        backend.insert(DOWNLOADS, Row::new()).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_may_reenter_the_backend() {
        let backend = Arc::new(MemoryBackend::new());
        let observed = Arc::new(AtomicU64::new(0));
        let (inner, sink) = (Arc::clone(&backend), Arc::clone(&observed));
        backend
            .subscribe(
                DOWNLOADS,
                ChangeKind::Insert,
                Arc::new(move |_: &ChangeEvent| {
                    let n = inner.count(DOWNLOADS, &[]).unwrap();
                    sink.store(n, Ordering::SeqCst);
                }),
            )
            .unwrap();
        backend.insert(DOWNLOADS, Row::new()).unwrap();
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }
}
