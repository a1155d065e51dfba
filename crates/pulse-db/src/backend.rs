//! The backend operation contract.
//!
//! Every caller above this layer (scenarios, the analytics cache, the
//! tracking helpers) talks to the data platform only through [`Backend`].
//! Operations block the calling thread; concurrency is obtained by calling
//! from several threads, which is why implementations must be `Sync`.

use std::cmp::Ordering;

use serde_json::Value;

use crate::error::{DbError, DbResult};

/// One row as returned by the platform: column name to JSON value.
pub type Row = serde_json::Map<String, Value>;

/// Download events, one row per tracked download.
pub const DOWNLOADS: &str = "downloads";
/// Published APK releases.
pub const RELEASES: &str = "apk_releases";
/// Insertion timestamp column present on both tables.
pub const CREATED_AT: &str = "created_at";
/// Foreign key from `downloads` to `apk_releases`.
pub const RELEASE_ID: &str = "release_id";

/// Comparison operator of a row filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Gt,
    Gte,
    Lt,
}

impl FilterOp {
    /// PostgREST operator keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
        }
    }
}

/// A single `column <op> value` predicate. Multiple filters are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Gt, value)
    }

    /// Evaluate the filter against a row. Rows missing the column never match.
    #[must_use]
    pub fn matches(&self, row: &Row) -> bool {
        let Some(actual) = row.get(&self.column) else {
            return false;
        };
        let Some(ord) = compare_values(actual, &self.value) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => ord == Ordering::Equal,
            FilterOp::Gt => ord == Ordering::Greater,
            FilterOp::Gte => ord != Ordering::Less,
            FilterOp::Lt => ord == Ordering::Less,
        }
    }
}

/// Ordering clause of a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub ascending: bool,
}

/// Parameters of a `select`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    /// Columns to project; `None` selects all.
    pub columns: Option<Vec<String>>,
    pub filters: Vec<Filter>,
    pub order: Option<OrderBy>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
        self.order = Some(OrderBy {
            column: column.into(),
            ascending,
        });
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Read/write/count access to the remote store.
///
/// All failures surface as [`DbError`]; implementations add no retry.
pub trait Backend: Send + Sync {
    /// Number of rows in `table` matching every filter.
    fn count(&self, table: &str, filters: &[Filter]) -> DbResult<u64>;

    /// Rows of `table` matching the query.
    fn select(&self, table: &str, query: &SelectQuery) -> DbResult<Vec<Row>>;

    /// Insert one row. Server-side defaults (`id`, `created_at`) are filled in.
    fn insert(&self, table: &str, row: Row) -> DbResult<()>;

    /// Delete every row matching the filters; returns the number removed.
    fn delete(&self, table: &str, filters: &[Filter]) -> DbResult<u64>;
}

/// Issue one `count` per filter set on scoped threads and join them all.
///
/// Results come back in the order of `filter_sets`. The first error (in that
/// order) wins; every count still runs to completion before returning.
pub fn count_concurrently(
    backend: &dyn Backend,
    table: &str,
    filter_sets: &[Vec<Filter>],
) -> DbResult<Vec<u64>> {
    std::thread::scope(|s| {
        let handles: Vec<_> = filter_sets
            .iter()
            .map(|filters| s.spawn(move || backend.count(table, filters)))
            .collect();
        let results: Vec<DbResult<u64>> = handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(DbError::Internal("count worker panicked".into())))
            })
            .collect();
        results.into_iter().collect()
    })
}

/// Order two JSON values of the same kind.
///
/// Strings that both parse as timestamps compare chronologically, numbers
/// numerically, everything else by string form. `null` compares to nothing.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (pulse_core::parse_timestamp(x), pulse_core::parse_timestamp(y)) {
                (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => Some(a.to_string().cmp(&b.to_string())),
    }
}
