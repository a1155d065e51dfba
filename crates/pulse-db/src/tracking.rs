//! Download tracking and release lookups.
//!
//! Two lanes write to `downloads`:
//! - the benchmark's write scenario calls [`Backend::insert`] directly and
//!   counts every error as a failure sample;
//! - the page-facing lane, [`track_download_best_effort`], never fails: errors
//!   are logged and reported as [`TrackOutcome::Dropped`].

use std::sync::Arc;
use std::thread;

use serde::Serialize;
use serde_json::Value;

use crate::backend::{Backend, CREATED_AT, DOWNLOADS, Filter, RELEASE_ID, RELEASES, Row, SelectQuery};
use crate::error::DbResult;

/// Lower bound that matches every real row; used to delete "everything".
const EPOCH: &str = "1970-01-01T00:00:00.000Z";

/// Result of a best-effort tracking call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrackOutcome {
    Recorded,
    Dropped { reason: String },
}

impl TrackOutcome {
    #[must_use]
    pub const fn is_recorded(&self) -> bool {
        matches!(self, Self::Recorded)
    }
}

/// Id of the most recently created release, or `None` when there is none.
pub fn latest_release_id(backend: &dyn Backend) -> DbResult<Option<Value>> {
    let query = SelectQuery::new()
        .columns(["id"])
        .order_by(CREATED_AT, false)
        .limit(1);
    let rows = backend.select(RELEASES, &query)?;
    Ok(rows
        .into_iter()
        .next()
        .and_then(|mut row| row.remove("id"))
        .filter(|id| !id.is_null()))
}

/// Most recently created release row, if any.
pub fn latest_release(backend: &dyn Backend) -> DbResult<Option<Row>> {
    let query = SelectQuery::new().order_by(CREATED_AT, false).limit(1);
    Ok(backend.select(RELEASES, &query)?.into_iter().next())
}

/// The row inserted for one download of `release_id` (null when unknown).
#[must_use]
pub fn download_row(release_id: Option<&Value>) -> Row {
    let mut row = Row::new();
    row.insert(
        RELEASE_ID.to_string(),
        release_id.cloned().unwrap_or(Value::Null),
    );
    row
}

/// Record one download; failures are logged and swallowed.
pub fn track_download_best_effort(
    backend: &dyn Backend,
    release_id: Option<&Value>,
) -> TrackOutcome {
    match backend.insert(DOWNLOADS, download_row(release_id)) {
        Ok(()) => TrackOutcome::Recorded,
        Err(err) => {
            tracing::warn!(error = %err, code = err.error_code(), "download tracking failed");
            TrackOutcome::Dropped {
                reason: err.to_string(),
            }
        }
    }
}

/// Fire-and-forget variant of [`track_download_best_effort`] on its own thread.
pub fn spawn_track_download(
    backend: Arc<dyn Backend>,
    release_id: Option<Value>,
) -> Option<thread::JoinHandle<TrackOutcome>> {
    let spawned = thread::Builder::new()
        .name("pulse-track".into())
        .spawn(move || track_download_best_effort(&*backend, release_id.as_ref()));
    match spawned {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::warn!(error = %err, "failed to spawn download tracking thread");
            None
        }
    }
}

/// Delete every row of `downloads`; returns how many were removed.
pub fn reset_downloads(backend: &dyn Backend) -> DbResult<u64> {
    let removed = backend.delete(DOWNLOADS, &[Filter::gt(CREATED_AT, EPOCH)])?;
    tracing::info!(removed, "downloads table cleared");
    Ok(removed)
}
