//! Named operations the harness drives against a [`Backend`].

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use pulse_core::{Clock, counter_windows};
use pulse_db::{
    Backend, CREATED_AT, DOWNLOADS, DbResult, Filter, RELEASES, SelectQuery, count_concurrently,
    download_row, latest_release_id,
};

use crate::selector::ScenarioKind;

/// Executes one scenario to completion, returning the backend outcome.
///
/// Implementations are shared by every worker of a stage.
pub trait OperationRunner: Send + Sync {
    fn run(&self, scenario: ScenarioKind) -> DbResult<()>;
}

/// Scenario implementations over one backend.
pub struct ScenarioLibrary {
    backend: Arc<dyn Backend>,
    clock: Arc<dyn Clock>,
}

impl ScenarioLibrary {
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    /// Prefetch per-stage inputs and return a runner for the stage.
    ///
    /// A failed or empty release lookup leaves `release_id` null; the stage
    /// still runs.
    #[must_use]
    pub fn prepare_stage(&self) -> StageScenarios<'_> {
        let release_id = match latest_release_id(&*self.backend) {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                tracing::info!("no releases found; downloads will carry a null release_id");
                None
            }
            Err(err) => {
                tracing::warn!(error = %err, "release prefetch failed; downloads will carry a null release_id");
                None
            }
        };
        StageScenarios {
            library: self,
            release_id,
        }
    }

    /// Dashboard load: all-time and since-local-midnight counts, concurrently.
    pub fn read_stats(&self) -> DbResult<()> {
        let windows = counter_windows(self.clock.now(), self.clock.zone());
        let filter_sets = [
            Vec::new(),
            vec![Filter::gt(CREATED_AT, windows.start_of_day.to_rfc3339())],
        ];
        count_concurrently(&*self.backend, DOWNLOADS, &filter_sets).map(|_| ())
    }

    /// One `downloads` insert.
    pub fn track_download(&self, release_id: Option<&Value>) -> DbResult<()> {
        self.backend.insert(DOWNLOADS, download_row(release_id))
    }

    /// One-row select on `apk_releases`.
    pub fn release_lookup(&self) -> DbResult<()> {
        let query = SelectQuery::new().columns(["id"]).limit(1);
        self.backend.select(RELEASES, &query).map(|_| ())
    }
}

impl fmt::Debug for ScenarioLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScenarioLibrary").finish_non_exhaustive()
    }
}

/// Scenarios bound to one stage's prefetched inputs.
#[derive(Debug)]
pub struct StageScenarios<'a> {
    library: &'a ScenarioLibrary,
    release_id: Option<Value>,
}

impl StageScenarios<'_> {
    #[must_use]
    pub const fn release_id(&self) -> Option<&Value> {
        self.release_id.as_ref()
    }
}

impl OperationRunner for StageScenarios<'_> {
    fn run(&self, scenario: ScenarioKind) -> DbResult<()> {
        match scenario {
            ScenarioKind::ReadStats => self.library.read_stats(),
            ScenarioKind::TrackDownload => self.library.track_download(self.release_id.as_ref()),
            ScenarioKind::ReleaseLookup => self.library.release_lookup(),
        }
    }
}
