//! Benchmark profiles and the staged run loop.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pulse_core::{Config, ConfigError, ConfigResult};

use crate::harness::{StageResult, run_stage};
use crate::scenarios::ScenarioLibrary;
use crate::selector::{ScenarioKind, WeightedSelector};

/// Default stage length for both profiles.
pub const DEFAULT_STAGE_DURATION: Duration = Duration::from_secs(10);
/// Share of mixed-profile iterations that read the dashboard counters.
pub const DEFAULT_READ_WEIGHT: f64 = 0.7;

/// Built-in workload shapes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    /// Dashboard reads mixed with download writes, 70/30.
    #[default]
    Mixed,
    /// Download writes only, at higher concurrency.
    Write,
}

impl Profile {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mixed => "mixed",
            Self::Write => "write",
        }
    }
}

/// Parameters of one benchmark run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkConfig {
    pub profile: Profile,
    #[serde(rename = "stage_duration_ms", serialize_with = "duration_ms")]
    pub stage_duration: Duration,
    pub concurrency_levels: Vec<usize>,
    pub scenario_weights: Vec<(ScenarioKind, f64)>,
    /// Pause before every stage.
    #[serde(rename = "cooldown_ms", serialize_with = "duration_ms")]
    pub cooldown: Duration,
    /// Run one read-aggregate before the first stage.
    pub warmup: bool,
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl BenchmarkConfig {
    /// Mixed load: levels 1/10/50, 10 s stages, 70 % reads, 2 s cool-down.
    #[must_use]
    pub fn mixed() -> Self {
        Self {
            profile: Profile::Mixed,
            stage_duration: DEFAULT_STAGE_DURATION,
            concurrency_levels: vec![1, 10, 50],
            scenario_weights: mixed_weights(DEFAULT_READ_WEIGHT, 0.0),
            cooldown: Duration::from_secs(2),
            warmup: true,
        }
    }

    /// Write capacity: levels 10/50/100, writes only, 1 s cool-down.
    #[must_use]
    pub fn write() -> Self {
        Self {
            profile: Profile::Write,
            stage_duration: DEFAULT_STAGE_DURATION,
            concurrency_levels: vec![10, 50, 100],
            scenario_weights: vec![(ScenarioKind::TrackDownload, 1.0)],
            cooldown: Duration::from_secs(1),
            warmup: false,
        }
    }

    #[must_use]
    pub fn for_profile(profile: Profile) -> Self {
        match profile {
            Profile::Mixed => Self::mixed(),
            Profile::Write => Self::write(),
        }
    }

    /// Apply the `PULSE_*` benchmark overrides present in `config`.
    ///
    /// The read and lookup weights only reshape the mixed profile; writes get
    /// whatever share remains.
    #[must_use]
    pub fn with_overrides(mut self, config: &Config) -> Self {
        if let Some(duration) = config.stage_duration {
            self.stage_duration = duration;
        }
        if let Some(levels) = &config.concurrency_levels {
            self.concurrency_levels.clone_from(levels);
        }
        if let Some(cooldown) = config.cooldown {
            self.cooldown = cooldown;
        }
        if config.read_weight.is_some() || config.lookup_weight.is_some() {
            if self.profile == Profile::Mixed {
                self.scenario_weights = mixed_weights(
                    config.read_weight.unwrap_or(DEFAULT_READ_WEIGHT),
                    config.lookup_weight.unwrap_or(0.0),
                );
            } else {
                tracing::debug!(profile = self.profile.as_str(), "ignoring scenario weight overrides");
            }
        }
        self
    }

    /// Check levels and build the selector.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for empty or zero levels, a zero stage
    /// duration, or weights the selector rejects.
    pub fn validate(&self) -> ConfigResult<WeightedSelector> {
        if self.concurrency_levels.is_empty() {
            return Err(ConfigError::invalid(
                "concurrency_levels",
                "at least one level is required",
            ));
        }
        if self.concurrency_levels.contains(&0) {
            return Err(ConfigError::invalid(
                "concurrency_levels",
                "levels must be positive",
            ));
        }
        if self.stage_duration.is_zero() {
            return Err(ConfigError::invalid(
                "stage_duration",
                "must be greater than zero",
            ));
        }
        WeightedSelector::new(self.scenario_weights.iter().copied())
    }
}

/// Progress notifications from [`run_benchmark_with`].
#[derive(Debug, Clone, Copy)]
pub enum StageEvent<'a> {
    /// About to start the stage at `concurrency`, after its cool-down.
    Starting { stage: usize, concurrency: usize },
    Finished(&'a StageResult),
}

/// Reads and lookups as given, writes take the remainder. A zero lookup
/// share leaves release lookups out of the mix.
fn mixed_weights(read: f64, lookup: f64) -> Vec<(ScenarioKind, f64)> {
    let mut weights = vec![(ScenarioKind::ReadStats, read)];
    if lookup > 0.0 {
        weights.push((ScenarioKind::ReleaseLookup, lookup));
    }
    weights.push((ScenarioKind::TrackDownload, 1.0 - read - lookup));
    weights
}

/// Run every configured level in order, one [`StageResult`] per level.
///
/// # Errors
///
/// Only configuration errors; backend failures are counted inside stages.
pub fn run_benchmark(
    config: &BenchmarkConfig,
    library: &ScenarioLibrary,
) -> ConfigResult<Vec<StageResult>> {
    run_benchmark_with(config, library, |_| {})
}

/// [`run_benchmark`], reporting each stage start and finish to `on_event`.
pub fn run_benchmark_with<F>(
    config: &BenchmarkConfig,
    library: &ScenarioLibrary,
    mut on_event: F,
) -> ConfigResult<Vec<StageResult>>
where
    F: FnMut(StageEvent<'_>),
{
    let selector = config.validate()?;

    if config.warmup {
        match library.read_stats() {
            Ok(()) => tracing::debug!("warmup read completed"),
            Err(err) => tracing::warn!(error = %err, "warmup read failed"),
        }
    }

    let mut results = Vec::with_capacity(config.concurrency_levels.len());
    for (stage, &concurrency) in config.concurrency_levels.iter().enumerate() {
        if !config.cooldown.is_zero() {
            thread::sleep(config.cooldown);
        }
        let scenarios = library.prepare_stage();
        on_event(StageEvent::Starting {
            stage: stage + 1,
            concurrency,
        });
        tracing::info!(
            stage = stage + 1,
            concurrency,
            duration_ms = config.stage_duration.as_millis(),
            "stage starting"
        );
        let result = run_stage(concurrency, config.stage_duration, &selector, &scenarios);
        tracing::info!(
            stage = stage + 1,
            concurrency,
            success = result.success_count,
            failed = result.failure_count,
            rps = result.throughput,
            "stage finished"
        );
        on_event(StageEvent::Finished(&result));
        results.push(result);
    }
    Ok(results)
}
