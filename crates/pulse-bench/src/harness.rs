//! One fixed-duration stage at a fixed concurrency.
//!
//! Workers are scoped OS threads with private tallies; nothing is shared
//! between them until the merge after join. The deadline is checked between
//! operations, so an operation still running when the stage ends is awaited
//! and scored by its own outcome in this stage.

use std::collections::BTreeMap;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};

use crate::scenarios::OperationRunner;
use crate::selector::{ScenarioKind, WeightedSelector};
use crate::stats::{LatencySummary, as_millis_f64, round2};

/// Whether one operation succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// One timed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSample {
    pub scenario: ScenarioKind,
    pub latency: Duration,
    pub outcome: Outcome,
}

/// Success/failure tallies for one scenario.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScenarioCounts {
    pub success: u64,
    pub failure: u64,
}

/// A worker's private accumulation.
#[derive(Debug, Default)]
struct WorkerTally {
    latencies: Vec<Duration>,
    success: u64,
    failure: u64,
    per_scenario: BTreeMap<ScenarioKind, ScenarioCounts>,
}

impl WorkerTally {
    fn record(&mut self, sample: WorkerSample) {
        let counts = self.per_scenario.entry(sample.scenario).or_default();
        match sample.outcome {
            Outcome::Success => {
                self.latencies.push(sample.latency);
                self.success += 1;
                counts.success += 1;
            }
            Outcome::Failure => {
                self.failure += 1;
                counts.failure += 1;
            }
        }
    }

    fn merge(&mut self, other: Self) {
        self.latencies.extend(other.latencies);
        self.success += other.success;
        self.failure += other.failure;
        for (kind, counts) in other.per_scenario {
            let mine = self.per_scenario.entry(kind).or_default();
            mine.success += counts.success;
            mine.failure += counts.failure;
        }
    }
}

fn secs<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round2(d.as_secs_f64()))
}

fn millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round2(as_millis_f64(*d)))
}

/// Reduced result of one stage.
///
/// Latencies cover successful operations only and are zero when there are
/// none. `p95_latency <= p99_latency` always holds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub concurrency: usize,
    #[serde(rename = "elapsed_secs", serialize_with = "secs")]
    pub elapsed: Duration,
    pub success_count: u64,
    pub failure_count: u64,
    /// Successful operations per second of `elapsed`.
    pub throughput: f64,
    #[serde(rename = "avg_latency_ms", serialize_with = "millis")]
    pub avg_latency: Duration,
    #[serde(rename = "p95_latency_ms", serialize_with = "millis")]
    pub p95_latency: Duration,
    #[serde(rename = "p99_latency_ms", serialize_with = "millis")]
    pub p99_latency: Duration,
    /// Workers whose tallies were lost to a panic.
    pub lost_workers: usize,
    pub scenario_counts: BTreeMap<ScenarioKind, ScenarioCounts>,
}

impl StageResult {
    fn reduce(concurrency: usize, elapsed: Duration, tally: WorkerTally, lost_workers: usize) -> Self {
        let WorkerTally {
            mut latencies,
            success,
            failure,
            per_scenario,
        } = tally;
        let summary = LatencySummary::from_samples(&mut latencies);
        let elapsed_secs = elapsed.as_secs_f64();
        #[allow(clippy::cast_precision_loss)]
        let throughput = if success == 0 || elapsed_secs <= 0.0 {
            0.0
        } else {
            success as f64 / elapsed_secs
        };
        Self {
            concurrency,
            elapsed,
            success_count: success,
            failure_count: failure,
            throughput,
            avg_latency: summary.avg,
            p95_latency: summary.p95,
            p99_latency: summary.p99,
            lost_workers,
            scenario_counts: per_scenario,
        }
    }

    /// Operations attempted, successful or not.
    #[must_use]
    pub const fn total_ops(&self) -> u64 {
        self.success_count + self.failure_count
    }
}

fn run_worker(
    start: Instant,
    duration: Duration,
    selector: &WeightedSelector,
    runner: &dyn OperationRunner,
) -> WorkerTally {
    let mut tally = WorkerTally::default();
    while start.elapsed() < duration {
        let scenario = selector.select();
        let op_start = Instant::now();
        let result = runner.run(scenario);
        let latency = op_start.elapsed();
        let outcome = match result {
            Ok(()) => Outcome::Success,
            Err(err) => {
                tracing::trace!(%scenario, error = %err, "operation failed");
                Outcome::Failure
            }
        };
        tally.record(WorkerSample {
            scenario,
            latency,
            outcome,
        });
    }
    tally
}

/// Run `concurrency` workers until `duration` has elapsed and reduce their samples.
///
/// Per-operation failures are counted, never escalated. A panicking worker
/// loses its own samples and is logged; its siblings are unaffected.
#[must_use]
pub fn run_stage(
    concurrency: usize,
    duration: Duration,
    selector: &WeightedSelector,
    runner: &dyn OperationRunner,
) -> StageResult {
    let start = Instant::now();
    let (merged, lost) = thread::scope(|s| {
        let handles: Vec<_> = (0..concurrency)
            .map(|worker| {
                thread::Builder::new()
                    .name(format!("pulse-worker-{worker}"))
                    .spawn_scoped(s, move || run_worker(start, duration, selector, runner))
            })
            .collect();

        let mut merged = WorkerTally::default();
        let mut lost = 0usize;
        for (worker, handle) in handles.into_iter().enumerate() {
            match handle {
                Ok(handle) => match handle.join() {
                    Ok(tally) => merged.merge(tally),
                    Err(_) => {
                        lost += 1;
                        tracing::warn!(worker, "benchmark worker panicked; its samples are lost");
                    }
                },
                Err(err) => {
                    lost += 1;
                    tracing::warn!(worker, error = %err, "failed to spawn benchmark worker");
                }
            }
        }
        (merged, lost)
    });
    let elapsed = start.elapsed();
    StageResult::reduce(concurrency, elapsed, merged, lost)
}
