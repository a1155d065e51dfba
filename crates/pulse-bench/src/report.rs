//! Human and JSON renderings of benchmark results.

use std::fmt::Write as _;

use serde::Serialize;

use crate::harness::StageResult;
use crate::runner::BenchmarkConfig;
use crate::stats::as_millis_f64;

/// Banner printed before a stage starts.
#[must_use]
pub fn render_stage_header(concurrency: usize) -> String {
    format!("--- Starting Test: {concurrency} Concurrent Users ---")
}

/// Multi-line summary of one stage.
#[must_use]
pub fn render_stage(result: &StageResult) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Results for {} users:", result.concurrency);
    let _ = writeln!(out, "  Duration: {:.2}s", result.elapsed.as_secs_f64());
    let _ = writeln!(out, "  Requests (Ops): {}", result.success_count);
    let _ = writeln!(out, "  Failed: {}", result.failure_count);
    let _ = writeln!(out, "  RPS: {:.2} ops/sec", result.throughput);
    let _ = writeln!(
        out,
        "  Avg Latency: {:.2}ms",
        as_millis_f64(result.avg_latency)
    );
    let _ = writeln!(out, "  P95 Latency: {}ms", result.p95_latency.as_millis());
    let _ = writeln!(out, "  P99 Latency: {}ms", result.p99_latency.as_millis());
    for (scenario, counts) in &result.scenario_counts {
        let _ = writeln!(
            out,
            "    {scenario}: {} ok, {} failed",
            counts.success, counts.failure
        );
    }
    if result.lost_workers > 0 {
        let _ = writeln!(out, "  Lost workers: {}", result.lost_workers);
    }
    out
}

/// Fixed-width table of every stage, one row per level.
#[must_use]
pub fn render_summary(results: &[StageResult]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>6} {:>9} {:>8} {:>10} {:>10} {:>9} {:>9}",
        "users", "ops", "failed", "rps", "avg_ms", "p95_ms", "p99_ms"
    );
    for r in results {
        let _ = writeln!(
            out,
            "{:>6} {:>9} {:>8} {:>10.2} {:>10.2} {:>9} {:>9}",
            r.concurrency,
            r.success_count,
            r.failure_count,
            r.throughput,
            as_millis_f64(r.avg_latency),
            r.p95_latency.as_millis(),
            r.p99_latency.as_millis(),
        );
    }
    out
}

/// JSON document for `--json`.
#[derive(Debug, Serialize)]
pub struct BenchmarkReport<'a> {
    pub config: &'a BenchmarkConfig,
    pub stages: &'a [StageResult],
}

impl BenchmarkReport<'_> {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
