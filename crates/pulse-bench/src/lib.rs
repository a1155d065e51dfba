//! Staged-concurrency load harness for Download Pulse
//!
//! This crate provides:
//! - A weighted scenario selector
//! - The scenario library (dashboard reads, download writes, release lookups)
//! - The per-stage worker harness and its latency reduction
//! - Benchmark profiles, the staged run loop, and report rendering

#![forbid(unsafe_code)]

pub mod harness;
pub mod report;
pub mod runner;
pub mod scenarios;
pub mod selector;
pub mod stats;

pub use harness::{Outcome, ScenarioCounts, StageResult, WorkerSample, run_stage};
pub use report::{BenchmarkReport, render_stage, render_stage_header, render_summary};
pub use runner::{BenchmarkConfig, Profile, StageEvent, run_benchmark, run_benchmark_with};
pub use scenarios::{OperationRunner, ScenarioLibrary, StageScenarios};
pub use selector::{ScenarioKind, WeightedSelector};
pub use stats::{LatencySummary, mean, percentile};
