//! Commands run end to end against the in-memory sandbox backend.

use std::collections::HashMap;

use clap::Parser;
use pulse_cli::{Cli, CliError, execute};
use pulse_core::Config;

fn config(pairs: &[(&str, &str)]) -> Config {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    Config::from_lookup(|key| map.get(key).cloned()).unwrap()
}

fn fast() -> Config {
    config(&[
        ("PULSE_STAGE_DURATION_MS", "50"),
        ("PULSE_CONCURRENCY_LEVELS", "1,2"),
        ("PULSE_COOLDOWN_MS", "0"),
    ])
}

fn run(args: &[&str], config: &Config) -> (Result<(), CliError>, String) {
    let cli = Cli::try_parse_from(std::iter::once("pulse").chain(args.iter().copied())).unwrap();
    let mut out = Vec::new();
    let result = execute(cli, config, &mut out);
    (result, String::from_utf8(out).unwrap())
}

#[test]
fn mixed_bench_prints_each_stage_and_a_summary() {
    let (result, text) = run(&["bench", "--sandbox"], &fast());
    result.unwrap();
    assert!(text.contains("--- Starting Test: 1 Concurrent Users ---"));
    assert!(text.contains("--- Starting Test: 2 Concurrent Users ---"));
    assert!(text.contains("Results for 2 users:"));
    assert!(text.contains("Summary (mixed profile)"));
    let header = text.find("Starting Test: 1").unwrap();
    let results = text.find("Results for 1 users").unwrap();
    assert!(header < results);
}

#[test]
fn write_bench_json_is_one_document() {
    let (result, text) = run(&["bench", "--profile", "write", "--json", "--sandbox"], &fast());
    result.unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["config"]["profile"], "write");
    let stages = value["stages"].as_array().unwrap();
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0]["concurrency"], 1);
    assert_eq!(stages[1]["concurrency"], 2);
    assert!(stages[0]["success_count"].as_u64().unwrap() > 0);
}

#[test]
fn stats_json_has_thirty_days() {
    let (result, text) = run(&["stats", "--json", "--sandbox"], &fast());
    result.unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["counters"]["total"], 12);
    assert_eq!(value["counters"]["today"], 12);
    assert_eq!(value["history"].as_array().unwrap().len(), 30);
}

#[test]
fn stats_text_lists_counters() {
    let (result, text) = run(&["stats", "--sandbox"], &fast());
    result.unwrap();
    assert!(text.contains("Total downloads: 12"));
    assert!(text.contains("History (30 days):"));
}

#[test]
fn reset_requires_confirmation() {
    let (result, text) = run(&["reset", "--sandbox"], &fast());
    let err = result.unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert!(text.is_empty());
}

#[test]
fn reset_removes_sandbox_downloads() {
    let (result, text) = run(&["reset", "--yes", "--sandbox"], &fast());
    result.unwrap();
    assert_eq!(text.trim(), "Removed 12 downloads.");
}

#[test]
fn remote_commands_without_credentials_exit_two() {
    let (result, _) = run(&["stats"], &fast());
    assert!(matches!(result, Err(CliError::Config(_))));
    assert_eq!(result.unwrap_err().exit_code(), 2);
}

#[test]
fn invalid_levels_fail_before_connecting() {
    let bad = Config {
        concurrency_levels: Some(vec![0]),
        ..fast()
    };
    let (result, text) = run(&["bench"], &bad);
    assert!(matches!(result, Err(CliError::Config(_))));
    assert!(text.is_empty());
}
