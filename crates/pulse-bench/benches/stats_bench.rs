//! Criterion benchmarks for the harness hot paths: scenario selection and
//! end-of-stage latency reduction.

use std::hint::black_box;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use pulse_bench::{LatencySummary, ScenarioKind, WeightedSelector};

/// Deterministic pseudo-latencies between 1 ms and ~250 ms.
fn latencies(n: usize) -> Vec<Duration> {
    (0..n)
        .map(|i| {
            let scrambled = (i as u64).wrapping_mul(2_654_435_761) % 250_000;
            Duration::from_micros(1_000 + scrambled)
        })
        .collect()
}

fn bench_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("latency_summary");
    for n in [1_000usize, 10_000, 100_000] {
        let samples = latencies(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &samples, |b, samples| {
            b.iter(|| {
                let mut owned = samples.clone();
                black_box(LatencySummary::from_samples(&mut owned));
            });
        });
    }
    group.finish();
}

fn bench_select(c: &mut Criterion) {
    let selector = WeightedSelector::new([
        (ScenarioKind::ReadStats, 0.7),
        (ScenarioKind::TrackDownload, 0.3),
    ])
    .unwrap_or_else(|_| WeightedSelector::only(ScenarioKind::ReadStats));
    c.bench_function("selector_select", |b| {
        b.iter(|| black_box(selector.select()));
    });
    c.bench_function("selector_select_with", |b| {
        let mut r = 0.0f64;
        b.iter(|| {
            r = (r + 0.618_033_988_75) % 1.0;
            black_box(selector.select_with(black_box(r)))
        });
    });
}

criterion_group!(benches, bench_reduce, bench_select);
criterion_main!(benches);
