//! Latency reduction: mean and nearest-rank-by-floor percentiles.

use std::time::Duration;

/// Element of `sorted` at index `floor(q * len)`, clamped to the last index.
///
/// Returns zero for an empty slice.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]
pub fn percentile(sorted: &[Duration], q: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = (q.clamp(0.0, 1.0) * sorted.len() as f64).floor() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Arithmetic mean; zero for an empty slice.
#[must_use]
pub fn mean(samples: &[Duration]) -> Duration {
    if samples.is_empty() {
        return Duration::ZERO;
    }
    let total: u128 = samples.iter().map(Duration::as_nanos).sum();
    let avg = total / samples.len() as u128;
    Duration::from_nanos(u64::try_from(avg).unwrap_or(u64::MAX))
}

/// Reduced latency distribution of one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySummary {
    pub samples: usize,
    pub avg: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub max: Duration,
}

impl LatencySummary {
    /// Sort `latencies` in place and reduce them.
    #[must_use]
    pub fn from_samples(latencies: &mut [Duration]) -> Self {
        latencies.sort_unstable();
        Self {
            samples: latencies.len(),
            avg: mean(latencies),
            p95: percentile(latencies, 0.95),
            p99: percentile(latencies, 0.99),
            max: latencies.last().copied().unwrap_or_default(),
        }
    }
}

/// Round to two decimals for display and JSON.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Milliseconds as a float.
#[must_use]
pub fn as_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn empty_samples_reduce_to_zero() {
        let s = LatencySummary::from_samples(&mut []);
        assert_eq!(s, LatencySummary::default());
    }

    #[test]
    fn percentile_uses_floor_index() {
        let sorted: Vec<Duration> = (1..=100).map(ms).collect();
        // floor(0.95 * 100) = 95 -> the 96th value.
        assert_eq!(percentile(&sorted, 0.95), ms(96));
        assert_eq!(percentile(&sorted, 0.99), ms(100));
        assert_eq!(percentile(&sorted, 0.0), ms(1));
        assert_eq!(percentile(&sorted, 1.0), ms(100), "clamped to the last index");
    }

    #[test]
    fn small_sample_percentiles_hit_the_maximum() {
        let mut samples = vec![ms(30), ms(10), ms(20)];
        let s = LatencySummary::from_samples(&mut samples);
        assert_eq!(s.avg, ms(20));
        assert_eq!(s.p95, ms(30));
        assert_eq!(s.p99, ms(30));
        assert_eq!(s.max, ms(30));
        assert_eq!(samples, [ms(10), ms(20), ms(30)]);
    }

    #[test]
    fn round2_keeps_two_decimals() {
        assert!((round2(1.005_1) - 1.01).abs() < 1e-9);
        assert!((round2(12.344) - 12.34).abs() < 1e-9);
    }

    proptest! {
        #[test]
        fn prop_p95_never_exceeds_p99(raw in prop::collection::vec(0u64..5_000_000, 1..500)) {
            let mut samples: Vec<Duration> = raw.into_iter().map(Duration::from_micros).collect();
            let s = LatencySummary::from_samples(&mut samples);
            prop_assert!(s.p95 <= s.p99);
            prop_assert!(s.p99 <= s.max);
            prop_assert!(s.avg <= s.max);
        }
    }
}
