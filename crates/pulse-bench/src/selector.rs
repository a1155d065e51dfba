//! Weighted random choice of the scenario a worker runs next.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use pulse_core::{ConfigError, ConfigResult};

/// Allowed deviation of the weight sum from 1.0.
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// A named unit of work a worker executes once per loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioKind {
    /// Dashboard load: all-time and today counts, concurrently.
    ReadStats,
    /// One insert into `downloads`.
    TrackDownload,
    /// One-row select on `apk_releases`.
    ReleaseLookup,
}

impl ScenarioKind {
    pub const ALL: [Self; 3] = [Self::ReadStats, Self::TrackDownload, Self::ReleaseLookup];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ReadStats => "read_stats",
            Self::TrackDownload => "track_download",
            Self::ReleaseLookup => "release_lookup",
        }
    }
}

impl fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps one uniform draw in `[0, 1)` onto the cumulative weight partition.
///
/// Stateless after construction; safe to share across worker threads.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedSelector {
    weights: Vec<(ScenarioKind, f64)>,
    upper_bounds: Vec<f64>,
}

impl WeightedSelector {
    /// Build a selector from `(scenario, probability)` pairs.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when the list is empty, names a scenario
    /// twice, holds a negative or non-finite weight, or does not sum to 1.0.
    pub fn new<I>(weights: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = (ScenarioKind, f64)>,
    {
        const KEY: &str = "scenario_weights";
        let weights: Vec<(ScenarioKind, f64)> = weights.into_iter().collect();
        if weights.is_empty() {
            return Err(ConfigError::invalid(KEY, "at least one scenario is required"));
        }
        let mut upper_bounds = Vec::with_capacity(weights.len());
        let mut sum = 0.0;
        for (i, &(kind, weight)) in weights.iter().enumerate() {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::invalid(
                    KEY,
                    format!("weight for {kind} must be a finite non-negative number, got {weight}"),
                ));
            }
            if weights[..i].iter().any(|(k, _)| *k == kind) {
                return Err(ConfigError::invalid(KEY, format!("{kind} is listed twice")));
            }
            sum += weight;
            upper_bounds.push(sum);
        }
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::invalid(
                KEY,
                format!("weights must sum to 1.0, got {sum}"),
            ));
        }
        Ok(Self {
            weights,
            upper_bounds,
        })
    }

    /// A selector that always yields `kind`.
    #[must_use]
    pub fn only(kind: ScenarioKind) -> Self {
        Self {
            weights: vec![(kind, 1.0)],
            upper_bounds: vec![1.0],
        }
    }

    /// The scenario whose cumulative slot contains `r`.
    ///
    /// Zero-weight scenarios are never returned. Draws at or past the final
    /// bound (float round-off) go to the last scenario with positive weight.
    #[must_use]
    pub fn select_with(&self, r: f64) -> ScenarioKind {
        self.weights
            .iter()
            .zip(&self.upper_bounds)
            .find(|((_, weight), upper)| *weight > 0.0 && r < **upper)
            .or_else(|| {
                self.weights
                    .iter()
                    .zip(&self.upper_bounds)
                    .rev()
                    .find(|((_, weight), _)| *weight > 0.0)
            })
            .map_or(self.weights[0].0, |((kind, _), _)| *kind)
    }

    /// Draw from the calling thread's generator and select.
    #[must_use]
    pub fn select(&self) -> ScenarioKind {
        self.select_with(rand::rng().random::<f64>())
    }

    #[must_use]
    pub fn weights(&self) -> &[(ScenarioKind, f64)] {
        &self.weights
    }
}
