//! Read-side deduplication and per-(variant, metric) aggregation

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::experiment::{MetricDefinition, MetricKind, Observation};

/// Remove redelivered observations.
///
/// Two observations are duplicates when they share `(request_id,
/// metric_id)` and, if `window` is set, were recorded within `window` of
/// the first copy. The earliest copy is kept. Observations without a
/// request ID are never deduplicated.
#[must_use]
pub fn dedup(mut observations: Vec<Observation>, window: Option<Duration>) -> Vec<Observation> {
    observations.sort_by_key(Observation::recorded_at);

    let mut seen: FxHashMap<(String, String), DateTime<Utc>> = FxHashMap::default();
    observations.retain(|o| {
        if o.request_id().is_empty() {
            return true;
        }
        let key = (o.request_id().to_string(), o.metric_id().to_string());
        match seen.get(&key) {
            Some(first) if window.map_or(true, |w| o.recorded_at() - *first <= w) => false,
            _ => {
                seen.insert(key, o.recorded_at());
                true
            }
        }
    });
    observations
}

/// Successes over trials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryAggregate {
    /// Observations with a non-zero value
    pub successes: u64,
    /// All observations
    pub trials: u64,
}

impl BinaryAggregate {
    /// Create from counts.
    #[must_use]
    pub const fn new(successes: u64, trials: u64) -> Self {
        Self { successes, trials }
    }

    /// Add one observation. Any non-zero value counts as a success.
    pub fn push(&mut self, value: f64) {
        self.trials += 1;
        if value != 0.0 {
            self.successes += 1;
        }
    }

    /// Success rate, 0 when there are no trials.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.successes as f64 / self.trials as f64
        }
    }
}

/// Running moments of a continuous metric (Welford's update).
///
/// Constant inputs yield exactly zero variance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuousAggregate {
    /// Observation count
    pub n: u64,
    /// Running mean
    pub mean: f64,
    /// Sum of squared deviations from the mean
    pub m2: f64,
}

impl ContinuousAggregate {
    /// Reconstruct moments from summary statistics.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_moments(n: u64, mean: f64, std_dev: f64) -> Self {
        let nf = n as f64;
        Self {
            n,
            mean,
            m2: (nf - 1.0).max(0.0) * std_dev * std_dev,
        }
    }

    /// Add one observation.
    #[allow(clippy::cast_precision_loss)]
    pub fn push(&mut self, value: f64) {
        self.n += 1;
        let delta = value - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Sample mean, 0 when empty.
    #[must_use]
    pub const fn mean(&self) -> f64 {
        self.mean
    }

    /// Sample variance (n - 1 denominator), clamped at 0.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn variance(&self) -> f64 {
        if self.n < 2 {
            return 0.0;
        }
        (self.m2 / (self.n - 1) as f64).max(0.0)
    }

    /// Sample standard deviation.
    #[must_use]
    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Aggregate of one metric for one variant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetricAggregate {
    /// Binary metric
    Binary(BinaryAggregate),
    /// Continuous metric
    Continuous(ContinuousAggregate),
}

impl MetricAggregate {
    /// Empty aggregate for a metric kind.
    #[must_use]
    pub fn empty(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Binary => Self::Binary(BinaryAggregate::default()),
            MetricKind::Continuous => Self::Continuous(ContinuousAggregate::default()),
        }
    }

    /// Add one observation value.
    pub fn push(&mut self, value: f64) {
        match self {
            Self::Binary(b) => b.push(value),
            Self::Continuous(c) => c.push(value),
        }
    }

    /// Number of observations.
    #[must_use]
    pub const fn count(&self) -> u64 {
        match self {
            Self::Binary(b) => b.trials,
            Self::Continuous(c) => c.n,
        }
    }

    /// Rate (binary) or mean (continuous).
    #[must_use]
    pub fn value(&self) -> f64 {
        match self {
            Self::Binary(b) => b.rate(),
            Self::Continuous(c) => c.mean(),
        }
    }
}

/// Aggregates keyed by (variant, metric).
#[derive(Debug, Clone, Default)]
pub struct AggregateTable {
    cells: FxHashMap<(String, String), MetricAggregate>,
}

impl AggregateTable {
    /// Aggregate observations of the given metrics. Observations of
    /// unknown metrics are ignored.
    #[must_use]
    pub fn build(observations: &[Observation], metrics: &[MetricDefinition]) -> Self {
        let kinds: FxHashMap<&str, MetricKind> =
            metrics.iter().map(|m| (m.id(), m.kind())).collect();

        let mut cells: FxHashMap<(String, String), MetricAggregate> = FxHashMap::default();
        for o in observations {
            let Some(kind) = kinds.get(o.metric_id()) else {
                continue;
            };
            cells
                .entry((o.variant_id().to_string(), o.metric_id().to_string()))
                .or_insert_with(|| MetricAggregate::empty(*kind))
                .push(o.value());
        }
        Self { cells }
    }

    /// Aggregate for (variant, metric), if any observation was seen.
    #[must_use]
    pub fn get(&self, variant_id: &str, metric_id: &str) -> Option<&MetricAggregate> {
        self.cells
            .get(&(variant_id.to_string(), metric_id.to_string()))
    }

    /// Aggregate for (variant, metric), empty if nothing was seen.
    #[must_use]
    pub fn get_or_empty(&self, variant_id: &str, metric: &MetricDefinition) -> MetricAggregate {
        self.get(variant_id, metric.id())
            .copied()
            .unwrap_or_else(|| MetricAggregate::empty(metric.kind()))
    }

    /// Insert or replace a cell.
    pub fn insert(&mut self, variant_id: &str, metric_id: &str, aggregate: MetricAggregate) {
        self.cells
            .insert((variant_id.to_string(), metric_id.to_string()), aggregate);
    }

    /// Number of populated cells.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether no cell is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
