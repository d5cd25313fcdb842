//! Statistical Analyzer
//!
//! Compares every non-control variant against control on every metric and
//! recommends a winner.
//!
//! | metric kind | test                        | effect size | interval            |
//! |-------------|-----------------------------|-------------|---------------------|
//! | binary      | 2×2 chi-squared (Yates < 5) | Cohen's h   | p̂ ± 1.96·√(p̂q̂/n)   |
//! | continuous  | Welch's t                   | Cohen's d   | x̄ ± 1.96·s/√n       |
//!
//! Comparisons run in parallel on the rayon pool; results are returned in
//! (variant, metric) declaration order.

pub mod distribution;
mod hypothesis;

pub use hypothesis::{
    chi_squared_2x2, cohens_d, cohens_h, mean_ci, proportion_ci, relative_improvement,
    welch_t_test, zero_pooled_variance, TestStatistic, Z_95,
};

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::experiment::{Experiment, ExperimentStatus, MetricDefinition, Observation};
use crate::metrics::{dedup, AggregateTable, MetricAggregate};

/// How a comparison turned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Control row: descriptive statistics only
    Baseline,
    /// p < alpha
    Significant,
    /// p ≥ alpha
    NotSignificant,
    /// Test undefined: zero pooled variance
    Inconclusive,
    /// Test undefined: zero row or column total
    Degenerate,
    /// An arm is below the minimum sample size; no test was run
    InsufficientData,
}

impl Outcome {
    /// Whether this outcome blocks concluding the experiment.
    #[must_use]
    pub const fn blocks_conclusion(self) -> bool {
        matches!(
            self,
            Self::Inconclusive | Self::Degenerate | Self::InsufficientData
        )
    }
}

/// One row of the results table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    /// Variant
    pub variant_id: String,
    /// Metric
    pub metric_id: String,
    /// Deduplicated observations
    pub sample_size: u64,
    /// Rate (binary) or mean (continuous)
    pub value: f64,
    /// 95% confidence interval (low, high)
    pub confidence_interval: (f64, f64),
    /// Test statistic, when a test was run
    pub statistic: Option<f64>,
    /// Two-sided p-value, when a test was run
    pub p_value: Option<f64>,
    /// p < alpha
    pub significant: bool,
    /// Cohen's h (binary) or d (continuous), treatment minus control
    pub effect_size: Option<f64>,
    /// (variant − control) / control × 100, regardless of significance
    pub improvement_pct: Option<f64>,
    /// How the comparison turned out
    pub outcome: Outcome,
}

/// Overall verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Recommendation {
    /// Promote the winning variant
    Promote {
        /// Winning variant
        variant_id: String,
    },
    /// No variant qualifies; never force a winner
    InsufficientEvidence,
}

/// Analyzer output for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentResults {
    /// Experiment
    pub experiment_id: String,
    /// Status at analysis time
    pub status: ExperimentStatus,
    /// Control rows first, then one row per (treatment, metric)
    pub variant_results: Vec<VariantResult>,
    /// Winner, if any variant qualifies
    pub winner_variant_id: Option<String>,
    /// Every live arm meets the minimum on the primary metric and no primary
    /// comparison is undefined
    pub can_conclude: bool,
    /// Overall verdict
    pub recommendation: Recommendation,
    /// When the analysis ran
    pub computed_at: DateTime<Utc>,
}

impl ExperimentResults {
    /// Row for (variant, metric).
    #[must_use]
    pub fn result(&self, variant_id: &str, metric_id: &str) -> Option<&VariantResult> {
        self.variant_results
            .iter()
            .find(|r| r.variant_id == variant_id && r.metric_id == metric_id)
    }
}

/// Statistical analyzer.
#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    dedup_window: Option<Duration>,
}

impl Analyzer {
    /// Create an analyzer with unbounded deduplication.
    #[must_use]
    pub const fn new() -> Self {
        Self { dedup_window: None }
    }

    /// Bound the deduplication window.
    #[must_use]
    pub const fn with_dedup_window(mut self, window: Option<Duration>) -> Self {
        self.dedup_window = window;
        self
    }

    /// Deduplicate, aggregate and analyze raw observations.
    #[must_use]
    pub fn analyze(&self, experiment: &Experiment, observations: Vec<Observation>) -> ExperimentResults {
        let observations = dedup(observations, self.dedup_window);
        let table = AggregateTable::build(&observations, experiment.metrics());
        self.analyze_table(experiment, &table)
    }

    /// Analyze pre-aggregated data.
    #[must_use]
    pub fn analyze_table(&self, experiment: &Experiment, table: &AggregateTable) -> ExperimentResults {
        let control_id = experiment.split().control_id();
        let min = experiment.min_sample_size();
        let alpha = experiment.alpha();

        let mut variant_results: Vec<VariantResult> = experiment
            .metrics()
            .iter()
            .map(|metric| baseline_row(control_id, metric, &table.get_or_empty(control_id, metric)))
            .collect();

        let pairs: Vec<(&str, &MetricDefinition)> = experiment
            .treatments()
            .flat_map(|v| experiment.metrics().iter().map(move |m| (v.id(), m)))
            .collect();
        let comparisons: Vec<VariantResult> = pairs
            .par_iter()
            .map(|(variant_id, metric)| {
                compare(
                    variant_id,
                    metric,
                    &table.get_or_empty(control_id, metric),
                    &table.get_or_empty(variant_id, metric),
                    min,
                    alpha,
                )
            })
            .collect();
        variant_results.extend(comparisons);

        let can_conclude = can_conclude(experiment, &variant_results);
        let winner_variant_id = pick_winner(experiment, &variant_results);
        let recommendation = winner_variant_id.clone().map_or(
            Recommendation::InsufficientEvidence,
            |variant_id| Recommendation::Promote { variant_id },
        );

        debug!(
            experiment_id = experiment.id(),
            comparisons = pairs.len(),
            can_conclude,
            winner = winner_variant_id.as_deref().unwrap_or("none"),
            "experiment analyzed"
        );

        ExperimentResults {
            experiment_id: experiment.id().to_string(),
            status: experiment.status(),
            variant_results,
            winner_variant_id,
            can_conclude,
            recommendation,
            computed_at: Utc::now(),
        }
    }
}

fn describe(aggregate: &MetricAggregate) -> (u64, f64, (f64, f64)) {
    let interval = match aggregate {
        MetricAggregate::Binary(b) => proportion_ci(b),
        MetricAggregate::Continuous(c) => mean_ci(c),
    };
    (aggregate.count(), aggregate.value(), interval)
}

fn baseline_row(control_id: &str, metric: &MetricDefinition, aggregate: &MetricAggregate) -> VariantResult {
    let (sample_size, value, confidence_interval) = describe(aggregate);
    VariantResult {
        variant_id: control_id.to_string(),
        metric_id: metric.id().to_string(),
        sample_size,
        value,
        confidence_interval,
        statistic: None,
        p_value: None,
        significant: false,
        effect_size: None,
        improvement_pct: None,
        outcome: Outcome::Baseline,
    }
}

fn compare(
    variant_id: &str,
    metric: &MetricDefinition,
    control: &MetricAggregate,
    treatment: &MetricAggregate,
    min_sample_size: u64,
    alpha: f64,
) -> VariantResult {
    let (sample_size, value, confidence_interval) = describe(treatment);
    let mut row = VariantResult {
        variant_id: variant_id.to_string(),
        metric_id: metric.id().to_string(),
        sample_size,
        value,
        confidence_interval,
        statistic: None,
        p_value: None,
        significant: false,
        effect_size: None,
        improvement_pct: relative_improvement(control.value(), value),
        outcome: Outcome::InsufficientData,
    };

    if control.count() < min_sample_size || treatment.count() < min_sample_size {
        return row;
    }

    let (test, effect_size, undefined) = match (control, treatment) {
        (MetricAggregate::Binary(c), MetricAggregate::Binary(t)) => (
            chi_squared_2x2(*c, *t),
            Some(cohens_h(c.rate(), t.rate())),
            Outcome::Degenerate,
        ),
        (MetricAggregate::Continuous(c), MetricAggregate::Continuous(t)) => {
            if zero_pooled_variance(c, t) {
                (None, None, Outcome::Inconclusive)
            } else {
                (welch_t_test(c, t), cohens_d(c, t), Outcome::Inconclusive)
            }
        }
        // Both aggregates come from the same metric definition
        _ => (None, None, Outcome::Inconclusive),
    };

    match test {
        Some(test) => {
            row.statistic = Some(test.statistic);
            row.p_value = Some(test.p_value);
            row.significant = test.p_value < alpha;
            row.effect_size = effect_size;
            row.outcome = if row.significant {
                Outcome::Significant
            } else {
                Outcome::NotSignificant
            };
        }
        None => row.outcome = undefined,
    }
    row
}

fn can_conclude(experiment: &Experiment, rows: &[VariantResult]) -> bool {
    let Some(primary) = experiment.primary_metric() else {
        return false;
    };
    let min = experiment.min_sample_size();
    let split = experiment.split();

    rows.iter()
        .filter(|r| r.metric_id == primary.id() && !split.is_removed(&r.variant_id))
        .all(|r| r.sample_size >= min && !r.outcome.blocks_conclusion())
}

fn pick_winner(experiment: &Experiment, rows: &[VariantResult]) -> Option<String> {
    let primary = experiment.primary_metric()?;
    let min = experiment.min_sample_size();
    let split = experiment.split();

    rows.iter()
        .filter(|r| r.metric_id == primary.id() && r.outcome != Outcome::Baseline)
        .filter(|r| r.sample_size >= min && r.significant)
        .filter(|r| !experiment.has_violation(&r.variant_id) && !split.is_removed(&r.variant_id))
        .filter_map(|r| {
            let directional = r.effect_size? * primary.direction_sign();
            (directional > 0.0).then_some((directional, r))
        })
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, r)| r.variant_id.clone())
}
