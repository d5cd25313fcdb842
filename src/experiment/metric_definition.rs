//! Metric definitions and the guardrails built on them

use serde::{Deserialize, Serialize};

/// Longest trailing window a guardrail may look back over (31 days).
pub const MAX_GUARDRAIL_WINDOW_SECS: u64 = 31 * 24 * 60 * 60;

/// Shape of a metric's observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    /// 0/1 outcomes, aggregated as success counts.
    Binary,
    /// Real-valued outcomes, aggregated as sum and sum of squares.
    Continuous,
}

/// A measured outcome of an experiment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MetricDefinition {
    id: String,
    kind: MetricKind,
    higher_is_better: bool,
    primary: bool,
}

impl MetricDefinition {
    /// Binary metric (e.g. conversion), higher is better.
    #[must_use]
    pub fn binary(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: MetricKind::Binary,
            higher_is_better: true,
            primary: false,
        }
    }

    /// Continuous metric (e.g. revenue), higher is better.
    #[must_use]
    pub fn continuous(id: impl Into<String>) -> Self {
        Self {
            kind: MetricKind::Continuous,
            ..Self::binary(id)
        }
    }

    /// Mark the metric as one where smaller values are better (latency, errors).
    #[must_use]
    pub const fn lower_is_better(mut self) -> Self {
        self.higher_is_better = false;
        self
    }

    /// Designate this metric as the experiment's deciding criterion.
    #[must_use]
    pub const fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Get the metric ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the metric kind.
    #[must_use]
    pub const fn kind(&self) -> MetricKind {
        self.kind
    }

    /// Whether larger values are an improvement.
    #[must_use]
    pub const fn higher_is_better(&self) -> bool {
        self.higher_is_better
    }

    /// Whether this is the primary metric.
    #[must_use]
    pub const fn is_primary(&self) -> bool {
        self.primary
    }

    /// +1.0 when higher is better, -1.0 otherwise. Multiplying a signed
    /// difference by this gives a value that is positive for improvements.
    #[must_use]
    pub const fn direction_sign(&self) -> f64 {
        if self.higher_is_better {
            1.0
        } else {
            -1.0
        }
    }
}

/// Which side of the threshold is unsafe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Breached when the measurement exceeds the threshold.
    Above,
    /// Breached when the measurement falls below the threshold.
    Below,
}

impl Comparison {
    /// Whether `value` breaches `threshold`.
    #[must_use]
    pub fn breached(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value > threshold,
            Self::Below => value < threshold,
        }
    }
}

/// Mitigation taken when a guardrail is breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailAction {
    /// Record and notify only.
    Alert,
    /// Remove the offending variant; its traffic falls through to control.
    StopVariant,
    /// Stop the whole experiment; all traffic reverts to the baseline.
    StopExperiment,
}

impl GuardrailAction {
    /// Lowercase name used in logs and audit events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Alert => "alert",
            Self::StopVariant => "stop_variant",
            Self::StopExperiment => "stop_experiment",
        }
    }
}

/// Automatic safety threshold on a metric over a trailing window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Guardrail {
    metric_id: String,
    comparison: Comparison,
    threshold: f64,
    window_secs: u64,
    action: GuardrailAction,
}

impl Guardrail {
    /// Create a guardrail.
    ///
    /// # Arguments
    ///
    /// * `metric_id` - Metric the guardrail watches
    /// * `comparison` - Which side of `threshold` is unsafe
    /// * `threshold` - Rate (binary) or mean (continuous) limit
    /// * `window` - Trailing window the measurement is taken over
    /// * `action` - Mitigation on breach
    #[must_use]
    pub fn new(
        metric_id: impl Into<String>,
        comparison: Comparison,
        threshold: f64,
        window: std::time::Duration,
        action: GuardrailAction,
    ) -> Self {
        Self {
            metric_id: metric_id.into(),
            comparison,
            threshold,
            window_secs: window.as_secs(),
            action,
        }
    }

    /// Get the watched metric ID.
    #[must_use]
    pub fn metric_id(&self) -> &str {
        &self.metric_id
    }

    /// Get the comparison direction.
    #[must_use]
    pub const fn comparison(&self) -> Comparison {
        self.comparison
    }

    /// Get the threshold.
    #[must_use]
    pub const fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Get the trailing window length in seconds.
    #[must_use]
    pub const fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Get the trailing window, capped at [`MAX_GUARDRAIL_WINDOW_SECS`].
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.window_secs.min(MAX_GUARDRAIL_WINDOW_SECS) as i64)
    }

    /// Get the mitigation action.
    #[must_use]
    pub const fn action(&self) -> GuardrailAction {
        self.action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_metric_defaults() {
        let metric = MetricDefinition::binary("conversion");
        assert_eq!(metric.kind(), MetricKind::Binary);
        assert!(metric.higher_is_better());
        assert!(!metric.is_primary());
        assert!((metric.direction_sign() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_latency_metric_direction() {
        let metric = MetricDefinition::continuous("latency_ms")
            .lower_is_better()
            .primary();
        assert_eq!(metric.kind(), MetricKind::Continuous);
        assert!(metric.is_primary());
        assert!((metric.direction_sign() + 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_comparison_breached() {
        assert!(Comparison::Above.breached(0.18, 0.10));
        assert!(!Comparison::Above.breached(0.10, 0.10));
        assert!(Comparison::Below.breached(0.4, 0.5));
        assert!(!Comparison::Below.breached(0.6, 0.5));
    }

    #[test]
    fn test_guardrail_window() {
        let guardrail = Guardrail::new(
            "error_rate",
            Comparison::Above,
            0.1,
            Duration::from_secs(600),
            GuardrailAction::StopVariant,
        );
        assert_eq!(guardrail.window_secs(), 600);
        assert_eq!(guardrail.window(), chrono::Duration::minutes(10));
        assert_eq!(guardrail.action().as_str(), "stop_variant");
    }
}
