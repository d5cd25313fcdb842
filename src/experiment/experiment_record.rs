//! Experiment - root entity of the experimentation schema

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    ExperimentStatus, Guardrail, GuardrailAction, MetricDefinition, MetricKind, TrafficSplit,
    Variant, MAX_GUARDRAIL_WINDOW_SECS,
};
use crate::{Error, Result};

/// Default significance level.
pub const DEFAULT_ALPHA: f64 = 0.05;

/// Default minimum sample size per arm before a comparison is tested.
pub const DEFAULT_MIN_SAMPLE_SIZE: u64 = 100;

/// Tolerance on the traffic split summing to 1.0.
pub const SPLIT_SUM_TOLERANCE: f64 = 1e-9;

/// A guardrail breach that is still in effect for a variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardrailViolation {
    /// Offending variant
    pub variant_id: String,
    /// Guardrail metric
    pub metric_id: String,
    /// Action that was taken
    pub action: GuardrailAction,
    /// Measured rate or mean over the trailing window
    pub observed: f64,
    /// Guardrail threshold
    pub threshold: f64,
    /// Number of observations the measurement was taken over
    pub samples: u64,
    /// When the breach was detected
    pub detected_at: DateTime<Utc>,
}

/// A controlled comparison between variants of one target component.
///
/// Mutated only through [`crate::directory::ExperimentDirectory`], which
/// enforces the lifecycle and bumps `version` on every write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    id: String,
    target_id: String,
    name: String,
    variants: Vec<Variant>,
    metrics: Vec<MetricDefinition>,
    #[serde(default)]
    guardrails: Vec<Guardrail>,
    split: TrafficSplit,
    status: ExperimentStatus,
    alpha: f64,
    min_sample_size: u64,
    version: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    violations: Vec<GuardrailViolation>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

impl Experiment {
    /// Create a builder. The experiment starts in `Draft`.
    #[must_use]
    pub fn builder(
        id: impl Into<String>,
        target_id: impl Into<String>,
        name: impl Into<String>,
    ) -> ExperimentBuilder {
        ExperimentBuilder::new(id, target_id, name)
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the target (service component) ID.
    #[must_use]
    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    /// Get the experiment name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the variants in declaration order.
    #[must_use]
    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    /// Look up a variant by ID.
    #[must_use]
    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id() == variant_id)
    }

    /// Get the control variant.
    #[must_use]
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control())
    }

    /// Iterate over the non-control variants.
    pub fn treatments(&self) -> impl Iterator<Item = &Variant> {
        self.variants.iter().filter(|v| !v.is_control())
    }

    /// Get the metric definitions.
    #[must_use]
    pub fn metrics(&self) -> &[MetricDefinition] {
        &self.metrics
    }

    /// Look up a metric by ID.
    #[must_use]
    pub fn metric(&self, metric_id: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.id() == metric_id)
    }

    /// Get the primary metric.
    #[must_use]
    pub fn primary_metric(&self) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.is_primary())
    }

    /// Get the guardrails.
    #[must_use]
    pub fn guardrails(&self) -> &[Guardrail] {
        &self.guardrails
    }

    /// Get the traffic split.
    #[must_use]
    pub const fn split(&self) -> &TrafficSplit {
        &self.split
    }

    /// Get the lifecycle status.
    #[must_use]
    pub const fn status(&self) -> ExperimentStatus {
        self.status
    }

    /// Get the significance level.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Get the minimum sample size per arm.
    #[must_use]
    pub const fn min_sample_size(&self) -> u64 {
        self.min_sample_size
    }

    /// Get the directory write version.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Get the creation timestamp.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Get the last modification timestamp.
    #[must_use]
    pub const fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Get the time the experiment first started running.
    #[must_use]
    pub const fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Get the time the experiment reached a terminal state.
    #[must_use]
    pub const fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    /// Get the guardrail violations still in effect.
    #[must_use]
    pub fn violations(&self) -> &[GuardrailViolation] {
        &self.violations
    }

    /// Whether any guardrail violation is in effect for a variant.
    #[must_use]
    pub fn has_violation(&self, variant_id: &str) -> bool {
        self.violations.iter().any(|v| v.variant_id == variant_id)
    }

    /// Get the archival annotations.
    #[must_use]
    pub const fn annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }

    /// Check every definition invariant.
    ///
    /// All problems are reported together, separated by `; `.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the definition is malformed.
    pub fn validate(&self) -> Result<()> {
        let mut problems: Vec<String> = Vec::new();

        if self.id.trim().is_empty() {
            problems.push("experiment id is empty".to_string());
        }
        if self.target_id.trim().is_empty() {
            problems.push("target id is empty".to_string());
        }

        self.validate_variants(&mut problems);
        self.validate_split(&mut problems);
        self.validate_metrics(&mut problems);
        self.validate_guardrails(&mut problems);

        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            problems.push(format!("alpha must be in (0, 1), got {}", self.alpha));
        }
        if self.min_sample_size < 2 {
            problems.push(format!(
                "min_sample_size must be at least 2, got {}",
                self.min_sample_size
            ));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "experiment '{}': {}",
                self.id,
                problems.join("; ")
            )))
        }
    }

    fn validate_variants(&self, problems: &mut Vec<String>) {
        let mut seen = HashSet::new();
        for variant in &self.variants {
            if variant.id().trim().is_empty() {
                problems.push("variant id is empty".to_string());
            } else if !seen.insert(variant.id()) {
                problems.push(format!("duplicate variant id '{}'", variant.id()));
            }
        }

        let controls = self.variants.iter().filter(|v| v.is_control()).count();
        if controls != 1 {
            problems.push(format!("expected exactly one control variant, found {controls}"));
        }
        if self.treatments().next().is_none() {
            problems.push("at least one non-control variant is required".to_string());
        }
    }

    fn validate_split(&self, problems: &mut Vec<String>) {
        if let Some(control) = self.control() {
            if self.split.control_id() != control.id() {
                problems.push(format!(
                    "split control '{}' does not match control variant '{}'",
                    self.split.control_id(),
                    control.id()
                ));
            }
        }

        let mut covered = HashSet::new();
        for entry in self.split.entries() {
            if self.variant(entry.variant_id()).is_none() {
                problems.push(format!("split references unknown variant '{}'", entry.variant_id()));
            }
            if !covered.insert(entry.variant_id()) {
                problems.push(format!("split lists variant '{}' twice", entry.variant_id()));
            }
            if !entry.share().is_finite() || !(0.0..=1.0).contains(&entry.share()) {
                problems.push(format!(
                    "share for '{}' must be in [0, 1], got {}",
                    entry.variant_id(),
                    entry.share()
                ));
            }
        }
        for variant in &self.variants {
            if !covered.contains(variant.id()) {
                problems.push(format!("variant '{}' has no traffic share", variant.id()));
            }
        }

        let total = self.split.total_share();
        if (total - 1.0).abs() > SPLIT_SUM_TOLERANCE {
            problems.push(format!("traffic shares must sum to 1.0, got {total}"));
        }
    }

    fn validate_metrics(&self, problems: &mut Vec<String>) {
        if self.metrics.is_empty() {
            problems.push("at least one metric is required".to_string());
        }
        let mut seen = HashSet::new();
        for metric in &self.metrics {
            if metric.id().trim().is_empty() {
                problems.push("metric id is empty".to_string());
            } else if !seen.insert(metric.id()) {
                problems.push(format!("duplicate metric id '{}'", metric.id()));
            }
        }
        let primaries = self.metrics.iter().filter(|m| m.is_primary()).count();
        if primaries != 1 {
            problems.push(format!("expected exactly one primary metric, found {primaries}"));
        }
    }

    fn validate_guardrails(&self, problems: &mut Vec<String>) {
        for guardrail in &self.guardrails {
            let Some(metric) = self.metric(guardrail.metric_id()) else {
                problems.push(format!(
                    "guardrail references unknown metric '{}'",
                    guardrail.metric_id()
                ));
                continue;
            };
            if !guardrail.threshold().is_finite() {
                problems.push(format!("guardrail '{}' threshold is not finite", metric.id()));
            } else if metric.kind() == MetricKind::Binary
                && !(0.0..=1.0).contains(&guardrail.threshold())
            {
                problems.push(format!(
                    "guardrail '{}' is a rate and needs a threshold in [0, 1], got {}",
                    metric.id(),
                    guardrail.threshold()
                ));
            }
            if guardrail.window_secs() == 0 || guardrail.window_secs() > MAX_GUARDRAIL_WINDOW_SECS {
                problems.push(format!(
                    "guardrail '{}' window must be between 1s and {MAX_GUARDRAIL_WINDOW_SECS}s",
                    metric.id()
                ));
            }
        }
    }

    /// Apply a lifecycle transition, maintaining timestamps.
    ///
    /// Returns the previous status.
    pub(crate) fn transition(
        &mut self,
        next: ExperimentStatus,
        at: DateTime<Utc>,
    ) -> Result<ExperimentStatus> {
        let previous = self.status;
        if !previous.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "experiment '{}' cannot move from {previous} to {next}",
                self.id
            )));
        }
        self.status = next;
        if next == ExperimentStatus::Running && self.started_at.is_none() {
            self.started_at = Some(at);
        }
        if next.is_terminal() {
            self.ended_at = Some(at);
        }
        self.touch(at);
        Ok(previous)
    }

    pub(crate) fn touch(&mut self, at: DateTime<Utc>) {
        self.updated_at = at;
        self.version += 1;
    }

    pub(crate) fn split_mut(&mut self) -> &mut TrafficSplit {
        &mut self.split
    }

    pub(crate) fn set_split(&mut self, split: TrafficSplit) {
        self.split = split;
    }

    /// Record a violation unless the same (variant, metric) is already in
    /// effect. Returns whether it was new.
    pub(crate) fn push_violation(&mut self, violation: GuardrailViolation) -> bool {
        let exists = self
            .violations
            .iter()
            .any(|v| v.variant_id == violation.variant_id && v.metric_id == violation.metric_id);
        if exists {
            return false;
        }
        self.violations.push(violation);
        true
    }

    pub(crate) fn annotate(&mut self, key: String, value: String) {
        self.annotations.insert(key, value);
    }

    /// Reset lifecycle fields for a freshly created draft.
    pub(crate) fn reset_as_draft(&mut self, at: DateTime<Utc>) {
        self.status = ExperimentStatus::Draft;
        self.version = 0;
        self.created_at = at;
        self.updated_at = at;
        self.started_at = None;
        self.ended_at = None;
        self.violations.clear();
    }

    /// Carry lifecycle fields over from the stored draft on update.
    pub(crate) fn inherit_lifecycle(&mut self, stored: &Self) {
        self.status = stored.status;
        self.version = stored.version;
        self.created_at = stored.created_at;
        self.updated_at = stored.updated_at;
        self.started_at = stored.started_at;
        self.ended_at = stored.ended_at;
        self.violations.clone_from(&stored.violations);
        self.annotations.clone_from(&stored.annotations);
    }
}

/// Builder for `Experiment`.
#[derive(Debug)]
pub struct ExperimentBuilder {
    id: String,
    target_id: String,
    name: String,
    variants: Vec<Variant>,
    metrics: Vec<MetricDefinition>,
    guardrails: Vec<Guardrail>,
    split: Option<TrafficSplit>,
    alpha: f64,
    min_sample_size: u64,
    created_at: DateTime<Utc>,
}

impl ExperimentBuilder {
    /// Create a new builder with required fields.
    #[must_use]
    pub fn new(id: impl Into<String>, target_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target_id: target_id.into(),
            name: name.into(),
            variants: Vec::new(),
            metrics: Vec::new(),
            guardrails: Vec::new(),
            split: None,
            alpha: DEFAULT_ALPHA,
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            created_at: Utc::now(),
        }
    }

    /// Add a variant. Declaration order is the assignment walk order.
    #[must_use]
    pub fn variant(mut self, variant: Variant) -> Self {
        self.variants.push(variant);
        self
    }

    /// Add a metric.
    #[must_use]
    pub fn metric(mut self, metric: MetricDefinition) -> Self {
        self.metrics.push(metric);
        self
    }

    /// Add a guardrail.
    #[must_use]
    pub fn guardrail(mut self, guardrail: Guardrail) -> Self {
        self.guardrails.push(guardrail);
        self
    }

    /// Set the traffic split as `(variant_id, share)` pairs.
    ///
    /// Without this, traffic is split evenly across the variants.
    #[must_use]
    pub fn split<I, S>(mut self, shares: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        self.split = Some(TrafficSplit::new(String::new(), shares));
        self
    }

    /// Set the significance level.
    #[must_use]
    pub const fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the minimum sample size per arm.
    #[must_use]
    pub const fn min_sample_size(mut self, min_sample_size: u64) -> Self {
        self.min_sample_size = min_sample_size;
        self
    }

    /// Set a custom creation timestamp (useful for deserialization/testing).
    #[must_use]
    pub const fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Build the `Experiment` in `Draft`. Invariants are checked on
    /// validation, not here.
    #[must_use]
    pub fn build(self) -> Experiment {
        let control_id = self
            .variants
            .iter()
            .find(|v| v.is_control())
            .map(|v| v.id().to_string())
            .unwrap_or_default();

        let mut split = match self.split {
            Some(split) => TrafficSplit::new(
                control_id,
                split
                    .entries()
                    .iter()
                    .map(|e| (e.variant_id().to_string(), e.share())),
            ),
            None => TrafficSplit::equal(control_id, self.variants.iter().map(Variant::id)),
        };
        split.align_to(self.variants.iter().map(Variant::id));

        Experiment {
            id: self.id,
            target_id: self.target_id,
            name: self.name,
            variants: self.variants,
            metrics: self.metrics,
            guardrails: self.guardrails,
            split,
            status: ExperimentStatus::Draft,
            alpha: self.alpha,
            min_sample_size: self.min_sample_size,
            version: 0,
            created_at: self.created_at,
            updated_at: self.created_at,
            started_at: None,
            ended_at: None,
            violations: Vec::new(),
            annotations: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{Comparison, GuardrailAction};
    use serde_json::json;
    use std::time::Duration;

    fn checkout(shares: [f64; 2]) -> Experiment {
        Experiment::builder("exp-1", "checkout", "Checkout button colour")
            .variant(Variant::control("control", "Blue", json!({"colour": "blue"})))
            .variant(Variant::new("green", "Green", json!({"colour": "green"})))
            .metric(MetricDefinition::binary("conversion").primary())
            .split([("control", shares[0]), ("green", shares[1])])
            .build()
    }

    #[test]
    fn test_builder_defaults() {
        let exp = checkout([0.5, 0.5]);
        assert_eq!(exp.status(), ExperimentStatus::Draft);
        assert_eq!(exp.split().control_id(), "control");
        assert!((exp.alpha() - DEFAULT_ALPHA).abs() < f64::EPSILON);
        assert_eq!(exp.min_sample_size(), DEFAULT_MIN_SAMPLE_SIZE);
        assert_eq!(exp.version(), 0);
        assert!(exp.validate().is_ok());
    }

    #[test]
    fn test_split_sum_must_be_one() {
        let err = checkout([0.5, 0.47]).validate().unwrap_err();
        assert!(err.to_string().contains("sum to 1.0"));
    }

    #[test]
    fn test_requires_exactly_one_control() {
        let exp = Experiment::builder("exp-2", "checkout", "No control")
            .variant(Variant::new("a", "A", json!({})))
            .variant(Variant::new("b", "B", json!({})))
            .metric(MetricDefinition::binary("conversion").primary())
            .build();
        let err = exp.validate().unwrap_err().to_string();
        assert!(err.contains("exactly one control"));
    }

    #[test]
    fn test_requires_treatment() {
        let exp = Experiment::builder("exp-3", "checkout", "Control only")
            .variant(Variant::control("a", "A", json!({})))
            .metric(MetricDefinition::binary("conversion").primary())
            .build();
        let err = exp.validate().unwrap_err().to_string();
        assert!(err.contains("non-control variant"));
    }

    #[test]
    fn test_requires_primary_metric() {
        let exp = Experiment::builder("exp-4", "checkout", "No primary")
            .variant(Variant::control("a", "A", json!({})))
            .variant(Variant::new("b", "B", json!({})))
            .metric(MetricDefinition::binary("conversion"))
            .build();
        let err = exp.validate().unwrap_err().to_string();
        assert!(err.contains("primary metric"));
    }

    #[test]
    fn test_guardrail_on_unknown_metric() {
        let exp = Experiment::builder("exp-5", "checkout", "Bad guardrail")
            .variant(Variant::control("a", "A", json!({})))
            .variant(Variant::new("b", "B", json!({})))
            .metric(MetricDefinition::binary("conversion").primary())
            .guardrail(Guardrail::new(
                "error_rate",
                Comparison::Above,
                0.1,
                Duration::from_secs(600),
                GuardrailAction::Alert,
            ))
            .build();
        let err = exp.validate().unwrap_err().to_string();
        assert!(err.contains("unknown metric 'error_rate'"));
    }

    #[test]
    fn test_transition_sets_timestamps() {
        let mut exp = checkout([0.5, 0.5]);
        let now = Utc::now();
        exp.transition(ExperimentStatus::Validated, now).unwrap();
        exp.transition(ExperimentStatus::Running, now).unwrap();
        assert_eq!(exp.started_at(), Some(now));
        assert_eq!(exp.version(), 2);

        exp.transition(ExperimentStatus::Stopped, now).unwrap();
        assert_eq!(exp.ended_at(), Some(now));
        assert!(exp.transition(ExperimentStatus::Running, now).is_err());
    }

    #[test]
    fn test_violation_recorded_once() {
        let mut exp = checkout([0.5, 0.5]);
        let violation = GuardrailViolation {
            variant_id: "green".to_string(),
            metric_id: "conversion".to_string(),
            action: GuardrailAction::Alert,
            observed: 0.01,
            threshold: 0.05,
            samples: 50,
            detected_at: Utc::now(),
        };
        assert!(exp.push_violation(violation.clone()));
        assert!(!exp.push_violation(violation));
        assert!(exp.has_violation("green"));
        assert!(!exp.has_violation("control"));
    }
}
