//! Guardrail Monitor
//!
//! Periodically measures every guardrail metric of every running experiment
//! over its trailing window and acts on breaches:
//!
//! | action            | effect                                           | log      |
//! |-------------------|--------------------------------------------------|----------|
//! | `alert`           | violation recorded, winner rule excludes variant | `warn!`  |
//! | `stop_variant`    | variant removed, its share falls to control      | `error!` |
//! | `stop_experiment` | experiment stopped, all traffic to baseline      | `error!` |
//!
//! Only non-control variants that are still in the split are evaluated, and
//! a (variant, metric) pair already in violation is skipped, so repeated
//! cycles never emit a second event for the same breach.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::directory::ExperimentDirectory;
use crate::experiment::{Experiment, Guardrail, GuardrailAction, GuardrailViolation};
use crate::metrics::{dedup, AggregateTable, ObservationStore};
use crate::Result;

/// Monitor tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardrailConfig {
    /// Seconds between monitoring cycles
    pub interval_secs: u64,
    /// Observations required in the window before a guardrail is evaluated
    pub min_samples: u64,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            min_samples: 50,
        }
    }
}

impl GuardrailConfig {
    /// Cycle interval as a `Duration`.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// A breach detected and acted on during one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailBreach {
    /// Experiment
    pub experiment_id: String,
    /// Offending variant
    pub variant_id: String,
    /// Guardrail metric
    pub metric_id: String,
    /// Action taken
    pub action: GuardrailAction,
    /// Measured rate or mean
    pub observed: f64,
    /// Guardrail threshold
    pub threshold: f64,
    /// Observations in the window
    pub samples: u64,
}

/// Guardrail monitor over a directory and an observation store.
#[derive(Debug)]
pub struct GuardrailMonitor<S> {
    directory: Arc<ExperimentDirectory>,
    store: Arc<S>,
    min_samples: u64,
    dedup_window: Option<chrono::Duration>,
}

impl<S: ObservationStore + 'static> GuardrailMonitor<S> {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        directory: Arc<ExperimentDirectory>,
        store: Arc<S>,
        min_samples: u64,
        dedup_window: Option<chrono::Duration>,
    ) -> Self {
        Self {
            directory,
            store,
            min_samples,
            dedup_window,
        }
    }

    /// Run one monitoring cycle at `now`. Returns the breaches acted on.
    ///
    /// Failures on one experiment are logged and do not stop the cycle.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Vec<GuardrailBreach> {
        let mut breaches = Vec::new();
        for experiment in self.directory.running() {
            if experiment.guardrails().is_empty() {
                continue;
            }
            if let Err(e) = self.check_experiment(&experiment, now, &mut breaches).await {
                error!(
                    experiment_id = experiment.id(),
                    error = %e,
                    "guardrail evaluation failed"
                );
            }
        }
        breaches
    }

    async fn check_experiment(
        &self,
        experiment: &Experiment,
        now: DateTime<Utc>,
        breaches: &mut Vec<GuardrailBreach>,
    ) -> Result<()> {
        let widest = experiment
            .guardrails()
            .iter()
            .map(Guardrail::window)
            .max()
            .unwrap_or_else(chrono::Duration::zero);
        let observations = self.store.scan(experiment.id(), Some(now - widest)).await?;

        for guardrail in experiment.guardrails() {
            let Some(metric) = experiment.metric(guardrail.metric_id()) else {
                continue;
            };
            let since = now - guardrail.window();
            let window: Vec<_> = observations
                .iter()
                .filter(|o| o.metric_id() == metric.id())
                .filter(|o| o.recorded_at() >= since && o.recorded_at() <= now)
                .cloned()
                .collect();
            let window = dedup(window, self.dedup_window);
            let table = AggregateTable::build(&window, std::slice::from_ref(metric));

            for variant in experiment.treatments() {
                if experiment.split().is_removed(variant.id())
                    || experiment
                        .violations()
                        .iter()
                        .any(|v| v.variant_id == variant.id() && v.metric_id == metric.id())
                {
                    continue;
                }
                let aggregate = table.get_or_empty(variant.id(), metric);
                if aggregate.count() < self.min_samples {
                    debug!(
                        experiment_id = experiment.id(),
                        variant_id = variant.id(),
                        metric_id = metric.id(),
                        samples = aggregate.count(),
                        "guardrail skipped: not enough samples"
                    );
                    continue;
                }
                let observed = aggregate.value();
                if !guardrail.comparison().breached(observed, guardrail.threshold()) {
                    continue;
                }

                let breach = GuardrailBreach {
                    experiment_id: experiment.id().to_string(),
                    variant_id: variant.id().to_string(),
                    metric_id: metric.id().to_string(),
                    action: guardrail.action(),
                    observed,
                    threshold: guardrail.threshold(),
                    samples: aggregate.count(),
                };
                if self.act(&breach, now)? {
                    let stopped = breach.action == GuardrailAction::StopExperiment;
                    breaches.push(breach);
                    if stopped {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply the guardrail action. Returns `false` if the breach was
    /// already handled.
    fn act(&self, breach: &GuardrailBreach, now: DateTime<Utc>) -> Result<bool> {
        let violation = GuardrailViolation {
            variant_id: breach.variant_id.clone(),
            metric_id: breach.metric_id.clone(),
            action: breach.action,
            observed: breach.observed,
            threshold: breach.threshold,
            samples: breach.samples,
            detected_at: now,
        };
        if !self.directory.record_violation(&breach.experiment_id, violation)? {
            return Ok(false);
        }

        let measurement = json!({
            "metric_id": breach.metric_id,
            "observed": breach.observed,
            "threshold": breach.threshold,
            "samples": breach.samples,
        });
        match breach.action {
            GuardrailAction::Alert => {
                warn!(
                    experiment_id = %breach.experiment_id,
                    variant_id = %breach.variant_id,
                    metric_id = %breach.metric_id,
                    observed = breach.observed,
                    threshold = breach.threshold,
                    "guardrail breached"
                );
            }
            GuardrailAction::StopVariant => {
                self.directory
                    .stop_variant(&breach.experiment_id, &breach.variant_id, measurement)?;
                error!(
                    experiment_id = %breach.experiment_id,
                    variant_id = %breach.variant_id,
                    metric_id = %breach.metric_id,
                    observed = breach.observed,
                    threshold = breach.threshold,
                    "guardrail breached: variant stopped"
                );
            }
            GuardrailAction::StopExperiment => {
                self.directory.stop(
                    &breach.experiment_id,
                    &format!(
                        "guardrail '{}' breached by variant '{}' ({} vs threshold {})",
                        breach.metric_id, breach.variant_id, breach.observed, breach.threshold
                    ),
                )?;
                error!(
                    experiment_id = %breach.experiment_id,
                    variant_id = %breach.variant_id,
                    metric_id = %breach.metric_id,
                    observed = breach.observed,
                    threshold = breach.threshold,
                    "guardrail breached: experiment stopped"
                );
            }
        }
        Ok(true)
    }

    /// Run cycles every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_cycle(Utc::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::EventKind;
    use crate::experiment::{Comparison, MetricDefinition, Observation, Variant};
    use crate::metrics::MemoryObservationStore;

    fn setup(action: GuardrailAction) -> (Arc<ExperimentDirectory>, Arc<MemoryObservationStore>) {
        let directory = Arc::new(ExperimentDirectory::new());
        directory
            .create(
                Experiment::builder("exp-1", "checkout", "test")
                    .variant(Variant::control("a", "A", json!({})))
                    .variant(Variant::new("b", "B", json!({})))
                    .metric(MetricDefinition::binary("conversion").primary())
                    .metric(MetricDefinition::binary("error").lower_is_better())
                    .guardrail(Guardrail::new(
                        "error",
                        Comparison::Above,
                        0.05,
                        Duration::from_secs(300),
                        action,
                    ))
                    .build(),
            )
            .unwrap();
        directory.start("exp-1").unwrap();
        (directory, Arc::new(MemoryObservationStore::new()))
    }

    async fn feed(store: &MemoryObservationStore, variant: &str, errors: usize, total: usize) {
        let batch: Vec<_> = (0..total)
            .map(|i| {
                let value = if i < errors { 1.0 } else { 0.0 };
                Observation::new("exp-1", variant, "error", value, format!("{variant}-{i}"))
            })
            .collect();
        store.append(&batch).await.unwrap();
    }

    #[test]
    fn test_default_cadence_is_minutes() {
        let config = GuardrailConfig::default();
        assert_eq!(config.interval(), Duration::from_secs(60));
        assert_eq!(config.min_samples, 50);
    }

    #[tokio::test]
    async fn test_stop_variant_once() {
        let (directory, store) = setup(GuardrailAction::StopVariant);
        feed(&store, "a", 2, 100).await;
        feed(&store, "b", 18, 100).await;

        let monitor = GuardrailMonitor::new(Arc::clone(&directory), store, 50, None);
        let breaches = monitor.run_cycle(Utc::now()).await;
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].variant_id, "b");
        assert!((breaches[0].observed - 0.18).abs() < 1e-12);

        assert!(monitor.run_cycle(Utc::now()).await.is_empty());
        assert_eq!(directory.events().count("exp-1", EventKind::VariantStopped), 1);
        assert!(directory.get("exp-1").unwrap().split().is_removed("b"));
    }

    #[tokio::test]
    async fn test_alert_records_violation_only() {
        let (directory, store) = setup(GuardrailAction::Alert);
        feed(&store, "b", 10, 100).await;

        let monitor = GuardrailMonitor::new(Arc::clone(&directory), store, 50, None);
        assert_eq!(monitor.run_cycle(Utc::now()).await.len(), 1);

        let exp = directory.get("exp-1").unwrap();
        assert!(exp.has_violation("b"));
        assert!(!exp.split().is_removed("b"));
        assert_eq!(exp.status(), crate::experiment::ExperimentStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_experiment() {
        let (directory, store) = setup(GuardrailAction::StopExperiment);
        feed(&store, "b", 30, 100).await;

        let monitor = GuardrailMonitor::new(Arc::clone(&directory), store, 50, None);
        monitor.run_cycle(Utc::now()).await;

        assert!(directory.get_active("checkout").is_none());
        assert_eq!(
            directory.get("exp-1").unwrap().status(),
            crate::experiment::ExperimentStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_too_few_samples_skipped() {
        let (directory, store) = setup(GuardrailAction::StopVariant);
        feed(&store, "b", 10, 20).await;

        let monitor = GuardrailMonitor::new(Arc::clone(&directory), store, 50, None);
        assert!(monitor.run_cycle(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn test_old_observations_outside_window() {
        let (directory, store) = setup(GuardrailAction::StopVariant);
        let old = Utc::now() - chrono::Duration::hours(1);
        let batch: Vec<_> = (0..100)
            .map(|i| {
                Observation::builder("exp-1", "b", "error", 1.0, format!("r{i}"))
                    .recorded_at(old)
                    .build()
            })
            .collect();
        store.append(&batch).await.unwrap();

        let monitor = GuardrailMonitor::new(Arc::clone(&directory), store, 50, None);
        assert!(monitor.run_cycle(Utc::now()).await.is_empty());
    }
}
