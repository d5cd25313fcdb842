//! Engine facade
//!
//! Wires the directory, metrics pipeline, analyzer, guardrail monitor and
//! promotion controller together behind the two request-path hooks and the
//! admin surface.
//!
//! ```rust,no_run
//! use trueno_ab::{Engine, Subject};
//!
//! # async fn demo() -> trueno_ab::Result<()> {
//! let engine = Engine::builder().build()?;
//!
//! let subject = Subject::new("req-1").user("user-42");
//! if let Some(resolution) = engine.resolve("checkout", &subject) {
//!     // serve with resolution.config_overrides, then report the outcome
//!     engine.record(
//!         &resolution.experiment_id,
//!         &resolution.variant_id,
//!         subject.request_id(),
//!         [("conversion", 1.0)],
//!     );
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::assignment::{self, AssignmentLog, IdentityScope, Subject};
use crate::config::EngineConfig;
use crate::directory::{AuditEvent, ExperimentDirectory};
use crate::experiment::{Experiment, ExperimentBuilder, Observation};
use crate::guardrail::GuardrailMonitor;
use crate::metrics::{MemoryObservationStore, MetricsPipeline, ObservationStore, PipelineStats};
use crate::promotion::{
    Baseline, BaselineRegistry, ConfigApplier, NoopApplier, PromotionController, PromotionState,
    RolloutStrategy,
};
use crate::stats::{Analyzer, ExperimentResults};
use crate::{Error, Result};

/// What the inbound hook hands back to the host for one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// Experiment the subject was assigned under
    pub experiment_id: String,
    /// Assigned variant
    pub variant_id: String,
    /// Variant configuration to serve with
    pub config_overrides: serde_json::Value,
    /// Which identity the assignment was made on
    pub scope: IdentityScope,
}

/// Builder for [`Engine`].
pub struct EngineBuilder<S = MemoryObservationStore> {
    config: EngineConfig,
    store: Arc<S>,
    directory: Option<Arc<ExperimentDirectory>>,
    baselines: Option<Arc<BaselineRegistry>>,
    applier: Arc<dyn ConfigApplier>,
}

impl Default for EngineBuilder<MemoryObservationStore> {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            store: Arc::new(MemoryObservationStore::new()),
            directory: None,
            baselines: None,
            applier: Arc::new(NoopApplier),
        }
    }
}

impl<S: ObservationStore + 'static> EngineBuilder<S> {
    /// Use this configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a different observation store.
    #[must_use]
    pub fn store<T: ObservationStore + 'static>(self, store: Arc<T>) -> EngineBuilder<T> {
        EngineBuilder {
            config: self.config,
            store,
            directory: self.directory,
            baselines: self.baselines,
            applier: self.applier,
        }
    }

    /// Share an existing directory (e.g. one rebuilt with
    /// [`ExperimentDirectory::from_definitions`]).
    #[must_use]
    pub fn directory(mut self, directory: Arc<ExperimentDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Share an existing baseline registry.
    #[must_use]
    pub fn baselines(mut self, baselines: Arc<BaselineRegistry>) -> Self {
        self.baselines = Some(baselines);
        self
    }

    /// Outbound seam for promotions.
    #[must_use]
    pub fn applier(mut self, applier: Arc<dyn ConfigApplier>) -> Self {
        self.applier = applier;
        self
    }

    /// Validate the configuration and start the metrics pipeline.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidConfig` if the configuration is rejected
    /// - `Error::Other` if called outside a Tokio runtime
    pub fn build(self) -> Result<Engine<S>> {
        self.config.validate()?;

        let directory = self.directory.unwrap_or_default();
        let baselines = self.baselines.unwrap_or_default();
        let (pipeline, _flush_task) = MetricsPipeline::spawn(Arc::clone(&self.store), &self.config.pipeline)?;
        let dedup_window = self.config.dedup_window();

        let monitor = Arc::new(GuardrailMonitor::new(
            Arc::clone(&directory),
            Arc::clone(&self.store),
            self.config.guardrail.min_samples,
            dedup_window,
        ));
        let promotion = Arc::new(PromotionController::new(
            Arc::clone(&directory),
            baselines,
            self.applier,
        ));
        let assignments = self.config.record_assignments.then(AssignmentLog::new);

        info!(
            flush_interval_ms = self.config.pipeline.flush_interval_ms,
            guardrail_interval_secs = self.config.guardrail.interval_secs,
            record_assignments = self.config.record_assignments,
            "experimentation engine started"
        );

        Ok(Engine {
            analyzer: Analyzer::new().with_dedup_window(dedup_window),
            config: self.config,
            directory,
            store: self.store,
            pipeline,
            monitor,
            promotion,
            assignments,
        })
    }
}

/// Handles of the background loops started by [`Engine::spawn_background`].
#[derive(Debug)]
pub struct BackgroundTasks {
    /// Guardrail monitoring loop
    pub guardrail: JoinHandle<()>,
    /// Promotion ramp ticker
    pub promotion: JoinHandle<()>,
}

impl BackgroundTasks {
    /// Stop both loops.
    pub fn shutdown(self) {
        self.guardrail.abort();
        self.promotion.abort();
    }
}

/// Experimentation engine.
pub struct Engine<S = MemoryObservationStore> {
    config: EngineConfig,
    directory: Arc<ExperimentDirectory>,
    store: Arc<S>,
    pipeline: MetricsPipeline,
    analyzer: Analyzer,
    monitor: Arc<GuardrailMonitor<S>>,
    promotion: Arc<PromotionController>,
    assignments: Option<AssignmentLog>,
}

impl Engine<MemoryObservationStore> {
    /// Builder with default configuration and an in-memory store.
    #[must_use]
    pub fn builder() -> EngineBuilder<MemoryObservationStore> {
        EngineBuilder::default()
    }
}

impl<S: ObservationStore + 'static> Engine<S> {
    // ------------------------------------------------------------------
    // Request path
    // ------------------------------------------------------------------

    /// Resolve the variant to serve for `subject` on `target_id`.
    ///
    /// `None` means "serve the baseline": no running experiment on the
    /// target, or the subject carries no usable identity. Never fails.
    #[must_use]
    pub fn resolve(&self, target_id: &str, subject: &Subject) -> Option<Resolution> {
        let experiment = self.directory.get_active(target_id)?;
        let Some((identity, scope)) = subject.assignment_key() else {
            debug!(target_id, "subject has no identity, serving baseline");
            return None;
        };

        let variant_id = assignment::resolve(identity, experiment.id(), experiment.split());
        let variant = experiment.variant(variant_id)?;

        if let Some(log) = &self.assignments {
            log.record(experiment.id(), identity, scope, variant_id);
        }
        trace!(
            target_id,
            experiment_id = experiment.id(),
            variant_id,
            ?scope,
            "resolved"
        );

        Some(Resolution {
            experiment_id: experiment.id().to_string(),
            variant_id: variant_id.to_string(),
            config_overrides: variant.config().clone(),
            scope,
        })
    }

    /// Report the outcome of a unit of work: one observation per metric.
    ///
    /// Unknown experiments, variants and metrics are ignored. Never blocks
    /// and never fails; returns how many observations were accepted.
    pub fn record<I, K>(
        &self,
        experiment_id: &str,
        variant_id: &str,
        request_id: &str,
        outcome: I,
    ) -> usize
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        let Some(experiment) = self.directory.get(experiment_id) else {
            debug!(experiment_id, "outcome for unknown experiment ignored");
            return 0;
        };
        if experiment.variant(variant_id).is_none() {
            debug!(experiment_id, variant_id, "outcome for unknown variant ignored");
            return 0;
        }

        let mut accepted = 0;
        for (metric_id, value) in outcome {
            let metric_id = metric_id.as_ref();
            if experiment.metric(metric_id).is_none() || !value.is_finite() {
                trace!(experiment_id, metric_id, "observation ignored");
                continue;
            }
            let observation =
                Observation::new(experiment_id, variant_id, metric_id, value, request_id);
            if self.pipeline.record(observation) {
                accepted += 1;
            }
        }
        accepted
    }

    // ------------------------------------------------------------------
    // Admin surface
    // ------------------------------------------------------------------

    /// Experiment builder preloaded with the configured `alpha` and
    /// `min_sample_size`.
    #[must_use]
    pub fn experiment(
        &self,
        id: impl Into<String>,
        target_id: impl Into<String>,
        name: impl Into<String>,
    ) -> ExperimentBuilder {
        Experiment::builder(id, target_id, name)
            .alpha(self.config.alpha)
            .min_sample_size(self.config.min_sample_size)
    }

    /// Register a draft experiment.
    ///
    /// # Errors
    ///
    /// See [`ExperimentDirectory::create`].
    pub fn create(&self, experiment: Experiment) -> Result<Arc<Experiment>> {
        self.directory.create(experiment)
    }

    /// Replace a draft experiment.
    ///
    /// # Errors
    ///
    /// See [`ExperimentDirectory::update`].
    pub fn update(&self, experiment: Experiment) -> Result<Arc<Experiment>> {
        self.directory.update(experiment)
    }

    /// Start an experiment.
    ///
    /// # Errors
    ///
    /// See [`ExperimentDirectory::start`].
    pub fn start(&self, experiment_id: &str) -> Result<Arc<Experiment>> {
        self.directory.start(experiment_id)
    }

    /// Pause a running experiment.
    ///
    /// # Errors
    ///
    /// See [`ExperimentDirectory::pause`].
    pub fn pause(&self, experiment_id: &str) -> Result<Arc<Experiment>> {
        self.directory.pause(experiment_id)
    }

    /// Resume a paused experiment.
    ///
    /// # Errors
    ///
    /// See [`ExperimentDirectory::resume`].
    pub fn resume(&self, experiment_id: &str) -> Result<Arc<Experiment>> {
        self.directory.resume(experiment_id)
    }

    /// Stop an experiment.
    ///
    /// # Errors
    ///
    /// See [`ExperimentDirectory::stop`].
    pub fn stop(&self, experiment_id: &str, reason: &str) -> Result<Arc<Experiment>> {
        let stopped = self.directory.stop(experiment_id, reason)?;
        self.prune_assignments();
        Ok(stopped)
    }

    /// Analyze everything the store holds for an experiment.
    ///
    /// Results lag the request path by at most the pipeline flush interval.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an unknown experiment
    /// - store errors from the scan
    pub async fn results(&self, experiment_id: &str) -> Result<ExperimentResults> {
        let experiment = self
            .directory
            .get(experiment_id)
            .ok_or_else(|| Error::experiment_not_found(experiment_id))?;
        let observations = self.store.scan(experiment_id, None).await?;
        debug!(experiment_id, observations = observations.len(), "analyzing");

        let analyzer = self.analyzer.clone();
        tokio::task::spawn_blocking(move || analyzer.analyze(&experiment, observations))
            .await
            .map_err(|e| Error::Other(format!("analysis task failed: {e}")))
    }

    /// Promote a variant.
    ///
    /// # Errors
    ///
    /// See [`PromotionController::promote`].
    pub fn promote(
        &self,
        experiment_id: &str,
        variant_id: &str,
        strategy: &RolloutStrategy,
    ) -> Result<PromotionState> {
        let state = self.promotion.promote(experiment_id, variant_id, strategy)?;
        if matches!(state, PromotionState::Applied { .. }) {
            self.prune_assignments();
        }
        Ok(state)
    }

    /// Drop logged assignments of experiments that ended or no longer
    /// exist. Returns how many were dropped.
    ///
    /// `stop` and `promote` call this; experiments ended by a guardrail or a
    /// ramp are released on the next call.
    pub fn prune_assignments(&self) -> usize {
        let Some(log) = &self.assignments else {
            return 0;
        };
        let dropped = log.retain_experiments(|experiment_id| {
            self.directory
                .get(experiment_id)
                .is_some_and(|experiment| !experiment.status().is_terminal())
        });
        if dropped > 0 {
            debug!(dropped, "released assignments of ended experiments");
        }
        dropped
    }

    /// Current baseline of a target.
    #[must_use]
    pub fn baseline(&self, target_id: &str) -> Option<Arc<Baseline>> {
        self.promotion.baselines().get(target_id)
    }

    /// Install the configuration a target runs before any promotion.
    pub fn seed_baseline(&self, target_id: impl Into<String>, config: serde_json::Value) {
        self.promotion.baselines().seed(target_id, config);
    }

    /// Audit trail of an experiment.
    #[must_use]
    pub fn events(&self, experiment_id: &str) -> Vec<AuditEvent> {
        self.directory.events().for_experiment(experiment_id)
    }

    /// Pipeline counters.
    #[must_use]
    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.stats()
    }

    /// Wait for every accepted observation to reach the store.
    ///
    /// # Errors
    ///
    /// `Error::Other` if the flush task has stopped.
    pub async fn flush(&self) -> Result<()> {
        self.pipeline.flush().await
    }

    /// Start the guardrail loop and the promotion ticker on the current
    /// runtime.
    #[must_use]
    pub fn spawn_background(&self) -> BackgroundTasks {
        BackgroundTasks {
            guardrail: Arc::clone(&self.monitor).spawn(self.config.guardrail.interval()),
            promotion: Arc::clone(&self.promotion).spawn(self.config.promotion.tick_interval()),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Experiment directory.
    #[must_use]
    pub const fn directory(&self) -> &Arc<ExperimentDirectory> {
        &self.directory
    }

    /// Observation store.
    #[must_use]
    pub const fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Guardrail monitor, for running cycles on demand.
    #[must_use]
    pub const fn monitor(&self) -> &Arc<GuardrailMonitor<S>> {
        &self.monitor
    }

    /// Promotion controller, for ticking ramps on demand.
    #[must_use]
    pub const fn promotion(&self) -> &Arc<PromotionController> {
        &self.promotion
    }

    /// Assignment log, when `record_assignments` is on.
    #[must_use]
    pub const fn assignments(&self) -> Option<&AssignmentLog> {
        self.assignments.as_ref()
    }
}
