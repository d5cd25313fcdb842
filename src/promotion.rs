//! Promotion Controller
//!
//! Turns a winning variant into the target's new baseline configuration.
//!
//! - **Immediate**: apply the variant's configuration through the
//!   [`ConfigApplier`], swap the baseline atomically and complete the
//!   experiment.
//! - **Gradual**: ramp the winner's share through `steps` (default
//!   5% → 25% → 50% → 100%), holding each step for `hold` without a
//!   guardrail violation on the winner before moving on. The last step
//!   applies the baseline as above. A violation aborts the ramp: the winner
//!   is removed from the split and the baseline is untouched.
//!
//! Failure never leaves a target without a configuration: the
//! last-known-good baseline stays in place and the caller gets
//! [`Error::PromotionFailed`]. Repeating a promotion that already took
//! effect is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::directory::{EventKind, ExperimentDirectory};
use crate::experiment::{Experiment, ExperimentStatus};
use crate::{Error, Result};

/// Default gradual rollout steps (winner share).
pub const DEFAULT_ROLLOUT_STEPS: [f64; 4] = [0.05, 0.25, 0.5, 1.0];

/// Default hold time per step (24h).
pub const DEFAULT_HOLD_SECS: u64 = 24 * 60 * 60;

/// Longest hold a rollout step may ask for (90 days).
pub const MAX_HOLD_SECS: u64 = 90 * 24 * 60 * 60;

/// Outbound seam that makes a configuration live for a target.
pub trait ConfigApplier: Send + Sync {
    /// Apply `config` as the baseline of `target_id`.
    ///
    /// # Errors
    ///
    /// Any error aborts the promotion; the previous baseline stays live.
    fn apply(&self, target_id: &str, config: &serde_json::Value) -> Result<()>;
}

/// Applier for hosts that read baselines from [`BaselineRegistry`] only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopApplier;

impl ConfigApplier for NoopApplier {
    fn apply(&self, _target_id: &str, _config: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// The live default configuration of a target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    /// Target component
    pub target_id: String,
    /// Experiment that produced it (`None` for a seeded baseline)
    pub experiment_id: Option<String>,
    /// Promoted variant (`None` for a seeded baseline)
    pub variant_id: Option<String>,
    /// Configuration payload
    pub config: serde_json::Value,
    /// When it became live
    pub applied_at: DateTime<Utc>,
}

/// Atomically swapped per-target baselines.
#[derive(Debug, Default)]
pub struct BaselineRegistry {
    baselines: ArcSwap<HashMap<String, Arc<Baseline>>>,
}

impl BaselineRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current baseline of a target.
    #[must_use]
    pub fn get(&self, target_id: &str) -> Option<Arc<Baseline>> {
        self.baselines.load().get(target_id).cloned()
    }

    /// Install an initial baseline for a target (the configuration it runs
    /// before any promotion).
    pub fn seed(&self, target_id: impl Into<String>, config: serde_json::Value) {
        let target_id = target_id.into();
        self.set(Baseline {
            target_id,
            experiment_id: None,
            variant_id: None,
            config,
            applied_at: Utc::now(),
        });
    }

    fn set(&self, baseline: Baseline) {
        let baseline = Arc::new(baseline);
        self.baselines.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(baseline.target_id.clone(), Arc::clone(&baseline));
            next
        });
    }

    /// All baselines.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Baseline>> {
        let mut all: Vec<_> = self.baselines.load().values().cloned().collect();
        all.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        all
    }
}

/// How a promotion reaches 100%.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RolloutStrategy {
    /// Switch the baseline at once
    Immediate,
    /// Staged shares, each held for `hold_secs`
    Gradual {
        /// Winner share per step, increasing, ending at 1.0
        steps: Vec<f64>,
        /// Seconds each step must hold without a guardrail violation
        hold_secs: u64,
    },
}

impl RolloutStrategy {
    /// 5% → 25% → 50% → 100%, 24h per step.
    #[must_use]
    pub fn gradual() -> Self {
        Self::Gradual {
            steps: DEFAULT_ROLLOUT_STEPS.to_vec(),
            hold_secs: DEFAULT_HOLD_SECS,
        }
    }

    const fn name(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Gradual { .. } => "gradual",
        }
    }

    fn validate(&self) -> Result<()> {
        let Self::Gradual { steps, hold_secs } = self else {
            return Ok(());
        };
        if *hold_secs > MAX_HOLD_SECS {
            return Err(Error::Validation(format!(
                "rollout hold must be at most {MAX_HOLD_SECS}s, got {hold_secs}s"
            )));
        }
        let increasing = steps.windows(2).all(|w| w[0] < w[1]);
        let in_range = steps.iter().all(|s| *s > 0.0 && *s <= 1.0);
        let ends_at_full = steps.last().is_some_and(|s| (*s - 1.0).abs() < f64::EPSILON);
        if increasing && in_range && ends_at_full {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "rollout steps must increase within (0, 1] and end at 1.0, got {steps:?}"
            )))
        }
    }
}

/// Controller tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromotionConfig {
    /// Default gradual steps
    pub steps: Vec<f64>,
    /// Default hold time per step
    pub hold_time_secs: u64,
    /// Seconds between ramp ticks
    pub tick_interval_secs: u64,
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            steps: DEFAULT_ROLLOUT_STEPS.to_vec(),
            hold_time_secs: DEFAULT_HOLD_SECS,
            tick_interval_secs: 60,
        }
    }
}

impl PromotionConfig {
    /// Gradual strategy with these defaults.
    #[must_use]
    pub fn gradual(&self) -> RolloutStrategy {
        RolloutStrategy::Gradual {
            steps: self.steps.clone(),
            hold_secs: self.hold_time_secs,
        }
    }

    /// Tick interval as a `Duration`.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.gradual()
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if self.tick_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "promotion tick_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where a promotion stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PromotionState {
    /// Gradual rollout holding at `share`
    Ramping {
        /// Winner
        variant_id: String,
        /// Index into the steps
        step: usize,
        /// Winner share at this step
        share: f64,
    },
    /// Baseline switched and experiment completed
    Applied {
        /// Winner
        variant_id: String,
    },
    /// Ramp stopped; baseline untouched
    Aborted {
        /// Winner
        variant_id: String,
        /// Why
        reason: String,
    },
}

#[derive(Debug, Clone)]
struct Ramp {
    variant_id: String,
    steps: Vec<f64>,
    hold: chrono::Duration,
    step: usize,
    step_started_at: DateTime<Utc>,
    /// The final apply was rejected and its failure already audited
    apply_failed: bool,
}

impl Ramp {
    #[allow(clippy::cast_possible_wrap)]
    fn hold_for(secs: u64) -> chrono::Duration {
        chrono::Duration::seconds(secs.min(MAX_HOLD_SECS) as i64)
    }

    fn state(&self) -> PromotionState {
        PromotionState::Ramping {
            variant_id: self.variant_id.clone(),
            step: self.step,
            share: self.steps[self.step],
        }
    }
}

/// Promotion controller.
pub struct PromotionController {
    directory: Arc<ExperimentDirectory>,
    baselines: Arc<BaselineRegistry>,
    applier: Arc<dyn ConfigApplier>,
    /// Active ramps by experiment; also serializes promotions
    ramps: Mutex<HashMap<String, Ramp>>,
}

impl std::fmt::Debug for PromotionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromotionController")
            .field("baselines", &self.baselines)
            .finish_non_exhaustive()
    }
}

impl PromotionController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        directory: Arc<ExperimentDirectory>,
        baselines: Arc<BaselineRegistry>,
        applier: Arc<dyn ConfigApplier>,
    ) -> Self {
        Self {
            directory,
            baselines,
            applier,
            ramps: Mutex::new(HashMap::new()),
        }
    }

    /// Baseline registry this controller writes to.
    #[must_use]
    pub const fn baselines(&self) -> &Arc<BaselineRegistry> {
        &self.baselines
    }

    /// Active ramp of an experiment, if any.
    #[must_use]
    pub fn state(&self, experiment_id: &str) -> Option<PromotionState> {
        self.lock().get(experiment_id).map(Ramp::state)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Ramp>> {
        self.ramps.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Promote a variant.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an unknown experiment or variant
    /// - `Error::Validation` for the control, a removed variant, a variant
    ///   with an active guardrail violation, an experiment that never ran,
    ///   or malformed rollout steps
    /// - `Error::Conflict` if the experiment ended without this promotion, or
    ///   another variant is being ramped
    /// - `Error::PromotionFailed` if the applier rejected the configuration
    pub fn promote(
        &self,
        experiment_id: &str,
        variant_id: &str,
        strategy: &RolloutStrategy,
    ) -> Result<PromotionState> {
        let mut ramps = self.lock();
        let experiment = self
            .directory
            .get(experiment_id)
            .ok_or_else(|| Error::experiment_not_found(experiment_id))?;
        let variant = experiment
            .variant(variant_id)
            .ok_or_else(|| Error::variant_not_found(variant_id))?;

        if self.already_applied(&experiment, variant_id) {
            debug!(experiment_id, variant_id, "promotion already applied");
            return Ok(PromotionState::Applied {
                variant_id: variant_id.to_string(),
            });
        }
        if let Some(ramp) = ramps.get(experiment_id) {
            if ramp.variant_id == variant_id {
                return Ok(ramp.state());
            }
            return Err(Error::Conflict(format!(
                "experiment '{experiment_id}' is already ramping variant '{}'",
                ramp.variant_id
            )));
        }

        match experiment.status() {
            ExperimentStatus::Running | ExperimentStatus::Paused => {}
            status @ (ExperimentStatus::Draft | ExperimentStatus::Validated) => {
                return Err(Error::Validation(format!(
                    "experiment '{experiment_id}' is {status} and has no results to promote"
                )));
            }
            status => {
                return Err(Error::Conflict(format!(
                    "experiment '{experiment_id}' is {status}"
                )));
            }
        }
        if variant.is_control() {
            return Err(Error::Validation(format!(
                "variant '{variant_id}' is the control and cannot be promoted"
            )));
        }
        if experiment.split().is_removed(variant_id) {
            return Err(Error::Validation(format!(
                "variant '{variant_id}' was removed from the split and cannot be promoted"
            )));
        }
        if experiment.has_violation(variant_id) {
            return Err(Error::Validation(format!(
                "variant '{variant_id}' has an active guardrail violation and cannot be promoted"
            )));
        }
        strategy.validate()?;

        match strategy {
            RolloutStrategy::Immediate => {
                self.apply(&experiment, variant_id, strategy.name(), true)
            }
            RolloutStrategy::Gradual { steps, hold_secs } => {
                let ramp = Ramp {
                    variant_id: variant_id.to_string(),
                    steps: steps.clone(),
                    hold: Ramp::hold_for(*hold_secs),
                    step: 0,
                    step_started_at: Utc::now(),
                    apply_failed: false,
                };
                self.start_ramp(&experiment, ramp, &mut ramps)
            }
        }
    }

    fn already_applied(&self, experiment: &Experiment, variant_id: &str) -> bool {
        experiment.status() == ExperimentStatus::Completed
            && self.baselines.get(experiment.target_id()).is_some_and(|b| {
                b.experiment_id.as_deref() == Some(experiment.id())
                    && b.variant_id.as_deref() == Some(variant_id)
            })
    }

    fn start_ramp(
        &self,
        experiment: &Experiment,
        ramp: Ramp,
        ramps: &mut HashMap<String, Ramp>,
    ) -> Result<PromotionState> {
        let share = ramp.steps[0];
        if ramp.steps.len() == 1 {
            return self.apply(experiment, &ramp.variant_id, "gradual", true);
        }
        self.directory.rebalance(
            experiment.id(),
            experiment.split().ramp(&ramp.variant_id, share),
        )?;
        self.directory.events().append(
            experiment.id(),
            EventKind::PromotionStarted,
            Some(experiment.status()),
            Some(experiment.status()),
            json!({"variant_id": ramp.variant_id, "steps": ramp.steps, "share": share}),
        );
        info!(
            experiment_id = experiment.id(),
            variant_id = %ramp.variant_id,
            share,
            "gradual promotion started"
        );
        let state = ramp.state();
        ramps.insert(experiment.id().to_string(), ramp);
        Ok(state)
    }

    /// Apply the winner as the baseline and complete the experiment.
    ///
    /// A rejected apply is audited only when `audit_failure` is set, so a
    /// retried final ramp step leaves one `PromotionFailed` event.
    fn apply(
        &self,
        experiment: &Experiment,
        variant_id: &str,
        strategy: &str,
        audit_failure: bool,
    ) -> Result<PromotionState> {
        let variant = experiment
            .variant(variant_id)
            .ok_or_else(|| Error::variant_not_found(variant_id))?;

        if let Err(e) = self.applier.apply(experiment.target_id(), variant.config()) {
            let reason = e.to_string();
            if !audit_failure {
                debug!(
                    experiment_id = experiment.id(),
                    variant_id,
                    error = %e,
                    "promotion retry failed"
                );
                return Err(Error::PromotionFailed {
                    experiment_id: experiment.id().to_string(),
                    reason,
                });
            }
            self.directory.events().append(
                experiment.id(),
                EventKind::PromotionFailed,
                Some(experiment.status()),
                Some(experiment.status()),
                json!({"variant_id": variant_id, "strategy": strategy, "reason": reason}),
            );
            error!(
                experiment_id = experiment.id(),
                target_id = experiment.target_id(),
                variant_id,
                error = %e,
                "promotion failed, last-known-good baseline retained"
            );
            return Err(Error::PromotionFailed {
                experiment_id: experiment.id().to_string(),
                reason,
            });
        }

        let previous = self.baselines.get(experiment.target_id());
        self.baselines.set(Baseline {
            target_id: experiment.target_id().to_string(),
            experiment_id: Some(experiment.id().to_string()),
            variant_id: Some(variant_id.to_string()),
            config: variant.config().clone(),
            applied_at: Utc::now(),
        });
        self.directory.events().append(
            experiment.id(),
            EventKind::PromotionApplied,
            Some(experiment.status()),
            Some(experiment.status()),
            json!({
                "variant_id": variant_id,
                "strategy": strategy,
                "previous_variant_id": previous.and_then(|b| b.variant_id.clone()),
            }),
        );
        self.directory.complete(
            experiment.id(),
            json!({"promoted_variant_id": variant_id, "strategy": strategy}),
        )?;
        info!(
            experiment_id = experiment.id(),
            target_id = experiment.target_id(),
            variant_id,
            strategy,
            "variant promoted to baseline"
        );

        Ok(PromotionState::Applied {
            variant_id: variant_id.to_string(),
        })
    }

    /// Advance every ramp whose hold time elapsed at `now`. Returns the
    /// ramps that changed state.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<(String, PromotionState)> {
        let mut ramps = self.lock();
        let mut changes = Vec::new();
        let mut finished = Vec::new();

        for (experiment_id, ramp) in ramps.iter_mut() {
            let Some(experiment) = self.directory.get(experiment_id) else {
                finished.push(experiment_id.clone());
                continue;
            };
            if experiment.status().is_terminal() {
                finished.push(experiment_id.clone());
                continue;
            }

            if experiment.has_violation(&ramp.variant_id)
                || experiment.split().is_removed(&ramp.variant_id)
            {
                let state = self.abort(&experiment, ramp);
                finished.push(experiment_id.clone());
                changes.push((experiment_id.clone(), state));
                continue;
            }

            if experiment.status() != ExperimentStatus::Running
                || now - ramp.step_started_at < ramp.hold
            {
                continue;
            }

            let next = ramp.step + 1;
            if next + 1 == ramp.steps.len() {
                match self.apply(&experiment, &ramp.variant_id, "gradual", !ramp.apply_failed) {
                    Ok(state) => {
                        finished.push(experiment_id.clone());
                        changes.push((experiment_id.clone(), state));
                    }
                    Err(e) => {
                        if !ramp.apply_failed {
                            warn!(experiment_id = %experiment_id, error = %e, "final promotion step failed, retrying next tick");
                        }
                        ramp.apply_failed = true;
                    }
                }
                continue;
            }

            let share = ramp.steps[next];
            let split = experiment.split().ramp(&ramp.variant_id, share);
            match self.directory.rebalance(experiment_id, split) {
                Ok(_) => {
                    ramp.step = next;
                    ramp.step_started_at = now;
                    self.directory.events().append(
                        experiment_id,
                        EventKind::PromotionStep,
                        Some(experiment.status()),
                        Some(experiment.status()),
                        json!({"variant_id": ramp.variant_id, "step": next, "share": share}),
                    );
                    info!(experiment_id = %experiment_id, variant_id = %ramp.variant_id, share, "promotion step");
                    changes.push((experiment_id.clone(), ramp.state()));
                }
                Err(e) => warn!(experiment_id = %experiment_id, error = %e, "promotion step rejected"),
            }
        }

        for experiment_id in finished {
            ramps.remove(&experiment_id);
        }
        changes
    }

    fn abort(&self, experiment: &Experiment, ramp: &Ramp) -> PromotionState {
        let reason = format!("guardrail violation on variant '{}'", ramp.variant_id);
        if let Err(e) = self.directory.stop_variant(
            experiment.id(),
            &ramp.variant_id,
            json!({"reason": "promotion aborted"}),
        ) {
            warn!(experiment_id = experiment.id(), error = %e, "could not remove aborted winner");
        }
        self.directory.events().append(
            experiment.id(),
            EventKind::PromotionFailed,
            Some(experiment.status()),
            Some(experiment.status()),
            json!({"variant_id": ramp.variant_id, "strategy": "gradual", "step": ramp.step, "reason": reason}),
        );
        error!(
            experiment_id = experiment.id(),
            variant_id = %ramp.variant_id,
            step = ramp.step,
            "gradual promotion aborted, baseline untouched"
        );
        PromotionState::Aborted {
            variant_id: ramp.variant_id.clone(),
            reason,
        }
    }

    /// Tick ramps every `interval` until the task is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.tick(Utc::now());
            }
        })
    }
}
