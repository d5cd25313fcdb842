//! Experiment Directory
//!
//! Versioned store of experiment definitions that answers "what is running
//! on target X" and owns every lifecycle transition.
//!
//! ## Concurrency
//!
//! - **Readers** load an immutable snapshot from an [`ArcSwap`]; the request
//!   path never takes a lock.
//! - **Writers** serialize on a single mutex, clone the snapshot
//!   (copy-on-write: only the experiment being changed is deep-cloned),
//!   apply the change and swap the new snapshot in. Two concurrent `start`
//!   calls on one experiment, or on two experiments of one target, cannot
//!   both succeed.
//! - **Audit events** for a write are appended only after its snapshot is
//!   published, so the log never records a change that was rolled back.
//!
//! # Example
//!
//! ```rust
//! use trueno_ab::directory::ExperimentDirectory;
//! use trueno_ab::experiment::{Experiment, ExperimentStatus, MetricDefinition, Variant};
//! use serde_json::json;
//!
//! # fn main() -> trueno_ab::Result<()> {
//! let directory = ExperimentDirectory::new();
//! directory.create(
//!     Experiment::builder("exp-001", "checkout", "Button colour")
//!         .variant(Variant::control("blue", "Blue", json!({})))
//!         .variant(Variant::new("green", "Green", json!({})))
//!         .metric(MetricDefinition::binary("conversion").primary())
//!         .build(),
//! )?;
//! directory.start("exp-001")?;
//!
//! let active = directory.get_active("checkout").expect("running");
//! assert_eq!(active.status(), ExperimentStatus::Running);
//! # Ok(())
//! # }
//! ```

mod audit;

pub use audit::{AuditEvent, EventKind, EventLog};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::experiment::{Experiment, ExperimentStatus, GuardrailViolation, TrafficSplit, Variant};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    experiments: HashMap<String, Arc<Experiment>>,
    /// target id -> id of its Running experiment
    active: HashMap<String, String>,
}

impl Snapshot {
    fn reindex(&mut self) {
        self.active = self
            .experiments
            .values()
            .filter(|e| e.status() == ExperimentStatus::Running)
            .map(|e| (e.target_id().to_string(), e.id().to_string()))
            .collect();
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Experiment> {
        self.experiments
            .get_mut(id)
            .map(Arc::make_mut)
            .ok_or_else(|| Error::experiment_not_found(id))
    }

    fn get(&self, id: &str) -> Result<&Experiment> {
        self.experiments
            .get(id)
            .map(AsRef::as_ref)
            .ok_or_else(|| Error::experiment_not_found(id))
    }

    /// Conflict if another experiment already holds the target.
    fn ensure_target_free(&self, experiment: &Experiment) -> Result<()> {
        let holder = self.experiments.values().find(|other| {
            other.id() != experiment.id()
                && other.target_id() == experiment.target_id()
                && other.status().occupies_target()
        });
        match holder {
            Some(other) => Err(Error::Conflict(format!(
                "target '{}' already has experiment '{}' in {}",
                experiment.target_id(),
                other.id(),
                other.status()
            ))),
            None => Ok(()),
        }
    }
}

struct PendingEvent {
    experiment_id: String,
    kind: EventKind,
    before: Option<ExperimentStatus>,
    after: Option<ExperimentStatus>,
    detail: serde_json::Value,
}

type Pending = Vec<PendingEvent>;

fn pending(
    events: &mut Pending,
    experiment: &Experiment,
    kind: EventKind,
    before: Option<ExperimentStatus>,
    detail: serde_json::Value,
) {
    events.push(PendingEvent {
        experiment_id: experiment.id().to_string(),
        kind,
        before,
        after: Some(experiment.status()),
        detail,
    });
}

/// Apply a transition and queue its audit event.
fn transition(
    experiment: &mut Experiment,
    next: ExperimentStatus,
    now: DateTime<Utc>,
    events: &mut Pending,
    detail: serde_json::Value,
) -> Result<()> {
    let before = experiment.transition(next, now)?;
    info!(
        experiment_id = experiment.id(),
        target_id = experiment.target_id(),
        from = %before,
        to = %next,
        version = experiment.version(),
        "experiment transition"
    );
    pending(events, experiment, EventKind::Transition, Some(before), detail);
    Ok(())
}

/// Copy-on-write experiment directory.
#[derive(Debug)]
pub struct ExperimentDirectory {
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    events: Arc<EventLog>,
}

impl Default for ExperimentDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl ExperimentDirectory {
    /// Create an empty directory with its own event log.
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_log(Arc::new(EventLog::new()))
    }

    /// Create an empty directory writing to a shared event log.
    #[must_use]
    pub fn with_event_log(events: Arc<EventLog>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            writer: Mutex::new(()),
            events,
        }
    }

    /// Rebuild a directory from exported definitions (replication, restart).
    ///
    /// # Errors
    ///
    /// - `Error::Conflict` on duplicate ids or two experiments occupying one target
    /// - `Error::Validation` if a non-draft definition is malformed
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = Experiment>,
        events: Arc<EventLog>,
    ) -> Result<Self> {
        let mut snapshot = Snapshot::default();
        for experiment in definitions {
            if experiment.status() != ExperimentStatus::Draft {
                experiment.validate()?;
            }
            if experiment.status().occupies_target() {
                snapshot.ensure_target_free(&experiment)?;
            }
            let id = experiment.id().to_string();
            if snapshot.experiments.insert(id.clone(), Arc::new(experiment)).is_some() {
                return Err(Error::Conflict(format!("duplicate experiment id '{id}'")));
            }
        }
        snapshot.reindex();

        Ok(Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            writer: Mutex::new(()),
            events,
        })
    }

    /// Get the shared event log.
    #[must_use]
    pub const fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    // ------------------------------------------------------------------
    // Read path (lock-free)
    // ------------------------------------------------------------------

    /// The Running experiment on a target, if any.
    ///
    /// Paused and terminal experiments are never returned.
    #[must_use]
    pub fn get_active(&self, target_id: &str) -> Option<Arc<Experiment>> {
        let snapshot = self.snapshot.load();
        let id = snapshot.active.get(target_id)?;
        snapshot.experiments.get(id).cloned()
    }

    /// Look up an experiment by ID.
    #[must_use]
    pub fn get(&self, experiment_id: &str) -> Option<Arc<Experiment>> {
        self.snapshot.load().experiments.get(experiment_id).cloned()
    }

    /// All experiments, ordered by ID.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<Experiment>> {
        let mut all: Vec<_> = self.snapshot.load().experiments.values().cloned().collect();
        all.sort_by(|a, b| a.id().cmp(b.id()));
        all
    }

    /// All Running experiments, ordered by ID.
    #[must_use]
    pub fn running(&self) -> Vec<Arc<Experiment>> {
        let mut running: Vec<_> = self
            .snapshot
            .load()
            .experiments
            .values()
            .filter(|e| e.status() == ExperimentStatus::Running)
            .cloned()
            .collect();
        running.sort_by(|a, b| a.id().cmp(b.id()));
        running
    }

    /// Owned copies of every definition, for replication or persistence.
    #[must_use]
    pub fn export(&self) -> Vec<Experiment> {
        self.list().iter().map(|e| Experiment::clone(e)).collect()
    }

    // ------------------------------------------------------------------
    // Write path (single writer)
    // ------------------------------------------------------------------

    fn write<T>(
        &self,
        f: impl FnOnce(&mut Snapshot, DateTime<Utc>, &mut Pending) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = Snapshot::clone(&self.snapshot.load());
        let mut events = Pending::new();
        let out = f(&mut next, Utc::now(), &mut events)?;
        next.reindex();
        self.snapshot.store(Arc::new(next));

        for e in events {
            self.events
                .append(&e.experiment_id, e.kind, e.before, e.after, e.detail);
        }
        Ok(out)
    }

    fn write_one(
        &self,
        experiment_id: &str,
        f: impl FnOnce(&mut Snapshot, DateTime<Utc>, &mut Pending) -> Result<()>,
    ) -> Result<Arc<Experiment>> {
        self.write(|snapshot, now, events| {
            f(snapshot, now, events)?;
            snapshot
                .experiments
                .get(experiment_id)
                .cloned()
                .ok_or_else(|| Error::experiment_not_found(experiment_id))
        })
    }

    /// Register a new experiment in `Draft`.
    ///
    /// Lifecycle fields of the given value are reset.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` if the id is empty
    /// - `Error::Conflict` if the id is already taken
    pub fn create(&self, mut experiment: Experiment) -> Result<Arc<Experiment>> {
        if experiment.id().trim().is_empty() {
            return Err(Error::Validation("experiment id is empty".to_string()));
        }
        let id = experiment.id().to_string();
        self.write_one(&id, |snapshot, now, events| {
            if snapshot.experiments.contains_key(experiment.id()) {
                return Err(Error::Conflict(format!(
                    "experiment '{}' already exists",
                    experiment.id()
                )));
            }
            experiment.reset_as_draft(now);
            info!(
                experiment_id = experiment.id(),
                target_id = experiment.target_id(),
                "experiment created"
            );
            pending(
                events,
                &experiment,
                EventKind::Created,
                None,
                json!({"name": experiment.name(), "target_id": experiment.target_id()}),
            );
            snapshot
                .experiments
                .insert(experiment.id().to_string(), Arc::new(experiment));
            Ok(())
        })
    }

    /// Replace a draft's definition.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the experiment does not exist
    /// - `Error::Conflict` if it is no longer a draft
    pub fn update(&self, mut experiment: Experiment) -> Result<Arc<Experiment>> {
        let id = experiment.id().to_string();
        self.write_one(&id, |snapshot, now, events| {
            let stored = snapshot.get(&id)?;
            if stored.status() != ExperimentStatus::Draft {
                return Err(Error::Conflict(format!(
                    "experiment '{id}' is {} and can no longer be edited",
                    stored.status()
                )));
            }
            experiment.inherit_lifecycle(stored);
            experiment.touch(now);
            pending(
                events,
                &experiment,
                EventKind::Updated,
                Some(ExperimentStatus::Draft),
                json!({"version": experiment.version()}),
            );
            snapshot.experiments.insert(id.clone(), Arc::new(experiment));
            Ok(())
        })
    }

    /// Validate a draft, moving it to `Validated`.
    ///
    /// # Errors
    ///
    /// - `Error::Validation` if the definition is malformed (stays `Draft`)
    /// - `Error::Conflict` if it is not a draft
    pub fn validate(&self, experiment_id: &str) -> Result<Arc<Experiment>> {
        self.write_one(experiment_id, |snapshot, now, events| {
            let experiment = snapshot.get_mut(experiment_id)?;
            Self::validate_draft(experiment, now, events)
        })
    }

    fn validate_draft(
        experiment: &mut Experiment,
        now: DateTime<Utc>,
        events: &mut Pending,
    ) -> Result<()> {
        if let Err(e) = experiment.validate() {
            warn!(experiment_id = experiment.id(), error = %e, "experiment rejected");
            return Err(e);
        }
        transition(experiment, ExperimentStatus::Validated, now, events, json!({}))
    }

    /// Start an experiment. A draft is validated first.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the experiment does not exist
    /// - `Error::Validation` if the definition is malformed
    /// - `Error::Conflict` if it is not startable, or its target already has
    ///   a running or paused experiment
    pub fn start(&self, experiment_id: &str) -> Result<Arc<Experiment>> {
        self.write_one(experiment_id, |snapshot, now, events| {
            let status = snapshot.get(experiment_id)?.status();
            match status {
                ExperimentStatus::Draft => {
                    Self::validate_draft(snapshot.get_mut(experiment_id)?, now, events)?;
                }
                ExperimentStatus::Validated => snapshot.get(experiment_id)?.validate()?,
                other => {
                    return Err(Error::Conflict(format!(
                        "experiment '{experiment_id}' is {other} and cannot be started"
                    )));
                }
            }

            snapshot.ensure_target_free(snapshot.get(experiment_id)?)?;

            let experiment = snapshot.get_mut(experiment_id)?;
            transition(experiment, ExperimentStatus::Running, now, events, json!({}))
        })
    }

    /// Pause a running experiment; its target reverts to the default
    /// configuration until resumed.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the experiment does not exist
    /// - `Error::Conflict` if it is not running
    pub fn pause(&self, experiment_id: &str) -> Result<Arc<Experiment>> {
        self.write_one(experiment_id, |snapshot, now, events| {
            let experiment = snapshot.get_mut(experiment_id)?;
            transition(experiment, ExperimentStatus::Paused, now, events, json!({}))
        })
    }

    /// Resume a paused experiment.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the experiment does not exist
    /// - `Error::Conflict` if it is not paused or its target is taken
    pub fn resume(&self, experiment_id: &str) -> Result<Arc<Experiment>> {
        self.write_one(experiment_id, |snapshot, now, events| {
            snapshot.ensure_target_free(snapshot.get(experiment_id)?)?;
            let experiment = snapshot.get_mut(experiment_id)?;
            if experiment.status() != ExperimentStatus::Paused {
                return Err(Error::Conflict(format!(
                    "experiment '{experiment_id}' is {} and cannot be resumed",
                    experiment.status()
                )));
            }
            transition(experiment, ExperimentStatus::Running, now, events, json!({}))
        })
    }

    /// Stop an experiment (terminal). All its traffic reverts to the
    /// target's baseline.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the experiment does not exist
    /// - `Error::Conflict` if it is already terminal
    pub fn stop(&self, experiment_id: &str, reason: &str) -> Result<Arc<Experiment>> {
        self.write_one(experiment_id, |snapshot, now, events| {
            let experiment = snapshot.get_mut(experiment_id)?;
            transition(
                experiment,
                ExperimentStatus::Stopped,
                now,
                events,
                json!({"reason": reason}),
            )
        })
    }

    /// Complete an experiment (terminal), normally after promotion.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the experiment does not exist
    /// - `Error::Conflict` if it is not running or paused
    pub fn complete(
        &self,
        experiment_id: &str,
        detail: serde_json::Value,
    ) -> Result<Arc<Experiment>> {
        self.write_one(experiment_id, |snapshot, now, events| {
            let experiment = snapshot.get_mut(experiment_id)?;
            transition(experiment, ExperimentStatus::Completed, now, events, detail)
        })
    }

    /// Remove a variant from future assignment; its band falls through to
    /// control. Returns `false` if it was already removed.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an unknown experiment or variant
    /// - `Error::Validation` for the control variant
    /// - `Error::Conflict` if the experiment is terminal
    pub fn stop_variant(
        &self,
        experiment_id: &str,
        variant_id: &str,
        detail: serde_json::Value,
    ) -> Result<bool> {
        self.write(|snapshot, now, events| {
            let experiment = snapshot.get_mut(experiment_id)?;
            let variant = experiment
                .variant(variant_id)
                .ok_or_else(|| Error::variant_not_found(variant_id))?;
            if variant.is_control() {
                return Err(Error::Validation(format!(
                    "control variant '{variant_id}' cannot be stopped"
                )));
            }
            if experiment.status().is_terminal() {
                return Err(Error::Conflict(format!(
                    "experiment '{experiment_id}' is {}",
                    experiment.status()
                )));
            }
            if !experiment.split_mut().remove_variant(variant_id) {
                return Ok(false);
            }
            experiment.touch(now);
            let status = experiment.status();
            let split = experiment.split();
            let detail = json!({
                "variant_id": variant_id,
                "control_share": split.effective_share(split.control_id()),
                "trigger": detail,
            });
            pending(events, experiment, EventKind::VariantStopped, Some(status), detail);
            Ok(true)
        })
    }

    /// Record an active guardrail violation. Returns `false` if the same
    /// (variant, metric) violation is already in effect.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an unknown experiment
    pub fn record_violation(
        &self,
        experiment_id: &str,
        violation: GuardrailViolation,
    ) -> Result<bool> {
        self.write(|snapshot, now, events| {
            let experiment = snapshot.get_mut(experiment_id)?;
            let detail = serde_json::to_value(&violation)?;
            if !experiment.push_violation(violation) {
                return Ok(false);
            }
            experiment.touch(now);
            let status = experiment.status();
            pending(events, experiment, EventKind::GuardrailBreached, Some(status), detail);
            Ok(true)
        })
    }

    /// Replace the split of a running or paused experiment.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an unknown experiment
    /// - `Error::Conflict` if it is not running or paused
    /// - `Error::Validation` if the new split is malformed
    pub fn rebalance(&self, experiment_id: &str, split: TrafficSplit) -> Result<Arc<Experiment>> {
        self.write_one(experiment_id, |snapshot, now, events| {
            let experiment = snapshot.get_mut(experiment_id)?;
            if !experiment.status().occupies_target() {
                return Err(Error::Conflict(format!(
                    "experiment '{experiment_id}' is {} and its split is frozen",
                    experiment.status()
                )));
            }
            let mut split = split;
            split.align_to(experiment.variants().iter().map(Variant::id));
            let shares: serde_json::Map<String, serde_json::Value> = split
                .entries()
                .iter()
                .map(|e| (e.variant_id().to_string(), json!(e.share())))
                .collect();
            experiment.set_split(split);
            experiment.validate()?;
            experiment.touch(now);
            let status = experiment.status();
            pending(
                events,
                experiment,
                EventKind::SplitRebalanced,
                Some(status),
                json!({"shares": shares}),
            );
            Ok(())
        })
    }

    /// Attach archival metadata. Allowed in every state, terminal included.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an unknown experiment
    pub fn annotate(
        &self,
        experiment_id: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Arc<Experiment>> {
        let (key, value) = (key.into(), value.into());
        self.write_one(experiment_id, |snapshot, now, events| {
            let experiment = snapshot.get_mut(experiment_id)?;
            let detail = json!({"key": key, "value": value});
            experiment.annotate(key, value);
            experiment.touch(now);
            let status = experiment.status();
            pending(events, experiment, EventKind::Annotated, Some(status), detail);
            Ok(())
        })
    }
}
