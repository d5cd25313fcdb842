//! Audit log of lifecycle, guardrail and promotion events
//!
//! Every directory write, guardrail mitigation and promotion step appends
//! one event. Sequence numbers are assigned under the log's write lock, so
//! they give a total causal order across all writers.

use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::experiment::ExperimentStatus;
use crate::Result;

/// What an audit event records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Experiment created as a draft
    Created,
    /// Draft definition replaced
    Updated,
    /// Lifecycle status changed
    Transition,
    /// Variant removed from assignment
    VariantStopped,
    /// Split replaced on a running experiment
    SplitRebalanced,
    /// Guardrail threshold breached
    GuardrailBreached,
    /// Archival metadata attached
    Annotated,
    /// Gradual promotion began
    PromotionStarted,
    /// Gradual promotion moved to its next step
    PromotionStep,
    /// Variant configuration became the new baseline
    PromotionApplied,
    /// Promotion aborted; last-known-good baseline retained
    PromotionFailed,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    /// Position in the log, starting at 1
    pub seq: u64,
    /// Experiment the event concerns
    pub experiment_id: String,
    /// Event kind
    pub kind: EventKind,
    /// Status before the event
    pub before: Option<ExperimentStatus>,
    /// Status after the event
    pub after: Option<ExperimentStatus>,
    /// Time of the event
    pub at: DateTime<Utc>,
    /// Kind-specific payload (triggering measurement, shares, reason, ...)
    pub detail: serde_json::Value,
}

/// Append-only, thread-safe event log.
#[derive(Debug, Default)]
pub struct EventLog {
    events: RwLock<Vec<AuditEvent>>,
}

impl EventLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. Returns its sequence number.
    pub fn append(
        &self,
        experiment_id: &str,
        kind: EventKind,
        before: Option<ExperimentStatus>,
        after: Option<ExperimentStatus>,
        detail: serde_json::Value,
    ) -> u64 {
        let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
        let seq = events.len() as u64 + 1;
        events.push(AuditEvent {
            seq,
            experiment_id: experiment_id.to_string(),
            kind,
            before,
            after,
            at: Utc::now(),
            detail,
        });
        seq
    }

    /// All events, in sequence order.
    #[must_use]
    pub fn all(&self) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events for one experiment, in sequence order.
    #[must_use]
    pub fn for_experiment(&self, experiment_id: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.experiment_id == experiment_id)
            .cloned()
            .collect()
    }

    /// Number of events of `kind` for an experiment.
    #[must_use]
    pub fn count(&self, experiment_id: &str, kind: EventKind) -> usize {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.experiment_id == experiment_id && e.kind == kind)
            .count()
    }

    /// Total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Export as JSON lines, one event per line (the persisted Events layout).
    ///
    /// # Errors
    ///
    /// Returns `Error::Serialization` if an event payload cannot be encoded.
    pub fn to_json_lines(&self) -> Result<String> {
        let events = self.events.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = String::new();
        for event in events.iter() {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }
}
