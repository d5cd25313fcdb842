//! Experiment lifecycle status

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an experiment.
///
/// ```text
/// Draft ──> Validated ──> Running <──> Paused
///   │           │            │           │
///   │           │            ├──> Completed <┤
///   └───────────┴────────────┴──> Stopped <──┘
/// ```
///
/// There is no edge from `Draft` straight to `Running`: starting a draft
/// passes through `Validated` so validation can never be skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    /// Created or edited, not yet checked.
    Draft,
    /// Definition passed validation.
    Validated,
    /// Receiving traffic.
    Running,
    /// Temporarily receiving no traffic; can be resumed.
    Paused,
    /// Concluded (normally by promotion). Terminal.
    Completed,
    /// Cancelled by an operator or a guardrail. Terminal.
    Stopped,
}

impl ExperimentStatus {
    /// Whether the status is terminal (`Completed` or `Stopped`).
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }

    /// Whether the experiment occupies its target (`Running` or `Paused`).
    #[must_use]
    pub const fn occupies_target(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// Whether `self -> next` is an edge of the lifecycle DAG.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Draft, Self::Validated)
                | (Self::Validated | Self::Paused, Self::Running)
                | (Self::Running, Self::Paused)
                | (Self::Running | Self::Paused, Self::Completed)
                | (
                    Self::Draft | Self::Validated | Self::Running | Self::Paused,
                    Self::Stopped
                )
        )
    }

    /// Lowercase name used in logs and audit events.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Validated => "validated",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ExperimentStatus; 6] = [
        ExperimentStatus::Draft,
        ExperimentStatus::Validated,
        ExperimentStatus::Running,
        ExperimentStatus::Paused,
        ExperimentStatus::Completed,
        ExperimentStatus::Stopped,
    ];

    #[test]
    fn test_draft_cannot_skip_validation() {
        assert!(!ExperimentStatus::Draft.can_transition_to(ExperimentStatus::Running));
        assert!(ExperimentStatus::Draft.can_transition_to(ExperimentStatus::Validated));
        assert!(ExperimentStatus::Validated.can_transition_to(ExperimentStatus::Running));
    }

    #[test]
    fn test_pause_resume_toggle() {
        assert!(ExperimentStatus::Running.can_transition_to(ExperimentStatus::Paused));
        assert!(ExperimentStatus::Paused.can_transition_to(ExperimentStatus::Running));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [ExperimentStatus::Completed, ExperimentStatus::Stopped] {
            assert!(from.is_terminal());
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_completed_requires_running_or_paused() {
        assert!(!ExperimentStatus::Draft.can_transition_to(ExperimentStatus::Completed));
        assert!(!ExperimentStatus::Validated.can_transition_to(ExperimentStatus::Completed));
        assert!(ExperimentStatus::Paused.can_transition_to(ExperimentStatus::Completed));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ExperimentStatus::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}
