//! Deterministic variant assignment
//!
//! The resolver is a pure function of (identity, experiment id, split): no
//! I/O, no shared state, no allocation. Any process that implements the
//! algorithm below maps the same subject to the same variant for the
//! lifetime of the experiment.
//!
//! ## Algorithm
//!
//! 1. `digest = SHA-256(identity ++ experiment_id)` (raw UTF-8 bytes, no
//!    separator)
//! 2. `x = u64::from_be_bytes(digest[0..8])`
//! 3. `bucket = (x >> 11) / 2^53`, which lies in [0, 1) and is exact in f64
//! 4. walk the split entries in order, accumulating shares; the first entry
//!    whose cumulative share exceeds `bucket` wins. A removed entry, or no
//!    entry at all (floating-point edge miss), resolves to control.
//!
//! Removing a variant leaves every other band where it was, so only the
//! removed variant's subjects move (to control).

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::experiment::TrafficSplit;

/// Size of the bucket space: the top 53 bits of the digest prefix.
const BUCKET_SPACE: f64 = 9_007_199_254_740_992.0; // 2^53

/// Map (identity, experiment) to a point in [0, 1).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bucket(identity: &str, experiment_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(experiment_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let x = u64::from_be_bytes(prefix);

    (x >> 11) as f64 / BUCKET_SPACE
}

/// Resolve the variant an identity is assigned to.
///
/// # Example
///
/// ```rust
/// use trueno_ab::assignment::resolve;
/// use trueno_ab::experiment::TrafficSplit;
///
/// let split = TrafficSplit::new("control", [("control", 0.5), ("green", 0.5)]);
/// let first = resolve("user-42", "exp-001", &split);
/// assert_eq!(first, resolve("user-42", "exp-001", &split));
/// ```
#[must_use]
pub fn resolve<'a>(identity: &str, experiment_id: &str, split: &'a TrafficSplit) -> &'a str {
    let point = bucket(identity, experiment_id);

    let mut cumulative = 0.0;
    for entry in split.entries() {
        cumulative += entry.share();
        if point < cumulative {
            if entry.is_removed() {
                return split.control_id();
            }
            return entry.variant_id();
        }
    }

    split.control_id()
}

/// Which key an assignment was made on.
///
/// Determinism is scoped to this key: a session-scoped assignment is stable
/// for the session, not for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityScope {
    /// Authenticated user identity.
    User,
    /// Anonymous session.
    Session,
    /// Single request (no stickiness at all).
    Request,
}

/// The subject of a unit of work, as seen by the inbound hook.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    user_id: Option<String>,
    session_id: Option<String>,
    request_id: String,
}

impl Subject {
    /// Create a subject known only by its request ID.
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }

    /// Set the user identity.
    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the session identity.
    #[must_use]
    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Get the request ID.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The key to hash and its scope: user, else session, else request.
    /// Empty or whitespace-only values are treated as absent.
    #[must_use]
    pub fn assignment_key(&self) -> Option<(&str, IdentityScope)> {
        if let Some(user) = non_blank(self.user_id.as_deref()) {
            return Some((user, IdentityScope::User));
        }
        if let Some(session) = non_blank(self.session_id.as_deref()) {
            return Some((session, IdentityScope::Session));
        }
        if self.request_id.trim().is_empty() {
            None
        } else {
            Some((self.request_id.as_str(), IdentityScope::Request))
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// An assignment, kept for audit and sticky-reassignment visibility only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assignment {
    /// Identity key the assignment was made on
    pub identity: String,
    /// Scope of the identity
    pub scope: IdentityScope,
    /// Experiment
    pub experiment_id: String,
    /// Variant resolved on first sight
    pub variant_id: String,
    /// First time the identity was seen
    pub assigned_at: DateTime<Utc>,
}

/// Optional audit cache of first assignments per (experiment, identity).
///
/// Resolution never reads it; correctness comes from the hash alone. The log
/// holds one entry per distinct identity of every live experiment, so it
/// grows with traffic until [`AssignmentLog::evict`] drops an experiment
/// (the engine does this when an experiment ends). A repeat identity costs a
/// lookup and no allocation.
#[derive(Debug, Default)]
pub struct AssignmentLog {
    entries: DashMap<String, DashMap<String, Assignment>>,
}

impl AssignmentLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an assignment unless the identity was already seen for the
    /// experiment. Returns whether it was new.
    pub fn record(
        &self,
        experiment_id: &str,
        identity: &str,
        scope: IdentityScope,
        variant_id: &str,
    ) -> bool {
        if let Some(seen) = self.entries.get(experiment_id) {
            if seen.contains_key(identity) {
                return false;
            }
        }

        let seen = self.entries.entry(experiment_id.to_string()).or_default();
        let inserted = match seen.entry(identity.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Assignment {
                    identity: identity.to_string(),
                    scope,
                    experiment_id: experiment_id.to_string(),
                    variant_id: variant_id.to_string(),
                    assigned_at: Utc::now(),
                });
                true
            }
        };
        inserted
    }

    /// Look up the first assignment of an identity.
    #[must_use]
    pub fn get(&self, experiment_id: &str, identity: &str) -> Option<Assignment> {
        let seen = self.entries.get(experiment_id)?;
        let assignment = seen.get(identity).map(|entry| entry.value().clone());
        assignment
    }

    /// All assignments recorded for an experiment.
    #[must_use]
    pub fn for_experiment(&self, experiment_id: &str) -> Vec<Assignment> {
        self.entries
            .get(experiment_id)
            .map(|seen| seen.iter().map(|entry| entry.value().clone()).collect())
            .unwrap_or_default()
    }

    /// Drop every assignment of an experiment. Returns how many were held.
    pub fn evict(&self, experiment_id: &str) -> usize {
        self.entries
            .remove(experiment_id)
            .map_or(0, |(_, seen)| seen.len())
    }

    /// Drop the experiments for which `keep` returns false. Returns how many
    /// assignments were dropped.
    pub fn retain_experiments(&self, mut keep: impl FnMut(&str) -> bool) -> usize {
        let mut dropped = 0;
        self.entries.retain(|experiment_id, seen| {
            let keep = keep(experiment_id);
            if !keep {
                dropped += seen.len();
            }
            keep
        });
        dropped
    }

    /// Number of recorded assignments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().map(|seen| seen.value().len()).sum()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|seen| seen.value().is_empty())
    }
}
