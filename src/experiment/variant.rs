//! Variants and the traffic split across them

use serde::{Deserialize, Serialize};

/// One configuration under test.
///
/// The configuration payload is opaque to the engine; it is handed back to
/// the caller as `config_overrides` when the variant is resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
    id: String,
    name: String,
    is_control: bool,
    config: serde_json::Value,
}

impl Variant {
    /// Create a treatment variant.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, config: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_control: false,
            config,
        }
    }

    /// Create the control (baseline) variant.
    #[must_use]
    pub fn control(
        id: impl Into<String>,
        name: impl Into<String>,
        config: serde_json::Value,
    ) -> Self {
        Self {
            is_control: true,
            ..Self::new(id, name, config)
        }
    }

    /// Get the variant ID.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this is the control variant.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        self.is_control
    }

    /// Get the configuration payload.
    #[must_use]
    pub const fn config(&self) -> &serde_json::Value {
        &self.config
    }
}

/// A variant's slot in a [`TrafficSplit`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SplitEntry {
    variant_id: String,
    share: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    removed: bool,
}

impl SplitEntry {
    /// Variant this slot routes to.
    #[must_use]
    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    /// Declared share in [0, 1].
    #[must_use]
    pub const fn share(&self) -> f64 {
        self.share
    }

    /// Whether the variant was removed from assignment.
    ///
    /// A removed slot keeps its band so no other variant's identities move;
    /// hits inside the band fall through to control.
    #[must_use]
    pub const fn is_removed(&self) -> bool {
        self.removed
    }
}

/// Proportion of eligible traffic routed to each variant.
///
/// Entries are kept in the experiment's variant declaration order, which is
/// the order the assignment resolver walks them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrafficSplit {
    control_id: String,
    entries: Vec<SplitEntry>,
}

impl TrafficSplit {
    /// Create a split from `(variant_id, share)` pairs, in walk order.
    #[must_use]
    pub fn new<I, S>(control_id: impl Into<String>, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            control_id: control_id.into(),
            entries: entries
                .into_iter()
                .map(|(id, share)| SplitEntry {
                    variant_id: id.into(),
                    share,
                    removed: false,
                })
                .collect(),
        }
    }

    /// Split traffic evenly across `variant_ids`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn equal<'a>(
        control_id: impl Into<String>,
        variant_ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let ids: Vec<&str> = variant_ids.into_iter().collect();
        let share = if ids.is_empty() {
            0.0
        } else {
            1.0 / ids.len() as f64
        };
        Self::new(control_id, ids.into_iter().map(|id| (id, share)))
    }

    /// Get the control variant ID.
    #[must_use]
    pub fn control_id(&self) -> &str {
        &self.control_id
    }

    /// Get the entries in walk order.
    #[must_use]
    pub fn entries(&self) -> &[SplitEntry] {
        &self.entries
    }

    /// Sum of declared shares, removed slots included.
    #[must_use]
    pub fn total_share(&self) -> f64 {
        self.entries.iter().map(SplitEntry::share).sum()
    }

    /// Declared share of a variant.
    #[must_use]
    pub fn share_of(&self, variant_id: &str) -> Option<f64> {
        self.entry(variant_id).map(SplitEntry::share)
    }

    /// Share of traffic a variant actually receives.
    ///
    /// Removed variants receive nothing; their bands count toward control.
    #[must_use]
    pub fn effective_share(&self, variant_id: &str) -> f64 {
        let Some(entry) = self.entry(variant_id) else {
            return 0.0;
        };
        if entry.removed {
            return 0.0;
        }
        if variant_id == self.control_id {
            let reclaimed: f64 = self
                .entries
                .iter()
                .filter(|e| e.removed)
                .map(SplitEntry::share)
                .sum();
            entry.share + reclaimed
        } else {
            entry.share
        }
    }

    /// Whether a variant was removed from assignment.
    #[must_use]
    pub fn is_removed(&self, variant_id: &str) -> bool {
        self.entry(variant_id).is_some_and(SplitEntry::is_removed)
    }

    /// Build a ramp split: `share` to `winner_id`, the rest to control,
    /// every other variant at zero. Walk order is preserved.
    #[must_use]
    pub fn ramp(&self, winner_id: &str, share: f64) -> Self {
        let share = share.clamp(0.0, 1.0);
        let entries = self
            .entries
            .iter()
            .map(|e| {
                let share = if e.variant_id == winner_id {
                    share
                } else if e.variant_id == self.control_id {
                    1.0 - share
                } else {
                    0.0
                };
                SplitEntry {
                    variant_id: e.variant_id.clone(),
                    share,
                    removed: false,
                }
            })
            .collect();
        Self {
            control_id: self.control_id.clone(),
            entries,
        }
    }

    /// Mark a variant as removed. Returns `false` if it already was, or if
    /// it is control or unknown.
    pub(crate) fn remove_variant(&mut self, variant_id: &str) -> bool {
        if variant_id == self.control_id {
            return false;
        }
        match self.entries.iter_mut().find(|e| e.variant_id == variant_id) {
            Some(entry) if !entry.removed => {
                entry.removed = true;
                true
            }
            _ => false,
        }
    }

    /// Reorder entries to follow `order`; ids not in `order` go last.
    pub(crate) fn align_to<'a>(&mut self, order: impl IntoIterator<Item = &'a str>) {
        let order: Vec<&str> = order.into_iter().collect();
        self.entries.sort_by_key(|e| {
            order
                .iter()
                .position(|id| *id == e.variant_id)
                .unwrap_or(usize::MAX)
        });
    }

    fn entry(&self, variant_id: &str) -> Option<&SplitEntry> {
        self.entries.iter().find(|e| e.variant_id == variant_id)
    }
}
