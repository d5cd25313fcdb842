//! Observation - one outcome measurement for one request

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single outcome measurement reported for a request served by a variant.
///
/// Observations are append-only and delivered at least once. Duplicates
/// share a `request_id` and are removed at read time (see
/// [`crate::metrics::dedup`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    experiment_id: String,
    variant_id: String,
    metric_id: String,
    value: f64,
    request_id: String,
    recorded_at: DateTime<Utc>,
}

impl Observation {
    /// Create an observation stamped with the current time.
    ///
    /// # Arguments
    ///
    /// * `experiment_id` - Experiment the request was assigned under
    /// * `variant_id` - Variant that served the request
    /// * `metric_id` - Metric being reported
    /// * `value` - 0/1 for binary metrics, the raw value for continuous ones
    /// * `request_id` - Unique request identifier used for deduplication
    #[must_use]
    pub fn new(
        experiment_id: impl Into<String>,
        variant_id: impl Into<String>,
        metric_id: impl Into<String>,
        value: f64,
        request_id: impl Into<String>,
    ) -> Self {
        Self::builder(experiment_id, variant_id, metric_id, value, request_id).build()
    }

    /// Create a builder for an observation with an explicit timestamp.
    #[must_use]
    pub fn builder(
        experiment_id: impl Into<String>,
        variant_id: impl Into<String>,
        metric_id: impl Into<String>,
        value: f64,
        request_id: impl Into<String>,
    ) -> ObservationBuilder {
        ObservationBuilder {
            experiment_id: experiment_id.into(),
            variant_id: variant_id.into(),
            metric_id: metric_id.into(),
            value,
            request_id: request_id.into(),
            recorded_at: Utc::now(),
        }
    }

    /// Get the experiment ID.
    #[must_use]
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Get the variant ID.
    #[must_use]
    pub fn variant_id(&self) -> &str {
        &self.variant_id
    }

    /// Get the metric ID.
    #[must_use]
    pub fn metric_id(&self) -> &str {
        &self.metric_id
    }

    /// Get the measured value.
    #[must_use]
    pub const fn value(&self) -> f64 {
        self.value
    }

    /// Get the request ID.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Get the time the observation was recorded.
    #[must_use]
    pub const fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }
}

/// Builder for [`Observation`].
#[derive(Debug)]
pub struct ObservationBuilder {
    experiment_id: String,
    variant_id: String,
    metric_id: String,
    value: f64,
    request_id: String,
    recorded_at: DateTime<Utc>,
}

impl ObservationBuilder {
    /// Set a custom timestamp (replay, tests, storage reload).
    #[must_use]
    pub const fn recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = recorded_at;
        self
    }

    /// Build the `Observation`.
    #[must_use]
    pub fn build(self) -> Observation {
        Observation {
            experiment_id: self.experiment_id,
            variant_id: self.variant_id,
            metric_id: self.metric_id,
            value: self.value,
            request_id: self.request_id,
            recorded_at: self.recorded_at,
        }
    }
}
