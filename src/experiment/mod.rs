//! Experiment Definition Schema
//!
//! Data structures describing an experiment and the observations it
//! produces. Definitions are plain serde values, so serializing and
//! reloading one reproduces an identical in-memory definition.
//!
//! ## Schema Overview
//!
//! ```text
//! Experiment ──< Variant (N, exactly one control)
//!     │
//!     ├── TrafficSplit (variant -> share, walk order = variant order)
//!     ├──< MetricDefinition (N, exactly one primary)
//!     ├──< Guardrail (N) ── MetricDefinition
//!     └──< Observation (N) [append-only, keyed by variant + metric]
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use trueno_ab::experiment::{Experiment, MetricDefinition, Variant};
//! use serde_json::json;
//!
//! let experiment = Experiment::builder("exp-001", "checkout", "Button colour")
//!     .variant(Variant::control("blue", "Blue", json!({"colour": "blue"})))
//!     .variant(Variant::new("green", "Green", json!({"colour": "green"})))
//!     .metric(MetricDefinition::binary("conversion").primary())
//!     .split([("blue", 0.5), ("green", 0.5)])
//!     .build();
//!
//! assert!(experiment.validate().is_ok());
//! ```

mod experiment_record;
mod metric_definition;
mod observation_record;
mod status;
mod variant;

pub use experiment_record::{
    Experiment, ExperimentBuilder, GuardrailViolation, DEFAULT_ALPHA, DEFAULT_MIN_SAMPLE_SIZE,
    SPLIT_SUM_TOLERANCE,
};
pub use metric_definition::{
    Comparison, Guardrail, GuardrailAction, MetricDefinition, MetricKind,
    MAX_GUARDRAIL_WINDOW_SECS,
};
pub use observation_record::{Observation, ObservationBuilder};
pub use status::ExperimentStatus;
pub use variant::{SplitEntry, TrafficSplit, Variant};
