//! # Trueno-AB: Experimentation Engine for Live Services
//!
//! **Version**: 0.1.0
//!
//! Trueno-AB runs controlled experiments on the configuration of a live
//! service component: it splits traffic deterministically between a control
//! and one or more treatment variants, collects per-request outcomes, decides
//! whether a treatment is better with a significance test, halts variants
//! that breach safety guardrails, and promotes a winner to the new baseline.
//!
//! ## Design Principles
//!
//! - **Deterministic assignment**: SHA-256 bucketing, no coordination
//!   between processes
//! - **Fail open**: the request-path hooks never error; a failure degrades
//!   to "serve the baseline"
//! - **Non-blocking ingestion**: outcomes go through a bounded channel and
//!   are written in batches
//! - **Last-known-good**: a failed promotion leaves the previous baseline
//!   live
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use serde_json::json;
//! use trueno_ab::experiment::{MetricDefinition, Variant};
//! use trueno_ab::{Engine, RolloutStrategy, Subject};
//!
//! # async fn demo() -> trueno_ab::Result<()> {
//! let engine = Engine::builder().build()?;
//! engine.create(
//!     engine
//!         .experiment("exp-001", "checkout", "Button colour")
//!         .variant(Variant::control("blue", "Blue", json!({"colour": "blue"})))
//!         .variant(Variant::new("green", "Green", json!({"colour": "green"})))
//!         .metric(MetricDefinition::binary("conversion").primary())
//!         .build(),
//! )?;
//! engine.start("exp-001")?;
//!
//! let subject = Subject::new("req-1").user("user-42");
//! if let Some(r) = engine.resolve("checkout", &subject) {
//!     engine.record(&r.experiment_id, &r.variant_id, subject.request_id(), [("conversion", 1.0)]);
//! }
//!
//! let results = engine.results("exp-001").await?;
//! if let Some(winner) = &results.winner_variant_id {
//!     engine.promote("exp-001", winner, &RolloutStrategy::gradual())?;
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod assignment;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod experiment;
pub mod guardrail;
pub mod logging;
pub mod metrics;
pub mod promotion;
pub mod stats;

pub use assignment::{IdentityScope, Subject};
pub use config::EngineConfig;
pub use directory::ExperimentDirectory;
pub use engine::{BackgroundTasks, Engine, EngineBuilder, Resolution};
pub use error::{Error, Result};
pub use promotion::{Baseline, ConfigApplier, PromotionState, RolloutStrategy};
pub use stats::{ExperimentResults, Outcome, Recommendation};
