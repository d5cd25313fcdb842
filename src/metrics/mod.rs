//! Metrics Pipeline
//!
//! Collects outcome observations without blocking the request path and
//! turns them into per-(variant, metric) aggregates:
//! - [`MetricsPipeline`]: bounded channel + background flush task with
//!   retries
//! - [`ObservationStore`]: append/scan seam, with in-memory and
//!   Arrow/Parquet backends
//! - [`dedup`] and [`AggregateTable`]: read-side deduplication and
//!   aggregation
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use trueno_ab::experiment::Observation;
//! use trueno_ab::metrics::{MemoryObservationStore, MetricsPipeline, ObservationStore, PipelineConfig};
//!
//! # async fn example() -> trueno_ab::Result<()> {
//! let store = Arc::new(MemoryObservationStore::new());
//! let (pipeline, _task) = MetricsPipeline::spawn(Arc::clone(&store), &PipelineConfig::default())?;
//!
//! pipeline.record(Observation::new("exp-1", "green", "conversion", 1.0, "req-1"));
//! pipeline.flush().await?;
//!
//! assert_eq!(store.scan("exp-1", None).await?.len(), 1);
//! # Ok(())
//! # }
//! ```

mod aggregate;
mod arrow_store;
mod memory;
mod pipeline;
mod retry;

pub use aggregate::{dedup, AggregateTable, BinaryAggregate, ContinuousAggregate, MetricAggregate};
pub use arrow_store::{observation_schema, ArrowObservationStore};
pub use memory::MemoryObservationStore;
pub use pipeline::{MetricsPipeline, PipelineConfig, PipelineStats};
pub use retry::{retry_async, RetryConfig};

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::experiment::Observation;
use crate::Result;

/// Durable home of observations.
///
/// Writes are batched and may be retried, so `append` must tolerate
/// redelivery: duplicates are removed at read time.
pub trait ObservationStore: Send + Sync {
    /// Append a batch of observations.
    fn append(&self, batch: &[Observation]) -> impl Future<Output = Result<()>> + Send;

    /// All observations of an experiment recorded at or after `since`
    /// (everything when `None`).
    fn scan(
        &self,
        experiment_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<Vec<Observation>>> + Send;
}
