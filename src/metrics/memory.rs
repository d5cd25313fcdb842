//! In-memory observation store using `DashMap`.
//!
//! This is the default backend - observations are lost on process restart.
//! For a durable log, use [`super::ArrowObservationStore`].

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::ObservationStore;
use crate::experiment::Observation;
use crate::Result;

/// In-memory observation store, partitioned by experiment.
///
/// # Example
///
/// ```rust
/// use trueno_ab::experiment::Observation;
/// use trueno_ab::metrics::{MemoryObservationStore, ObservationStore};
///
/// # async fn example() -> trueno_ab::Result<()> {
/// let store = MemoryObservationStore::new();
/// store.append(&[Observation::new("exp-1", "a", "conversion", 1.0, "req-1")]).await?;
/// assert_eq!(store.scan("exp-1", None).await?.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct MemoryObservationStore {
    partitions: DashMap<String, Vec<Observation>>,
}

impl MemoryObservationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.iter().map(|p| p.value().len()).sum()
    }

    /// Check if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every observation of an experiment.
    pub fn clear_experiment(&self, experiment_id: &str) {
        self.partitions.remove(experiment_id);
    }
}

impl ObservationStore for MemoryObservationStore {
    async fn append(&self, batch: &[Observation]) -> Result<()> {
        for observation in batch {
            self.partitions
                .entry(observation.experiment_id().to_string())
                .or_default()
                .push(observation.clone());
        }
        Ok(())
    }

    async fn scan(
        &self,
        experiment_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>> {
        Ok(self
            .partitions
            .get(experiment_id)
            .map(|partition| {
                partition
                    .iter()
                    .filter(|o| since.map_or(true, |t| o.recorded_at() >= t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
