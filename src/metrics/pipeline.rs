//! Non-blocking ingestion with a background flush task
//!
//! Heijunka (load levelling): producers hand observations to a bounded
//! channel and return immediately. A single task drains the channel into a
//! buffer and writes batches to the store every `flush_interval`, or as soon
//! as `batch_size` observations are buffered.
//!
//! Back-pressure never reaches the request path: a full channel drops the
//! observation and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace};

use super::retry::{retry_async, RetryConfig};
use super::ObservationStore;
use crate::experiment::Observation;
use crate::{Error, Result};

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Bounded channel capacity between producers and the flush task
    pub channel_capacity: usize,
    /// Buffered observations that trigger an early flush
    pub batch_size: usize,
    /// Maximum time an observation waits in the buffer
    pub flush_interval_ms: u64,
    /// Store write retry policy
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 65_536,
            batch_size: 1_024,
            flush_interval_ms: 1_000,
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Flush interval as a `Duration`.
    #[must_use]
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 || self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "pipeline channel_capacity and batch_size must be positive".to_string(),
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "pipeline flush_interval_ms must be positive".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Snapshot of pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Observations accepted into the channel
    pub accepted: u64,
    /// Observations written to the store
    pub persisted: u64,
    /// Observations lost (channel full/closed, or retries exhausted)
    pub dropped: u64,
    /// Store write retries
    pub retries: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    persisted: AtomicU64,
    dropped: AtomicU64,
    retries: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum Command {
    Observe(Observation),
    Flush(oneshot::Sender<()>),
}

/// Handle to the ingestion pipeline. Cheap to clone; the flush task drains
/// and exits once every handle is dropped.
#[derive(Debug, Clone)]
pub struct MetricsPipeline {
    sender: mpsc::Sender<Command>,
    counters: Arc<Counters>,
}

impl MetricsPipeline {
    /// Start the flush task on the current Tokio runtime.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidConfig` if the configuration is rejected
    /// - `Error::Other` if called outside a Tokio runtime
    pub fn spawn<S>(store: Arc<S>, config: &PipelineConfig) -> Result<(Self, JoinHandle<()>)>
    where
        S: ObservationStore + 'static,
    {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Other(format!("metrics pipeline needs a Tokio runtime: {e}")))?;

        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let counters = Arc::new(Counters::default());
        let task = FlushTask {
            store,
            receiver,
            config: config.clone(),
            counters: Arc::clone(&counters),
            buffer: Vec::with_capacity(config.batch_size),
        };
        let handle = runtime.spawn(task.run());

        Ok((Self { sender, counters }, handle))
    }

    /// Hand an observation to the pipeline without waiting.
    ///
    /// Returns `false` if it was dropped because the channel is full or the
    /// flush task is gone.
    pub fn record(&self, observation: Observation) -> bool {
        match self.sender.try_send(Command::Observe(observation)) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("observation dropped: channel full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!("observation dropped: pipeline closed");
                false
            }
        }
    }

    /// Wait until every observation accepted before this call has been
    /// written (or dropped after exhausting retries).
    ///
    /// # Errors
    ///
    /// Returns `Error::Other` if the flush task has stopped.
    pub async fn flush(&self) -> Result<()> {
        let (done, wait) = oneshot::channel();
        self.sender
            .send(Command::Flush(done))
            .await
            .map_err(|_| Error::Other("metrics pipeline closed".to_string()))?;
        wait.await
            .map_err(|_| Error::Other("metrics pipeline closed".to_string()))
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }
}

struct FlushTask<S> {
    store: Arc<S>,
    receiver: mpsc::Receiver<Command>,
    config: PipelineConfig,
    counters: Arc<Counters>,
    buffer: Vec<Observation>,
}

impl<S: ObservationStore> FlushTask<S> {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.receiver.recv() => match command {
                    Some(Command::Observe(observation)) => {
                        self.buffer.push(observation);
                        if self.buffer.len() >= self.config.batch_size {
                            self.write_buffer().await;
                        }
                    }
                    Some(Command::Flush(done)) => {
                        self.write_buffer().await;
                        let _ = done.send(());
                    }
                    None => {
                        self.write_buffer().await;
                        debug!("metrics pipeline drained");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !self.buffer.is_empty() {
                        self.write_buffer().await;
                    }
                }
            }
        }
    }

    async fn write_buffer(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(self.config.batch_size),
        );
        let size = batch.len() as u64;

        let mut attempts = 0u64;
        let store = &self.store;
        let result = retry_async(&self.config.retry, "observation append", || {
            attempts += 1;
            store.append(&batch)
        })
        .await;

        self.counters
            .retries
            .fetch_add(attempts.saturating_sub(1), Ordering::Relaxed);
        match result {
            Ok(()) => {
                self.counters.persisted.fetch_add(size, Ordering::Relaxed);
                trace!(size, "observation batch persisted");
            }
            Err(e) => {
                self.counters.dropped.fetch_add(size, Ordering::Relaxed);
                error!(size, attempts, error = %e, "observation batch dropped after retries");
            }
        }
    }
}
