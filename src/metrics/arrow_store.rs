//! Columnar observation log (Arrow/Parquet)
//!
//! **Append-only**: observations are never updated in place. Each flushed
//! batch becomes one Arrow `RecordBatch`; scans filter the batches
//! column-wise and materialize only matching rows.
//!
//! The log can be exported to and reloaded from Parquet, which is the
//! persisted Observations layout:
//!
//! | column          | type    |
//! |-----------------|---------|
//! | experiment_id   | Utf8    |
//! | variant_id      | Utf8    |
//! | metric_id       | Utf8    |
//! | value           | Float64 |
//! | request_id      | Utf8    |
//! | recorded_at_us  | Int64 (microseconds since the Unix epoch) |
//!
//! Timestamps are stored at microsecond precision.

use std::fs::File;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use arrow::array::{Array, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use super::ObservationStore;
use crate::experiment::Observation;
use crate::{Error, Result};

/// Arrow schema of the observation log.
#[must_use]
pub fn observation_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("experiment_id", DataType::Utf8, false),
        Field::new("variant_id", DataType::Utf8, false),
        Field::new("metric_id", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("request_id", DataType::Utf8, false),
        Field::new("recorded_at_us", DataType::Int64, false),
    ]))
}

/// Append-only Arrow observation log.
#[derive(Debug)]
pub struct ArrowObservationStore {
    schema: SchemaRef,
    batches: RwLock<Vec<RecordBatch>>,
}

impl Default for ArrowObservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ArrowObservationStore {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            schema: observation_schema(),
            batches: RwLock::new(Vec::new()),
        }
    }

    /// Load a log from a Parquet file.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageError` if the file cannot be read or its
    /// schema is not the observation schema.
    pub fn load_parquet<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .map_err(|e| Error::StorageError(format!("Failed to open Parquet file: {e}")))?;

        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| Error::StorageError(format!("Failed to parse Parquet file: {e}")))?
            .build()
            .map_err(|e| Error::StorageError(format!("Failed to create Parquet reader: {e}")))?;

        let store = Self::new();
        for batch in reader {
            let batch = batch
                .map_err(|e| Error::StorageError(format!("Failed to read record batch: {e}")))?;
            store.append_batch(batch)?;
        }
        Ok(store)
    }

    /// Write the whole log to a Parquet file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn save_parquet<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = ArrowWriter::try_new(file, Arc::clone(&self.schema), None)?;
        for batch in self.read().iter() {
            writer.write(batch)?;
        }
        writer.close()?;
        Ok(())
    }

    /// Append a pre-built batch.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageError` if the batch schema is not the
    /// observation schema.
    pub fn append_batch(&self, batch: RecordBatch) -> Result<()> {
        if batch.schema().fields() != self.schema.fields() {
            return Err(Error::StorageError(format!(
                "Schema mismatch: expected {:?}, got {:?}",
                self.schema,
                batch.schema()
            )));
        }
        if batch.num_rows() > 0 {
            self.batches
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .push(batch);
        }
        Ok(())
    }

    /// Number of record batches in the log.
    #[must_use]
    pub fn num_batches(&self) -> usize {
        self.read().len()
    }

    /// Number of observations in the log.
    #[must_use]
    pub fn num_rows(&self) -> usize {
        self.read().iter().map(RecordBatch::num_rows).sum()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<RecordBatch>> {
        self.batches.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn to_record_batch(&self, observations: &[Observation]) -> Result<RecordBatch> {
        let experiment_ids =
            StringArray::from_iter_values(observations.iter().map(Observation::experiment_id));
        let variant_ids =
            StringArray::from_iter_values(observations.iter().map(Observation::variant_id));
        let metric_ids =
            StringArray::from_iter_values(observations.iter().map(Observation::metric_id));
        let values = Float64Array::from_iter_values(observations.iter().map(Observation::value));
        let request_ids =
            StringArray::from_iter_values(observations.iter().map(Observation::request_id));
        let recorded_at = Int64Array::from_iter_values(
            observations.iter().map(|o| o.recorded_at().timestamp_micros()),
        );

        Ok(RecordBatch::try_new(
            Arc::clone(&self.schema),
            vec![
                Arc::new(experiment_ids),
                Arc::new(variant_ids),
                Arc::new(metric_ids),
                Arc::new(values),
                Arc::new(request_ids),
                Arc::new(recorded_at),
            ],
        )?)
    }
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| Error::StorageError(format!("column '{name}' missing or mistyped")))
}

fn scan_batch(
    batch: &RecordBatch,
    experiment_id: &str,
    since_us: Option<i64>,
    out: &mut Vec<Observation>,
) -> Result<()> {
    let experiments = column::<StringArray>(batch, "experiment_id")?;
    let variants = column::<StringArray>(batch, "variant_id")?;
    let metrics = column::<StringArray>(batch, "metric_id")?;
    let values = column::<Float64Array>(batch, "value")?;
    let requests = column::<StringArray>(batch, "request_id")?;
    let recorded = column::<Int64Array>(batch, "recorded_at_us")?;

    for row in 0..batch.num_rows() {
        if experiments.value(row) != experiment_id {
            continue;
        }
        let at_us = recorded.value(row);
        if since_us.is_some_and(|since| at_us < since) {
            continue;
        }
        let recorded_at = DateTime::<Utc>::from_timestamp_micros(at_us)
            .ok_or_else(|| Error::StorageError(format!("timestamp out of range: {at_us}")))?;
        out.push(
            Observation::builder(
                experiment_id,
                variants.value(row),
                metrics.value(row),
                values.value(row),
                requests.value(row),
            )
            .recorded_at(recorded_at)
            .build(),
        );
    }
    Ok(())
}

impl ObservationStore for ArrowObservationStore {
    async fn append(&self, batch: &[Observation]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let record_batch = self.to_record_batch(batch)?;
        self.append_batch(record_batch)
    }

    async fn scan(
        &self,
        experiment_id: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Observation>> {
        let since_us = since.map(|t| t.timestamp_micros());
        let mut out = Vec::new();
        for batch in self.read().iter() {
            scan_batch(batch, experiment_id, since_us, &mut out)?;
        }
        Ok(out)
    }
}
