//! Engine configuration
//!
//! Every field has a default, so a partial JSON document is a valid config:
//!
//! ```json
//! {
//!   "alpha": 0.01,
//!   "dedup_window_secs": 86400,
//!   "pipeline": { "flush_interval_ms": 250 },
//!   "guardrail": { "interval_secs": 300 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::experiment::{DEFAULT_ALPHA, DEFAULT_MIN_SAMPLE_SIZE};
use crate::guardrail::GuardrailConfig;
use crate::metrics::PipelineConfig;
use crate::promotion::PromotionConfig;
use crate::{Error, Result};

/// Longest request-id deduplication window (366 days).
pub const MAX_DEDUP_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default significance level for experiments built through the engine
    pub alpha: f64,
    /// Default minimum sample size per arm
    pub min_sample_size: u64,
    /// Request-id deduplication window; `None` keeps every request id
    pub dedup_window_secs: Option<u64>,
    /// Keep an in-memory log of (identity, experiment) → variant assignments
    pub record_assignments: bool,
    /// Metrics pipeline
    pub pipeline: PipelineConfig,
    /// Guardrail monitor
    pub guardrail: GuardrailConfig,
    /// Promotion controller
    pub promotion: PromotionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            min_sample_size: DEFAULT_MIN_SAMPLE_SIZE,
            dedup_window_secs: None,
            record_assignments: false,
            pipeline: PipelineConfig::default(),
            guardrail: GuardrailConfig::default(),
            promotion: PromotionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    ///
    /// `Error::Serialization` for malformed JSON, `Error::InvalidConfig` for
    /// out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the file cannot be read, otherwise as
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Check ranges.
    ///
    /// # Errors
    ///
    /// `Error::InvalidConfig` describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "alpha must be in (0, 1), got {}",
                self.alpha
            )));
        }
        if self.min_sample_size < 2 {
            return Err(Error::InvalidConfig(format!(
                "min_sample_size must be at least 2, got {}",
                self.min_sample_size
            )));
        }
        if let Some(secs) = self.dedup_window_secs {
            if secs == 0 || secs > MAX_DEDUP_WINDOW_SECS {
                return Err(Error::InvalidConfig(format!(
                    "dedup_window_secs must be between 1 and {MAX_DEDUP_WINDOW_SECS}, got {secs}"
                )));
            }
        }
        if self.guardrail.interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "guardrail interval_secs must be positive".to_string(),
            ));
        }
        self.pipeline.validate()?;
        self.promotion.validate()
    }

    /// Deduplication window as a `chrono::Duration`, capped at
    /// [`MAX_DEDUP_WINDOW_SECS`].
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn dedup_window(&self) -> Option<chrono::Duration> {
        self.dedup_window_secs
            .map(|secs| chrono::Duration::seconds(secs.min(MAX_DEDUP_WINDOW_SECS) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{"alpha": 0.01, "pipeline": {"batch_size": 16}, "dedup_window_secs": 60}"#,
        )
        .unwrap();

        assert!((config.alpha - 0.01).abs() < f64::EPSILON);
        assert_eq!(config.pipeline.batch_size, 16);
        assert_eq!(config.pipeline.channel_capacity, 65_536);
        assert_eq!(config.guardrail, GuardrailConfig::default());
        assert_eq!(config.dedup_window(), Some(chrono::Duration::seconds(60)));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let err = EngineConfig::from_json_str(r#"{"alpha": 1.5}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = EngineConfig::from_json_str(r#"{"promotion": {"steps": [0.5, 0.2]}}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let err = EngineConfig::from_json_str(r#"{"min_sample_size": 1}"#).unwrap_err();
        assert!(err.to_string().contains("at least 2"));

        let err = EngineConfig::from_json_str("{not json").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_rejects_unrepresentable_dedup_window() {
        let err = EngineConfig::from_json_str(r#"{"dedup_window_secs": 18446744073709551615}"#)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));

        let config = EngineConfig::from_json_str(&format!(
            r#"{{"dedup_window_secs": {MAX_DEDUP_WINDOW_SECS}}}"#
        ))
        .unwrap();
        assert_eq!(
            config.dedup_window(),
            Some(chrono::Duration::days(366))
        );

        let unchecked = EngineConfig {
            dedup_window_secs: Some(u64::MAX),
            ..EngineConfig::default()
        };
        assert_eq!(unchecked.dedup_window(), Some(chrono::Duration::days(366)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"record_assignments": true}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert!(config.record_assignments);

        let missing = EngineConfig::from_file("/nonexistent/trueno-ab.json");
        assert!(matches!(missing, Err(Error::Io(_))));
    }
}
