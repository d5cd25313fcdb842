//! Experiment Schema Tests
//!
//! Definitions are plain serde values: serializing and reloading must yield
//! an identical definition.

use std::time::Duration;

use serde_json::json;
use trueno_ab::experiment::{
    Comparison, Experiment, ExperimentStatus, Guardrail, GuardrailAction, MetricDefinition,
    MetricKind, Observation, Variant, DEFAULT_ALPHA, DEFAULT_MIN_SAMPLE_SIZE,
};

fn full_definition() -> Experiment {
    Experiment::builder("exp-001", "checkout", "Payment redesign")
        .variant(Variant::control("a", "Current", json!({"flow": "v1", "retries": 3})))
        .variant(Variant::new("b", "Redesign", json!({"flow": "v2", "retries": 3})))
        .variant(Variant::new("c", "Redesign + prefetch", json!({"flow": "v2", "prefetch": true})))
        .metric(MetricDefinition::binary("conversion").primary())
        .metric(MetricDefinition::continuous("latency_ms").lower_is_better())
        .metric(MetricDefinition::binary("error").lower_is_better())
        .guardrail(Guardrail::new(
            "error",
            Comparison::Above,
            0.05,
            Duration::from_secs(600),
            GuardrailAction::StopVariant,
        ))
        .guardrail(Guardrail::new(
            "latency_ms",
            Comparison::Above,
            800.0,
            Duration::from_secs(300),
            GuardrailAction::Alert,
        ))
        .split([("a", 0.5), ("b", 0.25), ("c", 0.25)])
        .alpha(0.01)
        .min_sample_size(500)
        .build()
}

// =============================================================================
// Experiment
// =============================================================================

#[test]
fn test_builder_defaults() {
    let experiment = Experiment::builder("exp-002", "search", "Ranking")
        .variant(Variant::control("a", "A", json!({})))
        .variant(Variant::new("b", "B", json!({})))
        .metric(MetricDefinition::binary("click").primary())
        .build();

    assert_eq!(experiment.status(), ExperimentStatus::Draft);
    assert!((experiment.alpha() - DEFAULT_ALPHA).abs() < f64::EPSILON);
    assert_eq!(experiment.min_sample_size(), DEFAULT_MIN_SAMPLE_SIZE);
    assert_eq!(experiment.version(), 0);
    assert!(experiment.started_at().is_none());
    assert_eq!(experiment.split().share_of("a"), Some(0.5));
    assert_eq!(experiment.control().unwrap().id(), "a");
    assert_eq!(experiment.primary_metric().unwrap().id(), "click");
}

#[test]
fn test_full_definition_validates() {
    let experiment = full_definition();
    assert!(experiment.validate().is_ok());
    assert_eq!(experiment.treatments().count(), 2);
    assert_eq!(experiment.guardrails().len(), 2);
    assert_eq!(experiment.metric("latency_ms").unwrap().kind(), MetricKind::Continuous);
}

#[test]
fn test_definition_round_trip() {
    let experiment = full_definition();

    let json = serde_json::to_string_pretty(&experiment).unwrap();
    let reloaded: Experiment = serde_json::from_str(&json).unwrap();

    assert_eq!(reloaded, experiment);
    assert_eq!(serde_json::to_string_pretty(&reloaded).unwrap(), json);
}

#[test]
fn test_variant_config_is_opaque() {
    let nested = json!({"thresholds": [0.1, 0.2], "model": {"name": "ranker-v3", "depth": 12}});
    let variant = Variant::new("b", "B", nested.clone());
    let reloaded: Variant = serde_json::from_str(&serde_json::to_string(&variant).unwrap()).unwrap();

    assert_eq!(reloaded.config(), &nested);
    assert!(!reloaded.is_control());
}

#[test]
fn test_guardrail_validation() {
    let bad_rate = Experiment::builder("exp-003", "checkout", "bad guardrail")
        .variant(Variant::control("a", "A", json!({})))
        .variant(Variant::new("b", "B", json!({})))
        .metric(MetricDefinition::binary("conversion").primary())
        .metric(MetricDefinition::binary("error"))
        .guardrail(Guardrail::new(
            "error",
            Comparison::Above,
            5.0,
            Duration::from_secs(60),
            GuardrailAction::Alert,
        ))
        .build();
    assert!(bad_rate.validate().is_err());

    let unknown_metric = Experiment::builder("exp-004", "checkout", "unknown metric")
        .variant(Variant::control("a", "A", json!({})))
        .variant(Variant::new("b", "B", json!({})))
        .metric(MetricDefinition::binary("conversion").primary())
        .guardrail(Guardrail::new(
            "crash",
            Comparison::Above,
            0.01,
            Duration::from_secs(60),
            GuardrailAction::StopExperiment,
        ))
        .build();
    assert!(unknown_metric.validate().is_err());
}

#[test]
fn test_comparison_breach() {
    assert!(Comparison::Above.breached(0.18, 0.05));
    assert!(!Comparison::Above.breached(0.05, 0.05));
    assert!(Comparison::Below.breached(0.01, 0.05));
    assert!(!Comparison::Below.breached(0.05, 0.05));
}

// =============================================================================
// Observation
// =============================================================================

#[test]
fn test_observation_round_trip() {
    let observation = Observation::new("exp-001", "b", "latency_ms", 123.456, "req-9");
    let json = serde_json::to_string(&observation).unwrap();
    let reloaded: Observation = serde_json::from_str(&json).unwrap();

    assert_eq!(reloaded, observation);
    assert_eq!(reloaded.request_id(), "req-9");
    assert!((reloaded.value() - 123.456).abs() < f64::EPSILON);
}
