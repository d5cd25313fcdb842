//! Statistical analyzer tests
//!
//! End-to-end from raw observations to a recommendation.

use serde_json::json;
use trueno_ab::experiment::{Experiment, MetricDefinition, Observation, Variant};
use trueno_ab::stats::{Analyzer, Outcome, Recommendation};

fn binary_experiment(min_sample_size: u64) -> Experiment {
    Experiment::builder("exp-bin", "checkout", "Button colour")
        .variant(Variant::control("a", "Blue", json!({})))
        .variant(Variant::new("b", "Green", json!({})))
        .metric(MetricDefinition::binary("conversion").primary())
        .min_sample_size(min_sample_size)
        .build()
}

fn conversions(variant: &str, successes: usize, trials: usize) -> Vec<Observation> {
    (0..trials)
        .map(|i| {
            let value = if i < successes { 1.0 } else { 0.0 };
            Observation::new("exp-bin", variant, "conversion", value, format!("{variant}-{i}"))
        })
        .collect()
}

/// Values centred on `mean` with a symmetric spread of ±`spread`.
#[allow(clippy::cast_precision_loss)]
fn latencies(exp: &str, variant: &str, mean: f64, spread: f64, n: usize) -> Vec<Observation> {
    (0..n)
        .map(|i| {
            let offset = ((i % 21) as f64 - 10.0) / 10.0 * spread;
            Observation::new(exp, variant, "latency_ms", mean + offset, format!("{variant}-{i}"))
        })
        .collect()
}

#[test]
fn test_binary_significant_winner() {
    let experiment = binary_experiment(100);
    let mut observations = conversions("a", 100, 1_000);
    observations.extend(conversions("b", 150, 1_000));

    let results = Analyzer::new().analyze(&experiment, observations);
    let row = results.result("b", "conversion").unwrap();

    assert_eq!(row.outcome, Outcome::Significant);
    assert!(row.p_value.unwrap() < 0.05);
    assert!(row.effect_size.unwrap() > 0.0);
    assert!((row.improvement_pct.unwrap() - 50.0).abs() < 1e-9);
    assert!(results.can_conclude);
    assert_eq!(results.winner_variant_id.as_deref(), Some("b"));
    assert_eq!(
        results.recommendation,
        Recommendation::Promote {
            variant_id: "b".to_string()
        }
    );

    let control = results.result("a", "conversion").unwrap();
    assert_eq!(control.outcome, Outcome::Baseline);
    assert!((control.value - 0.1).abs() < 1e-12);
}

#[test]
fn test_binary_no_difference() {
    let experiment = binary_experiment(100);
    let mut observations = conversions("a", 100, 1_000);
    observations.extend(conversions("b", 102, 1_000));

    let results = Analyzer::new().analyze(&experiment, observations);
    let row = results.result("b", "conversion").unwrap();

    assert_eq!(row.outcome, Outcome::NotSignificant);
    assert!(!row.significant);
    assert!(row.improvement_pct.is_some());
    assert!(results.can_conclude);
    assert_eq!(results.recommendation, Recommendation::InsufficientEvidence);
}

#[test]
fn test_below_minimum_cannot_conclude() {
    let experiment = binary_experiment(100);
    let mut observations = conversions("a", 5, 50);
    observations.extend(conversions("b", 40, 50));

    let results = Analyzer::new().analyze(&experiment, observations);
    let row = results.result("b", "conversion").unwrap();

    assert_eq!(row.outcome, Outcome::InsufficientData);
    assert!(row.p_value.is_none());
    assert!((row.value - 0.8).abs() < 1e-12);
    assert!(!results.can_conclude);
    assert!(results.winner_variant_id.is_none());
    assert_eq!(results.recommendation, Recommendation::InsufficientEvidence);
}

#[test]
fn test_degenerate_table() {
    let experiment = binary_experiment(10);
    let mut observations = conversions("a", 0, 200);
    observations.extend(conversions("b", 0, 200));

    let results = Analyzer::new().analyze(&experiment, observations);
    let row = results.result("b", "conversion").unwrap();

    assert_eq!(row.outcome, Outcome::Degenerate);
    assert!(row.p_value.is_none());
    assert!(!row.significant);
    assert!(!results.can_conclude);
}

#[test]
fn test_duplicate_requests_counted_once() {
    let experiment = binary_experiment(10);
    let mut observations = conversions("a", 10, 100);
    let b = conversions("b", 20, 100);
    observations.extend(b.iter().cloned());
    observations.extend(b);

    let results = Analyzer::new().analyze(&experiment, observations);
    assert_eq!(results.result("b", "conversion").unwrap().sample_size, 100);
}

#[test]
fn test_continuous_significant_and_direction() {
    let faster = Experiment::builder("exp-lat", "search", "Index tuning")
        .variant(Variant::control("a", "Old", json!({})))
        .variant(Variant::new("b", "New", json!({})))
        .metric(MetricDefinition::continuous("latency_ms").primary().lower_is_better())
        .build();

    let mut observations = latencies("exp-lat", "a", 200.0, 20.0, 500);
    observations.extend(latencies("exp-lat", "b", 190.0, 20.0, 500));

    let results = Analyzer::new().analyze(&faster, observations.clone());
    let row = results.result("b", "latency_ms").unwrap();
    assert_eq!(row.outcome, Outcome::Significant);
    assert!(row.statistic.unwrap() < 0.0);
    assert!(row.effect_size.unwrap() < 0.0);
    assert_eq!(results.winner_variant_id.as_deref(), Some("b"));

    // Same data, but higher is better: b is significantly worse
    let slower_is_bad = Experiment::builder("exp-lat", "search", "Index tuning")
        .variant(Variant::control("a", "Old", json!({})))
        .variant(Variant::new("b", "New", json!({})))
        .metric(MetricDefinition::continuous("latency_ms").primary())
        .build();
    let results = Analyzer::new().analyze(&slower_is_bad, observations);
    assert_eq!(
        results.result("b", "latency_ms").unwrap().outcome,
        Outcome::Significant
    );
    assert!(results.winner_variant_id.is_none());
}

#[test]
fn test_continuous_zero_variance_is_inconclusive() {
    let experiment = Experiment::builder("exp-flat", "search", "flat")
        .variant(Variant::control("a", "A", json!({})))
        .variant(Variant::new("b", "B", json!({})))
        .metric(MetricDefinition::continuous("latency_ms").primary())
        .min_sample_size(10)
        .build();

    let mut observations = latencies("exp-flat", "a", 100.0, 0.0, 50);
    observations.extend(latencies("exp-flat", "b", 100.0, 0.0, 50));

    let results = Analyzer::new().analyze(&experiment, observations);
    let row = results.result("b", "latency_ms").unwrap();
    assert_eq!(row.outcome, Outcome::Inconclusive);
    assert!(row.effect_size.is_none());
    assert!(!results.can_conclude);
}

#[test]
fn test_largest_directional_effect_wins() {
    let experiment = Experiment::builder("exp-bin", "checkout", "three-way")
        .variant(Variant::control("a", "A", json!({})))
        .variant(Variant::new("b", "B", json!({})))
        .variant(Variant::new("c", "C", json!({})))
        .metric(MetricDefinition::binary("conversion").primary())
        .build();

    let mut observations = conversions("a", 100, 1_000);
    observations.extend(conversions("b", 150, 1_000));
    observations.extend(conversions("c", 200, 1_000));

    let results = Analyzer::new().analyze(&experiment, observations);
    assert_eq!(results.winner_variant_id.as_deref(), Some("c"));
}

#[test]
fn test_results_serialize() {
    let experiment = binary_experiment(10);
    let mut observations = conversions("a", 10, 100);
    observations.extend(conversions("b", 30, 100));

    let results = Analyzer::new().analyze(&experiment, observations);
    let value = serde_json::to_value(&results).unwrap();
    assert_eq!(value["recommendation"]["action"], "promote");
    assert_eq!(value["variant_results"][0]["outcome"], "baseline");
}
