//! Guardrail monitor tests through the engine facade

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use trueno_ab::directory::EventKind;
use trueno_ab::experiment::{
    Comparison, ExperimentStatus, Guardrail, GuardrailAction, MetricDefinition, Variant,
};
use trueno_ab::{Engine, Subject};

fn engine_with_guardrail(action: GuardrailAction) -> Engine {
    let engine = Engine::builder().build().unwrap();
    engine
        .create(
            engine
                .experiment("exp-1", "checkout", "New payment flow")
                .variant(Variant::control("a", "Current", json!({"flow": "v1"})))
                .variant(Variant::new("b", "Redesign", json!({"flow": "v2"})))
                .metric(MetricDefinition::binary("conversion").primary())
                .metric(MetricDefinition::binary("error").lower_is_better())
                .guardrail(Guardrail::new(
                    "error",
                    Comparison::Above,
                    0.05,
                    Duration::from_secs(300),
                    action,
                ))
                .build(),
        )
        .unwrap();
    engine.start("exp-1").unwrap();
    engine
}

fn report_errors(engine: &Engine, variant: &str, errors: usize, total: usize) {
    for i in 0..total {
        let error = if i < errors { 1.0 } else { 0.0 };
        engine.record(
            "exp-1",
            variant,
            &format!("{variant}-req-{i}"),
            [("error", error), ("conversion", 0.0)],
        );
    }
}

#[tokio::test]
async fn test_error_rate_breach_stops_variant_once() {
    let engine = engine_with_guardrail(GuardrailAction::StopVariant);
    report_errors(&engine, "a", 1, 100);
    report_errors(&engine, "b", 18, 100);
    engine.flush().await.unwrap();

    let breaches = engine.monitor().run_cycle(Utc::now()).await;
    assert_eq!(breaches.len(), 1);
    assert_eq!(breaches[0].variant_id, "b");
    assert_eq!(breaches[0].samples, 100);

    // Later cycles see the same data and do nothing
    assert!(engine.monitor().run_cycle(Utc::now()).await.is_empty());
    assert!(engine.monitor().run_cycle(Utc::now()).await.is_empty());

    let events = engine.events("exp-1");
    let stopped: Vec<_> = events
        .iter()
        .filter(|e| e.kind == EventKind::VariantStopped)
        .collect();
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].detail["variant_id"], "b");
    assert_eq!(
        events
            .iter()
            .filter(|e| e.kind == EventKind::GuardrailBreached)
            .count(),
        1
    );

    for i in 0..10_000 {
        let subject = Subject::new(format!("r{i}")).user(format!("user-{i}"));
        let resolution = engine.resolve("checkout", &subject).unwrap();
        assert_eq!(resolution.variant_id, "a");
    }
}

#[tokio::test]
async fn test_healthy_variant_untouched() {
    let engine = engine_with_guardrail(GuardrailAction::StopVariant);
    report_errors(&engine, "b", 2, 100);
    engine.flush().await.unwrap();

    assert!(engine.monitor().run_cycle(Utc::now()).await.is_empty());
    let experiment = engine.directory().get("exp-1").unwrap();
    assert!(!experiment.split().is_removed("b"));
    assert!(experiment.violations().is_empty());
}

#[tokio::test]
async fn test_stop_experiment_reverts_target_to_baseline() {
    let engine = engine_with_guardrail(GuardrailAction::StopExperiment);
    report_errors(&engine, "b", 40, 100);
    engine.flush().await.unwrap();

    engine.monitor().run_cycle(Utc::now()).await;

    assert_eq!(
        engine.directory().get("exp-1").unwrap().status(),
        ExperimentStatus::Stopped
    );
    assert!(engine
        .resolve("checkout", &Subject::new("r1").user("user-1"))
        .is_none());
}

#[tokio::test]
async fn test_alert_keeps_serving_but_blocks_winner() {
    let engine = engine_with_guardrail(GuardrailAction::Alert);
    report_errors(&engine, "b", 30, 200);
    engine.flush().await.unwrap();

    let breaches = engine.monitor().run_cycle(Utc::now()).await;
    assert_eq!(breaches[0].action, GuardrailAction::Alert);

    let experiment = engine.directory().get("exp-1").unwrap();
    assert!(experiment.has_violation("b"));
    assert_eq!(experiment.status(), ExperimentStatus::Running);
}
