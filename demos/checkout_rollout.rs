//! Checkout Rollout Example
//!
//! Runs a three-way checkout experiment end to end:
//! a broken variant gets stopped by its error-rate guardrail, the analyzer
//! picks the better of the remaining ones, and the winner is ramped to
//! 100% and becomes the new baseline.
//!
//! Run with: cargo run --example checkout_rollout

use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use trueno_ab::experiment::{Comparison, Guardrail, GuardrailAction, MetricDefinition, Variant};
use trueno_ab::{logging, Engine, Recommendation, RolloutStrategy, Subject};

const USERS: usize = 30_000;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init("trueno_ab=info");
    println!("=== Trueno-AB Checkout Rollout ===\n");

    let engine = Engine::builder().build()?;
    engine.seed_baseline("checkout", json!({"layout": "classic"}));

    // -------------------------------------------------------------------------
    // 1. Define and start the experiment
    // -------------------------------------------------------------------------
    println!("1. Creating experiment...");

    let experiment = engine
        .experiment("exp-checkout-7", "checkout", "One-page checkout")
        .variant(Variant::control("classic", "Classic", json!({"layout": "classic"})))
        .variant(Variant::new("one-page", "One page", json!({"layout": "one-page"})))
        .variant(Variant::new(
            "one-page-beta",
            "One page (beta payment SDK)",
            json!({"layout": "one-page", "sdk": "beta"}),
        ))
        .metric(MetricDefinition::binary("purchase").primary())
        .metric(MetricDefinition::continuous("latency_ms").lower_is_better())
        .metric(MetricDefinition::binary("error").lower_is_better())
        .guardrail(Guardrail::new(
            "error",
            Comparison::Above,
            0.05,
            Duration::from_secs(900),
            GuardrailAction::StopVariant,
        ))
        .split([("classic", 0.4), ("one-page", 0.3), ("one-page-beta", 0.3)])
        .build();

    engine.create(experiment)?;
    engine.start("exp-checkout-7")?;
    println!("   Started on target 'checkout'");

    // -------------------------------------------------------------------------
    // 2. First wave of traffic; the beta SDK misbehaves
    // -------------------------------------------------------------------------
    println!("\n2. Serving first wave ({} users)...", USERS / 3);

    let mut rng = StdRng::seed_from_u64(42);
    serve(&engine, &mut rng, 0..USERS / 3);
    engine.flush().await?;

    let breaches = engine.monitor().run_cycle(Utc::now()).await;
    for breach in &breaches {
        println!(
            "   Guardrail breach: {} {} = {:.3} (threshold {}) -> {:?}",
            breach.variant_id, breach.metric_id, breach.observed, breach.threshold, breach.action
        );
    }

    // -------------------------------------------------------------------------
    // 3. Remaining traffic, then analysis
    // -------------------------------------------------------------------------
    println!("\n3. Serving remaining traffic...");
    serve(&engine, &mut rng, USERS / 3..USERS);
    engine.flush().await?;

    let stats = engine.pipeline_stats();
    println!(
        "   Observations: accepted={} persisted={} dropped={}",
        stats.accepted, stats.persisted, stats.dropped
    );

    let results = engine.results("exp-checkout-7").await?;
    println!("\n   {:<15} {:<12} {:>7} {:>10} {:>10}", "variant", "metric", "n", "value", "p");
    for row in &results.variant_results {
        println!(
            "   {:<15} {:<12} {:>7} {:>10.4} {:>10}",
            row.variant_id,
            row.metric_id,
            row.sample_size,
            row.value,
            row.p_value.map_or_else(|| "-".to_string(), |p| format!("{p:.2e}"))
        );
    }
    println!("   can_conclude: {}", results.can_conclude);

    // -------------------------------------------------------------------------
    // 4. Gradual promotion of the winner
    // -------------------------------------------------------------------------
    let Recommendation::Promote { variant_id } = results.recommendation else {
        println!("\n4. No winner; the baseline stays as it is.");
        return Ok(());
    };
    println!("\n4. Promoting '{variant_id}' gradually...");

    let strategy = RolloutStrategy::Gradual {
        steps: vec![0.1, 0.5, 1.0],
        hold_secs: 3_600,
    };
    println!("   {:?}", engine.promote("exp-checkout-7", &variant_id, &strategy)?);

    let mut now = Utc::now();
    while engine.promotion().state("exp-checkout-7").is_some() {
        now += chrono::Duration::hours(2);
        for (_, state) in engine.promotion().tick(now) {
            println!("   {state:?}");
        }
    }

    let baseline = engine
        .baseline("checkout")
        .ok_or_else(|| anyhow::anyhow!("checkout lost its baseline"))?;
    println!("\n   New baseline: {}", baseline.config);
    println!("\n   Audit trail:");
    for event in engine.events("exp-checkout-7") {
        println!("   #{:<3} {:?} {}", event.seq, event.kind, event.detail);
    }

    println!("\n=== Done ===");
    Ok(())
}

/// Simulate one request per user in `users`.
fn serve(engine: &Engine, rng: &mut StdRng, users: std::ops::Range<usize>) {
    for i in users {
        let subject = Subject::new(format!("req-{i}")).user(format!("user-{i}"));
        let Some(resolution) = engine.resolve("checkout", &subject) else {
            continue;
        };

        let (purchase_rate, latency_mean, error_rate) = match resolution.variant_id.as_str() {
            "one-page" => (0.125, 310.0, 0.01),
            "one-page-beta" => (0.13, 290.0, 0.15),
            _ => (0.10, 340.0, 0.01),
        };
        let purchase = f64::from(u8::from(rng.gen_bool(purchase_rate)));
        let error = f64::from(u8::from(rng.gen_bool(error_rate)));
        let latency = latency_mean + rng.gen_range(-60.0..60.0);

        engine.record(
            &resolution.experiment_id,
            &resolution.variant_id,
            subject.request_id(),
            [("purchase", purchase), ("latency_ms", latency), ("error", error)],
        );
    }
}
