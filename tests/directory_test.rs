//! Experiment directory tests
//!
//! Validation, lifecycle, one-active-experiment-per-target, variant removal
//! and snapshot replication.

use std::sync::Arc;

use serde_json::json;
use trueno_ab::assignment::resolve;
use trueno_ab::directory::{EventKind, EventLog, ExperimentDirectory};
use trueno_ab::experiment::{Experiment, ExperimentStatus, MetricDefinition, Variant};
use trueno_ab::Error;

fn experiment(id: &str, target: &str) -> Experiment {
    Experiment::builder(id, target, "Button colour")
        .variant(Variant::control("a", "Blue", json!({"colour": "blue"})))
        .variant(Variant::new("b", "Green", json!({"colour": "green"})))
        .metric(MetricDefinition::binary("conversion").primary())
        .split([("a", 0.5), ("b", 0.5)])
        .build()
}

#[test]
fn test_split_summing_to_097_is_rejected() {
    let directory = ExperimentDirectory::new();
    let bad = Experiment::builder("exp-bad", "checkout", "bad split")
        .variant(Variant::control("a", "A", json!({})))
        .variant(Variant::new("b", "B", json!({})))
        .metric(MetricDefinition::binary("conversion").primary())
        .split([("a", 0.5), ("b", 0.47)])
        .build();
    directory.create(bad).unwrap();

    let err = directory.start("exp-bad").unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("sum to 1.0"));
    assert_eq!(directory.get("exp-bad").unwrap().status(), ExperimentStatus::Draft);
}

#[test]
fn test_split_summing_to_one_is_accepted() {
    let directory = ExperimentDirectory::new();
    directory.create(experiment("exp-ok", "checkout")).unwrap();

    let started = directory.start("exp-ok").unwrap();
    assert_eq!(started.status(), ExperimentStatus::Running);
    assert_eq!(directory.events().count("exp-ok", EventKind::Transition), 2);
}

#[test]
fn test_invalid_definitions() {
    let no_primary = Experiment::builder("e", "t", "n")
        .variant(Variant::control("a", "A", json!({})))
        .variant(Variant::new("b", "B", json!({})))
        .metric(MetricDefinition::binary("conversion"))
        .build();
    assert!(matches!(no_primary.validate(), Err(Error::Validation(_))));

    let two_controls = Experiment::builder("e", "t", "n")
        .variant(Variant::control("a", "A", json!({})))
        .variant(Variant::control("b", "B", json!({})))
        .metric(MetricDefinition::binary("conversion").primary())
        .build();
    assert!(matches!(two_controls.validate(), Err(Error::Validation(_))));

    let control_only = Experiment::builder("e", "t", "n")
        .variant(Variant::control("a", "A", json!({})))
        .metric(MetricDefinition::binary("conversion").primary())
        .build();
    assert!(matches!(control_only.validate(), Err(Error::Validation(_))));
}

#[test]
fn test_one_active_experiment_per_target() {
    let directory = ExperimentDirectory::new();
    directory.create(experiment("exp-1", "checkout")).unwrap();
    directory.create(experiment("exp-2", "checkout")).unwrap();
    directory.create(experiment("exp-3", "search")).unwrap();

    directory.start("exp-1").unwrap();
    assert!(matches!(directory.start("exp-2"), Err(Error::Conflict(_))));
    directory.start("exp-3").unwrap();

    // Paused still holds the target
    directory.pause("exp-1").unwrap();
    assert!(directory.get_active("checkout").is_none());
    assert!(matches!(directory.start("exp-2"), Err(Error::Conflict(_))));

    directory.stop("exp-1", "superseded").unwrap();
    directory.start("exp-2").unwrap();
    assert_eq!(directory.get_active("checkout").unwrap().id(), "exp-2");
}

#[test]
fn test_concurrent_starts_on_one_target() {
    let directory = Arc::new(ExperimentDirectory::new());
    for i in 0..8 {
        directory.create(experiment(&format!("exp-{i}"), "checkout")).unwrap();
    }

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let directory = Arc::clone(&directory);
            std::thread::spawn(move || directory.start(&format!("exp-{i}")).is_ok())
        })
        .collect();
    let started = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(started, 1);
    assert_eq!(directory.running().len(), 1);
}

#[test]
fn test_illegal_transitions() {
    let directory = ExperimentDirectory::new();
    directory.create(experiment("exp-1", "checkout")).unwrap();

    assert!(matches!(directory.pause("exp-1"), Err(Error::Conflict(_))));
    assert!(matches!(directory.resume("exp-1"), Err(Error::Conflict(_))));

    directory.start("exp-1").unwrap();
    directory.stop("exp-1", "done").unwrap();
    assert!(matches!(directory.start("exp-1"), Err(Error::Conflict(_))));
    assert!(matches!(directory.stop("exp-1", "again"), Err(Error::Conflict(_))));
    assert!(matches!(
        directory.start("missing"),
        Err(Error::NotFound { .. })
    ));
}

#[test]
fn test_update_only_in_draft() {
    let directory = ExperimentDirectory::new();
    directory.create(experiment("exp-1", "checkout")).unwrap();

    let renamed = Experiment::builder("exp-1", "checkout", "Renamed")
        .variant(Variant::control("a", "Blue", json!({})))
        .variant(Variant::new("b", "Green", json!({})))
        .metric(MetricDefinition::binary("conversion").primary())
        .build();
    let updated = directory.update(renamed.clone()).unwrap();
    assert_eq!(updated.name(), "Renamed");

    directory.start("exp-1").unwrap();
    assert!(matches!(directory.update(renamed), Err(Error::Conflict(_))));
}

#[test]
fn test_stopped_variant_falls_to_control_only() {
    let directory = ExperimentDirectory::new();
    directory
        .create(
            Experiment::builder("exp-1", "checkout", "three-way")
                .variant(Variant::control("a", "A", json!({})))
                .variant(Variant::new("b", "B", json!({})))
                .variant(Variant::new("c", "C", json!({})))
                .metric(MetricDefinition::binary("conversion").primary())
                .split([("a", 0.4), ("b", 0.3), ("c", 0.3)])
                .build(),
        )
        .unwrap();
    directory.start("exp-1").unwrap();

    let before = directory.get("exp-1").unwrap();
    let identities: Vec<String> = (0..5_000).map(|i| format!("user-{i}")).collect();
    let assigned: Vec<&str> = identities
        .iter()
        .map(|id| resolve(id, "exp-1", before.split()))
        .collect();

    assert!(directory.stop_variant("exp-1", "b", json!({})).unwrap());
    assert!(!directory.stop_variant("exp-1", "b", json!({})).unwrap());
    assert!(matches!(
        directory.stop_variant("exp-1", "a", json!({})),
        Err(Error::Validation(_))
    ));

    let after = directory.get("exp-1").unwrap();
    for (id, previous) in identities.iter().zip(&assigned) {
        let now = resolve(id, "exp-1", after.split());
        match *previous {
            "b" => assert_eq!(now, "a"),
            other => assert_eq!(now, other),
        }
    }
    assert!((after.split().effective_share("a") - 0.7).abs() < 1e-12);
    assert_eq!(directory.events().count("exp-1", EventKind::VariantStopped), 1);
}

#[test]
fn test_export_and_rebuild() {
    let directory = ExperimentDirectory::new();
    directory.create(experiment("exp-1", "checkout")).unwrap();
    directory.create(experiment("exp-2", "search")).unwrap();
    directory.start("exp-1").unwrap();
    directory.annotate("exp-1", "owner", "growth").unwrap();

    let exported = directory.export();
    let json = serde_json::to_string(&exported).unwrap();
    let definitions: Vec<Experiment> = serde_json::from_str(&json).unwrap();
    assert_eq!(definitions, exported);

    let replica = ExperimentDirectory::from_definitions(definitions, Arc::new(EventLog::new())).unwrap();
    assert_eq!(replica.get_active("checkout").unwrap().id(), "exp-1");
    assert_eq!(
        replica.get("exp-1").unwrap().annotations().get("owner").map(String::as_str),
        Some("growth")
    );
    assert_eq!(replica.get("exp-2").unwrap().status(), ExperimentStatus::Draft);
}

#[test]
fn test_rebuild_rejects_two_running_on_one_target() {
    let directory_a = ExperimentDirectory::new();
    directory_a.create(experiment("exp-1", "checkout")).unwrap();
    directory_a.start("exp-1").unwrap();
    let directory_b = ExperimentDirectory::new();
    directory_b.create(experiment("exp-2", "checkout")).unwrap();
    directory_b.start("exp-2").unwrap();

    let mut definitions = directory_a.export();
    definitions.extend(directory_b.export());
    let result = ExperimentDirectory::from_definitions(definitions, Arc::new(EventLog::new()));
    assert!(matches!(result, Err(Error::Conflict(_))));
}
