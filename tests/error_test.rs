//! Tests for error types

use trueno_ab::Error;

#[test]
fn test_validation_error() {
    let error = Error::Validation("traffic shares must sum to 1.0, got 0.97".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Validation failed"));
    assert!(error_str.contains("0.97"));
}

#[test]
fn test_conflict_error() {
    let error = Error::Conflict("target 'checkout' already runs 'exp-1'".to_string());
    assert!(format!("{error}").starts_with("Conflict"));
}

#[test]
fn test_not_found_error() {
    let error = Error::NotFound {
        kind: "Experiment",
        id: "exp-404".to_string(),
    };
    let error_str = format!("{error}");
    assert_eq!(error_str, "Experiment not found: 'exp-404'");
}

#[test]
fn test_promotion_failed_error() {
    let error = Error::PromotionFailed {
        experiment_id: "exp-1".to_string(),
        reason: "config store timeout".to_string(),
    };
    let error_str = format!("{error}");
    assert!(error_str.contains("exp-1"));
    assert!(error_str.contains("config store timeout"));
    assert!(error_str.contains("Last-known-good configuration retained"));
}

#[test]
fn test_persistence_error() {
    let error = Error::Persistence("disk full".to_string());
    assert!(format!("{error}").contains("Persistence error"));
}

#[test]
fn test_storage_error() {
    let error = Error::StorageError("file not found".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Storage error"));
    assert!(error_str.contains("file not found"));
}

#[test]
fn test_invalid_config_error() {
    let error = Error::InvalidConfig("alpha must be in (0, 1)".to_string());
    assert!(format!("{error}").contains("Invalid configuration"));
}

#[test]
fn test_io_error_conversion() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
}

#[test]
fn test_serialization_error_conversion() {
    let json_error = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
    let error: Error = json_error.into();
    assert!(matches!(error, Error::Serialization(_)));
}

#[test]
fn test_other_error() {
    let error = Error::Other("generic error".to_string());
    let error_str = format!("{error}");
    assert_eq!(error_str, "generic error");
}

#[test]
fn test_error_is_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Error>();
}
