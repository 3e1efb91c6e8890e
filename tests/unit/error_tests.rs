//! Unit tests for error display and conversions.

use research_checkpoint::models::validation::ValidationError;
use research_checkpoint::AppError;

#[test]
fn display_prefixes_category() {
    assert_eq!(
        AppError::ArtifactMissing("reports/a.csv".into()).to_string(),
        "artifact missing: reports/a.csv"
    );
    assert_eq!(
        AppError::PathViolation("'../x' escapes".into()).to_string(),
        "path violation: '../x' escapes"
    );
    assert_eq!(AppError::Locked("run-1".into()).to_string(), "locked: run-1");
}

#[test]
fn validation_lists_every_field() {
    let err = AppError::from(vec![
        ValidationError::new("stageId", "bad pattern"),
        ValidationError::new("executionCount", "-1 is negative"),
    ]);
    assert_eq!(
        err.to_string(),
        "validation: stageId: bad pattern; executionCount: -1 is negative"
    );
}

#[test]
fn io_and_json_errors_convert() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
    assert!(matches!(io, AppError::Io(_)));

    let json: AppError = serde_json::from_str::<serde_json::Value>("{")
        .expect_err("bad json")
        .into();
    assert!(json.to_string().starts_with("io: json:"));
}
