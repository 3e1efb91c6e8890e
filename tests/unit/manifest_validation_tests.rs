//! Unit tests for pure manifest validation.
//!
//! Validates:
//! - A sealed, well-formed document converts into a typed manifest.
//! - Each rejected field is reported under its wire name.
//! - Every problem is reported together, not just the first.
//! - Unknown keys are refused at parse time.

use chrono::{TimeZone, Utc};

use research_checkpoint::integrity::compute_seal;
use research_checkpoint::models::manifest::{
    ArtifactRecord, CheckpointManifest, CheckpointStatus, InterruptReason, ManifestDocument,
    NotebookRef, PythonEnv, Rehydration, Sha256Digest, TrustLevel,
};
use research_checkpoint::models::stage::StageId;
use research_checkpoint::models::validation::{is_safe_component, validate};

fn sample_manifest() -> CheckpointManifest {
    CheckpointManifest {
        checkpoint_id: "ckpt-001".into(),
        research_session_id: "session-1".into(),
        report_title: "churn-study".into(),
        run_id: "run-1".into(),
        stage_id: StageId::parse("S02_eda_analysis").expect("stage id"),
        created_at: Utc
            .with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
            .single()
            .expect("timestamp"),
        execution_count: 7,
        status: CheckpointStatus::Saved,
        reason: None,
        notebook: NotebookRef {
            path: "notebooks/churn-study.ipynb".into(),
            checkpoint_cell_id: "cell1234".into(),
        },
        python_env: PythonEnv::unknown(),
        artifacts: vec![ArtifactRecord {
            relative_path: "reports/churn-study/run-1/S02_eda_analysis/summary.parquet".into(),
            sha256: Sha256Digest::parse(Sha256Digest::EMPTY).expect("digest"),
            size_bytes: 0,
        }],
        rehydration: Rehydration::default(),
        manifest_sha256: None,
        trust_level: TrustLevel::Local,
    }
}

fn sealed_document() -> ManifestDocument {
    let mut doc = sample_manifest().to_document();
    doc.manifest_sha256 = Some(compute_seal(&doc).expect("seal").to_string());
    doc
}

fn rejected_fields(doc: &ManifestDocument) -> Vec<String> {
    validate(doc)
        .expect_err("document should be rejected")
        .into_iter()
        .map(|err| err.field)
        .collect()
}

// ── Accepted documents ───────────────────────────────────────

#[test]
fn sealed_document_becomes_typed_manifest() {
    let manifest = validate(&sealed_document()).expect("valid");

    assert_eq!(manifest.stage_id.as_str(), "S02_eda_analysis");
    assert_eq!(manifest.execution_count, 7);
    assert_eq!(manifest.status, CheckpointStatus::Saved);
    assert_eq!(manifest.trust_level, TrustLevel::Local);
    assert_eq!(manifest.artifacts.len(), 1);
    assert!(manifest.manifest_sha256.is_some());
}

#[test]
fn emergency_with_reason_is_accepted() {
    let mut doc = sealed_document();
    doc.status = "emergency".into();
    doc.reason = Some("timeout".into());

    let manifest = validate(&doc).expect("valid");
    assert_eq!(manifest.reason, Some(InterruptReason::Timeout));
}

#[test]
fn explicit_trust_level_is_parsed() {
    let mut doc = sealed_document();
    doc.trust_level = Some("untrusted".into());

    let manifest = validate(&doc).expect("valid");
    assert_eq!(manifest.trust_level, TrustLevel::Untrusted);
}

// ── Rejected fields ──────────────────────────────────────────

#[test]
fn unsupported_version_is_rejected() {
    let mut doc = sealed_document();
    doc.manifest_version = 2;
    assert_eq!(rejected_fields(&doc), vec!["manifestVersion"]);
}

#[test]
fn malformed_timestamp_is_rejected() {
    let mut doc = sealed_document();
    doc.created_at = "yesterday afternoon".into();
    assert_eq!(rejected_fields(&doc), vec!["createdAt"]);
}

#[test]
fn negative_counts_are_rejected() {
    let mut doc = sealed_document();
    doc.execution_count = -1;
    doc.artifacts[0].size_bytes = -5;

    let fields = rejected_fields(&doc);
    assert!(fields.contains(&"executionCount".to_owned()));
    assert!(fields.contains(&"artifacts[0].sizeBytes".to_owned()));
}

#[test]
fn digests_must_be_64_lowercase_hex() {
    let mut upper = sealed_document();
    upper.artifacts[0].sha256 = Sha256Digest::EMPTY.to_uppercase();
    assert_eq!(rejected_fields(&upper), vec!["artifacts[0].sha256"]);

    let mut short = sealed_document();
    short.artifacts[0].sha256 = Sha256Digest::EMPTY[..63].to_owned();
    assert_eq!(rejected_fields(&short), vec!["artifacts[0].sha256"]);

    let mut seal = sealed_document();
    seal.manifest_sha256 = Some("not-a-digest".into());
    assert_eq!(rejected_fields(&seal), vec!["manifestSha256"]);
}

#[test]
fn stage_id_pattern_is_enforced() {
    for bad in ["S2_eda_analysis", "S02-eda-analysis", "S02_EDA_analysis", "S02_eda"] {
        let mut doc = sealed_document();
        doc.stage_id = bad.into();
        assert_eq!(rejected_fields(&doc), vec!["stageId"], "{bad} should fail");
    }
}

#[test]
fn emergency_without_reason_is_rejected() {
    let mut doc = sealed_document();
    doc.status = "emergency".into();
    doc.reason = None;
    assert_eq!(rejected_fields(&doc), vec!["reason"]);
}

#[test]
fn unknown_enum_strings_are_rejected() {
    let mut doc = sealed_document();
    doc.status = "finished".into();
    doc.reason = Some("bored".into());
    doc.rehydration.mode = "everything".into();
    doc.trust_level = Some("friendly".into());

    let fields = rejected_fields(&doc);
    for expected in ["status", "reason", "rehydration.mode", "trustLevel"] {
        assert!(fields.contains(&expected.to_owned()), "missing {expected}");
    }
}

#[test]
fn artifact_paths_must_be_plain_relative() {
    let mut absolute = sealed_document();
    absolute.artifacts[0].relative_path = "/etc/passwd".into();
    assert_eq!(rejected_fields(&absolute), vec!["artifacts[0].relativePath"]);

    let mut parent = sealed_document();
    parent.artifacts[0].relative_path = "reports/../../secret.csv".into();
    assert_eq!(rejected_fields(&parent), vec!["artifacts[0].relativePath"]);
}

#[test]
fn duplicate_artifacts_are_rejected() {
    let mut doc = sealed_document();
    let copy = doc.artifacts[0].clone();
    doc.artifacts.push(copy);
    assert_eq!(rejected_fields(&doc), vec!["artifacts[1].relativePath"]);
}

#[test]
fn missing_seal_is_rejected() {
    let mut doc = sealed_document();
    doc.manifest_sha256 = None;
    assert_eq!(rejected_fields(&doc), vec!["manifestSha256"]);
}

#[test]
fn unsafe_identifiers_are_rejected() {
    let mut doc = sealed_document();
    doc.report_title = "../escape".into();
    doc.run_id = "run/1".into();
    doc.research_session_id = "   ".into();

    let fields = rejected_fields(&doc);
    assert!(fields.contains(&"reportTitle".to_owned()));
    assert!(fields.contains(&"runId".to_owned()));
    assert!(fields.contains(&"researchSessionID".to_owned()));
}

#[test]
fn every_problem_is_reported_at_once() {
    let mut doc = sealed_document();
    doc.manifest_version = 9;
    doc.created_at = "nope".into();
    doc.stage_id = "bad".into();
    doc.execution_count = -3;

    assert_eq!(rejected_fields(&doc).len(), 4);
}

#[test]
fn unknown_keys_fail_to_parse() {
    let mut value = serde_json::to_value(sealed_document()).expect("to value");
    value["surprise"] = serde_json::json!(true);

    let parsed = serde_json::from_value::<ManifestDocument>(value);
    assert!(parsed.is_err());
}

#[test]
fn safe_component_rules() {
    assert!(is_safe_component("run-2026.03_a"));
    assert!(!is_safe_component(".hidden"));
    assert!(!is_safe_component("a..b"));
    assert!(!is_safe_component("with space"));
    assert!(!is_safe_component(""));
}
