//! Integration tests for saving, listing, and validating checkpoints.
//!
//! Validates:
//! - A save hashes every artifact, seals the manifest, and appends a
//!   tagged notebook cell.
//! - Missing artifacts, duplicate ids, and execution-count regressions fail
//!   without leaving a manifest behind.
//! - Listing is ordered by creation time and tolerates junk directories.
//! - Validation reports altered and missing artifacts individually.

use std::fs;

use research_checkpoint::integrity::sha256_hex;
use research_checkpoint::models::manifest::CheckpointStatus;
use research_checkpoint::notebook::{IpynbStore, NotebookStore};
use research_checkpoint::orchestrator::checkpoint_manager::ArtifactStatus;
use research_checkpoint::orchestrator::SaveRequest;
use research_checkpoint::AppError;

use super::test_helpers::{handle, Project, REPORT, RUN};

const STAGE: &str = "S02_eda_analysis";

// ── Save ─────────────────────────────────────────────────────

#[test]
fn save_records_artifact_digests() {
    let project = Project::new();
    let rel = project.artifact(RUN, STAGE, "summary.csv", b"id,churn\n1,0\n");

    let manifest = project.save(RUN, "ckpt-1", STAGE, 3, &[&rel]);

    assert_eq!(manifest.status, CheckpointStatus::Saved);
    assert_eq!(manifest.artifacts.len(), 1);
    assert_eq!(
        manifest.artifacts[0].sha256.as_str(),
        sha256_hex(b"id,churn\n1,0\n")
    );
    assert_eq!(manifest.artifacts[0].size_bytes, 13);
    assert!(manifest.manifest_sha256.is_some());
    assert!(project.manifest_path(RUN, "ckpt-1").is_file());
}

#[test]
fn save_appends_tagged_notebook_cell() {
    let project = Project::new();
    let manifest = project.save(RUN, "ckpt-1", STAGE, 1, &[]);

    let notebook = project.manager.layout().notebook_path(REPORT);
    let cells = IpynbStore::new().read_cells(&notebook).expect("notebook");
    assert_eq!(cells.len(), 1);

    let cell = &cells[0];
    assert_eq!(cell.id, manifest.notebook.checkpoint_cell_id);
    assert_eq!(cell.tags(), vec!["checkpoint"]);
    assert_eq!(cell.source[0], "[CHECKPOINT:saved:id=ckpt-1]\n");
    assert_eq!(cell.metadata["checkpoint"]["stageId"], STAGE);
}

#[test]
fn unwritable_notebook_does_not_fail_save() {
    let project = Project::new();
    // A directory where the notebook file should be makes the append fail.
    fs::create_dir_all(project.manager.layout().notebook_path(REPORT)).expect("mkdir");

    project.save(RUN, "ckpt-1", STAGE, 1, &[]);
    let report = project
        .manager
        .validate(REPORT, RUN, "ckpt-1")
        .expect("validate");
    assert!(report.is_valid(), "{}", report.failure_summary());
}

#[test]
fn missing_artifact_fails_without_manifest() {
    let project = Project::new();
    let rel = format!("reports/{REPORT}/{RUN}/{STAGE}/never-written.parquet");

    let err = project
        .manager
        .save(
            &handle(RUN),
            SaveRequest::new("ckpt-1", STAGE, 1).with_artifact(rel),
        )
        .expect_err("missing artifact");

    assert!(matches!(err, AppError::ArtifactMissing(_)), "{err}");
    assert!(!project.manifest_path(RUN, "ckpt-1").exists());
    assert!(project.manager.list(REPORT, None).expect("list").is_empty());
}

#[test]
fn parent_traversal_in_artifact_is_rejected() {
    let project = Project::new();
    let err = project
        .manager
        .save(
            &handle(RUN),
            SaveRequest::new("ckpt-1", STAGE, 1).with_artifact("reports/x/../../../etc/passwd"),
        )
        .expect_err("escape");
    assert!(matches!(err, AppError::Validation(_)), "{err}");
}

#[test]
fn duplicate_checkpoint_id_is_rejected() {
    let project = Project::new();
    project.save(RUN, "ckpt-1", STAGE, 1, &[]);

    let err = project
        .manager
        .save(&handle(RUN), SaveRequest::new("ckpt-1", STAGE, 2))
        .expect_err("duplicate");
    assert!(matches!(err, AppError::AlreadyExists(_)), "{err}");
}

#[test]
fn execution_count_may_not_regress() {
    let project = Project::new();
    project.save(RUN, "ckpt-1", "S01_load_data", 10, &[]);

    let err = project
        .manager
        .save(&handle(RUN), SaveRequest::new("ckpt-2", STAGE, 9))
        .expect_err("regression");
    assert!(matches!(err, AppError::Validation(ref e) if e[0].field == "executionCount"));

    // Equal counts are allowed.
    project.save(RUN, "ckpt-3", STAGE, 10, &[]);
}

#[test]
fn malformed_stage_id_is_rejected() {
    let project = Project::new();
    let err = project
        .manager
        .save(&handle(RUN), SaveRequest::new("ckpt-1", "eda", 1))
        .expect_err("bad stage");
    assert!(matches!(err, AppError::Validation(ref e) if e[0].field == "stageId"));
}

#[test]
fn unsafe_identifiers_are_rejected() {
    let project = Project::new();
    let err = project
        .manager
        .save(&handle("../run"), SaveRequest::new("ckpt-1", STAGE, 1))
        .expect_err("unsafe run");
    assert!(matches!(err, AppError::Validation(_)), "{err}");
}

// ── List ─────────────────────────────────────────────────────

#[test]
fn list_orders_by_creation_time() {
    let project = Project::new();
    project.save(RUN, "ckpt-b", "S01_load_data", 1, &[]);
    project.save(RUN, "ckpt-a", STAGE, 2, &[]);
    project.save(RUN, "ckpt-c", "S03_fit_model", 3, &[]);

    let ids: Vec<String> = project
        .manager
        .list(REPORT, Some(RUN))
        .expect("list")
        .into_iter()
        .map(|e| e.checkpoint_id)
        .collect();
    assert_eq!(ids, vec!["ckpt-b", "ckpt-a", "ckpt-c"]);
}

#[test]
fn list_without_run_spans_every_run() {
    let project = Project::new();
    project.save("run-1", "ckpt-1", "S01_load_data", 1, &[]);
    project.save("run-2", "ckpt-2", "S01_load_data", 1, &[]);

    let entries = project.manager.list(REPORT, None).expect("list");
    let runs: Vec<&str> = entries.iter().map(|e| e.run_id.as_str()).collect();
    assert_eq!(runs, vec!["run-1", "run-2"]);
}

#[test]
fn list_ignores_incomplete_and_hidden_directories() {
    let project = Project::new();
    project.save(RUN, "ckpt-1", STAGE, 1, &[]);

    let run_dir = project.manager.layout().run_checkpoints_dir(REPORT, RUN);
    fs::create_dir_all(run_dir.join("half-written")).expect("mkdir");
    fs::create_dir_all(run_dir.join(".ckpt-0.pruned-abc")).expect("mkdir");

    let entries = project.manager.list(REPORT, Some(RUN)).expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].checkpoint_id, "ckpt-1");
}

#[test]
fn list_of_unknown_report_is_empty() {
    let project = Project::new();
    assert!(project.manager.list("nothing-here", None).expect("list").is_empty());
}

#[test]
fn unreadable_manifest_is_listed_as_unreadable() {
    let project = Project::new();
    project.save(RUN, "ckpt-1", STAGE, 1, &[]);
    fs::write(project.manifest_path(RUN, "ckpt-1"), "{truncated").expect("corrupt");

    let entries = project.manager.list(REPORT, Some(RUN)).expect("list");
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].readable);
    assert!(entries[0].stage_id.is_none());
}

// ── Validate ─────────────────────────────────────────────────

#[test]
fn untouched_checkpoint_validates() {
    let project = Project::new();
    let rel = project.artifact(RUN, STAGE, "features.parquet", b"PAR1....PAR1");
    project.save(RUN, "ckpt-1", STAGE, 1, &[&rel]);

    let report = project
        .manager
        .validate(REPORT, RUN, "ckpt-1")
        .expect("validate");
    assert!(report.is_valid(), "{}", report.failure_summary());
    assert!(report.seal_ok);
    assert_eq!(report.artifacts[0].status, ArtifactStatus::Ok);
}

#[test]
fn altered_artifacts_are_reported_individually() {
    let project = Project::new();
    let same_size = project.artifact(RUN, STAGE, "a.csv", b"aaaa");
    let grown = project.artifact(RUN, STAGE, "b.csv", b"bbbb");
    let removed = project.artifact(RUN, STAGE, "c.csv", b"cccc");
    project.save(RUN, "ckpt-1", STAGE, 1, &[&same_size, &grown, &removed]);

    fs::write(project.root().join(&same_size), b"zzzz").expect("alter");
    fs::write(project.root().join(&grown), b"bbbbbb").expect("grow");
    fs::remove_file(project.root().join(&removed)).expect("remove");

    let report = project
        .manager
        .validate(REPORT, RUN, "ckpt-1")
        .expect("validate");
    assert!(!report.is_valid());
    assert!(report.seal_ok);

    let statuses: Vec<ArtifactStatus> = report.artifacts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        vec![
            ArtifactStatus::HashMismatch,
            ArtifactStatus::SizeMismatch,
            ArtifactStatus::Missing
        ]
    );

    let details: Vec<Option<&str>> = report
        .artifacts
        .iter()
        .map(|a| a.detail.as_deref())
        .collect();
    let hash_detail = details[0].expect("hash mismatch detail");
    assert!(hash_detail.starts_with("artifact corrupt: "), "{hash_detail}");
    assert!(hash_detail.contains(&same_size));
    let size_detail = details[1].expect("size mismatch detail");
    assert!(
        size_detail.starts_with(&format!("artifact corrupt: {grown} is 6 bytes, manifest records 4")),
        "{size_detail}"
    );
    assert!(details[2].is_none());
}

#[test]
fn edited_manifest_fails_seal() {
    let project = Project::new();
    project.save(RUN, "ckpt-1", STAGE, 4, &[]);

    let mut value = project.read_manifest(RUN, "ckpt-1");
    value["executionCount"] = serde_json::json!(40);
    project.write_manifest(RUN, "ckpt-1", value, false);

    let report = project
        .manager
        .validate(REPORT, RUN, "ckpt-1")
        .expect("validate");
    assert!(!report.seal_ok);
    assert!(!report.is_valid());
    assert!(report.failure_summary().contains("seal mismatch"));
}

#[test]
fn moved_manifest_fails_identity_check() {
    let project = Project::new();
    project.save(RUN, "ckpt-1", STAGE, 1, &[]);

    let run_dir = project.manager.layout().run_checkpoints_dir(REPORT, RUN);
    fs::rename(run_dir.join("ckpt-1"), run_dir.join("ckpt-9")).expect("rename");

    let report = project
        .manager
        .validate(REPORT, RUN, "ckpt-9")
        .expect("validate");
    assert!(!report.is_valid());
    assert!(report.failure_summary().contains("does not match its location"));
}

#[test]
fn validate_of_absent_checkpoint_is_not_found() {
    let project = Project::new();
    let err = project
        .manager
        .validate(REPORT, RUN, "ckpt-404")
        .expect_err("absent");
    assert!(matches!(err, AppError::NotFound(_)), "{err}");
}
