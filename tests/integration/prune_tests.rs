//! Integration tests for checkpoint retention.

use std::fs;

use super::test_helpers::{Project, REPORT, RUN};

fn save_series(project: &Project, count: u64) {
    for n in 1..=count {
        project.save(RUN, &format!("c{n}"), "S01_load_data", n, &[]);
    }
}

fn remaining(project: &Project) -> Vec<String> {
    project
        .manager
        .list(REPORT, Some(RUN))
        .expect("list")
        .into_iter()
        .map(|e| e.checkpoint_id)
        .collect()
}

#[test]
fn oldest_beyond_keep_count_are_removed() {
    let project = Project::new();
    save_series(&project, 5);

    let report = project.manager.prune(REPORT, RUN, 2).expect("prune");
    assert_eq!(report.removed, vec!["c1", "c2", "c3"]);
    assert_eq!(report.retained, vec!["c4", "c5"]);
    assert_eq!(report.protected.as_deref(), Some("c5"));
    assert_eq!(remaining(&project), vec!["c4", "c5"]);
}

#[test]
fn prune_is_idempotent() {
    let project = Project::new();
    save_series(&project, 4);

    project.manager.prune(REPORT, RUN, 2).expect("first prune");
    let second = project.manager.prune(REPORT, RUN, 2).expect("second prune");

    assert!(second.removed.is_empty());
    assert_eq!(second.retained, vec!["c3", "c4"]);
}

#[test]
fn resume_target_survives_outside_window() {
    let project = Project::new();
    save_series(&project, 3);
    // Break the two newest so the resume target is the oldest.
    for id in ["c2", "c3"] {
        fs::write(project.manifest_path(RUN, id), "{").expect("corrupt");
    }

    let report = project.manager.prune(REPORT, RUN, 1).expect("prune");
    assert_eq!(report.protected.as_deref(), Some("c1"));
    assert!(!report.removed.contains(&"c1".to_owned()));
    assert!(remaining(&project).contains(&"c1".to_owned()));

    let outcome = project.manager.resume(REPORT, Some(RUN)).expect("resume");
    assert_eq!(
        outcome.checkpoint.map(|m| m.checkpoint_id),
        Some("c1".to_owned())
    );
}

#[test]
fn no_tombstones_remain_after_prune() {
    let project = Project::new();
    save_series(&project, 3);
    let run_dir = project.manager.layout().run_checkpoints_dir(REPORT, RUN);
    fs::create_dir_all(run_dir.join(".c0.pruned-deadbeef")).expect("stale tombstone");

    project.manager.prune(REPORT, RUN, 1).expect("prune");

    let hidden: Vec<String> = fs::read_dir(&run_dir)
        .expect("read dir")
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(".pruned-"))
        .collect();
    assert!(hidden.is_empty(), "{hidden:?}");
}

#[test]
fn keep_count_larger_than_set_removes_nothing() {
    let project = Project::new();
    save_series(&project, 2);

    let report = project.manager.prune(REPORT, RUN, 5).expect("prune");
    assert!(report.removed.is_empty());
    assert_eq!(report.retained, vec!["c1", "c2"]);
}

#[test]
fn prune_of_empty_run_is_noop() {
    let project = Project::new();
    let report = project.manager.prune(REPORT, RUN, 3).expect("prune");
    assert!(report.removed.is_empty());
    assert!(report.protected.is_none());
}

#[test]
fn directory_without_manifest_is_swept_and_id_reusable() {
    let project = Project::new();
    save_series(&project, 2);
    let run_dir = project.manager.layout().run_checkpoints_dir(REPORT, RUN);
    let stale = run_dir.join("c9");
    fs::create_dir_all(&stale).expect("stale dir");
    fs::write(stale.join("partial.tmp"), b"half").expect("stale file");

    let report = project.manager.prune(REPORT, RUN, 5).expect("prune");
    assert_eq!(report.incomplete, vec!["c9"]);
    assert_eq!(report.retained, vec!["c1", "c2"]);
    assert!(!stale.exists());

    project.save(RUN, "c9", "S02_eda_analysis", 3, &[]);
    assert_eq!(remaining(&project), vec!["c1", "c2", "c9"]);
}
