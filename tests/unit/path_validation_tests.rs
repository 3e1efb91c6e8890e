//! Unit tests for path confinement under each trust level.
//!
//! Validates:
//! - Absolute paths and `..` escapes are rejected.
//! - Local checkpoints may follow symlinks that stay inside the root.
//! - Symlinks resolving outside the root are always rejected.
//! - Imported and untrusted checkpoints may not cross symlinks at all.
//! - Untrusted paths must stay below the run's artifact prefix.

use std::fs;
use std::path::Path;

use research_checkpoint::integrity::confine_path;
use research_checkpoint::models::manifest::TrustLevel;
use research_checkpoint::AppError;

fn assert_violation(result: research_checkpoint::Result<std::path::PathBuf>) {
    match result {
        Err(AppError::PathViolation(_)) => {}
        other => panic!("expected PathViolation, got {other:?}"),
    }
}

#[test]
fn plain_relative_path_is_confined() {
    let root = tempfile::tempdir().expect("temp dir");
    fs::create_dir_all(root.path().join("reports/r/run-1")).expect("mkdir");
    fs::write(root.path().join("reports/r/run-1/a.csv"), "x").expect("write");

    let resolved =
        confine_path(root.path(), "reports/r/run-1/a.csv", TrustLevel::Local, None).expect("ok");
    let canonical_root = root.path().canonicalize().expect("canon");
    assert!(resolved.starts_with(&canonical_root));
}

#[test]
fn nonexistent_target_is_still_confined() {
    let root = tempfile::tempdir().expect("temp dir");
    let resolved =
        confine_path(root.path(), "reports/r/run-1/later.csv", TrustLevel::Local, None)
            .expect("ok");
    assert!(resolved.ends_with("reports/r/run-1/later.csv"));
}

#[test]
fn inner_parent_segments_are_normalized() {
    let root = tempfile::tempdir().expect("temp dir");
    let resolved = confine_path(root.path(), "reports/x/../r/a.csv", TrustLevel::Local, None)
        .expect("stays inside");
    assert!(resolved.ends_with("reports/r/a.csv"));
}

#[test]
fn escapes_are_rejected() {
    let root = tempfile::tempdir().expect("temp dir");
    assert_violation(confine_path(root.path(), "../../etc/passwd", TrustLevel::Local, None));
    assert_violation(confine_path(root.path(), "reports/../../x", TrustLevel::Local, None));
    assert_violation(confine_path(root.path(), "/etc/passwd", TrustLevel::Local, None));
    assert_violation(confine_path(root.path(), "", TrustLevel::Local, None));
}

#[test]
fn untrusted_paths_need_run_prefix() {
    let root = tempfile::tempdir().expect("temp dir");
    let prefix = Path::new("reports/r/run-1");

    confine_path(
        root.path(),
        "reports/r/run-1/S01_load_data/a.csv",
        TrustLevel::Untrusted,
        Some(prefix),
    )
    .expect("inside prefix");

    assert_violation(confine_path(
        root.path(),
        "reports/r/run-2/a.csv",
        TrustLevel::Untrusted,
        Some(prefix),
    ));
}

#[test]
fn prefix_only_applies_to_untrusted() {
    let root = tempfile::tempdir().expect("temp dir");
    confine_path(
        root.path(),
        "shared/lookup.csv",
        TrustLevel::Imported,
        Some(Path::new("reports/r/run-1")),
    )
    .expect("imported ignores prefix");
}

#[cfg(unix)]
mod symlinks {
    use std::os::unix::fs::symlink;

    use super::*;

    fn tree_with_inner_link() -> tempfile::TempDir {
        let root = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(root.path().join("data")).expect("mkdir");
        fs::write(root.path().join("data/real.csv"), "x").expect("write");
        fs::create_dir_all(root.path().join("reports/r/run-1")).expect("mkdir");
        symlink(
            root.path().join("data/real.csv"),
            root.path().join("reports/r/run-1/link.csv"),
        )
        .expect("symlink");
        root
    }

    #[test]
    fn local_follows_inner_symlink() {
        let root = tree_with_inner_link();
        let resolved = confine_path(
            root.path(),
            "reports/r/run-1/link.csv",
            TrustLevel::Local,
            None,
        )
        .expect("inner link allowed");
        assert!(resolved.ends_with("data/real.csv"));
    }

    #[test]
    fn imported_and_untrusted_refuse_symlinks() {
        let root = tree_with_inner_link();
        for trust in [TrustLevel::Imported, TrustLevel::Untrusted] {
            assert_violation(confine_path(
                root.path(),
                "reports/r/run-1/link.csv",
                trust,
                Some(Path::new("reports/r/run-1")),
            ));
        }
    }

    #[test]
    fn link_escaping_root_is_rejected_for_local() {
        let outside = tempfile::tempdir().expect("outside");
        fs::write(outside.path().join("secret.csv"), "s").expect("write");

        let root = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(root.path().join("reports")).expect("mkdir");
        symlink(
            outside.path().join("secret.csv"),
            root.path().join("reports/escape.csv"),
        )
        .expect("symlink");

        assert_violation(confine_path(
            root.path(),
            "reports/escape.csv",
            TrustLevel::Local,
            None,
        ));
    }
}
