//! On-disk layout of reports, checkpoints, artifacts, and notebooks.
//!
//! ```text
//! reports/{reportTitle}/checkpoints/{runId}/{checkpointId}/checkpoint.json
//! reports/{reportTitle}/{runId}/{stageId}/{artifactName}
//! notebooks/{reportTitle}.ipynb
//! ```

use std::path::{Path, PathBuf};

use crate::models::manifest::MANIFEST_FILE_NAME;

const REPORTS_DIR: &str = "reports";
const CHECKPOINTS_DIR: &str = "checkpoints";
const NOTEBOOKS_DIR: &str = "notebooks";
const LOCK_FILE_NAME: &str = ".run.lock";

/// Path builder rooted at the project directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    /// Construct a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Project root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `reports/{reportTitle}/checkpoints`
    #[must_use]
    pub fn checkpoints_root(&self, report_title: &str) -> PathBuf {
        self.root
            .join(REPORTS_DIR)
            .join(report_title)
            .join(CHECKPOINTS_DIR)
    }

    /// `reports/{reportTitle}/checkpoints/{runId}`
    #[must_use]
    pub fn run_checkpoints_dir(&self, report_title: &str, run_id: &str) -> PathBuf {
        self.checkpoints_root(report_title).join(run_id)
    }

    /// `reports/{reportTitle}/checkpoints/{runId}/{checkpointId}`
    #[must_use]
    pub fn checkpoint_dir(&self, report_title: &str, run_id: &str, checkpoint_id: &str) -> PathBuf {
        self.run_checkpoints_dir(report_title, run_id)
            .join(checkpoint_id)
    }

    /// `reports/{reportTitle}/checkpoints/{runId}/{checkpointId}/checkpoint.json`
    #[must_use]
    pub fn manifest_path(&self, report_title: &str, run_id: &str, checkpoint_id: &str) -> PathBuf {
        self.checkpoint_dir(report_title, run_id, checkpoint_id)
            .join(MANIFEST_FILE_NAME)
    }

    /// Run lock file inside the run's checkpoint directory.
    #[must_use]
    pub fn lock_path(&self, report_title: &str, run_id: &str) -> PathBuf {
        self.run_checkpoints_dir(report_title, run_id)
            .join(LOCK_FILE_NAME)
    }

    /// `reports/{reportTitle}/{runId}`, relative to the root.
    ///
    /// Untrusted checkpoints may only reference artifacts below this prefix.
    #[must_use]
    pub fn run_artifact_prefix(report_title: &str, run_id: &str) -> PathBuf {
        Path::new(REPORTS_DIR).join(report_title).join(run_id)
    }

    /// `reports/{reportTitle}/{runId}/{stageId}/{artifactName}`, relative to the root.
    #[must_use]
    pub fn artifact_relative_path(
        report_title: &str,
        run_id: &str,
        stage_id: &str,
        artifact_name: &str,
    ) -> String {
        format!("{REPORTS_DIR}/{report_title}/{run_id}/{stage_id}/{artifact_name}")
    }

    /// `notebooks/{reportTitle}.ipynb`, relative to the root.
    #[must_use]
    pub fn notebook_relative_path(report_title: &str) -> String {
        format!("{NOTEBOOKS_DIR}/{report_title}.ipynb")
    }

    /// Absolute notebook path for a report.
    #[must_use]
    pub fn notebook_path(&self, report_title: &str) -> PathBuf {
        self.root.join(Self::notebook_relative_path(report_title))
    }
}
