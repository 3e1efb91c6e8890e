//! Shared fixtures for checkpoint integration tests.
//!
//! Builds a throwaway project tree with a manager over it, writes artifact
//! files, and tampers with stored manifests so individual test modules can
//! focus on behaviour rather than setup.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tempfile::TempDir;

use research_checkpoint::integrity::{seal_of_value, SEAL_FIELD};
use research_checkpoint::orchestrator::{CheckpointManager, ProjectLayout, RunHandle, SaveRequest};

pub const REPORT: &str = "churn-study";
pub const RUN: &str = "run-1";
pub const SESSION: &str = "session-1";

/// A project root plus a manager writing `.ipynb` notebooks inside it.
pub struct Project {
    pub dir: TempDir,
    pub manager: Arc<CheckpointManager>,
}

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().canonicalize().expect("canonical root");
        let manager = Arc::new(CheckpointManager::with_ipynb(root));
        Self { dir, manager }
    }

    pub fn root(&self) -> &Path {
        self.manager.layout().root()
    }

    /// Write an artifact for `stage` under the run's directory, returning its
    /// project-relative path.
    pub fn artifact(&self, run: &str, stage: &str, name: &str, content: &[u8]) -> String {
        let rel = ProjectLayout::artifact_relative_path(REPORT, run, stage, name);
        let abs = self.root().join(&rel);
        fs::create_dir_all(abs.parent().expect("parent")).expect("mkdir");
        fs::write(&abs, content).expect("write artifact");
        rel
    }

    /// Save a checkpoint with the given artifacts.
    pub fn save(
        &self,
        run: &str,
        checkpoint_id: &str,
        stage: &str,
        execution_count: u64,
        artifacts: &[&str],
    ) -> research_checkpoint::models::manifest::CheckpointManifest {
        let mut request = SaveRequest::new(checkpoint_id, stage, execution_count);
        for artifact in artifacts {
            request = request.with_artifact(*artifact);
        }
        self.manager
            .save(&handle(run), request)
            .expect("save checkpoint")
    }

    pub fn manifest_path(&self, run: &str, checkpoint_id: &str) -> std::path::PathBuf {
        self.manager
            .layout()
            .manifest_path(REPORT, run, checkpoint_id)
    }

    pub fn read_manifest(&self, run: &str, checkpoint_id: &str) -> Value {
        let raw = fs::read(self.manifest_path(run, checkpoint_id)).expect("read manifest");
        serde_json::from_slice(&raw).expect("manifest json")
    }

    /// Overwrite a stored manifest, optionally recomputing its seal.
    pub fn write_manifest(&self, run: &str, checkpoint_id: &str, mut value: Value, reseal: bool) {
        if reseal {
            let seal = seal_of_value(&value).expect("seal");
            value[SEAL_FIELD] = Value::String(seal.to_string());
        }
        fs::write(
            self.manifest_path(run, checkpoint_id),
            serde_json::to_vec_pretty(&value).expect("render"),
        )
        .expect("write manifest");
    }
}

pub fn handle(run: &str) -> RunHandle {
    RunHandle::new(SESSION, REPORT, run)
}
