//! Checkpoint persistence: save, list, validate, resume, prune, emergency.
//!
//! The manifest file on disk is the only source of truth. Every write goes
//! through a unique temporary file, an atomic rename, and a directory fsync,
//! so a crash at any point leaves either no manifest or a complete, sealed
//! one. [`CheckpointManager::resume`] scans newest-first and treats every
//! damaged candidate as "try the previous one".

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use super::layout::ProjectLayout;
use super::rehydration::generate_rehydration_code;
use crate::integrity::writer::sync_file;
use crate::integrity::{
    compute_seal, confine_path, hash_file, sync_dir, verify_seal, write_atomic, WriteMode,
};
use crate::markers::{CheckpointMarkerKind, Marker};
use crate::models::manifest::{
    ArtifactRecord, CheckpointManifest, CheckpointStatus, InterruptReason, ManifestDocument,
    NotebookRef, PythonEnv, Rehydration, Sha256Digest, TrustLevel, MANIFEST_FILE_NAME,
};
use crate::models::stage::{is_plain_relative, StageEnvelope, StageId};
use crate::models::validation::{self, check_component, ValidationError};
use crate::notebook::{new_cell_id, CellType, IpynbStore, NotebookCell, NotebookStore};
use crate::{AppError, Result};

/// Checkpoints retained by [`CheckpointManager::prune`] when not configured.
pub const DEFAULT_KEEP_COUNT: usize = 5;

/// Explicit handle identifying the run a checkpoint belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunHandle {
    /// Interpreter session driving the run.
    pub research_session_id: String,
    /// Report the run belongs to.
    pub report_title: String,
    /// Run identifier.
    pub run_id: String,
}

impl RunHandle {
    /// Construct a run handle.
    #[must_use]
    pub fn new(
        research_session_id: impl Into<String>,
        report_title: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            research_session_id: research_session_id.into(),
            report_title: report_title.into(),
            run_id: run_id.into(),
        }
    }

    /// Check that the handle's identifiers are usable as path components.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` listing each unsafe identifier.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        check_component("reportTitle", &self.report_title, &mut errors);
        check_component("runId", &self.run_id, &mut errors);
        if self.research_session_id.trim().is_empty() {
            errors.push(ValidationError::new("researchSessionID", "must not be empty"));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::Validation(errors))
        }
    }
}

/// Parameters for a normal stage-boundary checkpoint.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    /// Identifier of the new checkpoint (becomes its directory name).
    pub checkpoint_id: String,
    /// Stage that just completed.
    pub stage_id: String,
    /// Interpreter fingerprint.
    pub python_env: PythonEnv,
    /// Artifact paths relative to the project root.
    pub artifacts: Vec<String>,
    /// Rehydration settings.
    pub rehydration: Rehydration,
    /// Interpreter execution counter.
    pub execution_count: u64,
    /// Path-confinement strictness for the artifacts.
    pub trust_level: TrustLevel,
}

impl SaveRequest {
    /// Construct a request with no artifacts and an unknown environment.
    #[must_use]
    pub fn new(
        checkpoint_id: impl Into<String>,
        stage_id: impl Into<String>,
        execution_count: u64,
    ) -> Self {
        Self {
            checkpoint_id: checkpoint_id.into(),
            stage_id: stage_id.into(),
            python_env: PythonEnv::unknown(),
            artifacts: Vec::new(),
            rehydration: Rehydration::default(),
            execution_count,
            trust_level: TrustLevel::Local,
        }
    }

    /// Add an artifact path.
    #[must_use]
    pub fn with_artifact(mut self, relative_path: impl Into<String>) -> Self {
        self.artifacts.push(relative_path.into());
        self
    }

    /// Set the environment fingerprint.
    #[must_use]
    pub fn with_python_env(mut self, env: PythonEnv) -> Self {
        self.python_env = env;
        self
    }

    /// Set the rehydration settings.
    #[must_use]
    pub fn with_rehydration(mut self, rehydration: Rehydration) -> Self {
        self.rehydration = rehydration;
        self
    }

    /// Set the trust level.
    #[must_use]
    pub fn with_trust_level(mut self, trust_level: TrustLevel) -> Self {
        self.trust_level = trust_level;
        self
    }
}

/// Best-effort context for an emergency checkpoint.
#[derive(Debug, Clone, Default)]
pub struct EmergencyDetails {
    /// Artifact paths the stage was producing; recorded without verification.
    pub artifacts: Vec<String>,
    /// Environment fingerprint, if still obtainable.
    pub python_env: Option<PythonEnv>,
    /// Execution counter, if known; otherwise the run's latest is reused.
    pub execution_count: Option<u64>,
}

/// Cheap listing entry; contents are not validated.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointEntry {
    /// Checkpoint identifier (directory name).
    pub checkpoint_id: String,
    /// Owning report.
    pub report_title: String,
    /// Owning run.
    pub run_id: String,
    /// Stage id as recorded, if readable.
    pub stage_id: Option<String>,
    /// Status as recorded, if readable.
    pub status: Option<String>,
    /// Producing session, if readable.
    #[serde(rename = "researchSessionID")]
    pub research_session_id: Option<String>,
    /// Execution counter, if readable.
    pub execution_count: Option<u64>,
    /// Recorded creation time, if readable.
    pub created_at: Option<DateTime<Utc>>,
    /// Absolute manifest path.
    pub manifest_path: PathBuf,
    /// Whether the manifest parsed far enough to read its creation time.
    pub readable: bool,
    /// Creation time, or the file modification time when unreadable.
    #[serde(skip)]
    order_time: DateTime<Utc>,
}

/// Outcome of checking one artifact against its manifest record.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Present with matching size and digest.
    Ok,
    /// File does not exist.
    Missing,
    /// Size differs from the record.
    SizeMismatch,
    /// Size matches but digest differs.
    HashMismatch,
    /// Path escapes the project tree or crosses a forbidden symlink.
    PathViolation,
    /// File exists but could not be read.
    Unreadable,
}

/// Per-artifact verification result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactCheck {
    /// Artifact path relative to the project root.
    pub relative_path: String,
    /// Verification outcome.
    pub status: ArtifactStatus,
    /// Digest recorded in the manifest.
    pub expected_sha256: String,
    /// Digest computed now, if the file was readable.
    pub actual_sha256: Option<String>,
    /// Size recorded in the manifest.
    pub expected_size: u64,
    /// Size observed now, if the file was readable.
    pub actual_size: Option<u64>,
    /// Additional context for failures.
    pub detail: Option<String>,
}

/// Full verification report for one checkpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    /// Checkpoint identifier.
    pub checkpoint_id: String,
    /// Manifest location.
    pub manifest_path: PathBuf,
    /// Whether the stored seal matches the manifest content.
    pub seal_ok: bool,
    /// Manifest-level problems (parse, schema, field, identity).
    pub problems: Vec<String>,
    /// Per-artifact results.
    pub artifacts: Vec<ArtifactCheck>,
    /// Parsed manifest, when field validation succeeded.
    pub manifest: Option<CheckpointManifest>,
}

impl ValidationReport {
    fn new(checkpoint_id: &str, manifest_path: &Path) -> Self {
        Self {
            checkpoint_id: checkpoint_id.to_owned(),
            manifest_path: manifest_path.to_path_buf(),
            seal_ok: false,
            problems: Vec::new(),
            artifacts: Vec::new(),
            manifest: None,
        }
    }

    /// Whether the manifest and every artifact passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.seal_ok
            && self.problems.is_empty()
            && self.manifest.is_some()
            && self
                .artifacts
                .iter()
                .all(|a| a.status == ArtifactStatus::Ok)
    }

    /// One-line description of why the checkpoint failed.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        if let Some(problem) = self.problems.first() {
            return problem.clone();
        }
        if !self.seal_ok {
            return "integrity seal not verified".into();
        }
        self.artifacts
            .iter()
            .find(|a| a.status != ArtifactStatus::Ok)
            .map_or_else(
                || "valid".into(),
                |a| match &a.detail {
                    Some(detail) => {
                        format!("artifact {} failed: {:?} ({detail})", a.relative_path, a.status)
                    }
                    None => format!("artifact {} failed: {:?}", a.relative_path, a.status),
                },
            )
    }
}

/// A resume candidate that was passed over.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedCheckpoint {
    /// Checkpoint identifier.
    pub checkpoint_id: String,
    /// Owning run.
    pub run_id: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Result of [`CheckpointManager::resume`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeOutcome {
    /// Whether a valid checkpoint was selected.
    pub found: bool,
    /// Number of candidates examined.
    pub searched_count: usize,
    /// The selected checkpoint.
    pub checkpoint: Option<CheckpointManifest>,
    /// Interpreter code that rebuilds state from the selected checkpoint.
    pub rehydration_cells: Vec<String>,
    /// Prefix of the stage to run next (e.g. `S03_`).
    pub next_stage_id: Option<String>,
    /// Newer candidates that failed validation.
    pub skipped: Vec<SkippedCheckpoint>,
}

impl ResumeOutcome {
    fn not_found() -> Self {
        Self {
            found: false,
            searched_count: 0,
            checkpoint: None,
            rehydration_cells: Vec::new(),
            next_stage_id: None,
            skipped: Vec::new(),
        }
    }

    /// Describe differences between the checkpoint's environment and `current`.
    ///
    /// Differences never block a resume; they are reproducibility warnings.
    #[must_use]
    pub fn environment_warnings(&self, current: &PythonEnv) -> Vec<String> {
        let Some(saved) = self.checkpoint.as_ref().map(|m| &m.python_env) else {
            return Vec::new();
        };

        let mut warnings = Vec::new();
        if saved.python_path != current.python_path {
            warnings.push(format!(
                "interpreter changed: {} -> {}",
                saved.python_path, current.python_path
            ));
        }
        if saved.platform != current.platform {
            warnings.push(format!(
                "platform changed: {} -> {}",
                saved.platform, current.platform
            ));
        }

        let before: BTreeSet<&str> = saved.packages.iter().map(String::as_str).collect();
        let after: BTreeSet<&str> = current.packages.iter().map(String::as_str).collect();
        let missing: Vec<&str> = before.difference(&after).copied().collect();
        let added: Vec<&str> = after.difference(&before).copied().collect();
        if !missing.is_empty() {
            warnings.push(format!(
                "packages missing since checkpoint: {}",
                missing.join(", ")
            ));
        }
        if !added.is_empty() {
            warnings.push(format!(
                "packages added since checkpoint: {}",
                added.join(", ")
            ));
        }
        warnings
    }
}

/// Result of [`CheckpointManager::prune`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    /// Deleted checkpoint ids, oldest first.
    pub removed: Vec<String>,
    /// Remaining checkpoint ids, oldest first.
    pub retained: Vec<String>,
    /// The checkpoint `resume` would select, which prune never deletes.
    pub protected: Option<String>,
    /// Directories left without a manifest by an interrupted save, now deleted.
    pub incomplete: Vec<String>,
}

/// Stateless manager over the project's checkpoint tree.
pub struct CheckpointManager {
    layout: ProjectLayout,
    notebooks: Arc<dyn NotebookStore>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

impl CheckpointManager {
    /// Construct a manager rooted at `project_root`.
    #[must_use]
    pub fn new(project_root: impl Into<PathBuf>, notebooks: Arc<dyn NotebookStore>) -> Self {
        Self {
            layout: ProjectLayout::new(project_root),
            notebooks,
        }
    }

    /// Construct a manager that appends checkpoint cells to `.ipynb` files.
    #[must_use]
    pub fn with_ipynb(project_root: impl Into<PathBuf>) -> Self {
        Self::new(project_root, Arc::new(IpynbStore::new()))
    }

    /// Path layout used by this manager.
    #[must_use]
    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    /// Persist a checkpoint at a stage boundary.
    ///
    /// Confirms and fsyncs every artifact, hashes it, seals the manifest, writes
    /// it atomically, and finally appends a tagged checkpoint cell to the
    /// report notebook. A notebook failure is logged but does not undo the
    /// checkpoint.
    ///
    /// # Errors
    ///
    /// - `AppError::Validation` for unsafe ids, a malformed stage id, duplicate
    ///   artifacts, or an execution count lower than the run's latest.
    /// - `AppError::AlreadyExists` if the checkpoint id is taken.
    /// - `AppError::PathViolation` if an artifact escapes the project tree.
    /// - `AppError::ArtifactMissing` if a declared artifact does not exist.
    /// - `AppError::Io` on write failures.
    pub fn save(&self, run: &RunHandle, request: SaveRequest) -> Result<CheckpointManifest> {
        let span = info_span!(
            "save_checkpoint",
            report_title = %run.report_title,
            run_id = %run.run_id,
            checkpoint_id = %request.checkpoint_id,
        );
        let _guard = span.enter();

        run.validate()?;
        let mut errors = Vec::new();
        check_component("checkpointId", &request.checkpoint_id, &mut errors);
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }
        let stage_id =
            StageId::parse(&request.stage_id).map_err(|err| AppError::Validation(vec![err]))?;

        let checkpoint_dir =
            self.layout
                .checkpoint_dir(&run.report_title, &run.run_id, &request.checkpoint_id);
        if checkpoint_dir.exists() {
            return Err(AppError::AlreadyExists(format!(
                "checkpoint {}",
                request.checkpoint_id
            )));
        }

        if let Some(latest) = self.latest_execution_count(run)? {
            if request.execution_count < latest {
                return Err(AppError::Validation(vec![ValidationError::new(
                    "executionCount",
                    format!(
                        "{} regresses below the run's latest {latest}",
                        request.execution_count
                    ),
                )]));
            }
        }

        let artifacts = self.collect_artifacts(run, &request.artifacts, request.trust_level)?;

        let manifest = CheckpointManifest {
            checkpoint_id: request.checkpoint_id,
            research_session_id: run.research_session_id.clone(),
            report_title: run.report_title.clone(),
            run_id: run.run_id.clone(),
            stage_id,
            created_at: Utc::now().trunc_subsecs(6),
            execution_count: request.execution_count,
            status: CheckpointStatus::Saved,
            reason: None,
            notebook: NotebookRef {
                path: ProjectLayout::notebook_relative_path(&run.report_title),
                checkpoint_cell_id: new_cell_id(),
            },
            python_env: request.python_env,
            artifacts,
            rehydration: request.rehydration,
            manifest_sha256: None,
            trust_level: request.trust_level,
        };

        let manifest = self.persist(manifest)?;
        self.append_checkpoint_cell(&manifest, CheckpointMarkerKind::Saved);

        info!(
            stage_id = %manifest.stage_id,
            artifacts = manifest.artifacts.len(),
            execution_count = manifest.execution_count,
            "{}",
            Marker::checkpoint(CheckpointMarkerKind::Saved, manifest.checkpoint_id.clone())
        );
        Ok(manifest)
    }

    /// Checkpoint the declared outputs of a stage that just completed.
    ///
    /// The checkpoint id is generated from the stage id. Without an explicit
    /// `execution_count` the run's latest is reused, or 0 for a fresh run.
    ///
    /// # Errors
    ///
    /// Same as [`save`](Self::save); notably `AppError::ArtifactMissing` when
    /// the stage did not write one of its outputs.
    pub fn save_stage_outputs(
        &self,
        run: &RunHandle,
        envelope: &StageEnvelope,
        execution_count: Option<u64>,
    ) -> Result<CheckpointManifest> {
        let stage_id =
            StageId::parse(&envelope.stage_id).map_err(|err| AppError::Validation(vec![err]))?;
        let execution_count = match execution_count {
            Some(count) => count,
            None => self.latest_execution_count(run)?.unwrap_or(0),
        };

        let mut request = SaveRequest::new(
            generated_checkpoint_id(&stage_id, "completed", Utc::now()),
            stage_id.as_str(),
            execution_count,
        );
        request.artifacts = envelope.outputs.values().cloned().collect();
        self.save(run, request)
    }

    /// Write an unscheduled checkpoint while a stage is being stopped.
    ///
    /// Artifact existence and hashes are not required: files that can be
    /// hashed are recorded with real values, the rest with the empty digest
    /// and size 0. The status is `interrupted` for aborts and `emergency`
    /// otherwise.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unsafe run identifiers or a malformed
    /// stage id, or `AppError::Io` if the manifest cannot be written.
    pub fn emergency(
        &self,
        run: &RunHandle,
        stage_id: &str,
        reason: InterruptReason,
        details: EmergencyDetails,
    ) -> Result<CheckpointManifest> {
        let span = info_span!(
            "emergency_checkpoint",
            report_title = %run.report_title,
            run_id = %run.run_id,
            stage_id,
            %reason,
        );
        let _guard = span.enter();

        run.validate()?;
        let stage_id = StageId::parse(stage_id).map_err(|err| AppError::Validation(vec![err]))?;

        let now = Utc::now().trunc_subsecs(6);
        let checkpoint_id = generated_checkpoint_id(&stage_id, reason.as_str(), now);

        let execution_count = details
            .execution_count
            .or_else(|| self.latest_execution_count(run).ok().flatten())
            .unwrap_or(0);

        let artifacts = details
            .artifacts
            .iter()
            .filter_map(|rel| self.best_effort_artifact(rel))
            .collect();

        let manifest = CheckpointManifest {
            checkpoint_id,
            research_session_id: run.research_session_id.clone(),
            report_title: run.report_title.clone(),
            run_id: run.run_id.clone(),
            stage_id,
            created_at: now,
            execution_count,
            status: reason.checkpoint_status(),
            reason: Some(reason),
            notebook: NotebookRef {
                path: ProjectLayout::notebook_relative_path(&run.report_title),
                checkpoint_cell_id: new_cell_id(),
            },
            python_env: details.python_env.unwrap_or_else(PythonEnv::unknown),
            artifacts,
            rehydration: Rehydration::default(),
            manifest_sha256: None,
            trust_level: TrustLevel::Local,
        };

        let manifest = self.persist(manifest)?;
        self.append_checkpoint_cell(&manifest, CheckpointMarkerKind::Emergency);

        warn!(
            status = manifest.status.as_str(),
            "{}",
            Marker::checkpoint(CheckpointMarkerKind::Emergency, manifest.checkpoint_id.clone())
        );
        Ok(manifest)
    }

    /// Enumerate checkpoints in creation order without validating them.
    ///
    /// With `run_id` omitted, every run of the report is included. Ties on
    /// creation time are broken by checkpoint id, then run id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unsafe identifiers, or `AppError::Io`
    /// if an existing directory cannot be read.
    pub fn list(&self, report_title: &str, run_id: Option<&str>) -> Result<Vec<CheckpointEntry>> {
        let mut errors = Vec::new();
        check_component("reportTitle", report_title, &mut errors);
        if let Some(run) = run_id {
            check_component("runId", run, &mut errors);
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let runs = match run_id {
            Some(run) => vec![run.to_owned()],
            None => visible_subdirs(&self.layout.checkpoints_root(report_title))?,
        };

        let mut entries = Vec::new();
        for run in runs {
            let run_dir = self.layout.run_checkpoints_dir(report_title, &run);
            for checkpoint_id in visible_subdirs(&run_dir)? {
                let dir = run_dir.join(&checkpoint_id);
                if let Some(entry) = read_entry(report_title, &run, checkpoint_id, &dir) {
                    entries.push(entry);
                }
            }
        }

        entries.sort_by(|a, b| {
            a.order_time
                .cmp(&b.order_time)
                .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(entries)
    }

    /// Re-verify a checkpoint's seal, fields, and every artifact.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unsafe identifiers, or
    /// `AppError::NotFound` if the manifest does not exist. Verification
    /// failures are reported in the returned [`ValidationReport`].
    pub fn validate(
        &self,
        report_title: &str,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<ValidationReport> {
        let mut errors = Vec::new();
        check_component("reportTitle", report_title, &mut errors);
        check_component("runId", run_id, &mut errors);
        check_component("checkpointId", checkpoint_id, &mut errors);
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let path = self
            .layout
            .manifest_path(report_title, run_id, checkpoint_id);
        if !path.exists() {
            return Err(AppError::NotFound(format!("checkpoint {checkpoint_id}")));
        }

        Ok(self.inspect(report_title, run_id, checkpoint_id, &path))
    }

    /// Select the newest fully valid `saved` checkpoint and build its rehydration code.
    ///
    /// Candidates are examined newest-first. Any candidate that fails to
    /// parse, fails its seal, fails field validation, has a missing or
    /// altered artifact, or is not a `saved` checkpoint is logged and
    /// skipped. An empty or entirely invalid set yields `found: false`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unsafe identifiers, or `AppError::Io`
    /// if the checkpoint directories cannot be enumerated.
    pub fn resume(&self, report_title: &str, run_id: Option<&str>) -> Result<ResumeOutcome> {
        let span = info_span!("resume_checkpoint", report_title, run_id);
        let _guard = span.enter();

        let entries = self.list(report_title, run_id)?;
        let mut outcome = ResumeOutcome::not_found();

        for entry in entries.iter().rev() {
            outcome.searched_count += 1;

            let report = self.inspect(
                report_title,
                &entry.run_id,
                &entry.checkpoint_id,
                &entry.manifest_path,
            );

            let reason = if report.is_valid() {
                match report.manifest {
                    Some(manifest) if manifest.status == CheckpointStatus::Saved => {
                        let next_stage_id = manifest.stage_id.next_prefix();
                        outcome.rehydration_cells = generate_rehydration_code(&manifest);
                        outcome.next_stage_id = next_stage_id;
                        info!(
                            checkpoint_id = %manifest.checkpoint_id,
                            run_id = %manifest.run_id,
                            stage_id = %manifest.stage_id,
                            searched = outcome.searched_count,
                            "resume checkpoint selected"
                        );
                        outcome.checkpoint = Some(manifest);
                        outcome.found = true;
                        return Ok(outcome);
                    }
                    Some(manifest) => {
                        format!("status '{}' is not resumable", manifest.status.as_str())
                    }
                    None => "manifest unavailable".into(),
                }
            } else {
                report.failure_summary()
            };

            warn!(
                checkpoint_id = %entry.checkpoint_id,
                run_id = %entry.run_id,
                %reason,
                "skipping checkpoint during resume"
            );
            outcome.skipped.push(SkippedCheckpoint {
                checkpoint_id: entry.checkpoint_id.clone(),
                run_id: entry.run_id.clone(),
                reason,
            });
        }

        info!(
            searched = outcome.searched_count,
            "no valid checkpoint to resume from"
        );
        Ok(outcome)
    }

    /// Delete checkpoints beyond the `keep_count` most recent, oldest first.
    ///
    /// The checkpoint that [`resume`](Self::resume) would select is never
    /// deleted, even when it falls outside the retention window. Each
    /// deletion first renames the directory to a hidden tombstone so a crash
    /// mid-delete never leaves a partial checkpoint visible.
    ///
    /// Leftover tombstones and checkpoint directories that never received a
    /// manifest are deleted as well. The caller must hold the run lock, since
    /// a save in flight also has a directory without a manifest.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` for unsafe identifiers, or `AppError::Io`
    /// if a checkpoint directory cannot be moved aside.
    pub fn prune(&self, report_title: &str, run_id: &str, keep_count: usize) -> Result<PruneReport> {
        let span = info_span!("prune_checkpoints", report_title, run_id, keep_count);
        let _guard = span.enter();

        let entries = self.list(report_title, Some(run_id))?;
        self.sweep_tombstones(report_title, run_id);
        let incomplete = self.sweep_incomplete(report_title, run_id)?;

        let protected = self
            .resume(report_title, Some(run_id))?
            .checkpoint
            .map(|m| m.checkpoint_id);

        let excess = entries.len().saturating_sub(keep_count);
        let (oldest, newest) = entries.split_at(excess);

        let mut report = PruneReport {
            protected: protected.clone(),
            incomplete,
            ..PruneReport::default()
        };

        for entry in oldest {
            if protected.as_deref() == Some(entry.checkpoint_id.as_str()) {
                info!(
                    checkpoint_id = %entry.checkpoint_id,
                    "retaining resume target outside retention window"
                );
                report.retained.push(entry.checkpoint_id.clone());
                continue;
            }
            self.remove_checkpoint(report_title, run_id, &entry.checkpoint_id)?;
            report.removed.push(entry.checkpoint_id.clone());
        }
        report
            .retained
            .extend(newest.iter().map(|e| e.checkpoint_id.clone()));

        info!(
            removed = report.removed.len(),
            retained = report.retained.len(),
            incomplete = report.incomplete.len(),
            "prune completed"
        );
        Ok(report)
    }

    /// Verify a manifest file and its artifacts without mutating anything.
    fn inspect(
        &self,
        report_title: &str,
        run_id: &str,
        checkpoint_id: &str,
        path: &Path,
    ) -> ValidationReport {
        let mut report = ValidationReport::new(checkpoint_id, path);

        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(err) => {
                report.problems.push(format!("cannot read manifest: {err}"));
                return report;
            }
        };

        let value: Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(err) => {
                report
                    .problems
                    .push(AppError::ManifestCorrupt(format!("invalid JSON: {err}")).to_string());
                return report;
            }
        };

        match verify_seal(&value) {
            Ok(()) => report.seal_ok = true,
            Err(err) => report.problems.push(err.to_string()),
        }

        let doc: ManifestDocument = match serde_json::from_value(value) {
            Ok(doc) => doc,
            Err(err) => {
                report.problems.push(
                    AppError::ManifestCorrupt(format!("schema mismatch: {err}")).to_string(),
                );
                return report;
            }
        };

        let manifest = match validation::validate(&doc) {
            Ok(manifest) => manifest,
            Err(errors) => {
                report
                    .problems
                    .push(AppError::Validation(errors).to_string());
                return report;
            }
        };

        if manifest.report_title != report_title
            || manifest.run_id != run_id
            || manifest.checkpoint_id != checkpoint_id
        {
            report.problems.push(
                AppError::ManifestCorrupt(format!(
                    "manifest identity {}/{}/{} does not match its location",
                    manifest.report_title, manifest.run_id, manifest.checkpoint_id
                ))
                .to_string(),
            );
        }

        report.artifacts = self.check_artifacts(&manifest);
        report.manifest = Some(manifest);
        report
    }

    fn check_artifacts(&self, manifest: &CheckpointManifest) -> Vec<ArtifactCheck> {
        let prefix = ProjectLayout::run_artifact_prefix(&manifest.report_title, &manifest.run_id);

        manifest
            .artifacts
            .iter()
            .map(|artifact| {
                let mut check = ArtifactCheck {
                    relative_path: artifact.relative_path.clone(),
                    status: ArtifactStatus::Ok,
                    expected_sha256: artifact.sha256.to_string(),
                    actual_sha256: None,
                    expected_size: artifact.size_bytes,
                    actual_size: None,
                    detail: None,
                };

                let absolute = match confine_path(
                    self.layout.root(),
                    &artifact.relative_path,
                    manifest.trust_level,
                    Some(&prefix),
                ) {
                    Ok(path) => path,
                    Err(err) => {
                        error!(
                            checkpoint_id = %manifest.checkpoint_id,
                            artifact = %artifact.relative_path,
                            %err,
                            "artifact path confinement violated"
                        );
                        check.status = ArtifactStatus::PathViolation;
                        check.detail = Some(err.to_string());
                        return check;
                    }
                };

                match hash_file(&absolute) {
                    Ok((digest, size)) => {
                        check.actual_sha256 = Some(digest.to_string());
                        check.actual_size = Some(size);
                        let corrupt = if size != artifact.size_bytes {
                            check.status = ArtifactStatus::SizeMismatch;
                            Some(format!(
                                "{} is {size} bytes, manifest records {}",
                                artifact.relative_path, artifact.size_bytes
                            ))
                        } else if digest != artifact.sha256 {
                            check.status = ArtifactStatus::HashMismatch;
                            Some(format!(
                                "{} hashes to {digest}, manifest records {}",
                                artifact.relative_path, artifact.sha256
                            ))
                        } else {
                            None
                        };
                        check.detail =
                            corrupt.map(|msg| AppError::ArtifactCorrupt(msg).to_string());
                    }
                    Err(AppError::ArtifactMissing(_)) => check.status = ArtifactStatus::Missing,
                    Err(err) => {
                        check.status = ArtifactStatus::Unreadable;
                        check.detail = Some(err.to_string());
                    }
                }
                check
            })
            .collect()
    }

    fn collect_artifacts(
        &self,
        run: &RunHandle,
        paths: &[String],
        trust_level: TrustLevel,
    ) -> Result<Vec<ArtifactRecord>> {
        let prefix = ProjectLayout::run_artifact_prefix(&run.report_title, &run.run_id);
        let mut seen = HashSet::new();
        let mut records = Vec::with_capacity(paths.len());

        for relative_path in paths {
            if !is_plain_relative(Path::new(relative_path)) {
                return Err(AppError::Validation(vec![ValidationError::new(
                    "artifacts",
                    format!("'{relative_path}' must be relative without '..'"),
                )]));
            }
            if !seen.insert(relative_path.as_str()) {
                return Err(AppError::Validation(vec![ValidationError::new(
                    "artifacts",
                    format!("duplicate artifact '{relative_path}'"),
                )]));
            }

            let absolute =
                confine_path(self.layout.root(), relative_path, trust_level, Some(&prefix))?;
            if !absolute.is_file() {
                return Err(AppError::ArtifactMissing(relative_path.clone()));
            }

            sync_file(&absolute)?;
            let (sha256, size_bytes) = hash_file(&absolute)?;
            debug!(artifact = %relative_path, size_bytes, "artifact verified");

            records.push(ArtifactRecord {
                relative_path: relative_path.clone(),
                sha256,
                size_bytes,
            });
        }

        Ok(records)
    }

    fn best_effort_artifact(&self, relative_path: &str) -> Option<ArtifactRecord> {
        if !is_plain_relative(Path::new(relative_path)) {
            warn!(artifact = relative_path, "dropping non-relative artifact path");
            return None;
        }
        let absolute = match confine_path(self.layout.root(), relative_path, TrustLevel::Local, None)
        {
            Ok(path) => path,
            Err(err) => {
                warn!(artifact = relative_path, %err, "dropping unconfined artifact path");
                return None;
            }
        };

        let (sha256, size_bytes) = match hash_file(&absolute) {
            Ok(hashed) => hashed,
            Err(err) => {
                warn!(artifact = relative_path, %err, "recording unverified artifact");
                (Sha256Digest::parse(Sha256Digest::EMPTY)?, 0)
            }
        };

        Some(ArtifactRecord {
            relative_path: relative_path.to_owned(),
            sha256,
            size_bytes,
        })
    }

    /// Seal, validate, and atomically write a manifest. The seal is the last
    /// value computed before the single rename that makes the checkpoint visible.
    fn persist(&self, mut manifest: CheckpointManifest) -> Result<CheckpointManifest> {
        manifest.manifest_sha256 = Some(compute_seal(&manifest.to_document())?);
        let doc = manifest.to_document();
        validation::validate(&doc).map_err(AppError::Validation)?;

        let rendered = serde_json::to_vec_pretty(&doc)
            .map_err(|err| AppError::ManifestCorrupt(format!("cannot serialize manifest: {err}")))?;

        let path = self.layout.manifest_path(
            &manifest.report_title,
            &manifest.run_id,
            &manifest.checkpoint_id,
        );
        let written = write_atomic(&path, &rendered, WriteMode::CreateNew)?;
        debug!(
            manifest = %written.path.display(),
            bytes = written.bytes_written,
            "manifest written"
        );
        sync_dir(
            &self
                .layout
                .run_checkpoints_dir(&manifest.report_title, &manifest.run_id),
        )?;

        Ok(manifest)
    }

    fn append_checkpoint_cell(&self, manifest: &CheckpointManifest, kind: CheckpointMarkerKind) {
        let manifest_rel = format!(
            "reports/{}/checkpoints/{}/{}/{MANIFEST_FILE_NAME}",
            manifest.report_title, manifest.run_id, manifest.checkpoint_id
        );
        let marker = Marker::checkpoint(kind, manifest.checkpoint_id.clone());

        let cell = NotebookCell {
            id: manifest.notebook.checkpoint_cell_id.clone(),
            cell_type: CellType::Markdown,
            source: vec![
                format!("{marker}\n"),
                format!(
                    "Checkpoint `{}` for stage `{}` ({})\n",
                    manifest.checkpoint_id,
                    manifest.stage_id,
                    manifest.status.as_str()
                ),
                format!("Manifest: `{manifest_rel}`"),
            ],
            metadata: json!({
                "tags": ["checkpoint"],
                "checkpoint": {
                    "id": manifest.checkpoint_id,
                    "runId": manifest.run_id,
                    "stageId": manifest.stage_id.as_str(),
                    "status": manifest.status.as_str(),
                    "manifest": manifest_rel,
                }
            }),
        };

        let notebook = self.layout.notebook_path(&manifest.report_title);
        if let Err(err) = self.notebooks.append_cell(&notebook, cell) {
            warn!(
                checkpoint_id = %manifest.checkpoint_id,
                notebook = %notebook.display(),
                %err,
                "failed to append checkpoint cell"
            );
        }
    }

    fn latest_execution_count(&self, run: &RunHandle) -> Result<Option<u64>> {
        Ok(self
            .list(&run.report_title, Some(&run.run_id))?
            .iter()
            .filter(|e| e.research_session_id.as_deref() == Some(run.research_session_id.as_str()))
            .filter_map(|e| e.execution_count)
            .max())
    }

    fn remove_checkpoint(&self, report_title: &str, run_id: &str, checkpoint_id: &str) -> Result<()> {
        let run_dir = self.layout.run_checkpoints_dir(report_title, run_id);
        let dir = run_dir.join(checkpoint_id);
        let tombstone = run_dir.join(format!(
            ".{checkpoint_id}.pruned-{}",
            Uuid::new_v4().simple()
        ));

        fs::rename(&dir, &tombstone).map_err(|err| {
            AppError::Io(format!("cannot move {} aside: {err}", dir.display()))
        })?;
        sync_dir(&run_dir)?;

        if let Err(err) = fs::remove_dir_all(&tombstone) {
            warn!(checkpoint_id, %err, "tombstone left behind; removed on next prune");
        }
        info!(checkpoint_id, "checkpoint pruned");
        Ok(())
    }

    /// Delete checkpoint directories that have no manifest file.
    fn sweep_incomplete(&self, report_title: &str, run_id: &str) -> Result<Vec<String>> {
        let run_dir = self.layout.run_checkpoints_dir(report_title, run_id);
        let mut swept = Vec::new();
        for name in visible_subdirs(&run_dir)? {
            let dir = run_dir.join(&name);
            if dir.join(MANIFEST_FILE_NAME).exists() {
                continue;
            }
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    warn!(checkpoint_id = %name, "removed checkpoint directory without manifest");
                    swept.push(name);
                }
                Err(err) => warn!(checkpoint_id = %name, %err, "failed to remove incomplete checkpoint"),
            }
        }
        Ok(swept)
    }

    fn sweep_tombstones(&self, report_title: &str, run_id: &str) {
        let run_dir = self.layout.run_checkpoints_dir(report_title, run_id);
        let Ok(entries) = fs::read_dir(&run_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') && name.contains(".pruned-") {
                if let Err(err) = fs::remove_dir_all(entry.path()) {
                    warn!(tombstone = %name, %err, "failed to remove tombstone");
                }
            }
        }
    }
}

/// Checkpoint id of the form `{stage}-{tag}-{timestamp}-{uuid8}`.
///
/// The stage part is cut short when needed so the id stays a safe path
/// component for every valid stage id.
fn generated_checkpoint_id(stage_id: &StageId, tag: &str, at: DateTime<Utc>) -> String {
    let suffix = format!(
        "-{tag}-{}-{}",
        at.format("%Y%m%dT%H%M%S%6fZ"),
        &Uuid::new_v4().simple().to_string()[..8]
    );
    let stage = stage_id.as_str();
    // Stage ids are ASCII, so any byte offset is a char boundary.
    let keep = stage
        .len()
        .min(validation::MAX_COMPONENT_LEN.saturating_sub(suffix.len()));
    format!("{}{suffix}", &stage[..keep])
}

/// Names of non-hidden subdirectories; a missing directory yields none.
fn visible_subdirs(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::Io(format!(
                "cannot read {}: {err}",
                dir.display()
            )))
        }
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    Ok(names)
}

/// Build a listing entry from whatever the manifest exposes.
fn read_entry(
    report_title: &str,
    run_id: &str,
    checkpoint_id: String,
    dir: &Path,
) -> Option<CheckpointEntry> {
    let manifest_path = dir.join(MANIFEST_FILE_NAME);
    let Ok(meta) = fs::metadata(&manifest_path) else {
        debug!(checkpoint_id, "directory has no manifest; ignoring incomplete checkpoint");
        return None;
    };
    let modified = meta
        .modified()
        .map_or_else(|_| DateTime::<Utc>::from(std::time::UNIX_EPOCH), DateTime::<Utc>::from);

    let value = fs::read(&manifest_path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok());
    let field = |name: &str| {
        value
            .as_ref()
            .and_then(|v| v.get(name))
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    let created_at = field("createdAt")
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map(|ts| ts.with_timezone(&Utc));
    let execution_count = value
        .as_ref()
        .and_then(|v| v.get("executionCount"))
        .and_then(Value::as_u64);

    Some(CheckpointEntry {
        stage_id: field("stageId"),
        status: field("status"),
        research_session_id: field("researchSessionID"),
        execution_count,
        readable: created_at.is_some(),
        order_time: created_at.unwrap_or(modified),
        created_at,
        manifest_path,
        report_title: report_title.to_owned(),
        run_id: run_id.to_owned(),
        checkpoint_id,
    })
}
