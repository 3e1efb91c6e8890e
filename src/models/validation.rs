//! Pure, side-effect-free manifest validation.
//!
//! [`validate`] inspects every field of a [`ManifestDocument`] and returns
//! either a [`CheckpointManifest`] or the full list of problems found. It
//! never touches the filesystem, so it is safe to run against documents read
//! from untrusted locations.

use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use super::manifest::{
    ArtifactRecord, CheckpointManifest, CheckpointStatus, InterruptReason, ManifestDocument,
    Rehydration, RehydrationMode, Sha256Digest, TrustLevel, MANIFEST_VERSION,
};
use super::stage::{is_plain_relative, StageId};

/// Longest identifier accepted as a path component.
pub const MAX_COMPONENT_LEN: usize = 128;

#[allow(clippy::expect_used)]
static PATH_COMPONENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^[A-Za-z0-9][A-Za-z0-9._-]{{0,{}}}$",
        MAX_COMPONENT_LEN - 1
    ))
    .expect("path component regex is valid")
});

/// A single violated field constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    /// Wire name of the offending field (e.g. `artifacts[2].sha256`).
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl ValidationError {
    /// Construct a validation error for `field`.
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Whether `raw` is usable as a single directory name under `reports/`.
///
/// Identifiers become path components, so separators, leading dots, and
/// anything outside `[A-Za-z0-9._-]` are rejected.
#[must_use]
pub fn is_safe_component(raw: &str) -> bool {
    PATH_COMPONENT_REGEX.is_match(raw) && !raw.contains("..")
}

/// Check that `raw` is a safe path component, recording an error otherwise.
pub(crate) fn check_component(field: &str, raw: &str, errors: &mut Vec<ValidationError>) {
    if !is_safe_component(raw) {
        errors.push(ValidationError::new(
            field,
            format!("'{raw}' is not a safe identifier"),
        ));
    }
}

/// Validate a manifest document.
///
/// # Errors
///
/// Returns every violated constraint: unsupported version, malformed
/// timestamp, negative counts or sizes, malformed digests, stage ids that
/// break the naming pattern, unknown enum strings, `emergency` without a
/// reason, unsafe identifiers, non-relative artifact paths, duplicate
/// artifacts, and a missing seal.
pub fn validate(doc: &ManifestDocument) -> std::result::Result<CheckpointManifest, Vec<ValidationError>> {
    let mut errors = Vec::new();

    if doc.manifest_version != i64::from(MANIFEST_VERSION) {
        errors.push(ValidationError::new(
            "manifestVersion",
            format!(
                "unsupported version {} (expected {MANIFEST_VERSION})",
                doc.manifest_version
            ),
        ));
    }

    check_component("checkpointId", &doc.checkpoint_id, &mut errors);
    check_component("reportTitle", &doc.report_title, &mut errors);
    check_component("runId", &doc.run_id, &mut errors);
    if doc.research_session_id.trim().is_empty() {
        errors.push(ValidationError::new("researchSessionID", "must not be empty"));
    }

    let stage_id = match StageId::parse(&doc.stage_id) {
        Ok(id) => Some(id),
        Err(err) => {
            errors.push(err);
            None
        }
    };

    let created_at = match DateTime::parse_from_rfc3339(&doc.created_at) {
        Ok(ts) => Some(ts.with_timezone(&Utc)),
        Err(err) => {
            errors.push(ValidationError::new(
                "createdAt",
                format!("'{}' is not an ISO-8601 timestamp: {err}", doc.created_at),
            ));
            None
        }
    };

    let execution_count = non_negative("executionCount", doc.execution_count, &mut errors);

    let status = CheckpointStatus::parse(&doc.status);
    if status.is_none() {
        errors.push(ValidationError::new(
            "status",
            format!("unknown status '{}'", doc.status),
        ));
    }

    let reason = match doc.reason.as_deref() {
        None => None,
        Some(raw) => {
            let parsed = InterruptReason::parse(raw);
            if parsed.is_none() {
                errors.push(ValidationError::new(
                    "reason",
                    format!("unknown reason '{raw}'"),
                ));
            }
            parsed
        }
    };
    if status == Some(CheckpointStatus::Emergency) && doc.reason.is_none() {
        errors.push(ValidationError::new(
            "reason",
            "required when status is 'emergency'",
        ));
    }

    if !is_plain_relative(Path::new(&doc.notebook.path)) {
        errors.push(ValidationError::new(
            "notebook.path",
            format!("'{}' must be relative without '..'", doc.notebook.path),
        ));
    }
    if doc.notebook.checkpoint_cell_id.trim().is_empty() {
        errors.push(ValidationError::new(
            "notebook.checkpointCellId",
            "must not be empty",
        ));
    }

    let mut artifacts = Vec::with_capacity(doc.artifacts.len());
    let mut seen = HashSet::new();
    for (idx, artifact) in doc.artifacts.iter().enumerate() {
        let field = |name: &str| format!("artifacts[{idx}].{name}");

        let path_ok = is_plain_relative(Path::new(&artifact.relative_path));
        if !path_ok {
            errors.push(ValidationError::new(
                field("relativePath"),
                format!(
                    "'{}' must be relative without '..'",
                    artifact.relative_path
                ),
            ));
        } else if !seen.insert(artifact.relative_path.as_str()) {
            errors.push(ValidationError::new(
                field("relativePath"),
                format!("duplicate artifact '{}'", artifact.relative_path),
            ));
        }

        let digest = Sha256Digest::parse(&artifact.sha256);
        if digest.is_none() {
            errors.push(ValidationError::new(
                field("sha256"),
                "must be exactly 64 lowercase hex characters",
            ));
        }

        let size = non_negative(&field("sizeBytes"), artifact.size_bytes, &mut errors);

        if let (true, Some(sha256), Some(size_bytes)) = (path_ok, digest, size) {
            artifacts.push(ArtifactRecord {
                relative_path: artifact.relative_path.clone(),
                sha256,
                size_bytes,
            });
        }
    }

    let mode = RehydrationMode::parse(&doc.rehydration.mode);
    if mode.is_none() {
        errors.push(ValidationError::new(
            "rehydration.mode",
            format!("unknown mode '{}'", doc.rehydration.mode),
        ));
    }

    let seal = match doc.manifest_sha256.as_deref() {
        None => {
            errors.push(ValidationError::new("manifestSha256", "missing integrity seal"));
            None
        }
        Some(raw) => {
            let parsed = Sha256Digest::parse(raw);
            if parsed.is_none() {
                errors.push(ValidationError::new(
                    "manifestSha256",
                    "must be exactly 64 lowercase hex characters",
                ));
            }
            parsed
        }
    };

    let trust_level = match doc.trust_level.as_deref() {
        None => Some(TrustLevel::Local),
        Some(raw) => {
            let parsed = TrustLevel::parse(raw);
            if parsed.is_none() {
                errors.push(ValidationError::new(
                    "trustLevel",
                    format!("unknown trust level '{raw}'"),
                ));
            }
            parsed
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    match (
        stage_id,
        created_at,
        execution_count,
        status,
        mode,
        seal,
        trust_level,
    ) {
        (
            Some(stage_id),
            Some(created_at),
            Some(execution_count),
            Some(status),
            Some(mode),
            Some(seal),
            Some(trust_level),
        ) => Ok(CheckpointManifest {
            checkpoint_id: doc.checkpoint_id.clone(),
            research_session_id: doc.research_session_id.clone(),
            report_title: doc.report_title.clone(),
            run_id: doc.run_id.clone(),
            stage_id,
            created_at,
            execution_count,
            status,
            reason,
            notebook: doc.notebook.clone(),
            python_env: doc.python_env.clone(),
            artifacts,
            rehydration: Rehydration {
                mode,
                cell_source: doc.rehydration.rehydration_cell_source.clone(),
            },
            manifest_sha256: Some(seal),
            trust_level,
        }),
        _ => Err(vec![ValidationError::new(
            "manifest",
            "incomplete after validation",
        )]),
    }
}

fn non_negative(field: &str, value: i64, errors: &mut Vec<ValidationError>) -> Option<u64> {
    match u64::try_from(value) {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(ValidationError::new(field, format!("{value} is negative")));
            None
        }
    }
}
