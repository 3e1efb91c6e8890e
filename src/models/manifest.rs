//! Checkpoint manifest model.
//!
//! A manifest exists in two forms. [`ManifestDocument`] mirrors the on-disk
//! `checkpoint.json` with loosely typed fields so that a hostile or damaged
//! file can be inspected field by field. [`CheckpointManifest`] is the
//! strongly typed form produced only by
//! [`validate`](super::validation::validate); nothing outside validation
//! trusts a document directly.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};

use super::stage::StageId;

/// The only manifest layout version this crate reads and writes.
pub const MANIFEST_VERSION: u32 = 1;

/// File name of the serialized manifest inside a checkpoint directory.
pub const MANIFEST_FILE_NAME: &str = "checkpoint.json";

/// Persistence status of a checkpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    /// Written at a normal stage boundary with verified artifacts.
    Saved,
    /// Written after an operator or orchestrator abort.
    Interrupted,
    /// Written by the supervisor while a stage was being terminated.
    Emergency,
}

impl CheckpointStatus {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Saved => "saved",
            Self::Interrupted => "interrupted",
            Self::Emergency => "emergency",
        }
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "saved" => Some(Self::Saved),
            "interrupted" => Some(Self::Interrupted),
            "emergency" => Some(Self::Emergency),
            _ => None,
        }
    }
}

/// Why an emergency or interrupted checkpoint was taken.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    /// The watchdog hard timeout fired.
    Timeout,
    /// An operator or orchestrator aborted the stage.
    Abort,
    /// The stage raised an error.
    Error,
}

impl InterruptReason {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Abort => "abort",
            Self::Error => "error",
        }
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "timeout" => Some(Self::Timeout),
            "abort" => Some(Self::Abort),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Manifest status recorded for an unscheduled checkpoint with this reason.
    ///
    /// Aborts are deliberate and recorded as `interrupted`; timeouts and
    /// errors are recorded as `emergency`.
    #[must_use]
    pub fn checkpoint_status(self) -> CheckpointStatus {
        match self {
            Self::Abort => CheckpointStatus::Interrupted,
            Self::Timeout | Self::Error => CheckpointStatus::Emergency,
        }
    }
}

impl Display for InterruptReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much program state the rehydration code restores.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RehydrationMode {
    /// Reload artifacts only.
    #[default]
    ArtifactsOnly,
    /// Reload artifacts, then replay the stored variable-restoration source.
    WithVars,
}

impl RehydrationMode {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ArtifactsOnly => "artifacts_only",
            Self::WithVars => "with_vars",
        }
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "artifacts_only" => Some(Self::ArtifactsOnly),
            "with_vars" => Some(Self::WithVars),
            _ => None,
        }
    }
}

/// Origin classification controlling path-confinement strictness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Written on this machine; symlinks inside the project tree are followed.
    #[default]
    Local,
    /// Copied from another machine; no symlinks anywhere on artifact paths.
    Imported,
    /// Unknown origin; no symlinks and artifacts confined to the run directory.
    Untrusted,
}

impl TrustLevel {
    /// Wire representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Imported => "imported",
            Self::Untrusted => "untrusted",
        }
    }

    /// Parse the wire representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "local" => Some(Self::Local),
            "imported" => Some(Self::Imported),
            "untrusted" => Some(Self::Untrusted),
            _ => None,
        }
    }

    /// Whether artifact paths may traverse symbolic links.
    #[must_use]
    pub fn allows_symlinks(self) -> bool {
        matches!(self, Self::Local)
    }
}

/// A lowercase hexadecimal SHA-256 digest (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Digest of the empty byte string.
    pub const EMPTY: &'static str =
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    /// Accept `raw` only if it is exactly 64 lowercase hex characters.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let well_formed = raw.len() == 64
            && raw
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(raw.to_owned()))
    }

    /// Borrow the hex string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for Sha256Digest {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where the checkpoint marker cell lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotebookRef {
    /// Notebook path relative to the project root.
    pub path: String,
    /// Identifier of the appended checkpoint cell.
    pub checkpoint_cell_id: String,
}

/// Interpreter environment fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PythonEnv {
    /// Interpreter executable path.
    pub python_path: String,
    /// Installed packages as `name==version` strings.
    #[serde(default)]
    pub packages: Vec<String>,
    /// Platform tag (e.g. `linux-x86_64`).
    pub platform: String,
    /// Seed per random generator name (`random`, `numpy`, `torch`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub random_seeds: Option<BTreeMap<String, u64>>,
}

impl PythonEnv {
    /// Fingerprint used when the interpreter state cannot be queried.
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            python_path: "unknown".into(),
            packages: Vec::new(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            random_seeds: None,
        }
    }
}

/// Wire form of an artifact record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArtifactDocument {
    /// Artifact path relative to the project root.
    pub relative_path: String,
    /// Claimed SHA-256 digest.
    pub sha256: String,
    /// Claimed size in bytes.
    pub size_bytes: i64,
}

/// Wire form of the rehydration block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RehydrationDocument {
    /// Rehydration mode string.
    pub mode: String,
    /// Stored variable-restoration source lines.
    #[serde(default)]
    pub rehydration_cell_source: Vec<String>,
}

/// Wire form of `checkpoint.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ManifestDocument {
    /// Layout version.
    pub manifest_version: i64,
    /// Checkpoint identifier (also the directory name).
    pub checkpoint_id: String,
    /// Identifier of the interpreter session that produced the checkpoint.
    #[serde(rename = "researchSessionID")]
    pub research_session_id: String,
    /// Report the run belongs to.
    pub report_title: String,
    /// Run identifier.
    pub run_id: String,
    /// Stage that produced the checkpoint.
    pub stage_id: String,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
    /// Interpreter execution counter at checkpoint time.
    pub execution_count: i64,
    /// Status string.
    pub status: String,
    /// Reason string; required for `emergency`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Notebook cell reference.
    pub notebook: NotebookRef,
    /// Environment fingerprint.
    pub python_env: PythonEnv,
    /// Artifacts the checkpoint depends on.
    #[serde(default)]
    pub artifacts: Vec<ArtifactDocument>,
    /// Rehydration settings.
    pub rehydration: RehydrationDocument,
    /// Integrity seal over every other field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_sha256: Option<String>,
    /// Trust level string; absent means `local`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<String>,
}

/// A verified artifact reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRecord {
    /// Path relative to the project root.
    pub relative_path: String,
    /// Content digest.
    pub sha256: Sha256Digest,
    /// Content length in bytes.
    pub size_bytes: u64,
}

/// Rehydration settings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Rehydration {
    /// What the generated code restores.
    pub mode: RehydrationMode,
    /// Source lines replayed in [`RehydrationMode::WithVars`].
    pub cell_source: Vec<String>,
}

/// A checkpoint manifest whose fields have passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointManifest {
    /// Checkpoint identifier.
    pub checkpoint_id: String,
    /// Producing interpreter session.
    pub research_session_id: String,
    /// Owning report.
    pub report_title: String,
    /// Owning run.
    pub run_id: String,
    /// Producing stage.
    pub stage_id: StageId,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Interpreter execution counter.
    pub execution_count: u64,
    /// Persistence status.
    pub status: CheckpointStatus,
    /// Interrupt reason (always present for `emergency`).
    pub reason: Option<InterruptReason>,
    /// Notebook cell reference.
    pub notebook: NotebookRef,
    /// Environment fingerprint.
    pub python_env: PythonEnv,
    /// Artifacts the checkpoint depends on.
    pub artifacts: Vec<ArtifactRecord>,
    /// Rehydration settings.
    pub rehydration: Rehydration,
    /// Integrity seal; `None` only before sealing.
    pub manifest_sha256: Option<Sha256Digest>,
    /// Path-confinement strictness.
    pub trust_level: TrustLevel,
}

impl CheckpointManifest {
    /// Convert back to the wire form.
    #[must_use]
    pub fn to_document(&self) -> ManifestDocument {
        ManifestDocument {
            manifest_version: i64::from(MANIFEST_VERSION),
            checkpoint_id: self.checkpoint_id.clone(),
            research_session_id: self.research_session_id.clone(),
            report_title: self.report_title.clone(),
            run_id: self.run_id.clone(),
            stage_id: self.stage_id.to_string(),
            created_at: format_timestamp(self.created_at),
            execution_count: i64::try_from(self.execution_count).unwrap_or(i64::MAX),
            status: self.status.as_str().to_owned(),
            reason: self.reason.map(|r| r.as_str().to_owned()),
            notebook: self.notebook.clone(),
            python_env: self.python_env.clone(),
            artifacts: self
                .artifacts
                .iter()
                .map(|a| ArtifactDocument {
                    relative_path: a.relative_path.clone(),
                    sha256: a.sha256.to_string(),
                    size_bytes: i64::try_from(a.size_bytes).unwrap_or(i64::MAX),
                })
                .collect(),
            rehydration: RehydrationDocument {
                mode: self.rehydration.mode.as_str().to_owned(),
                rehydration_cell_source: self.rehydration.cell_source.clone(),
            },
            manifest_sha256: self.manifest_sha256.as_ref().map(ToString::to_string),
            trust_level: match self.trust_level {
                TrustLevel::Local => None,
                other => Some(other.as_str().to_owned()),
            },
        }
    }
}

impl Serialize for CheckpointManifest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

/// Render a timestamp the way manifests store it (UTC, microsecond precision).
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}
