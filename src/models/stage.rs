//! Stage identifiers, envelopes, and the per-stage lifecycle state machine.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::validation::ValidationError;

#[allow(clippy::expect_used)]
static STAGE_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^S(\d{2})_[a-z][a-z0-9]*_[a-z][a-z0-9_]*$").expect("stage id regex is valid")
});

/// Smallest permitted `maxDurationSec`.
pub const MIN_STAGE_DURATION_SECS: u64 = 30;
/// Largest permitted `maxDurationSec`.
pub const MAX_STAGE_DURATION_SECS: u64 = 600;
/// Default `maxDurationSec` when the envelope omits it.
pub const DEFAULT_STAGE_DURATION_SECS: u64 = 240;

const GOAL_MIN_CHARS: usize = 10;
const GOAL_MAX_CHARS: usize = 200;

/// A validated stage identifier of the form `S{NN}_{verb}_{noun}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageId(String);

impl StageId {
    /// Parse and validate a stage identifier.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] if `raw` does not match the naming pattern.
    pub fn parse(raw: &str) -> std::result::Result<Self, ValidationError> {
        if STAGE_ID_REGEX.is_match(raw) {
            Ok(Self(raw.to_owned()))
        } else {
            Err(ValidationError::new(
                "stageId",
                format!("'{raw}' does not match S{{NN}}_{{verb}}_{{noun}}"),
            ))
        }
    }

    /// Two-digit sequence number encoded in the identifier.
    #[must_use]
    pub fn sequence(&self) -> u8 {
        // The regex guarantees two ASCII digits at offsets 1..3.
        self.0[1..3].parse().unwrap_or(0)
    }

    /// Prefix of the stage that follows this one, e.g. `S02_eda_analysis` → `S03_`.
    ///
    /// Returns `None` once the two-digit sequence is exhausted (`S99`).
    #[must_use]
    pub fn next_prefix(&self) -> Option<String> {
        let next = self.sequence().checked_add(1)?;
        (next <= 99).then(|| format!("S{next:02}_"))
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StageId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StageId {
    type Error = ValidationError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<StageId> for String {
    fn from(value: StageId) -> Self {
        value.0
    }
}

fn default_max_duration() -> u64 {
    DEFAULT_STAGE_DURATION_SECS
}

fn default_true() -> bool {
    true
}

/// Contract describing one bounded unit of work handed to the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEnvelope {
    /// Stage identifier; kept as a raw string so malformed envelopes can be reported.
    pub stage_id: String,
    /// Human-readable purpose of the stage.
    pub goal: String,
    /// Named input files, relative to the project root.
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Named output files, relative to the project root.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
    /// Soft wall-clock budget in seconds.
    #[serde(default = "default_max_duration")]
    pub max_duration_sec: u64,
    /// Stages that must have completed first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Whether the orchestrator may retry the stage after a failure.
    #[serde(default = "default_true")]
    pub retryable: bool,
    /// Whether a checkpoint is expected once the stage completes.
    #[serde(default = "default_true")]
    pub checkpoint_after: bool,
}

impl StageEnvelope {
    /// Construct an envelope with protocol defaults.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            stage_id: stage_id.into(),
            goal: goal.into(),
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            max_duration_sec: DEFAULT_STAGE_DURATION_SECS,
            dependencies: Vec::new(),
            retryable: true,
            checkpoint_after: true,
        }
    }

    /// Validate the envelope before delegation, returning its parsed stage id.
    ///
    /// # Errors
    ///
    /// Returns every violated constraint (stage id pattern, goal length,
    /// duration range, dependency ids, input/output path shape).
    pub fn validate(&self) -> std::result::Result<StageId, Vec<ValidationError>> {
        let mut errors = Vec::new();

        let stage_id = match StageId::parse(&self.stage_id) {
            Ok(id) => Some(id),
            Err(err) => {
                errors.push(err);
                None
            }
        };

        let goal_len = self.goal.trim().chars().count();
        if !(GOAL_MIN_CHARS..=GOAL_MAX_CHARS).contains(&goal_len) {
            errors.push(ValidationError::new(
                "goal",
                format!("length {goal_len} outside {GOAL_MIN_CHARS}..={GOAL_MAX_CHARS}"),
            ));
        }

        if !(MIN_STAGE_DURATION_SECS..=MAX_STAGE_DURATION_SECS).contains(&self.max_duration_sec) {
            errors.push(ValidationError::new(
                "maxDurationSec",
                format!(
                    "{} outside {MIN_STAGE_DURATION_SECS}..={MAX_STAGE_DURATION_SECS}",
                    self.max_duration_sec
                ),
            ));
        }

        for dep in &self.dependencies {
            if let Err(err) = StageId::parse(dep) {
                errors.push(ValidationError::new("dependencies", err.message));
            }
        }

        for (field, map) in [("inputs", &self.inputs), ("outputs", &self.outputs)] {
            for (name, path) in map {
                if !is_plain_relative(Path::new(path)) {
                    errors.push(ValidationError::new(
                        field,
                        format!("'{name}' path '{path}' must be relative without '..'"),
                    ));
                }
            }
        }

        match stage_id {
            Some(id) if errors.is_empty() => Ok(id),
            _ => Err(errors),
        }
    }
}

/// Whether `path` is non-empty, relative, and free of parent traversal.
pub(crate) fn is_plain_relative(path: &Path) -> bool {
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Lifecycle state of a supervised stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Envelope accepted, execution not started.
    Pending,
    /// Execution in progress.
    Running,
    /// Execution returned normally.
    Completed,
    /// Hard timeout reached; signal escalation in progress.
    Interrupting,
    /// Escalation finished; process no longer running the stage.
    Interrupted,
    /// Execution returned an error.
    Failed,
    /// A valid checkpoint exists; the run can continue after restart.
    Resumable,
    /// No valid checkpoint exists; the run cannot continue automatically.
    Blocked,
}

impl StageState {
    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(self, next: StageState) -> bool {
        matches!(
            (self, next),
            (StageState::Pending, StageState::Running)
                | (
                    StageState::Running,
                    StageState::Completed | StageState::Interrupting | StageState::Failed
                )
                | (StageState::Interrupting, StageState::Interrupted)
                | (
                    StageState::Interrupted | StageState::Failed,
                    StageState::Resumable | StageState::Blocked
                )
        )
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageState::Completed | StageState::Resumable | StageState::Blocked
        )
    }
}
