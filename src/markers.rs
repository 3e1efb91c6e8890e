//! Lifecycle marker text emitted into interpreter output.
//!
//! Three marker families are understood:
//!
//! ```text
//! [STAGE:begin|end|progress:id=<stageId>]
//! [CHECKPOINT:saved|begin|end|emergency:id=<checkpointId>]
//! [REHYDRATED:from=<checkpointId>]
//! ```
//!
//! Markers may appear anywhere in a line; [`parse_line`] returns the first.

use std::fmt::{Display, Formatter};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

#[allow(clippy::expect_used)]
static MARKER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\[(?:(STAGE):(begin|end|progress):id=([^\]\s]+)|(CHECKPOINT):(saved|begin|end|emergency):id=([^\]\s]+)|(REHYDRATED):from=([^\]\s]+))\]",
    )
    .expect("marker regex is valid")
});

/// Stage lifecycle marker kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageMarkerKind {
    /// Stage started.
    Begin,
    /// Stage finished.
    End,
    /// Stage reported progress.
    Progress,
}

/// Checkpoint lifecycle marker kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMarkerKind {
    /// Checkpoint persisted.
    Saved,
    /// Checkpoint write started.
    Begin,
    /// Checkpoint write finished.
    End,
    /// Emergency checkpoint persisted.
    Emergency,
}

/// A recognized lifecycle marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Marker {
    /// `[STAGE:<kind>:id=<id>]`
    Stage {
        /// Lifecycle event.
        kind: StageMarkerKind,
        /// Stage identifier.
        id: String,
    },
    /// `[CHECKPOINT:<kind>:id=<id>]`
    Checkpoint {
        /// Lifecycle event.
        kind: CheckpointMarkerKind,
        /// Checkpoint identifier.
        id: String,
    },
    /// `[REHYDRATED:from=<id>]`
    Rehydrated {
        /// Checkpoint the session was rebuilt from.
        from: String,
    },
}

impl Marker {
    /// Stage marker shorthand.
    #[must_use]
    pub fn stage(kind: StageMarkerKind, id: impl Into<String>) -> Self {
        Self::Stage {
            kind,
            id: id.into(),
        }
    }

    /// Checkpoint marker shorthand.
    #[must_use]
    pub fn checkpoint(kind: CheckpointMarkerKind, id: impl Into<String>) -> Self {
        Self::Checkpoint {
            kind,
            id: id.into(),
        }
    }

    /// Rehydration marker shorthand.
    #[must_use]
    pub fn rehydrated(from: impl Into<String>) -> Self {
        Self::Rehydrated { from: from.into() }
    }
}

impl Display for Marker {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stage { kind, id } => {
                let kind = match kind {
                    StageMarkerKind::Begin => "begin",
                    StageMarkerKind::End => "end",
                    StageMarkerKind::Progress => "progress",
                };
                write!(f, "[STAGE:{kind}:id={id}]")
            }
            Self::Checkpoint { kind, id } => {
                let kind = match kind {
                    CheckpointMarkerKind::Saved => "saved",
                    CheckpointMarkerKind::Begin => "begin",
                    CheckpointMarkerKind::End => "end",
                    CheckpointMarkerKind::Emergency => "emergency",
                };
                write!(f, "[CHECKPOINT:{kind}:id={id}]")
            }
            Self::Rehydrated { from } => write!(f, "[REHYDRATED:from={from}]"),
        }
    }
}

/// Find the first marker in `line`.
#[must_use]
pub fn parse_line(line: &str) -> Option<Marker> {
    let caps = MARKER_REGEX.captures(line)?;

    if caps.get(1).is_some() {
        let kind = match caps.get(2)?.as_str() {
            "begin" => StageMarkerKind::Begin,
            "end" => StageMarkerKind::End,
            _ => StageMarkerKind::Progress,
        };
        return Some(Marker::stage(kind, caps.get(3)?.as_str()));
    }

    if caps.get(4).is_some() {
        let kind = match caps.get(5)?.as_str() {
            "saved" => CheckpointMarkerKind::Saved,
            "begin" => CheckpointMarkerKind::Begin,
            "end" => CheckpointMarkerKind::End,
            _ => CheckpointMarkerKind::Emergency,
        };
        return Some(Marker::checkpoint(kind, caps.get(6)?.as_str()));
    }

    caps.get(7)?;
    Some(Marker::rehydrated(caps.get(8)?.as_str()))
}

/// Checkpoint id from the first `REHYDRATED` marker in `output`, if any.
#[must_use]
pub fn find_rehydrated(output: &str) -> Option<String> {
    output.lines().find_map(|line| match parse_line(line) {
        Some(Marker::Rehydrated { from }) => Some(from),
        _ => None,
    })
}
