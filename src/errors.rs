//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

use crate::models::validation::ValidationError;

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// One or more manifest or envelope fields are malformed.
    Validation(Vec<ValidationError>),
    /// A declared artifact does not exist on disk.
    ArtifactMissing(String),
    /// An artifact exists but its hash or size does not match the manifest.
    ArtifactCorrupt(String),
    /// A manifest is unparseable or its integrity seal does not match.
    ManifestCorrupt(String),
    /// A path escapes the project tree or crosses a forbidden symlink.
    PathViolation(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Entity with the same identifier already exists.
    AlreadyExists(String),
    /// Notebook read or append failure.
    Notebook(String),
    /// Another orchestrator holds the run lock.
    Locked(String),
    /// Process-control primitive failure (signal delivery, reaping).
    Process(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Validation(errors) => {
                write!(f, "validation: ")?;
                for (idx, err) in errors.iter().enumerate() {
                    if idx > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{err}")?;
                }
                Ok(())
            }
            Self::ArtifactMissing(msg) => write!(f, "artifact missing: {msg}"),
            Self::ArtifactCorrupt(msg) => write!(f, "artifact corrupt: {msg}"),
            Self::ManifestCorrupt(msg) => write!(f, "manifest corrupt: {msg}"),
            Self::PathViolation(msg) => write!(f, "path violation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Self::Notebook(msg) => write!(f, "notebook: {msg}"),
            Self::Locked(msg) => write!(f, "locked: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<Vec<ValidationError>> for AppError {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self::Validation(errors)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("json: {err}"))
    }
}
