//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::orchestrator::DEFAULT_KEEP_COUNT;
use crate::supervisor::SupervisorConfig;
use crate::{AppError, Result};

/// Checkpoint retention settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RetentionConfig {
    /// Most recent checkpoints kept by `prune`.
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_count: default_keep_count(),
        }
    }
}

fn default_keep_count() -> usize {
    DEFAULT_KEEP_COUNT
}

/// Stage supervision settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorSection {
    /// Wait after the interrupt signal before escalating.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Watchdog polling cadence.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Gap between the soft and hard timeouts.
    #[serde(default = "default_hard_timeout_margin_seconds")]
    pub hard_timeout_margin_seconds: u64,
    /// Cap on captured stage output.
    #[serde(default = "default_max_captured_output_bytes")]
    pub max_captured_output_bytes: usize,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            poll_interval_seconds: default_poll_interval_seconds(),
            hard_timeout_margin_seconds: default_hard_timeout_margin_seconds(),
            max_captured_output_bytes: default_max_captured_output_bytes(),
        }
    }
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_poll_interval_seconds() -> u64 {
    5
}

fn default_hard_timeout_margin_seconds() -> u64 {
    30
}

fn default_max_captured_output_bytes() -> usize {
    1024 * 1024
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Directory containing `reports/` and `notebooks/`.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Retention settings.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Supervision settings.
    #[serde(default)]
    pub supervisor: SupervisorSection,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// Relative `project_root` values are resolved against the config file's
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;

        let mut config: Self = toml::from_str(&raw)?;
        if config.project_root.is_relative() {
            if let Some(dir) = path.parent() {
                config.project_root = dir.join(&config.project_root);
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `project_root` with every default.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the root does not exist.
    pub fn with_project_root(project_root: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Self {
            project_root: project_root.into(),
            retention: RetentionConfig::default(),
            supervisor: SupervisorSection::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Canonical project root.
    #[must_use]
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Supervision settings as runtime durations.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            grace_period: Duration::from_millis(self.supervisor.grace_period_ms),
            poll_interval: Duration::from_secs(self.supervisor.poll_interval_seconds),
            hard_timeout_margin: Duration::from_secs(self.supervisor.hard_timeout_margin_seconds),
            max_captured_output_bytes: self.supervisor.max_captured_output_bytes,
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.retention.keep_count == 0 {
            return Err(AppError::Config(
                "retention.keep_count must be at least 1".into(),
            ));
        }

        if self.supervisor.grace_period_ms == 0 {
            return Err(AppError::Config(
                "supervisor.grace_period_ms must be greater than zero".into(),
            ));
        }

        if !(1..=60).contains(&self.supervisor.poll_interval_seconds) {
            return Err(AppError::Config(format!(
                "supervisor.poll_interval_seconds must be within 1..=60, got {}",
                self.supervisor.poll_interval_seconds
            )));
        }

        if self.supervisor.max_captured_output_bytes == 0 {
            return Err(AppError::Config(
                "supervisor.max_captured_output_bytes must be greater than zero".into(),
            ));
        }

        let canonical_root = self
            .project_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("project_root invalid: {err}")))?;
        self.project_root = canonical_root;

        Ok(())
    }
}
