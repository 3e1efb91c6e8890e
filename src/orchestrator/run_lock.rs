//! Advisory single-writer lock per run.
//!
//! The lock is a small JSON file created with `create_new`. A lock whose
//! owning process no longer exists is reclaimed once; any other existing
//! lock yields `AppError::Locked`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::layout::ProjectLayout;
use crate::models::validation::check_component;
use crate::{AppError, Result};

/// Age after which an unparseable lock file is considered abandoned.
const UNREADABLE_LOCK_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockRecord {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held run lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    /// Acquire the lock for `report_title`/`run_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Locked` if another live process holds the lock,
    /// `AppError::Validation` for unsafe identifiers, or `AppError::Io` if the
    /// lock file cannot be created.
    pub fn acquire(layout: &ProjectLayout, report_title: &str, run_id: &str) -> Result<Self> {
        let mut errors = Vec::new();
        check_component("reportTitle", report_title, &mut errors);
        check_component("runId", run_id, &mut errors);
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let path = layout.lock_path(report_title, run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(AppError::Locked(holder)) if is_stale(&path) => {
                warn!(lock = %path.display(), %holder, "reclaiming stale run lock");
                fs::remove_file(&path)?;
                try_create(&path)
            }
            Err(err) => Err(err),
        }
    }

    /// Lock file location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the lock file cannot be removed.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn try_create(path: &Path) -> Result<RunLock> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let holder = fs::read_to_string(path).unwrap_or_default();
            return Err(AppError::Locked(format!(
                "{} is held: {}",
                path.display(),
                holder.trim()
            )));
        }
        Err(err) => return Err(err.into()),
    };

    let record = LockRecord {
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    let body = serde_json::to_vec(&record)
        .map_err(|err| AppError::Io(format!("cannot encode lock record: {err}")))?;
    file.write_all(&body)?;
    file.sync_all()?;

    info!(lock = %path.display(), pid = record.pid, "run lock acquired");
    Ok(RunLock {
        path: path.to_path_buf(),
        released: false,
    })
}

fn is_stale(path: &Path) -> bool {
    let record = fs::read(path)
        .ok()
        .and_then(|raw| serde_json::from_slice::<LockRecord>(&raw).ok());

    match record {
        Some(record) => !process_alive(record.pid),
        None => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .is_some_and(|age| age > UNREADABLE_LOCK_TTL),
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 probes for existence; EPERM still means the process exists.
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}
