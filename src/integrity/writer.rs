//! Atomic, durable file writing.
//!
//! Content is written to a uniquely named temporary file in the target's
//! directory, flushed to disk, renamed into place, and the directory entry
//! is fsync'd. Readers therefore observe either the previous state or the
//! complete new file, never a partial write.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::{AppError, Result};

/// Whether an existing target may be replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Atomically replace any existing file.
    Replace,
    /// Fail if the target already exists.
    CreateNew,
}

/// Summary of a completed file write operation.
#[derive(Debug, Clone)]
pub struct WriteSummary {
    /// Absolute path of the written file.
    pub path: PathBuf,
    /// Number of bytes written.
    pub bytes_written: usize,
}

/// Write `content` to `target` atomically and durably.
///
/// Parent directories are created as needed. The caller is responsible for
/// path confinement.
///
/// # Errors
///
/// Returns `AppError::AlreadyExists` when `mode` is [`WriteMode::CreateNew`]
/// and the target exists, or `AppError::Io` on any I/O failure (directory
/// creation, temp file write, fsync, or rename).
pub fn write_atomic(target: &Path, content: &[u8], mode: WriteMode) -> Result<WriteSummary> {
    let parent = target
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", target.display())))?;

    std::fs::create_dir_all(parent).map_err(|err| {
        AppError::Io(format!(
            "failed to create parent directories for {}: {err}",
            target.display()
        ))
    })?;

    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| AppError::Io(format!("failed to create temporary file: {err}")))?;

    tmp.write_all(content)
        .map_err(|err| AppError::Io(format!("failed to write temporary file: {err}")))?;
    tmp.as_file()
        .sync_all()
        .map_err(|err| AppError::Io(format!("failed to sync temporary file: {err}")))?;

    match mode {
        WriteMode::Replace => {
            tmp.persist(target).map_err(|err| {
                AppError::Io(format!(
                    "failed to persist file to {}: {err}",
                    target.display()
                ))
            })?;
        }
        WriteMode::CreateNew => {
            tmp.persist_noclobber(target).map_err(|err| {
                if err.error.kind() == std::io::ErrorKind::AlreadyExists {
                    AppError::AlreadyExists(target.display().to_string())
                } else {
                    AppError::Io(format!(
                        "failed to persist file to {}: {err}",
                        target.display()
                    ))
                }
            })?;
        }
    }

    sync_dir(parent)?;

    Ok(WriteSummary {
        path: target.to_path_buf(),
        bytes_written: content.len(),
    })
}

/// Flush a file's content to stable storage.
///
/// # Errors
///
/// Returns `AppError::ArtifactMissing` if the file is gone, or `AppError::Io`
/// if the sync fails.
pub fn sync_file(path: &Path) -> Result<()> {
    let file = File::open(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            AppError::ArtifactMissing(path.display().to_string())
        } else {
            AppError::Io(format!("cannot open {}: {err}", path.display()))
        }
    })?;
    file.sync_all()
        .map_err(|err| AppError::Io(format!("failed to sync {}: {err}", path.display())))
}

/// Fsync a directory so that renames inside it survive a crash.
///
/// # Errors
///
/// Returns `AppError::Io` if the directory cannot be opened or synced.
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)
        .map_err(|err| AppError::Io(format!("cannot open directory {}: {err}", dir.display())))?;
    handle
        .sync_all()
        .map_err(|err| AppError::Io(format!("failed to sync directory {}: {err}", dir.display())))
}

/// Directory handles cannot be fsync'd on this platform; renames are
/// already durable through the filesystem journal.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
