//! Path confinement and symlink-escape detection.
//!
//! Ensures every artifact and manifest path stays within the project root.
//! Rejects absolute paths and `..` traversal, and applies symlink rules
//! according to the checkpoint's [`TrustLevel`].

use std::path::{Component, Path, PathBuf};

use crate::models::manifest::TrustLevel;
use crate::{AppError, Result};

/// Validate that `candidate` (relative to `project_root`) stays inside the tree.
///
/// - `Local`: symlinks are followed, but the resolved target must remain
///   inside the project root.
/// - `Imported`: no component below the root may be a symlink.
/// - `Untrusted`: as `Imported`, and the path must additionally start with
///   `required_prefix` (the run's artifact directory) when one is given.
///
/// Returns the absolute path (canonical when the target exists).
///
/// # Errors
///
/// Returns `AppError::PathViolation` if:
/// - The project root cannot be canonicalized.
/// - The candidate is absolute or escapes the root via `..`.
/// - The candidate crosses a symlink the trust level forbids.
/// - A symlink target resolves outside the root.
/// - An untrusted path lies outside `required_prefix`.
pub fn confine_path(
    project_root: &Path,
    candidate: impl AsRef<Path>,
    trust: TrustLevel,
    required_prefix: Option<&Path>,
) -> Result<PathBuf> {
    let candidate = candidate.as_ref();
    let root = project_root
        .canonicalize()
        .map_err(|err| AppError::PathViolation(format!("project root invalid: {err}")))?;

    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(AppError::PathViolation(format!(
                        "'{}' attempts to escape the project root",
                        candidate.display()
                    )));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(AppError::PathViolation(format!(
                    "'{}' is absolute; artifact paths must be relative",
                    candidate.display()
                )));
            }
            Component::Normal(part) => normalized.push(part),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(AppError::PathViolation("empty path".into()));
    }

    if trust == TrustLevel::Untrusted {
        if let Some(prefix) = required_prefix {
            if !normalized.starts_with(prefix) {
                return Err(AppError::PathViolation(format!(
                    "untrusted path '{}' is outside '{}'",
                    candidate.display(),
                    prefix.display()
                )));
            }
        }
    }

    let absolute = root.join(&normalized);

    if !trust.allows_symlinks() {
        let mut walked = root.clone();
        for part in normalized.components() {
            walked.push(part);
            match walked.symlink_metadata() {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(AppError::PathViolation(format!(
                        "'{}' traverses symlink '{}' (trust level {})",
                        candidate.display(),
                        walked.display(),
                        trust.as_str()
                    )));
                }
                Ok(_) => {}
                // Nothing below a missing component can be a symlink.
                Err(_) => break,
            }
        }
    }

    // Symlink escape detection: canonicalize resolves links and the final
    // target must still be within the root.
    if absolute.exists() {
        let canonical = absolute
            .canonicalize()
            .map_err(|err| AppError::PathViolation(format!("cannot resolve path: {err}")))?;

        if !canonical.starts_with(&root) {
            return Err(AppError::PathViolation(format!(
                "'{}' resolves outside the project root",
                candidate.display()
            )));
        }

        Ok(canonical)
    } else {
        Ok(absolute)
    }
}
