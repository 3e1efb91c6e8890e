//! Content hashing, manifest sealing, path confinement, and durable writes.
//!
//! Every component that reads or writes checkpoint data goes through this
//! module so that hashing and confinement rules are applied uniformly.

pub mod path_safety;
pub mod writer;

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::models::manifest::{ManifestDocument, Sha256Digest};
use crate::{AppError, Result};

pub use path_safety::confine_path;
pub use writer::{sync_dir, write_atomic, WriteMode, WriteSummary};

/// JSON key holding the seal; excluded from the sealed content.
pub const SEAL_FIELD: &str = "manifestSha256";

/// Compute SHA-256 hex digest of the given bytes.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Stream a file through SHA-256, returning its digest and length.
///
/// # Errors
///
/// Returns `AppError::ArtifactMissing` if the file does not exist, or
/// `AppError::Io` if it cannot be read.
pub fn hash_file(path: &Path) -> Result<(Sha256Digest, u64)> {
    let file = File::open(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            AppError::ArtifactMissing(path.display().to_string())
        } else {
            AppError::Io(format!("cannot open {}: {err}", path.display()))
        }
    })?;

    let mut hasher = Sha256::new();
    let size = io::copy(&mut BufReader::new(file), &mut hasher)
        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", path.display())))?;

    let hex = format!("{:x}", hasher.finalize());
    let digest = Sha256Digest::parse(&hex)
        .ok_or_else(|| AppError::Io(format!("digest of {} is malformed", path.display())))?;
    Ok((digest, size))
}

/// Compute the integrity seal for a manifest document.
///
/// The seal covers the canonical JSON of every field except
/// `manifestSha256`, so a document can be sealed and later re-verified
/// regardless of pretty-printing or key order.
///
/// # Errors
///
/// Returns `AppError::ManifestCorrupt` if the document cannot be serialized.
pub fn compute_seal(doc: &ManifestDocument) -> Result<Sha256Digest> {
    let value = serde_json::to_value(doc)
        .map_err(|err| AppError::ManifestCorrupt(format!("cannot serialize manifest: {err}")))?;
    seal_of_value(&value)
}

/// Compute the seal of a raw manifest JSON value (ignoring any existing seal).
///
/// # Errors
///
/// Returns `AppError::ManifestCorrupt` if `value` is not a JSON object.
pub fn seal_of_value(value: &Value) -> Result<Sha256Digest> {
    let Value::Object(map) = value else {
        return Err(AppError::ManifestCorrupt(
            "manifest root is not an object".into(),
        ));
    };

    let mut body = map.clone();
    body.remove(SEAL_FIELD);

    let mut canonical = String::new();
    write_canonical(&Value::Object(body), &mut canonical);

    Sha256Digest::parse(&sha256_hex(canonical.as_bytes()))
        .ok_or_else(|| AppError::ManifestCorrupt("seal digest is malformed".into()))
}

/// Verify that the seal stored in `value` matches its content.
///
/// # Errors
///
/// Returns `AppError::ManifestCorrupt` if the seal is absent or does not match.
pub fn verify_seal(value: &Value) -> Result<()> {
    let stored = value
        .get(SEAL_FIELD)
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::ManifestCorrupt("manifest has no integrity seal".into()))?;

    let expected = seal_of_value(value)?;
    if expected.as_str() == stored {
        Ok(())
    } else {
        Err(AppError::ManifestCorrupt(format!(
            "seal mismatch: stored {stored}, computed {expected}"
        )))
    }
}

/// Serialize `value` with object keys in sorted order and no whitespace.
fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(&Value::String(key.clone()), out);
                out.push(':');
                if let Some(child) = map.get(key) {
                    write_canonical(child, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            // Display for scalars is compact JSON.
            let _ = write!(out, "{scalar}");
        }
    }
}
