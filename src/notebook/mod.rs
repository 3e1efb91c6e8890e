//! Notebook store abstraction.
//!
//! The checkpoint core only needs two notebook capabilities: append a cell and
//! read the cell list. [`NotebookStore`] captures that seam; [`IpynbStore`]
//! implements it on nbformat 4 JSON files.

pub mod ipynb;

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

pub use ipynb::IpynbStore;

/// Notebook cell kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    /// Executable code cell.
    Code,
    /// Markdown prose cell.
    Markdown,
    /// Raw passthrough cell.
    Raw,
}

/// A notebook cell as seen by the checkpoint core.
#[derive(Debug, Clone, PartialEq)]
pub struct NotebookCell {
    /// Cell identifier.
    pub id: String,
    /// Cell kind.
    pub cell_type: CellType,
    /// Source lines (each line keeps its trailing newline except the last).
    pub source: Vec<String>,
    /// Free-form metadata object.
    pub metadata: serde_json::Value,
}

impl NotebookCell {
    /// Construct a cell with a fresh identifier.
    #[must_use]
    pub fn new(cell_type: CellType, source: Vec<String>, metadata: serde_json::Value) -> Self {
        Self {
            id: new_cell_id(),
            cell_type,
            source,
            metadata,
        }
    }

    /// Tags listed under `metadata.tags`.
    #[must_use]
    pub fn tags(&self) -> Vec<&str> {
        self.metadata
            .get("tags")
            .and_then(serde_json::Value::as_array)
            .map(|tags| tags.iter().filter_map(serde_json::Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Generate an nbformat-compatible cell id (8–64 chars of `[A-Za-z0-9-_]`).
#[must_use]
pub fn new_cell_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Minimal notebook persistence interface.
pub trait NotebookStore: Send + Sync {
    /// Append `cell` to the notebook at `path`, creating the notebook if needed.
    ///
    /// Returns the identifier of the appended cell.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Notebook` if the notebook cannot be read, parsed,
    /// or written.
    fn append_cell(&self, path: &Path, cell: NotebookCell) -> Result<String>;

    /// Read every cell of the notebook at `path`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the notebook does not exist, or
    /// `AppError::Notebook` if it cannot be parsed.
    fn read_cells(&self, path: &Path) -> Result<Vec<NotebookCell>>;
}
