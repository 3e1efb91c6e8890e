//! nbformat 4 notebook store.

use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::debug;

use super::{new_cell_id, CellType, NotebookCell, NotebookStore};
use crate::integrity::{write_atomic, WriteMode};
use crate::{AppError, Result};

/// [`NotebookStore`] backed by `.ipynb` files on the local filesystem.
///
/// Every append rewrites the notebook through an atomic rename, so readers
/// never see a half-written file. Single-writer access per notebook is
/// assumed (the run lock provides it).
#[derive(Debug, Clone, Copy, Default)]
pub struct IpynbStore;

impl IpynbStore {
    /// Construct a store.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    fn load(path: &Path) -> Result<Option<Value>> {
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).map(Some).map_err(|err| {
                AppError::Notebook(format!("cannot parse {}: {err}", path.display()))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(AppError::Notebook(format!(
                "cannot read {}: {err}",
                path.display()
            ))),
        }
    }
}

fn empty_notebook() -> Value {
    json!({
        "cells": [],
        "metadata": {},
        "nbformat": 4,
        "nbformat_minor": 5
    })
}

fn cell_to_json(cell: &NotebookCell) -> Value {
    let mut obj = Map::new();
    obj.insert("id".into(), Value::String(cell.id.clone()));
    obj.insert(
        "cell_type".into(),
        serde_json::to_value(cell.cell_type).unwrap_or(Value::String("raw".into())),
    );
    obj.insert("metadata".into(), cell.metadata.clone());
    obj.insert(
        "source".into(),
        Value::Array(cell.source.iter().cloned().map(Value::String).collect()),
    );
    if cell.cell_type == CellType::Code {
        obj.insert("execution_count".into(), Value::Null);
        obj.insert("outputs".into(), Value::Array(Vec::new()));
    }
    Value::Object(obj)
}

fn cell_from_json(value: &Value) -> Option<NotebookCell> {
    let cell_type = value
        .get("cell_type")
        .and_then(|v| serde_json::from_value::<CellType>(v.clone()).ok())?;

    // nbformat allows `source` to be a single string or a list of lines.
    let source = match value.get("source") {
        Some(Value::String(text)) => text.split_inclusive('\n').map(str::to_owned).collect(),
        Some(Value::Array(lines)) => lines
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    };

    Some(NotebookCell {
        id: value
            .get("id")
            .and_then(Value::as_str)
            .map_or_else(new_cell_id, str::to_owned),
        cell_type,
        source,
        metadata: value.get("metadata").cloned().unwrap_or_else(|| json!({})),
    })
}

impl NotebookStore for IpynbStore {
    fn append_cell(&self, path: &Path, cell: NotebookCell) -> Result<String> {
        let mut notebook = Self::load(path)?.unwrap_or_else(empty_notebook);

        let cells = notebook
            .get_mut("cells")
            .and_then(Value::as_array_mut)
            .ok_or_else(|| {
                AppError::Notebook(format!("{} has no cells array", path.display()))
            })?;
        cells.push(cell_to_json(&cell));

        let rendered = serde_json::to_vec_pretty(&notebook)
            .map_err(|err| AppError::Notebook(format!("cannot serialize notebook: {err}")))?;
        let written = write_atomic(path, &rendered, WriteMode::Replace)?;

        debug!(
            notebook = %written.path.display(),
            bytes = written.bytes_written,
            cell_id = %cell.id,
            "cell appended"
        );
        Ok(cell.id)
    }

    fn read_cells(&self, path: &Path) -> Result<Vec<NotebookCell>> {
        let notebook = Self::load(path)?
            .ok_or_else(|| AppError::NotFound(format!("notebook {}", path.display())))?;

        let cells = notebook
            .get("cells")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                AppError::Notebook(format!("{} has no cells array", path.display()))
            })?;

        Ok(cells.iter().filter_map(cell_from_json).collect())
    }
}
