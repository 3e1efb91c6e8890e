//! Rehydration code generation.
//!
//! Turns a validated manifest into interpreter source lines that reload
//! artifacts into variables, restore random seeds, and announce the resume
//! with a `REHYDRATED` marker. Generation is pure: nothing is read from disk.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use crate::markers::Marker;
use crate::models::manifest::{CheckpointManifest, RehydrationMode};

/// Generators with a known seed-restoration call, in emission order.
const SEED_ORDER: &[&str] = &["random", "numpy", "torch"];

const PYTHON_KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Import required to load an artifact kind. Ordering is emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Import {
    Pandas,
    Pickle,
    Joblib,
    Json,
}

impl Import {
    fn statement(self) -> &'static str {
        match self {
            Self::Pandas => "import pandas as pd",
            Self::Pickle => "import pickle",
            Self::Joblib => "import joblib",
            Self::Json => "import json",
        }
    }
}

/// Artifact kinds the generator knows how to load, keyed by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArtifactKind {
    Parquet,
    Csv,
    Pickle,
    Joblib,
    Json,
}

impl ArtifactKind {
    fn from_path(path: &str) -> Option<Self> {
        let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "parquet" => Some(Self::Parquet),
            "csv" => Some(Self::Csv),
            "pkl" | "pickle" => Some(Self::Pickle),
            "joblib" => Some(Self::Joblib),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    fn import(self) -> Import {
        match self {
            Self::Parquet | Self::Csv => Import::Pandas,
            Self::Pickle => Import::Pickle,
            Self::Joblib => Import::Joblib,
            Self::Json => Import::Json,
        }
    }

    fn load_line(self, var: &str, path: &str) -> String {
        let lit = py_str(path);
        match self {
            Self::Parquet => format!("{var} = pd.read_parquet({lit})"),
            Self::Csv => format!("{var} = pd.read_csv({lit})"),
            Self::Pickle => format!("with open({lit}, 'rb') as _fh: {var} = pickle.load(_fh)"),
            Self::Joblib => format!("{var} = joblib.load({lit})"),
            Self::Json => format!("with open({lit}, 'r', encoding='utf-8') as _fh: {var} = json.load(_fh)"),
        }
    }
}

/// Generate interpreter code that rebuilds program state from `manifest`.
///
/// Emits, in order: one import per artifact kind present; one load line per
/// artifact; the stored restoration source (`with_vars` only); seed
/// restoration for `random`, `numpy`, `torch`; and a final line printing
/// `[REHYDRATED:from=<checkpointId>]`.
#[must_use]
pub fn generate_rehydration_code(manifest: &CheckpointManifest) -> Vec<String> {
    let imports: BTreeSet<Import> = manifest
        .artifacts
        .iter()
        .filter_map(|a| ArtifactKind::from_path(&a.relative_path))
        .map(ArtifactKind::import)
        .collect();
    let mut lines: Vec<String> = imports
        .into_iter()
        .map(|imp| imp.statement().to_owned())
        .collect();

    let mut used = HashSet::new();
    for artifact in &manifest.artifacts {
        match ArtifactKind::from_path(&artifact.relative_path) {
            Some(kind) => {
                let var = unique_identifier(&artifact.relative_path, &mut used);
                lines.push(kind.load_line(&var, &artifact.relative_path));
            }
            None => lines.push(format!(
                "# unsupported artifact kind, not loaded: {}",
                artifact.relative_path.replace('\n', " ")
            )),
        }
    }

    if manifest.rehydration.mode == RehydrationMode::WithVars {
        lines.extend(
            manifest
                .rehydration
                .cell_source
                .iter()
                .map(|line| line.trim_end_matches(['\r', '\n']).to_owned()),
        );
    }

    if let Some(seeds) = &manifest.python_env.random_seeds {
        for name in SEED_ORDER {
            let Some(seed) = seeds.get(*name) else {
                continue;
            };
            match *name {
                "random" => {
                    lines.push("import random".into());
                    lines.push(format!("random.seed({seed})"));
                }
                "numpy" => {
                    lines.push("import numpy as np".into());
                    lines.push(format!("np.random.seed({seed})"));
                }
                _ => {
                    lines.push("import torch".into());
                    lines.push(format!("torch.manual_seed({seed})"));
                }
            }
        }
        for name in seeds.keys().filter(|k| !SEED_ORDER.contains(&k.as_str())) {
            lines.push(format!("# no seed restorer for generator {}", py_str(name)));
        }
    }

    let marker = Marker::rehydrated(manifest.checkpoint_id.clone());
    lines.push(format!("print({})", py_str(&marker.to_string())));
    lines
}

/// Derive a Python identifier from the artifact's file stem, unique within `used`.
fn unique_identifier(relative_path: &str, used: &mut HashSet<String>) -> String {
    let stem = Path::new(relative_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact");

    let mut base: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if base.is_empty() {
        base = "artifact".into();
    }
    if base.starts_with(|c: char| c.is_ascii_digit()) {
        base.insert(0, '_');
    }
    if PYTHON_KEYWORDS.contains(&base.as_str()) {
        base.push('_');
    }

    let mut candidate = base.clone();
    let mut suffix = 2;
    while !used.insert(candidate.clone()) {
        candidate = format!("{base}_{suffix}");
        suffix += 1;
    }
    candidate
}

/// Render `value` as a single-quoted Python string literal.
fn py_str(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}
