//! Model-reference extraction and resolution helpers.
//!
//! A model reference is a string node input whose suffix is a known
//! weight-file extension (`.safetensors`, `.ckpt`, ...). References may
//! carry a folder prefix such as `SD1.5/` or `SDXL/` -- the *base hint*
//! -- which is stripped before lookup and used only to break ties when a
//! filename exists in several places under the model root.

use std::path::{Component, Path, PathBuf};

use crate::workflow::Workflow;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Weight-file extensions recognised as model references.
pub const DEFAULT_MODEL_EXTENSIONS: &[&str] = &[
    ".ckpt",
    ".safetensors",
    ".pt",
    ".pth",
    ".bin",
    ".onnx",
    ".torchscript",
];

/// Family tag preferred for SD 1.x base hints.
pub const FAMILY_SD15: &str = "SD1.5";

/// Family tag preferred for every other base hint.
pub const FAMILY_SDXL: &str = "SDXL";

/// Base hints that map to [`FAMILY_SD15`].
const SD15_HINTS: &[&str] = &["SD1.5", "SD1.x"];

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Which input values count as model references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFileRules {
    /// Suffixes that mark a value as a model file.
    pub extensions: Vec<String>,
    /// Suffixes of files the service fetches on its own; never resolved.
    pub optional_suffixes: Vec<String>,
}

impl Default for ModelFileRules {
    fn default() -> Self {
        Self {
            extensions: DEFAULT_MODEL_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            optional_suffixes: Vec::new(),
        }
    }
}

impl ModelFileRules {
    /// Whether `value` names a model file that must be resolved locally.
    pub fn is_model_reference(&self, value: &str) -> bool {
        self.extensions.iter().any(|ext| value.ends_with(ext.as_str()))
            && !self
                .optional_suffixes
                .iter()
                .any(|suffix| value.ends_with(suffix.as_str()))
    }
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// A model file referenced by one node input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReference {
    pub node_id: String,
    pub input_name: String,
    /// The input value exactly as written in the workflow.
    pub value: String,
    /// Parent folder portion of `value`, if any (e.g. `SD1.5`).
    pub base_hint: Option<String>,
    /// Bare filename used for lookups.
    pub filename: String,
}

/// Split a reference into its parent folder and bare filename.
///
/// Both `/` and `\` are accepted as separators since workflows are often
/// authored on Windows.
pub fn split_reference(value: &str) -> (Option<&str>, &str) {
    match value.rfind(['/', '\\']) {
        Some(idx) => {
            let head = &value[..idx];
            let tail = &value[idx + 1..];
            ((!head.is_empty()).then_some(head), tail)
        }
        None => (None, value),
    }
}

/// Collect every model reference in `workflow`, in document order.
pub fn extract_model_references(workflow: &Workflow, rules: &ModelFileRules) -> Vec<ModelReference> {
    let mut refs = Vec::new();
    for node in workflow.nodes() {
        let Some(inputs) = node.inputs else {
            continue;
        };
        for (input_name, value) in inputs {
            let Some(value) = value.as_str() else {
                continue;
            };
            if !rules.is_model_reference(value) {
                continue;
            }
            let (base_hint, filename) = split_reference(value);
            refs.push(ModelReference {
                node_id: node.id.to_string(),
                input_name: input_name.clone(),
                value: value.to_string(),
                base_hint: base_hint.map(str::to_string),
                filename: filename.to_string(),
            });
        }
    }
    refs
}

// ---------------------------------------------------------------------------
// Candidate selection
// ---------------------------------------------------------------------------

/// Canonical family tag for a base hint.
pub fn family_tag(base_hint: &str) -> &'static str {
    if SD15_HINTS.contains(&base_hint) {
        FAMILY_SD15
    } else {
        FAMILY_SDXL
    }
}

/// Pick one path among several files with the same name.
///
/// Without a base hint the first candidate wins. With a hint, the first
/// candidate whose path contains the hint's family tag wins, falling back
/// to the first candidate.
pub fn select_candidate<'a>(candidates: &'a [PathBuf], base_hint: Option<&str>) -> Option<&'a PathBuf> {
    let first = candidates.first()?;
    let Some(hint) = base_hint else {
        return Some(first);
    };
    let tag = family_tag(hint);
    Some(
        candidates
            .iter()
            .find(|p| p.to_string_lossy().contains(tag))
            .unwrap_or(first),
    )
}

/// Convert an absolute model path into the form the service expects.
///
/// The service addresses models relative to their type folder, so the
/// leading `checkpoints/` (or `loras/`, ...) component is dropped:
/// `<root>/checkpoints/SD1.5/x.safetensors` becomes `SD1.5/x.safetensors`.
/// Files sitting directly in the root are returned as their bare name.
/// Returns `None` when `path` is not under `model_root`.
pub fn relative_model_path(model_root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(model_root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    match parts.len() {
        0 => None,
        1 => Some(parts[0].clone()),
        _ => Some(parts[1..].join("/")),
    }
}
