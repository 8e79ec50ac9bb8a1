//! Collecting a finished job's artifacts.

use std::path::Path;

use comfyrun_comfyui::catalog::HistoryEntry;
use comfyrun_core::files::{clear_directory, find_files_named, move_into};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How harvested items are reported back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTagging {
    /// Bare paths and text values.
    #[default]
    Plain,
    /// `{filename, node_id}` and `{text, node_id}` objects.
    WithNodeId,
}

/// A media file named in the job history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducedFile {
    pub filename: String,
    pub node_id: String,
}

/// A text item named in the job history, kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct ProducedText {
    pub text: Value,
    pub node_id: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutputs {
    pub files: Vec<ProducedFile>,
    pub texts: Vec<ProducedText>,
}

/// Result payload of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub file_paths: Vec<Value>,
    pub text_output: Vec<Value>,
}

impl RunResult {
    pub fn is_empty(&self) -> bool {
        self.file_paths.is_empty() && self.text_output.is_empty()
    }
}

/// Everything the history says the job produced, restricted to
/// `output_node_ids` when that list is non-empty.
///
/// Per node, gifs come before images.
pub fn collect_outputs(history: &HistoryEntry, output_node_ids: &[String]) -> JobOutputs {
    let mut outputs = JobOutputs::default();
    for (node_id, output) in history.node_outputs() {
        if !output_node_ids.is_empty() && !output_node_ids.iter().any(|id| id == node_id) {
            continue;
        }
        outputs.files.extend(output.files().map(|f| ProducedFile {
            filename: f.filename.clone(),
            node_id: node_id.to_string(),
        }));
        outputs.texts.extend(output.text.iter().map(|t| ProducedText {
            text: t.clone(),
            node_id: node_id.to_string(),
        }));
    }
    outputs
}

/// Move produced files from the service output directory into
/// `output_folder`, then empty the service output directory.
///
/// Files no longer on disk (intermediate temp files) are skipped.
pub async fn harvest(
    outputs: &JobOutputs,
    service_output_dir: &Path,
    output_folder: &Path,
    tagging: OutputTagging,
) -> std::io::Result<RunResult> {
    let mut result = RunResult::default();

    for file in &outputs.files {
        let found = find_files_named(service_output_dir, &file.filename).await?;
        let Some(path) = found.first() else {
            tracing::debug!(filename = %file.filename, "Output file vanished, skipping");
            continue;
        };
        let moved = move_into(path, output_folder).await?.display().to_string();
        result.file_paths.push(match tagging {
            OutputTagging::Plain => Value::String(moved),
            OutputTagging::WithNodeId => json!({"filename": moved, "node_id": file.node_id}),
        });
    }
    tracing::debug!(count = result.file_paths.len(), "Harvested output files");

    clear_directory(service_output_dir).await?;

    result.text_output = outputs
        .texts
        .iter()
        .map(|t| match tagging {
            OutputTagging::Plain => t.text.clone(),
            OutputTagging::WithNodeId => json!({"text": t.text, "node_id": t.node_id}),
        })
        .collect();

    Ok(result)
}
