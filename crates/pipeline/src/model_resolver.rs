//! Model-file dependency resolution.
//!
//! Finds the weight files a workflow references, fetches the ones the
//! model root lacks, reports what could not be found, and rewrites the
//! workflow's references to the paths the service expects.
//!
//! Presence is decided in one place, [`ModelResolver::is_present`]: a
//! recursive search of the whole model root for the bare filename. The
//! same search drives reference rewriting, so a file accepted as present
//! is always rewritable.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use comfyrun_comfyui::events::RunnerEvent;
use comfyrun_core::files::find_files_named;
use comfyrun_core::model_refs::{
    extract_model_references, relative_model_path, select_candidate, split_reference,
    ModelFileRules, ModelReference,
};
use comfyrun_core::workflow::Workflow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::downloader::{DownloadOutcome, FileAcquisition, ModelSource};

/// A model that is neither local nor fetchable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingModel {
    pub model: String,
    pub similar_models: Vec<String>,
}

/// A model the caller manages outside the runner.
///
/// When `filepath` is given it must exist, otherwise the model is still
/// reported missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoredModel {
    pub filename: String,
    #[serde(default)]
    pub filepath: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelReport {
    /// At least one file was newly written to the model tree.
    pub models_downloaded: bool,
    pub models_not_found: Vec<MissingModel>,
    /// Per-model acquisition results, in processing order.
    pub outcomes: Vec<(String, DownloadOutcome)>,
}

impl ModelReport {
    pub fn is_complete(&self) -> bool {
        self.models_not_found.is_empty()
    }
}

pub struct ModelResolver {
    model_root: PathBuf,
    rules: ModelFileRules,
    downloader: Arc<dyn FileAcquisition>,
    events: broadcast::Sender<RunnerEvent>,
}

impl ModelResolver {
    pub fn new(
        model_root: PathBuf,
        rules: ModelFileRules,
        downloader: Arc<dyn FileAcquisition>,
        events: broadcast::Sender<RunnerEvent>,
    ) -> Self {
        Self {
            model_root,
            rules,
            downloader,
            events,
        }
    }

    /// Model references in `workflow`, in document order.
    pub fn references(&self, workflow: &Workflow) -> Vec<ModelReference> {
        extract_model_references(workflow, &self.rules)
    }

    /// Whether a file with this bare name exists anywhere under the model root.
    pub async fn is_present(&self, filename: &str) -> std::io::Result<bool> {
        Ok(!find_files_named(&self.model_root, filename).await?.is_empty())
    }

    /// Work out which referenced models are missing and fetch what can be
    /// fetched. A non-empty `models_not_found` is a report, not an error.
    pub async fn find_missing_models(
        &self,
        workflow: &Workflow,
        extra_models: &[ModelSource],
        ignore: &[IgnoredModel],
    ) -> std::io::Result<ModelReport> {
        let mut report = ModelReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut to_fetch: Vec<String> = Vec::new();

        for reference in self.references(workflow) {
            if !seen.insert(reference.filename.clone()) {
                continue;
            }

            let ignored = ignore
                .iter()
                .find(|m| m.filename == reference.value || m.filename == reference.filename);
            if let Some(ignored) = ignored {
                match ignored.filepath.as_deref().filter(|p| !p.is_empty()) {
                    Some(path) if !tokio::fs::try_exists(path).await.unwrap_or(false) => {
                        report.models_not_found.push(MissingModel {
                            model: reference.filename.clone(),
                            similar_models: Vec::new(),
                        });
                    }
                    _ => tracing::debug!(model = %reference.filename, "Ignoring model"),
                }
                continue;
            }

            if self.is_present(&reference.filename).await? {
                report
                    .outcomes
                    .push((reference.filename.clone(), DownloadOutcome::AlreadyPresent));
            } else {
                to_fetch.push(reference.filename);
            }
        }

        for model in to_fetch {
            let outcome = match self.downloader.download_by_name(&model).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(model = %model, error = %e, "Model download failed");
                    DownloadOutcome::NotFound {
                        similar: Vec::new(),
                    }
                }
            };
            self.note_outcome(&model, &outcome, &mut report);
            if let DownloadOutcome::NotFound { similar } = &outcome {
                report.models_not_found.push(MissingModel {
                    model: model.clone(),
                    similar_models: similar.clone(),
                });
            }
            report.outcomes.push((model, outcome));
        }

        for extra in extra_models {
            match self.downloader.download_by_url(extra).await {
                Ok(outcome) => {
                    self.note_outcome(&extra.filename, &outcome, &mut report);
                    if outcome.is_found() {
                        report.models_not_found.retain(|m| m.model != extra.filename);
                    }
                    report.outcomes.push((extra.filename.clone(), outcome));
                }
                Err(e) => {
                    tracing::warn!(model = %extra.filename, url = %extra.url, error = %e, "Extra model download failed");
                }
            }
        }

        // Final re-check: anything placed under the model root meanwhile counts.
        let mut still_missing = Vec::with_capacity(report.models_not_found.len());
        for missing in std::mem::take(&mut report.models_not_found) {
            let (_, bare) = split_reference(&missing.model);
            if !self.is_present(bare).await? {
                still_missing.push(missing);
            }
        }
        report.models_not_found = still_missing;

        for missing in &report.models_not_found {
            tracing::warn!(
                model = %missing.model,
                alternatives = ?missing.similar_models,
                "Model not found",
            );
            let _ = self.events.send(RunnerEvent::ModelMissing {
                model: missing.model.clone(),
                similar_models: missing.similar_models.clone(),
            });
        }

        Ok(report)
    }

    fn note_outcome(&self, model: &str, outcome: &DownloadOutcome, report: &mut ModelReport) {
        if outcome.is_new() {
            report.models_downloaded = true;
            let _ = self.events.send(RunnerEvent::ModelDownloaded {
                model: model.to_string(),
            });
        }
    }

    /// Point every resolvable model reference at the file actually on disk.
    ///
    /// References with no match are left untouched. Returns the number of
    /// inputs rewritten.
    pub async fn rewrite_references(&self, workflow: &mut Workflow) -> std::io::Result<usize> {
        let mut rewritten = 0;
        for reference in self.references(workflow) {
            let candidates = find_files_named(&self.model_root, &reference.filename).await?;
            let Some(path) = select_candidate(&candidates, reference.base_hint.as_deref()) else {
                continue;
            };
            let Some(resolved) = relative_model_path(&self.model_root, path) else {
                continue;
            };
            if resolved == reference.value {
                continue;
            }
            tracing::debug!(node_id = %reference.node_id, from = %reference.value, to = %resolved, "Updating model reference");
            if workflow.set_input(&reference.node_id, &reference.input_name, Value::String(resolved)) {
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::downloader::DownloadError;

    /// Reports every name as unknown; panics on direct URL fetches.
    struct NoSources;

    #[async_trait]
    impl FileAcquisition for NoSources {
        async fn download_by_name(&self, _name: &str) -> Result<DownloadOutcome, DownloadError> {
            Ok(DownloadOutcome::NotFound {
                similar: vec!["close.safetensors".into()],
            })
        }

        async fn download_by_url(&self, _source: &ModelSource) -> Result<DownloadOutcome, DownloadError> {
            panic!("unexpected url download");
        }
    }

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"w").unwrap();
    }

    fn resolver(root: &Path) -> ModelResolver {
        let (tx, _) = broadcast::channel(16);
        ModelResolver::new(root.to_path_buf(), ModelFileRules::default(), Arc::new(NoSources), tx)
    }

    fn workflow_with(ckpt: &str) -> Workflow {
        Workflow::from_value(json!({
            "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": ckpt}},
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn rewrite_prefers_sd15_for_sd1x_hint() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "checkpoints/SD1.5/x.safetensors");
        touch(dir.path(), "checkpoints/SDXL/x.safetensors");

        let mut wf = workflow_with("SD1.x/x.safetensors");
        let n = resolver(dir.path()).rewrite_references(&mut wf).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(wf.input("4", "ckpt_name"), Some(&json!("SD1.5/x.safetensors")));
    }

    #[tokio::test]
    async fn rewrite_prefers_sdxl_for_other_hints() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "checkpoints/SD1.5/x.safetensors");
        touch(dir.path(), "checkpoints/SDXL/x.safetensors");

        let mut wf = workflow_with("Pony/x.safetensors");
        resolver(dir.path()).rewrite_references(&mut wf).await.unwrap();
        assert_eq!(wf.input("4", "ckpt_name"), Some(&json!("SDXL/x.safetensors")));
    }

    #[tokio::test]
    async fn rewrite_without_hint_takes_first_and_strips_type_folder() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "checkpoints/x.safetensors");

        let mut wf = workflow_with("x.safetensors");
        let n = resolver(dir.path()).rewrite_references(&mut wf).await.unwrap();
        assert_eq!(n, 0, "already in the form the service expects");
        assert_eq!(wf.input("4", "ckpt_name"), Some(&json!("x.safetensors")));
    }

    #[tokio::test]
    async fn unresolvable_reference_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = workflow_with("SDXL/nowhere.safetensors");
        let n = resolver(dir.path()).rewrite_references(&mut wf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(wf.input("4", "ckpt_name"), Some(&json!("SDXL/nowhere.safetensors")));
    }

    #[tokio::test]
    async fn missing_model_carries_alternatives() {
        let dir = tempfile::tempdir().unwrap();
        let report = resolver(dir.path())
            .find_missing_models(&workflow_with("gone.safetensors"), &[], &[])
            .await
            .unwrap();
        assert!(!report.is_complete());
        assert_eq!(
            report.models_not_found,
            vec![MissingModel {
                model: "gone.safetensors".into(),
                similar_models: vec!["close.safetensors".into()],
            }]
        );
        assert!(!report.models_downloaded);
    }

    #[tokio::test]
    async fn present_model_needs_no_fetch() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "checkpoints/SD1.5/here.safetensors");
        let report = resolver(dir.path())
            .find_missing_models(&workflow_with("here.safetensors"), &[], &[])
            .await
            .unwrap();
        assert!(report.is_complete());
        assert_eq!(
            report.outcomes,
            vec![("here.safetensors".to_string(), DownloadOutcome::AlreadyPresent)]
        );
    }
}
