//! Integration tests for custom-node and model dependency resolution.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use serde_json::json;
use tokio::sync::broadcast;

use comfyrun_comfyui::catalog::{CustomNodeEntry, NodeMappings};
use comfyrun_comfyui::events::RunnerEvent;
use comfyrun_core::model_refs::ModelFileRules;
use comfyrun_core::workflow::Workflow;
use comfyrun_pipeline::downloader::{DownloadOutcome, ModelSource};
use comfyrun_pipeline::model_resolver::{IgnoredModel, MissingModel, ModelResolver};
use comfyrun_pipeline::nodes::{
    ExtraNodeSource, InstallPolicy, NodeDependencyResolver, NodeInstallOutcome, NodeTypeCatalog,
};
use comfyrun_pipeline::PipelineError;

use common::{FakeAcquisition, FakePinned, FakeService};

const VHS: &str = "https://github.com/a/video-helpers";
const IMPACT: &str = "https://github.com/b/impact";

fn entry(url: &str, pattern: Option<&str>) -> CustomNodeEntry {
    serde_json::from_value(json!({
        "title": url.rsplit('/').next().unwrap(),
        "reference": url,
        "files": [url],
        "install_type": "git-clone",
        "installed": "False",
        "nodename_pattern": pattern,
    }))
    .unwrap()
}

fn service() -> Arc<FakeService> {
    Arc::new(FakeService {
        catalog: Mutex::new(vec![entry(VHS, None), entry(IMPACT, Some("^Impact"))]),
        mappings: NodeMappings::from_value(&json!({
            VHS: [["VHS_VideoCombine", "VHS_LoadVideo"], {}],
            IMPACT: [["ImpactWildcardProcessor"], {}],
        })),
        ..FakeService::with_registered(&["KSampler", "SaveImage"])
    })
}

fn workflow() -> Workflow {
    Workflow::from_value(json!({
        "1": {"class_type": "KSampler", "inputs": {}},
        "2": {"class_type": "VHS_VideoCombine", "inputs": {}},
        "3": {"class_type": "ImpactSegsToMask", "inputs": {}},
        "4": {"class_type": "workflow/grouped", "inputs": {}},
        "5": {"class_type": "TotallyUnknownNode", "inputs": {}}
    }))
    .unwrap()
}

fn impact_workflow() -> Workflow {
    Workflow::from_value(json!({
        "1": {"class_type": "KSampler", "inputs": {}},
        "3": {"class_type": "ImpactSegsToMask", "inputs": {}}
    }))
    .unwrap()
}

fn resolver(
    service: &Arc<FakeService>,
    pinned: &Arc<FakePinned>,
    custom_nodes: &std::path::Path,
    policy: InstallPolicy,
) -> (NodeDependencyResolver, broadcast::Receiver<RunnerEvent>) {
    let (tx, rx) = broadcast::channel(64);
    let resolver = NodeDependencyResolver::new(
        service.clone(),
        pinned.clone(),
        custom_nodes.to_path_buf(),
        policy,
        tx,
    );
    (resolver, rx)
}

// ---------------------------------------------------------------------------
// Test: missing-node detection is stable and converges after install
// ---------------------------------------------------------------------------

#[tokio::test]
async fn find_missing_is_idempotent_and_empty_after_install() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let pinned = Arc::new(FakePinned::default());
    let (resolver, _rx) = resolver(&service, &pinned, dir.path(), InstallPolicy::BestEffort);
    let wf = workflow();

    let catalog = NodeTypeCatalog::fetch(service.as_ref()).await.unwrap();
    let first = resolver.find_missing(&wf, &catalog);
    let second = resolver.find_missing(&wf, &catalog);
    assert_eq!(first, second);

    let urls: Vec<_> = first.entries.iter().map(|e| e.reference.as_str()).collect();
    assert_eq!(urls, vec![VHS, IMPACT]);
    assert_eq!(first.unmatched, vec!["TotallyUnknownNode".to_string()]);

    let report = resolver.install(&first, &catalog, &[]).await.unwrap();
    assert!(report.nodes_installed);
    assert_eq!(report.failures().count(), 0);

    // The fake registers mapped class types on install; ImpactSegsToMask
    // only matches by pattern, so register it as the real service would.
    service.registered.lock().unwrap().insert("ImpactSegsToMask".into());

    let refreshed = NodeTypeCatalog::fetch(service.as_ref()).await.unwrap();
    let after = resolver.find_missing(&wf, &refreshed);
    assert!(after.is_empty());
}

#[tokio::test]
async fn installed_entries_are_not_reinstalled() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    service.catalog.lock().unwrap()[0].installed = json!("True");
    let pinned = Arc::new(FakePinned::default());
    let (resolver, _rx) = resolver(&service, &pinned, dir.path(), InstallPolicy::BestEffort);

    let wf = Workflow::from_value(json!({
        "2": {"class_type": "VHS_VideoCombine", "inputs": {}}
    }))
    .unwrap();
    let report = resolver.resolve(&wf, &[]).await.unwrap();

    assert!(!report.nodes_installed);
    assert_eq!(
        report.outcomes,
        vec![NodeInstallOutcome::AlreadyInstalled {
            source: VHS.to_string()
        }]
    );
    assert!(service.installs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unresolved_class_types_are_looked_up_in_the_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let pinned = Arc::new(FakePinned::default());
    let (resolver, _rx) = resolver(&service, &pinned, dir.path(), InstallPolicy::BestEffort);
    let resolver = resolver.with_unresolved(vec!["VHS_LoadVideo".into()]);

    let wf = Workflow::from_value(json!({"1": {"class_type": "KSampler", "inputs": {}}})).unwrap();
    let catalog = NodeTypeCatalog::fetch(service.as_ref()).await.unwrap();
    let missing = resolver.find_missing(&wf, &catalog);

    assert_eq!(missing.entries.len(), 1);
    assert_eq!(missing.entries[0].reference, VHS);
}

// ---------------------------------------------------------------------------
// Test: extra node sources
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pinned_source_bypasses_generic_install() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let pinned = Arc::new(FakePinned::default());
    let (resolver, _rx) = resolver(&service, &pinned, dir.path(), InstallPolicy::BestEffort);

    let extra = [ExtraNodeSource {
        url: VHS.into(),
        commit_hash: Some("abc123".into()),
    }];
    let wf = Workflow::from_value(json!({
        "2": {"class_type": "VHS_VideoCombine", "inputs": {}}
    }))
    .unwrap();
    let report = resolver.resolve(&wf, &extra).await.unwrap();

    assert!(report.nodes_installed);
    assert!(service.installs.lock().unwrap().is_empty());
    assert_eq!(
        pinned.installs.lock().unwrap().as_slice(),
        &[(VHS.to_string(), "abc123".to_string())]
    );
}

#[tokio::test]
async fn pin_without_missing_entry_is_not_installed() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let pinned = Arc::new(FakePinned::default());
    let (resolver, _rx) = resolver(&service, &pinned, dir.path(), InstallPolicy::BestEffort);

    let wf = Workflow::from_value(json!({"1": {"class_type": "KSampler", "inputs": {}}})).unwrap();
    let extra = [ExtraNodeSource {
        url: IMPACT.into(),
        commit_hash: Some("abc123".into()),
    }];
    for _ in 0..2 {
        let report = resolver.resolve(&wf, &extra).await.unwrap();
        assert!(!report.nodes_installed);
        assert!(report.outcomes.is_empty());
    }
    assert!(pinned.installs.lock().unwrap().is_empty());
    assert!(service.installs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_extra_url_gets_a_git_clone_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let pinned = Arc::new(FakePinned::default());
    let (resolver, _rx) = resolver(&service, &pinned, dir.path(), InstallPolicy::BestEffort);
    let url = "https://github.com/c/brand-new-nodes";

    let wf = Workflow::from_value(json!({"1": {"class_type": "KSampler", "inputs": {}}})).unwrap();
    let report = resolver
        .resolve(&wf, &[ExtraNodeSource { url: url.into(), commit_hash: None }])
        .await
        .unwrap();

    assert!(report.nodes_installed);
    assert_eq!(service.installs.lock().unwrap().as_slice(), &[url.to_string()]);

    // Once checked out it is left alone.
    std::fs::create_dir_all(dir.path().join("brand-new-nodes")).unwrap();
    let again = resolver
        .resolve(&wf, &[ExtraNodeSource { url: url.into(), commit_hash: None }])
        .await
        .unwrap();
    assert!(!again.nodes_installed);
    assert_eq!(service.installs.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: install policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn best_effort_records_failure_and_continues() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let pinned = Arc::new(FakePinned::default());
    pinned.fail.store(true, Ordering::SeqCst);
    let (resolver, mut rx) = resolver(&service, &pinned, dir.path(), InstallPolicy::BestEffort);

    let wf = impact_workflow();
    let extra = [ExtraNodeSource {
        url: IMPACT.into(),
        commit_hash: Some("ffff".into()),
    }];
    let report = resolver.resolve(&wf, &extra).await.unwrap();

    assert!(report.nodes_installed);
    assert_eq!(report.failures().count(), 1);
    assert_matches!(rx.try_recv(), Ok(RunnerEvent::NodeInstallFailed { ref source, .. }) if source == IMPACT);
}

#[tokio::test]
async fn fail_fast_aborts_on_first_failure() {
    let dir = tempfile::tempdir().unwrap();
    let service = service();
    let pinned = Arc::new(FakePinned::default());
    pinned.fail.store(true, Ordering::SeqCst);
    let (resolver, _rx) = resolver(&service, &pinned, dir.path(), InstallPolicy::FailFast);

    let wf = impact_workflow();
    let extra = [ExtraNodeSource {
        url: IMPACT.into(),
        commit_hash: Some("ffff".into()),
    }];
    let err = resolver.resolve(&wf, &extra).await.unwrap_err();

    assert_matches!(err, PipelineError::DependencyInstallFailed { ref node, .. } if node == IMPACT);
}

// ---------------------------------------------------------------------------
// Model resolution
// ---------------------------------------------------------------------------

fn model_resolver(root: &std::path::Path, known: &[&str]) -> (ModelResolver, Arc<FakeAcquisition>) {
    let acquisition = Arc::new(FakeAcquisition::new(root, known));
    let (tx, _) = broadcast::channel(64);
    let resolver = ModelResolver::new(root.to_path_buf(), ModelFileRules::default(), acquisition.clone(), tx);
    (resolver, acquisition)
}

fn two_model_workflow() -> Workflow {
    Workflow::from_value(json!({
        "4": {"class_type": "CheckpointLoaderSimple", "inputs": {"ckpt_name": "SDXL/base.safetensors"}},
        "6": {"class_type": "LoraLoader", "inputs": {"lora_name": "detail.safetensors", "strength": 0.8}}
    }))
    .unwrap()
}

// ---------------------------------------------------------------------------
// Test: ignore list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ignored_model_with_missing_filepath_is_still_reported() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("loras")).unwrap();
    std::fs::write(dir.path().join("loras/detail.safetensors"), b"w").unwrap();
    let (resolver, acquisition) = model_resolver(dir.path(), &[]);

    let ignore = [IgnoredModel {
        filename: "base.safetensors".into(),
        filepath: Some("/definitely/not/here/base.safetensors".into()),
    }];
    let report = resolver
        .find_missing_models(&two_model_workflow(), &[], &ignore)
        .await
        .unwrap();

    assert_eq!(
        report.models_not_found,
        vec![MissingModel {
            model: "base.safetensors".into(),
            similar_models: vec![],
        }]
    );
    assert!(acquisition.by_name.lock().unwrap().is_empty());
}

#[tokio::test]
async fn ignored_model_without_or_with_existing_filepath_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("loras")).unwrap();
    std::fs::write(dir.path().join("loras/detail.safetensors"), b"w").unwrap();
    let external = dir.path().join("elsewhere.safetensors");
    std::fs::write(&external, b"w").unwrap();
    let (resolver, acquisition) = model_resolver(dir.path(), &[]);

    for filepath in [None, Some(external.display().to_string())] {
        let ignore = [IgnoredModel {
            filename: "base.safetensors".into(),
            filepath,
        }];
        let report = resolver
            .find_missing_models(&two_model_workflow(), &[], &ignore)
            .await
            .unwrap();
        assert!(report.is_complete());
        assert!(!report.models_downloaded);
    }
    assert!(acquisition.by_name.lock().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Test: presence check avoids fetching
// ---------------------------------------------------------------------------

#[tokio::test]
async fn present_models_are_never_fetched() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("checkpoints/SD1.5")).unwrap();
    std::fs::create_dir_all(dir.path().join("loras")).unwrap();
    std::fs::write(dir.path().join("checkpoints/SD1.5/base.safetensors"), b"w").unwrap();
    std::fs::write(dir.path().join("loras/detail.safetensors"), b"w").unwrap();
    let (resolver, acquisition) = model_resolver(dir.path(), &["base.safetensors"]);

    let report = resolver
        .find_missing_models(&two_model_workflow(), &[], &[])
        .await
        .unwrap();

    assert!(report.is_complete());
    assert!(!report.models_downloaded);
    assert!(acquisition.by_name.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_pass_finds_nothing_to_download() {
    let dir = tempfile::tempdir().unwrap();
    let (resolver, acquisition) =
        model_resolver(dir.path(), &["base.safetensors", "detail.safetensors"]);

    let first = resolver
        .find_missing_models(&two_model_workflow(), &[], &[])
        .await
        .unwrap();
    assert!(first.models_downloaded);
    assert_eq!(acquisition.by_name.lock().unwrap().len(), 2);

    let second = resolver
        .find_missing_models(&two_model_workflow(), &[], &[])
        .await
        .unwrap();
    assert!(!second.models_downloaded);
    assert!(second.is_complete());
    assert_eq!(acquisition.by_name.lock().unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Test: explicit downloads clear not-found entries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn extra_download_resolves_a_missing_model() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("checkpoints")).unwrap();
    std::fs::write(dir.path().join("checkpoints/base.safetensors"), b"w").unwrap();
    let (resolver, acquisition) = model_resolver(dir.path(), &[]);

    let extra = [ModelSource {
        filename: "detail.safetensors".into(),
        url: "https://example.invalid/detail.safetensors".into(),
        dest: "loras".into(),
        sha256: None,
    }];
    let report = resolver
        .find_missing_models(&two_model_workflow(), &extra, &[])
        .await
        .unwrap();

    assert!(report.is_complete());
    assert!(report.models_downloaded);
    assert!(report
        .outcomes
        .contains(&("detail.safetensors".to_string(), DownloadOutcome::NewDownload)));
    assert_eq!(acquisition.by_url.lock().unwrap().len(), 1);
    assert!(dir.path().join("loras/detail.safetensors").exists());
}
