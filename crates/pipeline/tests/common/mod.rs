//! In-memory doubles for the pipeline's collaborators.
//!
//! Each fake records what was asked of it so tests can assert on calls
//! (starts, installs, downloads, interrupts) without a real server.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

use comfyrun_comfyui::api::{ComfyUIApiError, SubmitResponse};
use comfyrun_comfyui::catalog::{CustomNodeEntry, HistoryEntry, NodeMappings, QueueState};
use comfyrun_comfyui::client::ComfyUIClientError;
use comfyrun_comfyui::service::{ComfyService, EventConnector, EventStream};
use comfyrun_pipeline::bootstrap::{BootstrapError, ServiceBootstrap};
use comfyrun_pipeline::downloader::{DownloadError, DownloadOutcome, FileAcquisition, ModelSource};
use comfyrun_pipeline::node_installer::{InstallError, PinnedNodeInstaller};
use comfyrun_pipeline::process::{ProcessError, ServiceProcess, ServiceProcessState};
use comfyrun_pipeline::{ExecutionPipeline, PipelineParts, RunnerConfig};

/// Prompt id every submission to [`FakeService`] is assigned.
pub const PROMPT_ID: &str = "p-1";

/// A one-node workflow using a built-in class type.
pub fn minimal_workflow() -> String {
    json!({
        "1": {"class_type": "KSampler", "inputs": {"seed": 1}}
    })
    .to_string()
}

pub fn api_error() -> ComfyUIApiError {
    ComfyUIApiError::ApiError {
        status: 503,
        body: "unavailable".into(),
    }
}

// ---------------------------------------------------------------------------
// Service client
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeService {
    pub registered: Mutex<HashSet<String>>,
    pub catalog: Mutex<Vec<CustomNodeEntry>>,
    pub mappings: NodeMappings,
    pub history: Mutex<Option<HistoryEntry>>,
    pub queue: Mutex<QueueState>,
    pub queue_unreachable: AtomicBool,
    pub submitted: Mutex<Vec<(Value, String)>>,
    pub installs: Mutex<Vec<String>>,
    pub interrupts: AtomicUsize,
    pub queue_calls: AtomicUsize,
    /// Total requests of any kind.
    pub calls: AtomicUsize,
}

impl FakeService {
    pub fn with_registered(names: &[&str]) -> Self {
        Self {
            registered: Mutex::new(names.iter().map(|s| s.to_string()).collect()),
            history: Mutex::new(Some(HistoryEntry::default())),
            ..Default::default()
        }
    }

    pub fn set_history(&self, history: Value) {
        *self.history.lock().unwrap() = Some(serde_json::from_value(history).unwrap());
    }

    pub fn set_running(&self, client_id: &str) {
        let row = serde_json::from_value(json!([0, "p-9", {}, {"client_id": client_id}, []])).unwrap();
        self.queue.lock().unwrap().queue_running = vec![row];
    }

    fn touch(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ComfyService for FakeService {
    async fn health_check(&self) -> Result<bool, ComfyUIApiError> {
        self.touch();
        Ok(true)
    }

    async fn queue_prompt(&self, workflow: &Value, client_id: &str) -> Result<SubmitResponse, ComfyUIApiError> {
        self.touch();
        self.submitted
            .lock()
            .unwrap()
            .push((workflow.clone(), client_id.to_string()));
        Ok(SubmitResponse {
            prompt_id: PROMPT_ID.to_string(),
            number: 1,
        })
    }

    async fn get_history(&self, _prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        self.touch();
        Ok(self.history.lock().unwrap().clone())
    }

    async fn get_queue(&self) -> Result<QueueState, ComfyUIApiError> {
        self.touch();
        self.queue_calls.fetch_add(1, Ordering::SeqCst);
        if self.queue_unreachable.load(Ordering::SeqCst) {
            return Err(api_error());
        }
        Ok(self.queue.lock().unwrap().clone())
    }

    async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        self.touch();
        self.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_registered_nodes(&self) -> Result<HashSet<String>, ComfyUIApiError> {
        self.touch();
        Ok(self.registered.lock().unwrap().clone())
    }

    async fn get_custom_node_list(&self) -> Result<Vec<CustomNodeEntry>, ComfyUIApiError> {
        self.touch();
        Ok(self.catalog.lock().unwrap().clone())
    }

    async fn get_node_mappings(&self) -> Result<NodeMappings, ComfyUIApiError> {
        self.touch();
        Ok(self.mappings.clone())
    }

    /// Marks the entry installed and registers the class types it maps to.
    async fn install_custom_node(&self, entry: &CustomNodeEntry) -> Result<(), ComfyUIApiError> {
        self.touch();
        self.installs.lock().unwrap().push(entry.reference.clone());
        for known in self.catalog.lock().unwrap().iter_mut() {
            if known.reference == entry.reference {
                known.installed = json!("True");
            }
        }
        if let Some(names) = entry.primary_file().and_then(|url| self.mappings.0.get(url)) {
            self.registered.lock().unwrap().extend(names.iter().cloned());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Event stream
// ---------------------------------------------------------------------------

/// Replays scripted frames to every connection, then stays open.
#[derive(Default)]
pub struct FakeConnector {
    pub frames: Mutex<Vec<Message>>,
    pub connected: Mutex<Vec<String>>,
}

impl FakeConnector {
    /// Frames that complete [`PROMPT_ID`].
    pub fn completing() -> Self {
        Self {
            frames: Mutex::new(vec![
                Message::Binary(vec![0, 1, 2]),
                Message::Text(
                    json!({"type": "executing", "data": {"node": "1", "prompt_id": PROMPT_ID}}).to_string(),
                ),
                Message::Text(
                    json!({"type": "executing", "data": {"node": null, "prompt_id": PROMPT_ID}}).to_string(),
                ),
            ]),
            connected: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventConnector for FakeConnector {
    async fn connect(&self, client_id: &str) -> Result<EventStream, ComfyUIClientError> {
        self.connected.lock().unwrap().push(client_id.to_string());
        let frames = self.frames.lock().unwrap().clone();
        Ok(futures::stream::iter(frames.into_iter().map(Ok))
            .chain(futures::stream::pending())
            .boxed())
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProcess {
    pub running: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// Simulates a foreign process on the port.
    pub blocked: AtomicBool,
}

impl FakeProcess {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceProcess for FakeProcess {
    fn state(&self) -> ServiceProcessState {
        if self.blocked.load(Ordering::SeqCst) {
            ServiceProcessState::Blocked
        } else if self.running.load(Ordering::SeqCst) {
            ServiceProcessState::Running
        } else {
            ServiceProcessState::Stopped
        }
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) || self.blocked.load(Ordering::SeqCst)
    }

    async fn ensure_running(&self) -> Result<(), ProcessError> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(ProcessError::PortBlocked { port: 8188 });
        }
        if !self.running.swap(true, Ordering::SeqCst) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ProcessError> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeBootstrap {
    pub revisions: Mutex<Vec<Option<String>>>,
    pub fail_checkout: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ServiceBootstrap for FakeBootstrap {
    async fn ensure_repository(&self, revision: Option<&str>) -> Result<(), BootstrapError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.revisions.lock().unwrap().push(revision.map(str::to_string));
        if self.fail_checkout.load(Ordering::SeqCst) {
            return Err(BootstrapError::Checkout {
                revision: revision.unwrap_or_default().to_string(),
                detail: "unknown revision".into(),
            });
        }
        Ok(())
    }

    async fn ensure_manager(&self) -> Result<(), BootstrapError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn install_requirements(&self) -> Result<(), BootstrapError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File acquisition
// ---------------------------------------------------------------------------

/// "Downloads" by writing a placeholder file under the model root.
pub struct FakeAcquisition {
    pub model_root: PathBuf,
    /// Names resolvable through `download_by_name`, placed in `checkpoints/`.
    pub known: Vec<String>,
    pub by_name: Mutex<Vec<String>>,
    pub by_url: Mutex<Vec<String>>,
}

impl FakeAcquisition {
    pub fn new(model_root: &Path, known: &[&str]) -> Self {
        Self {
            model_root: model_root.to_path_buf(),
            known: known.iter().map(|s| s.to_string()).collect(),
            by_name: Mutex::new(Vec::new()),
            by_url: Mutex::new(Vec::new()),
        }
    }

    fn place(&self, dest: &str, filename: &str) -> DownloadOutcome {
        let dir = self.model_root.join(dest);
        std::fs::create_dir_all(&dir).unwrap();
        let target = dir.join(filename);
        if target.exists() {
            return DownloadOutcome::AlreadyPresent;
        }
        std::fs::write(target, b"weights").unwrap();
        DownloadOutcome::NewDownload
    }
}

#[async_trait]
impl FileAcquisition for FakeAcquisition {
    async fn download_by_name(&self, name: &str) -> Result<DownloadOutcome, DownloadError> {
        self.by_name.lock().unwrap().push(name.to_string());
        if self.known.iter().any(|k| k == name) {
            return Ok(self.place("checkpoints", name));
        }
        Ok(DownloadOutcome::NotFound {
            similar: self.known.clone(),
        })
    }

    async fn download_by_url(&self, source: &ModelSource) -> Result<DownloadOutcome, DownloadError> {
        self.by_url.lock().unwrap().push(source.url.clone());
        Ok(self.place(&source.dest, &source.filename))
    }
}

// ---------------------------------------------------------------------------
// Pinned installer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakePinned {
    pub installs: Mutex<Vec<(String, String)>>,
    pub fail: AtomicBool,
}

#[async_trait]
impl PinnedNodeInstaller for FakePinned {
    async fn install(&self, url: &str, commit_hash: &str) -> Result<(), InstallError> {
        self.installs
            .lock()
            .unwrap()
            .push((url.to_string(), commit_hash.to_string()));
        if self.fail.load(Ordering::SeqCst) {
            return Err(InstallError::InvalidUrl(url.to_string()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A pipeline wired to fakes over a temporary service checkout.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: RunnerConfig,
    pub service: Arc<FakeService>,
    pub connector: Arc<FakeConnector>,
    pub process: Arc<FakeProcess>,
    pub bootstrap: Arc<FakeBootstrap>,
    pub acquisition: Arc<FakeAcquisition>,
    pub pinned: Arc<FakePinned>,
}

impl Harness {
    pub fn new(service: FakeService, known_models: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = RunnerConfig {
            base_path: dir.path().join("ComfyUI"),
            log_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        std::fs::create_dir_all(config.model_dir()).unwrap();
        std::fs::create_dir_all(config.output_dir()).unwrap();

        Self {
            acquisition: Arc::new(FakeAcquisition::new(&config.model_dir(), known_models)),
            service: Arc::new(service),
            connector: Arc::new(FakeConnector::completing()),
            process: Arc::new(FakeProcess::default()),
            bootstrap: Arc::new(FakeBootstrap::default()),
            pinned: Arc::new(FakePinned::default()),
            config,
            dir,
        }
    }

    pub fn pipeline(&self) -> ExecutionPipeline {
        ExecutionPipeline::new(
            self.config.clone(),
            PipelineParts {
                service: self.service.clone(),
                connector: self.connector.clone(),
                process: self.process.clone(),
                bootstrap: self.bootstrap.clone(),
                pinned: self.pinned.clone(),
                downloader: self.acquisition.clone(),
            },
        )
    }

    pub fn output_folder(&self) -> PathBuf {
        self.dir.path().join("results")
    }

    pub fn touch_model(&self, rel: &str) {
        let path = self.config.model_dir().join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"weights").unwrap();
    }
}
