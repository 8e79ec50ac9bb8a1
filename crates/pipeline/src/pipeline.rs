//! The execution pipeline: prepare the service, run one workflow,
//! harvest what it produced.
//!
//! Steps, in order, each terminal on failure:
//!
//! 1. Load the workflow (path or inline JSON) and check it is API format.
//! 2. Bootstrap the service checkout: repository, manager, requirements.
//! 3. Clear stale logs if the service is down, then ensure it is running.
//! 4. Install missing custom nodes, then fetch missing models.
//! 5. Restart the service if anything new was installed or downloaded.
//! 6. Stage input files and rewrite model references.
//! 7. Submit, wait for completion, harvest outputs, clean up.
//!
//! Steps 1-6 are shared with [`ExecutionPipeline::prepare_only`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use comfyrun_comfyui::api::ComfyUIApi;
use comfyrun_comfyui::client::{ws_url_from_http, ComfyUIClient};
use comfyrun_comfyui::events::{RunnerEvent, EVENT_CHANNEL_CAPACITY};
use comfyrun_comfyui::processor::wait_for_completion;
use comfyrun_comfyui::reconnect::{connect_with_retry, ReconnectConfig};
use comfyrun_comfyui::service::{ComfyService, EventConnector};
use comfyrun_core::files::{clear_directory, copy_into, remove_matching};
use comfyrun_core::workflow::Workflow;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{GitBootstrap, ServiceBootstrap};
use crate::cancel::{cancel_generation, CancelPolicy};
use crate::config::{RunnerConfig, LOG_FILE_PREFIX, LOG_FILE_SUFFIX};
use crate::downloader::{FileAcquisition, ModelDownloader, ModelSource};
use crate::error::PipelineError;
use crate::harvest::{collect_outputs, harvest, OutputTagging, RunResult};
use crate::model_resolver::{IgnoredModel, ModelResolver};
use crate::node_installer::{GitNodeInstaller, PinnedNodeInstaller};
use crate::nodes::{ExtraNodeSource, NodeDependencyResolver};
use crate::process::{ProcessSettings, ServiceProcess, ServiceProcessManager, ServiceProcessState};

// ---------------------------------------------------------------------------
// Run options
// ---------------------------------------------------------------------------

/// A file to copy into the service's input directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputFile {
    /// Copied to the top of the input directory.
    Path(PathBuf),
    /// Copied to `input/<dest_folder>/`.
    Staged { filepath: PathBuf, dest_folder: String },
}

/// What happens to the service once a run finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostRunAction {
    #[default]
    KeepRunning,
    StopService,
}

/// Per-call inputs besides the workflow itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub files: Vec<InputFile>,
    pub extra_models: Vec<ModelSource>,
    pub extra_nodes: Vec<ExtraNodeSource>,
    pub ignore_models: Vec<IgnoredModel>,
    pub output_folder: PathBuf,
    /// Only these nodes' outputs are harvested; empty means all.
    #[serde(deserialize_with = "node_ids")]
    pub output_node_ids: Vec<String>,
    /// Correlation tag for the job; a v4 UUID when absent.
    pub client_id: Option<String>,
    /// Service revision to pin the checkout to.
    pub comfy_revision: Option<String>,
    pub post_run: PostRunAction,
    /// Remove service log files after the run once the service is down.
    pub clear_logs: bool,
    pub tagging: OutputTagging,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            extra_models: Vec::new(),
            extra_nodes: Vec::new(),
            ignore_models: Vec::new(),
            output_folder: PathBuf::from("./output"),
            output_node_ids: Vec::new(),
            client_id: None,
            comfy_revision: None,
            post_run: PostRunAction::KeepRunning,
            clear_logs: true,
            tagging: OutputTagging::Plain,
        }
    }
}

/// Node ids may arrive as numbers; history keys are strings.
fn node_ids<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The collaborators a pipeline drives.
pub struct PipelineParts {
    pub service: Arc<dyn ComfyService>,
    pub connector: Arc<dyn EventConnector>,
    pub process: Arc<dyn ServiceProcess>,
    pub bootstrap: Arc<dyn ServiceBootstrap>,
    pub pinned: Arc<dyn PinnedNodeInstaller>,
    pub downloader: Arc<dyn FileAcquisition>,
}

pub struct ExecutionPipeline {
    config: RunnerConfig,
    service: Arc<dyn ComfyService>,
    connector: Arc<dyn EventConnector>,
    process: Arc<dyn ServiceProcess>,
    bootstrap: Arc<dyn ServiceBootstrap>,
    nodes: NodeDependencyResolver,
    models: ModelResolver,
    reconnect: ReconnectConfig,
    cancel_policy: CancelPolicy,
    events: broadcast::Sender<RunnerEvent>,
    shutdown: CancellationToken,
}

impl ExecutionPipeline {
    pub fn new(config: RunnerConfig, parts: PipelineParts) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let nodes = NodeDependencyResolver::new(
            Arc::clone(&parts.service),
            parts.pinned,
            config.custom_nodes_dir(),
            config.install_policy,
            events.clone(),
        );
        let models = ModelResolver::new(
            config.model_dir(),
            config.model_rules.clone(),
            parts.downloader,
            events.clone(),
        );

        Self {
            config,
            service: parts.service,
            connector: parts.connector,
            process: parts.process,
            bootstrap: parts.bootstrap,
            nodes,
            models,
            reconnect: ReconnectConfig::default(),
            cancel_policy: CancelPolicy::default(),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Pipeline over the real HTTP, WebSocket, git and process backends.
    pub async fn from_config(config: RunnerConfig) -> Result<Self, PipelineError> {
        let api_url = config.api_url();
        let http = reqwest::Client::new();
        let service: Arc<dyn ComfyService> =
            Arc::new(ComfyUIApi::with_client(http.clone(), api_url.clone()));
        let downloader = ModelDownloader::from_catalog_files(
            http,
            config.model_dir(),
            &config.model_lists,
        )
        .await?;

        let parts = PipelineParts {
            connector: Arc::new(ComfyUIClient::new(ws_url_from_http(&api_url))),
            process: Arc::new(ServiceProcessManager::new(
                ProcessSettings::from(&config),
                Arc::clone(&service),
            )),
            bootstrap: Arc::new(GitBootstrap::new(&config)),
            pinned: Arc::new(GitNodeInstaller::new(
                config.custom_nodes_dir(),
                config.python.clone(),
            )),
            downloader: Arc::new(downloader),
            service,
        };
        Ok(Self::new(config, parts))
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    pub fn with_unresolved_nodes(mut self, class_types: Vec<String>) -> Self {
        self.nodes = self.nodes.with_unresolved(class_types);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Last service state seen by the process manager.
    pub fn service_state(&self) -> ServiceProcessState {
        self.process.state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// Cancelling this token abandons any in-flight completion wait.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    // -- public entry points -------------------------------------------------

    /// Run a workflow end to end.
    ///
    /// Returns `None` when a precondition fails (invalid workflow, blocked
    /// port, checkout failure, missing models). Any later failure is
    /// logged, cleaned up after and yields an empty result.
    pub async fn run(&self, workflow_input: &str, options: &RunOptions) -> Option<RunResult> {
        let workflow = match self.prepare_for_run(workflow_input, options).await {
            Ok(workflow) => workflow,
            Err(e) if e.is_precondition() => {
                tracing::error!(error = %e, "Run aborted");
                return None;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Error preparing workflow");
                return Some(RunResult::default());
            }
        };

        match self.execute_and_clean_up(&workflow, options).await {
            Ok(result) => Some(result),
            Err(e) => {
                tracing::error!(error = ?e, "Error generating output");
                Some(RunResult::default())
            }
        }
    }

    /// Like [`run`](Self::run) but surfaces the failure.
    pub async fn run_detailed(
        &self,
        workflow_input: &str,
        options: &RunOptions,
    ) -> Result<RunResult, PipelineError> {
        let workflow = self.prepare_for_run(workflow_input, options).await?;
        self.execute_and_clean_up(&workflow, options).await
    }

    /// Every preparatory step without submitting anything. Returns the
    /// workflow with its model references rewritten.
    pub async fn prepare_only(
        &self,
        workflow_input: &str,
        options: &RunOptions,
    ) -> Result<Workflow, PipelineError> {
        let workflow = self.prepare(workflow_input, options).await?;
        tracing::info!(nodes = workflow.len(), "Finished setting up workflow");
        Ok(workflow)
    }

    /// Interrupt the job tagged `client_id`, or the running job when no
    /// tag is given. `true` if an interrupt was sent.
    pub async fn cancel(&self, client_id: Option<&str>) -> bool {
        self.cancel_with_policy(client_id, &self.cancel_policy).await
    }

    pub async fn cancel_within(&self, client_id: Option<&str>, retry_window: Duration) -> bool {
        let policy = self.cancel_policy.clone().with_retry_window(retry_window);
        self.cancel_with_policy(client_id, &policy).await
    }

    async fn cancel_with_policy(&self, client_id: Option<&str>, policy: &CancelPolicy) -> bool {
        match cancel_generation(self.service.as_ref(), client_id, policy, &self.events).await {
            Ok(sent) => sent,
            Err(e) => {
                tracing::error!(client_id = ?client_id, error = %e, "Error stopping the generation");
                false
            }
        }
    }

    // -- preparation ---------------------------------------------------------

    async fn prepare(
        &self,
        workflow_input: &str,
        options: &RunOptions,
    ) -> Result<Workflow, PipelineError> {
        let workflow = self.prepare_service(workflow_input, options).await?;
        self.prepare_dependencies(workflow, options).await
    }

    /// [`prepare`](Self::prepare) for a run that will submit. Once the
    /// service is up, a failure that is not a precondition still gets the
    /// caller's cleanup.
    async fn prepare_for_run(
        &self,
        workflow_input: &str,
        options: &RunOptions,
    ) -> Result<Workflow, PipelineError> {
        let workflow = self.prepare_service(workflow_input, options).await?;
        match self.prepare_dependencies(workflow, options).await {
            Err(e) if !e.is_precondition() => {
                self.clean_up(options).await;
                Err(e)
            }
            prepared => prepared,
        }
    }

    /// Load the workflow, bootstrap the checkout and start the service.
    async fn prepare_service(
        &self,
        workflow_input: &str,
        options: &RunOptions,
    ) -> Result<Workflow, PipelineError> {
        let workflow = Workflow::load(workflow_input)
            .await
            .map_err(|e| PipelineError::InvalidWorkflow(e.to_string()))?;

        tracing::debug!(base_path = %self.config.base_path.display(), "Preparing service checkout");
        self.bootstrap
            .ensure_repository(options.comfy_revision.as_deref())
            .await?;
        self.bootstrap.ensure_manager().await?;
        self.bootstrap.install_requirements().await?;

        if !self.process.is_running().await {
            self.clear_logs().await;
        }
        self.start_service().await?;
        Ok(workflow)
    }

    /// Dependencies, restart, input staging and reference rewrite against
    /// a running service.
    async fn prepare_dependencies(
        &self,
        mut workflow: Workflow,
        options: &RunOptions,
    ) -> Result<Workflow, PipelineError> {
        let node_report = self.nodes.resolve(&workflow, &options.extra_nodes).await?;

        let model_report = self
            .models
            .find_missing_models(&workflow, &options.extra_models, &options.ignore_models)
            .await?;
        if !model_report.is_complete() {
            tracing::info!(
                "Provide download urls for the models listed above or switch the workflow to one of the alternatives"
            );
            return Err(PipelineError::ModelsNotFound(model_report.models_not_found));
        }

        if node_report.nodes_installed || model_report.models_downloaded {
            tracing::info!(
                nodes_installed = node_report.nodes_installed,
                models_downloaded = model_report.models_downloaded,
                "Restarting the server",
            );
            self.stop_service().await?;
            self.start_service().await?;
        }

        self.stage_inputs(&options.files).await?;

        let rewritten = self.models.rewrite_references(&mut workflow).await?;
        tracing::debug!(rewritten, "Model references updated");

        Ok(workflow)
    }

    async fn start_service(&self) -> Result<(), PipelineError> {
        let was_running = self.process.is_running().await;
        tracing::debug!(state = ?self.process.state(), was_running, "Ensuring server is running");
        self.process.ensure_running().await?;
        if !was_running {
            let _ = self.events.send(RunnerEvent::ServerStarted {
                port: self.config.port,
            });
        }
        Ok(())
    }

    async fn stop_service(&self) -> Result<(), PipelineError> {
        self.process.stop().await?;
        let _ = self.events.send(RunnerEvent::ServerStopped {
            port: self.config.port,
        });
        Ok(())
    }

    async fn clear_logs(&self) {
        match remove_matching(self.config.log_dir(), LOG_FILE_PREFIX, LOG_FILE_SUFFIX).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Cleared service logs"),
            Err(e) => tracing::warn!(error = %e, "Failed to clear service logs"),
        }
    }

    /// Replace the input directory's contents with `files`. An empty list
    /// leaves the directory untouched.
    async fn stage_inputs(&self, files: &[InputFile]) -> Result<(), PipelineError> {
        if files.is_empty() {
            return Ok(());
        }
        let input_dir = self.config.input_dir();
        clear_directory(&input_dir).await?;

        for file in files {
            let (src, dest) = match file {
                InputFile::Path(path) => (path, input_dir.clone()),
                InputFile::Staged {
                    filepath,
                    dest_folder,
                } => (filepath, input_dir.join(dest_folder)),
            };
            let staged = copy_into(src, &dest, true).await?;
            tracing::debug!(src = %src.display(), dest = %staged.display(), "Staged input file");
        }
        Ok(())
    }

    // -- execution -----------------------------------------------------------

    async fn execute_and_clean_up(
        &self,
        workflow: &Workflow,
        options: &RunOptions,
    ) -> Result<RunResult, PipelineError> {
        let result = self.execute(workflow, options).await;
        self.clean_up(options).await;
        result
    }

    async fn execute(&self, workflow: &Workflow, options: &RunOptions) -> Result<RunResult, PipelineError> {
        let client_id = options
            .client_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let cancel = self.shutdown.child_token();

        tracing::info!(client_id = %client_id, "Generating output, please wait");
        let mut stream = connect_with_retry(self.connector.as_ref(), &client_id, &self.reconnect, &cancel)
            .await
            .ok_or(PipelineError::EventStreamUnavailable)?;

        let submitted = self
            .service
            .queue_prompt(&workflow.to_value(), &client_id)
            .await?;
        let prompt_id = submitted.prompt_id;
        tracing::info!(prompt_id = %prompt_id, client_id = %client_id, position = submitted.number, "Prompt queued");
        let _ = self.events.send(RunnerEvent::GenerationQueued {
            prompt_id: prompt_id.clone(),
            client_id: client_id.clone(),
        });

        wait_for_completion(
            &mut stream,
            &prompt_id,
            self.config.execution_timeout,
            &cancel,
            &self.events,
        )
        .await?;

        let history = self
            .service
            .get_history(&prompt_id)
            .await?
            .ok_or_else(|| PipelineError::HistoryMissing(prompt_id.clone()))?;

        let outputs = collect_outputs(&history, &options.output_node_ids);
        let result = harvest(
            &outputs,
            &self.config.output_dir(),
            &options.output_folder,
            options.tagging,
        )
        .await?;

        tracing::info!(
            prompt_id = %prompt_id,
            files = result.file_paths.len(),
            texts = result.text_output.len(),
            "Outputs harvested",
        );
        Ok(result)
    }

    async fn clean_up(&self, options: &RunOptions) {
        if options.post_run == PostRunAction::StopService {
            if let Err(e) = self.stop_service().await {
                tracing::error!(error = %e, "Failed to stop the server");
            }
        }
        if options.clear_logs && !self.process.is_running().await {
            self.clear_logs().await;
        }
    }
}
