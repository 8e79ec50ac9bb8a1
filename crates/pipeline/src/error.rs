use std::time::Duration;

use comfyrun_comfyui::api::ComfyUIApiError;
use comfyrun_comfyui::processor::WaitError;
use comfyrun_core::error::CoreError;

use crate::bootstrap::BootstrapError;
use crate::downloader::DownloadError;
use crate::model_resolver::MissingModel;
use crate::process::ProcessError;

/// Why a pipeline call stopped short of a result.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The input was not an executable API-format graph. Nothing ran.
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Something owns the service port but does not answer as the service.
    #[error("Port {port} blocked")]
    PortBlocked { port: u16 },

    /// The service checkout could not be moved to the requested revision.
    #[error("Unable to checkout service repository: {0}")]
    RepositoryCheckoutFailed(String),

    #[error("Service bootstrap failed: {0}")]
    Bootstrap(BootstrapError),

    #[error("Service process error: {0}")]
    Process(ProcessError),

    /// Only raised under [`crate::nodes::InstallPolicy::FailFast`].
    #[error("Failed to install custom node {node}: {error}")]
    DependencyInstallFailed { node: String, error: String },

    /// Required models are neither local nor fetchable.
    #[error("{} model(s) not found: {}", .0.len(), model_names(.0))]
    ModelsNotFound(Vec<MissingModel>),

    /// The service stopped answering queue requests.
    #[error("Service queue unreachable")]
    QueueUnreachable,

    #[error("Service API error: {0}")]
    Api(#[from] ComfyUIApiError),

    #[error("Could not open the service event stream")]
    EventStreamUnavailable,

    #[error("No history recorded for prompt {0}")]
    HistoryMissing(String),

    #[error("Timed out after {0:?} waiting for the job")]
    Timeout(Duration),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Execution failed: {0}")]
    Execution(WaitError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Failures that stop a run before anything is submitted and leave
    /// nothing to clean up.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidWorkflow(_)
                | Self::PortBlocked { .. }
                | Self::RepositoryCheckoutFailed(_)
                | Self::Bootstrap(_)
                | Self::Process(_)
                | Self::DependencyInstallFailed { .. }
                | Self::ModelsNotFound(_)
        )
    }
}

fn model_names(models: &[MissingModel]) -> String {
    models
        .iter()
        .map(|m| m.model.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<WaitError> for PipelineError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout(d) => Self::Timeout(d),
            WaitError::Cancelled => Self::Cancelled,
            other => Self::Execution(other),
        }
    }
}

impl From<ProcessError> for PipelineError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::PortBlocked { port } => Self::PortBlocked { port },
            other => Self::Process(other),
        }
    }
}

impl From<BootstrapError> for PipelineError {
    fn from(err: BootstrapError) -> Self {
        match err {
            BootstrapError::Checkout { revision, detail } => {
                Self::RepositoryCheckoutFailed(format!("{revision}: {detail}"))
            }
            other => Self::Bootstrap(other),
        }
    }
}

impl From<CoreError> for PipelineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Io(e) => Self::Io(e),
            other => Self::InvalidWorkflow(other.to_string()),
        }
    }
}
