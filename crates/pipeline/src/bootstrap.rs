//! Preparing the service checkout before it can be started.
//!
//! Covers cloning the service repository, pinning it to a revision,
//! adding the manager component under `custom_nodes/` and installing the
//! service's Python requirements.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{run_tool, CommandError, DEFAULT_TOOL_TIMEOUT};
use crate::config::RunnerConfig;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Failed to clone {url}: {source}")]
    Clone { url: String, source: CommandError },

    #[error("Checkout of {revision} failed: {detail}")]
    Checkout { revision: String, detail: String },

    #[error("Failed to install service requirements: {0}")]
    Requirements(CommandError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Environment preparation steps run before the service starts.
#[async_trait]
pub trait ServiceBootstrap: Send + Sync {
    /// Clone the service when missing, then move it to `revision` if one
    /// is given and differs from the current `HEAD`.
    async fn ensure_repository(&self, revision: Option<&str>) -> Result<(), BootstrapError>;

    /// Clone the manager component when missing.
    async fn ensure_manager(&self) -> Result<(), BootstrapError>;

    /// `pip install -r requirements.txt` for the service.
    async fn install_requirements(&self) -> Result<(), BootstrapError>;
}

/// [`ServiceBootstrap`] backed by the `git` CLI and the configured Python.
pub struct GitBootstrap {
    base_path: PathBuf,
    manager_dir: PathBuf,
    requirements_file: PathBuf,
    repo_url: String,
    manager_url: String,
    python: String,
    timeout: Duration,
}

impl GitBootstrap {
    pub fn new(config: &RunnerConfig) -> Self {
        Self {
            base_path: config.base_path.clone(),
            manager_dir: config.manager_dir(),
            requirements_file: config.requirements_file(),
            repo_url: config.repo_url.clone(),
            manager_url: config.manager_url.clone(),
            python: config.python.clone(),
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn clone_repo(&self, url: &str, dest: &Path) -> Result<(), BootstrapError> {
        tracing::info!(url = %url, dest = %dest.display(), "Cloning repository");
        run_tool(
            "git",
            [OsStr::new("clone"), OsStr::new(url), dest.as_os_str()],
            None,
            self.timeout,
        )
        .await
        .map(|_| ())
        .map_err(|source| BootstrapError::Clone {
            url: url.to_string(),
            source,
        })
    }
}

#[async_trait]
impl ServiceBootstrap for GitBootstrap {
    async fn ensure_repository(&self, revision: Option<&str>) -> Result<(), BootstrapError> {
        if !self.base_path.exists() {
            self.clone_repo(&self.repo_url, &self.base_path).await?;
        }

        let Some(revision) = revision else {
            return Ok(());
        };

        let checkout_err = |e: CommandError| BootstrapError::Checkout {
            revision: revision.to_string(),
            detail: e.to_string(),
        };

        let head = run_tool("git", ["rev-parse", "HEAD"], Some(self.base_path.as_path()), self.timeout)
            .await
            .map_err(checkout_err)?;

        if head == revision {
            tracing::debug!(revision = %revision, "Service already at requested revision");
            return Ok(());
        }

        tracing::info!(from = %head, to = %revision, "Moving service to revision");
        run_tool("git", ["checkout", revision], Some(self.base_path.as_path()), self.timeout)
            .await
            .map_err(checkout_err)?;
        Ok(())
    }

    async fn ensure_manager(&self) -> Result<(), BootstrapError> {
        if self.manager_dir.exists() {
            return Ok(());
        }
        if let Some(parent) = self.manager_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        self.clone_repo(&self.manager_url, &self.manager_dir).await
    }

    async fn install_requirements(&self) -> Result<(), BootstrapError> {
        tracing::debug!("Checking service requirements, please wait...");
        run_tool(
            &self.python,
            [
                OsStr::new("-m"),
                OsStr::new("pip"),
                OsStr::new("install"),
                OsStr::new("-r"),
                self.requirements_file.as_os_str(),
            ],
            Some(self.base_path.as_path()),
            self.timeout,
        )
        .await
        .map(|_| ())
        .map_err(BootstrapError::Requirements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn bootstrap_in(dir: &Path, python: &str) -> GitBootstrap {
        let config = RunnerConfig {
            base_path: dir.to_path_buf(),
            python: python.to_string(),
            ..Default::default()
        };
        GitBootstrap::new(&config).with_timeout(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn existing_checkout_without_revision_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let bootstrap = bootstrap_in(dir.path(), "python3");
        bootstrap.ensure_repository(None).await.unwrap();
    }

    #[tokio::test]
    async fn existing_manager_is_not_recloned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("custom_nodes/ComfyUI-Manager")).unwrap();
        let bootstrap = bootstrap_in(dir.path(), "python3");
        bootstrap.ensure_manager().await.unwrap();
    }

    #[tokio::test]
    async fn failing_pip_is_requirements_error() {
        let dir = tempfile::tempdir().unwrap();
        // `false` ignores its arguments and exits 1.
        let bootstrap = bootstrap_in(dir.path(), "false");
        let err = bootstrap.install_requirements().await.unwrap_err();
        assert_matches!(err, BootstrapError::Requirements(CommandError::Failed { .. }));
    }
}
