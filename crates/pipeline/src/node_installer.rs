//! Installing a custom node at an exact commit.
//!
//! The manager's generic installer always takes the latest revision, so
//! sources pinned to a commit are cloned and checked out directly.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::command::{run_tool, CommandError, DEFAULT_TOOL_TIMEOUT};

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Cannot derive a folder name from {0}")]
    InvalidUrl(String),

    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        source: CommandError,
    },
}

/// Installs a custom node repository at a pinned commit.
#[async_trait]
pub trait PinnedNodeInstaller: Send + Sync {
    async fn install(&self, url: &str, commit_hash: &str) -> Result<(), InstallError>;
}

/// Folder name a repository URL clones into: the last path segment
/// without a `.git` suffix.
pub fn repo_dir_name(url: &str) -> Option<&str> {
    let name = url.trim_end_matches('/').rsplit('/').next()?;
    let name = name.strip_suffix(".git").unwrap_or(name);
    (!name.is_empty() && !name.contains(':')).then_some(name)
}

/// [`PinnedNodeInstaller`] backed by the `git` CLI.
pub struct GitNodeInstaller {
    custom_nodes_dir: PathBuf,
    python: String,
    timeout: Duration,
}

impl GitNodeInstaller {
    pub fn new(custom_nodes_dir: PathBuf, python: String) -> Self {
        Self {
            custom_nodes_dir,
            python,
            timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    async fn git(&self, step: &'static str, args: &[&OsStr], cwd: Option<&Path>) -> Result<(), InstallError> {
        run_tool("git", args, cwd, self.timeout)
            .await
            .map(|_| ())
            .map_err(|source| InstallError::Step { step, source })
    }
}

#[async_trait]
impl PinnedNodeInstaller for GitNodeInstaller {
    async fn install(&self, url: &str, commit_hash: &str) -> Result<(), InstallError> {
        let name = repo_dir_name(url).ok_or_else(|| InstallError::InvalidUrl(url.to_string()))?;
        let dest = self.custom_nodes_dir.join(name);

        if dest.exists() {
            self.git("fetch", &[OsStr::new("fetch"), OsStr::new("origin")], Some(dest.as_path()))
                .await?;
        } else {
            tracing::info!(url = %url, dest = %dest.display(), "Cloning custom node");
            self.git(
                "clone",
                &[OsStr::new("clone"), OsStr::new(url), dest.as_os_str()],
                None,
            )
            .await?;
        }

        self.git(
            "checkout",
            &[OsStr::new("checkout"), OsStr::new(commit_hash)],
            Some(dest.as_path()),
        )
        .await?;

        let requirements = dest.join("requirements.txt");
        if requirements.exists() {
            tracing::debug!(node = %name, "Installing custom node requirements");
            run_tool(
                &self.python,
                [
                    OsStr::new("-m"),
                    OsStr::new("pip"),
                    OsStr::new("install"),
                    OsStr::new("-r"),
                    requirements.as_os_str(),
                ],
                Some(dest.as_path()),
                self.timeout,
            )
            .await
            .map_err(|source| InstallError::Step {
                step: "requirements",
                source,
            })?;
        }

        tracing::info!(url = %url, commit = %commit_hash, "Pinned custom node installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn dir_name_from_https_url() {
        assert_eq!(
            repo_dir_name("https://github.com/Kosinkadink/ComfyUI-AnimateDiff-Evolved"),
            Some("ComfyUI-AnimateDiff-Evolved")
        );
    }

    #[test]
    fn dir_name_strips_git_suffix_and_slash() {
        assert_eq!(repo_dir_name("https://host/a/b.git"), Some("b"));
        assert_eq!(repo_dir_name("https://host/a/b/"), Some("b"));
    }

    #[test]
    fn dir_name_rejects_bare_host() {
        assert_eq!(repo_dir_name("https:"), None);
        assert_eq!(repo_dir_name(""), None);
    }

    #[tokio::test]
    async fn invalid_url_fails_before_running_git() {
        let dir = tempfile::tempdir().unwrap();
        let installer = GitNodeInstaller::new(dir.path().to_path_buf(), "python3".into());
        let err = installer.install("", "abc123").await.unwrap_err();
        assert_matches!(err, InstallError::InvalidUrl(_));
    }
}
