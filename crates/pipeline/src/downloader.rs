//! Fetching model files by catalog name or explicit URL.
//!
//! Downloads stream into `<dest>/<filename>.part` and are renamed into
//! place only once complete (and, when a checksum is known, verified),
//! so an interrupted transfer never leaves a file that passes the
//! by-name presence check.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use comfyrun_core::hashing::sha256_file;
use comfyrun_core::similarity::{rank_similar, DEFAULT_SUGGESTION_LIMIT};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

/// Suffix of in-flight downloads.
pub const PARTIAL_SUFFIX: &str = ".part";

/// A downloadable model: where it comes from and where it goes.
///
/// `dest` is a directory; relative values are taken from the model root.
/// Catalog files may spell it `save_path`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    pub filename: String,
    pub url: String,
    #[serde(alias = "save_path", default)]
    pub dest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    AlreadyPresent,
    NewDownload,
    /// No source known; `similar` lists catalog names that look close.
    NotFound { similar: Vec<String> },
}

impl DownloadOutcome {
    pub fn is_found(&self) -> bool {
        !matches!(self, Self::NotFound { .. })
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::NewDownload)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Download of {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("Checksum mismatch for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("Invalid model catalog {path}: {detail}")]
    Catalog { path: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Acquires model files for the resolver.
#[async_trait]
pub trait FileAcquisition: Send + Sync {
    /// Look `name` up in the known sources and fetch it.
    async fn download_by_name(&self, name: &str) -> Result<DownloadOutcome, DownloadError>;

    /// Fetch an explicitly described file.
    async fn download_by_url(&self, source: &ModelSource) -> Result<DownloadOutcome, DownloadError>;
}

// ---------------------------------------------------------------------------
// Catalog parsing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum CatalogFile {
    List(Vec<ModelSource>),
    Wrapped { models: Vec<ModelSource> },
}

/// Parse a model catalog: either a bare array or `{"models": [...]}`.
pub fn parse_catalog(json: &str) -> Result<Vec<ModelSource>, serde_json::Error> {
    Ok(match serde_json::from_str::<CatalogFile>(json)? {
        CatalogFile::List(models) | CatalogFile::Wrapped { models } => models,
    })
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

/// HTTP-backed [`FileAcquisition`] over a name -> source catalog.
pub struct ModelDownloader {
    client: reqwest::Client,
    model_root: PathBuf,
    catalog: Vec<ModelSource>,
}

impl ModelDownloader {
    pub fn new(client: reqwest::Client, model_root: PathBuf, catalog: Vec<ModelSource>) -> Self {
        Self {
            client,
            model_root,
            catalog,
        }
    }

    /// Build from catalog files on disk. Unreadable files are skipped
    /// with a warning; malformed ones are an error.
    pub async fn from_catalog_files(
        client: reqwest::Client,
        model_root: PathBuf,
        paths: &[PathBuf],
    ) -> Result<Self, DownloadError> {
        let mut catalog = Vec::new();
        for path in paths {
            let json = match tokio::fs::read_to_string(path).await {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable model catalog");
                    continue;
                }
            };
            let models = parse_catalog(&json).map_err(|e| DownloadError::Catalog {
                path: path.display().to_string(),
                detail: e.to_string(),
            })?;
            tracing::debug!(path = %path.display(), count = models.len(), "Loaded model catalog");
            catalog.extend(models);
        }
        Ok(Self::new(client, model_root, catalog))
    }

    pub fn catalog(&self) -> &[ModelSource] {
        &self.catalog
    }

    fn dest_dir(&self, dest: &str) -> PathBuf {
        let dest = Path::new(dest);
        if dest.is_absolute() {
            dest.to_path_buf()
        } else {
            self.model_root.join(dest)
        }
    }

    async fn fetch(&self, source: &ModelSource) -> Result<DownloadOutcome, DownloadError> {
        let dir = self.dest_dir(&source.dest);
        let target = dir.join(&source.filename);
        if tokio::fs::try_exists(&target).await? {
            tracing::debug!(model = %source.filename, "Model already present");
            return Ok(DownloadOutcome::AlreadyPresent);
        }

        tracing::info!(model = %source.filename, url = %source.url, "Downloading model");
        let mut response = self.client.get(&source.url).send().await?;
        if !response.status().is_success() {
            return Err(DownloadError::Status {
                url: source.url.clone(),
                status: response.status().as_u16(),
            });
        }

        tokio::fs::create_dir_all(&dir).await?;
        let partial = dir.join(format!("{}{PARTIAL_SUFFIX}", source.filename));
        let written = match stream_to_file(&mut response, &partial).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };

        if let Some(expected) = &source.sha256 {
            let actual = sha256_file(&partial).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(DownloadError::ChecksumMismatch {
                    filename: source.filename.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        tokio::fs::rename(&partial, &target).await?;
        tracing::info!(model = %source.filename, bytes = written, "Model downloaded");
        Ok(DownloadOutcome::NewDownload)
    }
}

#[async_trait]
impl FileAcquisition for ModelDownloader {
    async fn download_by_name(&self, name: &str) -> Result<DownloadOutcome, DownloadError> {
        let Some(source) = self.catalog.iter().find(|m| m.filename == name) else {
            let similar = rank_similar(
                name,
                self.catalog.iter().map(|m| m.filename.as_str()),
                DEFAULT_SUGGESTION_LIMIT,
            );
            return Ok(DownloadOutcome::NotFound { similar });
        };
        self.fetch(source).await
    }

    async fn download_by_url(&self, source: &ModelSource) -> Result<DownloadOutcome, DownloadError> {
        self.fetch(source).await
    }
}

/// Write the response body to `path`, returning the byte count.
async fn stream_to_file(response: &mut reqwest::Response, path: &Path) -> Result<u64, DownloadError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
