//! Artifact locations: publishing build outputs and fetching them for deploys.
//!
//! Artifacts are addressed by URL. Local artifacts use `file://` URLs (a bare
//! absolute path is accepted too); `http(s)` artifacts are downloaded.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use delivery_core::{CommitRef, Id};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(String),
    #[error("unsupported artifact url: {0}")]
    UnsupportedUrl(String),
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("download of {url} returned status {status}")]
    DownloadStatus { url: String, status: u16 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// An artifact available on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArtifact {
    /// Directory containing the artifact; processes run from here.
    pub cwd: PathBuf,
    pub filename: String,
}

impl LocalArtifact {
    pub fn path(&self) -> PathBuf {
        self.cwd.join(&self.filename)
    }

    fn from_path(path: &Path) -> Result<Self> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(ArtifactError::NotFound(path.display().to_string()));
        };
        Ok(Self {
            cwd: parent.to_path_buf(),
            filename: name.to_string_lossy().to_string(),
        })
    }
}

pub fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

/// Local path for a `file://` URL or bare absolute path.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if let Some(rest) = url.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    let path = Path::new(url);
    path.is_absolute().then(|| path.to_path_buf())
}

#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Make the artifact at `url` available locally.
    async fn checkout(&self, url: &str) -> Result<LocalArtifact>;
}

/// Resolves local artifacts in place and downloads remote ones.
#[derive(Debug, Clone)]
pub struct LocalArtifactFetcher {
    download_dir: PathBuf,
    http: reqwest::Client,
}

impl LocalArtifactFetcher {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn download(&self, url: &str) -> Result<LocalArtifact> {
        let name = url
            .split(['?', '#'])
            .next()
            .and_then(|u| u.rsplit('/').next())
            .filter(|n| !n.is_empty())
            .unwrap_or("artifact")
            .to_string();
        let dir = self.download_dir.join("downloads").join(Id::new().to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&name);

        info!(url = %url, path = %path.display(), "downloading artifact");
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(ArtifactError::DownloadStatus {
                url: url.to_string(),
                status: response.status().as_u16(),
            });
        }

        let mut file = tokio::fs::File::create(&path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        Ok(LocalArtifact {
            cwd: dir,
            filename: name,
        })
    }
}

#[async_trait]
impl ArtifactFetcher for LocalArtifactFetcher {
    async fn checkout(&self, url: &str) -> Result<LocalArtifact> {
        if url.starts_with("http://") || url.starts_with("https://") {
            return self.download(url).await;
        }
        let Some(path) = local_path(url) else {
            return Err(ArtifactError::UnsupportedUrl(url.to_string()));
        };
        if !path.exists() {
            return Err(ArtifactError::NotFound(path.display().to_string()));
        }
        debug!(path = %path.display(), "using local artifact");
        LocalArtifact::from_path(&path)
    }
}

/// Copies build outputs into `<artifact_dir>/<owner>/<repo>/<sha>/`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    artifact_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Publish a file and return its URL. Directories are published in place.
    pub async fn store(&self, source: &Path, commit: &CommitRef) -> Result<String> {
        let metadata = tokio::fs::metadata(source)
            .await
            .map_err(|_| ArtifactError::NotFound(source.display().to_string()))?;
        if metadata.is_dir() {
            return Ok(file_url(source));
        }

        let Some(name) = source.file_name() else {
            return Err(ArtifactError::NotFound(source.display().to_string()));
        };
        let dir = self
            .artifact_dir
            .join(&commit.owner)
            .join(&commit.repo)
            .join(&commit.sha);
        tokio::fs::create_dir_all(&dir).await?;
        let target = dir.join(name);
        tokio::fs::copy(source, &target).await?;
        info!(commit = %commit, path = %target.display(), "artifact stored");
        Ok(file_url(&target))
    }
}
