//! Artifact cache: downloads a server build exactly once.
//!
//! A file at `<cache_dir>/<name>` is proof of a completed download: bytes are
//! streamed into `<cache_dir>/.partial/<name>.<uuid>.part` and renamed into
//! place only after the stream finished and was synced. Readers checking for
//! existence never observe a half-written archive.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use crate::error::UpdaterError;
use crate::version::RemoteArtifact;

const SCRATCH_DIR: &str = ".partial";

/// Longest wait for the response head or the next body chunk.
pub const READ_TIMEOUT_SECS: u64 = 30;

/// Cumulative download progress. Advisory only.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DownloadProgress {
    pub artifact: String,
    pub downloaded_bytes: u64,
    pub total_bytes: Option<u64>,
}

pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

pub struct ArtifactFetcher {
    http: reqwest::Client,
    cache_dir: PathBuf,
    download_base_url: String,
    progress: Option<ProgressCallback>,
    read_timeout: Duration,
}

impl ArtifactFetcher {
    pub fn new(http: reqwest::Client, cache_dir: PathBuf, download_base_url: &str) -> Self {
        Self {
            http,
            cache_dir,
            download_base_url: download_base_url.trim().trim_end_matches('/').to_string(),
            progress: None,
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
        }
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn cached_path(&self, artifact: &RemoteArtifact) -> PathBuf {
        self.cache_dir.join(artifact.file_name())
    }

    pub fn download_url(&self, artifact: &RemoteArtifact) -> String {
        format!("{}/{}", self.download_base_url, artifact.file_name())
    }

    /// Return the cached path for `artifact`, downloading it first if absent.
    pub async fn ensure_cached(&self, artifact: &RemoteArtifact) -> Result<PathBuf, UpdaterError> {
        let final_path = self.cached_path(artifact);
        if is_file(&final_path).await {
            tracing::debug!("{} already cached at {}", artifact, final_path.display());
            return Ok(final_path);
        }

        let scratch = self.cache_dir.join(SCRATCH_DIR);
        tokio::fs::create_dir_all(&scratch)
            .await
            .map_err(|e| UpdaterError::from_io(&e, "create cache directory", &scratch))?;

        let temp_path = scratch.join(format!(
            "{}.{}.part",
            artifact.file_name(),
            uuid::Uuid::new_v4().simple()
        ));
        let url = self.download_url(artifact);
        tracing::info!("Downloading server build {} from {}", artifact, url);

        let downloaded = match self.download_to(artifact, &url, &temp_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                // 임시 파일만 정리, 최종 경로는 건드리지 않음
                if let Err(rm) = tokio::fs::remove_file(&temp_path).await {
                    if rm.kind() != std::io::ErrorKind::NotFound {
                        tracing::debug!("Could not remove {}: {}", temp_path.display(), rm);
                    }
                }
                return Err(e);
            }
        };

        if let Err(e) = tokio::fs::rename(&temp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            // 다른 프로세스가 먼저 같은 빌드를 완성했으면 그걸 사용
            if is_file(&final_path).await {
                tracing::debug!("{} was cached concurrently", artifact);
                return Ok(final_path);
            }
            return Err(UpdaterError::from_io(&e, "rename downloaded artifact", &final_path));
        }

        tracing::info!("Cached {} ({} bytes) at {}", artifact, downloaded, final_path.display());
        Ok(final_path)
    }

    async fn download_to(
        &self,
        artifact: &RemoteArtifact,
        url: &str,
        temp_path: &Path,
    ) -> Result<u64, UpdaterError> {
        let name = artifact.file_name();
        let response = tokio::time::timeout(self.read_timeout, self.http.get(url).send())
            .await
            .map_err(|_| self.stalled())?
            .map_err(|e| UpdaterError::from_reqwest(&e, "download artifact"))?;

        if !response.status().is_success() {
            return Err(UpdaterError::ApiError {
                status_code: response.status().as_u16(),
                message: format!("download of {} failed", name),
            });
        }

        let total = response.content_length();
        let mut file = tokio::fs::File::create(temp_path)
            .await
            .map_err(|e| UpdaterError::from_io(&e, "create temp file", temp_path))?;

        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(self.read_timeout, stream.next()).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!("Download of {} stalled after {} bytes", name, downloaded);
                    return Err(self.stalled());
                }
            };
            let chunk = chunk.map_err(|e| {
                tracing::warn!("Download of {} broke off after {} bytes: {}", name, downloaded, e);
                UpdaterError::DownloadInterrupted {
                    artifact: name.clone(),
                    downloaded_bytes: downloaded,
                    total_bytes: total,
                }
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|e| UpdaterError::from_io(&e, "write temp file", temp_path))?;
            downloaded += chunk.len() as u64;
            self.report(&name, downloaded, total);
        }

        if let Some(expected) = total {
            if downloaded < expected {
                return Err(UpdaterError::DownloadInterrupted {
                    artifact: name,
                    downloaded_bytes: downloaded,
                    total_bytes: total,
                });
            }
        }

        file.flush()
            .await
            .map_err(|e| UpdaterError::from_io(&e, "flush temp file", temp_path))?;
        file.sync_all()
            .await
            .map_err(|e| UpdaterError::from_io(&e, "sync temp file", temp_path))?;

        Ok(downloaded)
    }

    fn stalled(&self) -> UpdaterError {
        UpdaterError::Timeout {
            operation: "download artifact".to_string(),
            duration_secs: self.read_timeout.as_secs(),
        }
    }

    fn report(&self, name: &str, downloaded: u64, total: Option<u64>) {
        if let Some(ref cb) = self.progress {
            cb(DownloadProgress {
                artifact: name.to_string(),
                downloaded_bytes: downloaded,
                total_bytes: total,
            });
        }
    }

    /// Completed builds present in the cache, sorted by file name.
    pub async fn cached_artifacts(&self) -> Result<Vec<RemoteArtifact>, UpdaterError> {
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(UpdaterError::from_io(&e, "list cache directory", &self.cache_dir)),
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| UpdaterError::from_io(&e, "list cache directory", &self.cache_dir))?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            if let Some(artifact) = entry.file_name().to_str().and_then(RemoteArtifact::parse_file_name) {
                found.push(artifact);
            }
        }
        found.sort_by_key(|a| a.file_name());
        Ok(found)
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}
