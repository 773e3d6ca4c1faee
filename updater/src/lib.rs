//! # processing-ls 업데이터 라이브러리
//!
//! Picks the language-server build that matches an installed Processing
//! version and keeps a local cache of downloaded builds.
//!
//! ## 동작 원리
//! 1. **version**: 호스트 버전 파싱, `<base>-<build>.<ext>` 파일명 파싱, 호환성 판정
//! 2. **index**: 원격 릴리즈 인덱스(git tree 목록) 조회
//! 3. **fetcher**: 캐시에 없을 때만 다운로드 (임시 파일 → rename)
//!
//! A build is compatible when its base version is a dotted prefix of the host
//! version; among compatible builds the highest build number wins.

pub mod error;
pub mod fetcher;
pub mod index;
pub mod version;

pub use error::UpdaterError;
pub use fetcher::{ArtifactFetcher, DownloadProgress, ProgressCallback};
pub use index::ReleaseIndexClient;
pub use version::{resolve_compatible_build, HostVersion, RemoteArtifact, MIN_SUPPORTED};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Per-request timeout for the index listing.
pub const HTTP_TIMEOUT_SECS: u64 = 30;

const CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DEFAULT_INDEX_URL: &str =
    "https://api.github.com/repos/kgtkr/processing-language-server-builds/git/trees/main?recursive=1";

pub const DEFAULT_DOWNLOAD_BASE_URL: &str =
    "https://raw.githubusercontent.com/kgtkr/processing-language-server-builds/main";

// ══════════════════════════════════════════════════════
// 설정
// ══════════════════════════════════════════════════════

/// `[update]` table of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateSettings {
    /// Listing endpoint returning the git tree of published builds
    #[serde(alias = "indexUrl")]
    pub index_url: String,
    /// Raw-content base; the artifact file name is appended
    #[serde(alias = "downloadBaseUrl")]
    pub download_base_url: String,
    /// 다운로드 캐시 디렉터리 (None이면 플랫폼 기본 경로)
    #[serde(alias = "cacheDir")]
    pub cache_dir: Option<PathBuf>,
    /// Extra attempts for recoverable index failures
    #[serde(alias = "indexRetries")]
    pub index_retries: u32,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            index_url: DEFAULT_INDEX_URL.to_string(),
            download_base_url: DEFAULT_DOWNLOAD_BASE_URL.to_string(),
            cache_dir: None,
            index_retries: 2,
        }
    }
}

impl UpdateSettings {
    pub fn effective_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(default_cache_dir)
    }
}

/// `%LOCALAPPDATA%/processing-ls/artifacts` on Windows,
/// `$HOME/.cache/processing-ls/artifacts` elsewhere, `./artifacts` as fallback.
pub fn default_cache_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("LOCALAPPDATA")
            .or_else(|_| std::env::var("APPDATA"))
            .map(|base| PathBuf::from(base).join("processing-ls").join("artifacts"))
            .unwrap_or_else(|_| PathBuf::from("./artifacts"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".cache").join("processing-ls").join("artifacts"))
            .unwrap_or_else(|_| PathBuf::from("./artifacts"))
    }
}

fn http_client() -> Result<reqwest::Client, UpdaterError> {
    reqwest::Client::builder()
        .user_agent(concat!("processing-ls/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .build()
        .map_err(|e| UpdaterError::NetworkError {
            message: format!("failed to create HTTP client: {}", e),
            recoverable: false,
        })
}

// ══════════════════════════════════════════════════════
// Updater
// ══════════════════════════════════════════════════════

/// Index client and artifact cache sharing one HTTP client.
pub struct Updater {
    index: ReleaseIndexClient,
    fetcher: ArtifactFetcher,
    index_retries: u32,
}

impl Updater {
    pub fn new(settings: &UpdateSettings) -> Result<Self, UpdaterError> {
        let http = http_client()?;
        Ok(Self {
            index: ReleaseIndexClient::new(http.clone(), &settings.index_url),
            fetcher: ArtifactFetcher::new(
                http,
                settings.effective_cache_dir(),
                &settings.download_base_url,
            ),
            index_retries: settings.index_retries,
        })
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.fetcher = self.fetcher.with_progress(callback);
        self
    }

    /// Override how long a download may stall before it is abandoned.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.fetcher = self.fetcher.with_read_timeout(timeout);
        self
    }

    /// Fetch the index, retrying recoverable failures with backoff.
    pub async fn fetch_index(&self) -> Result<Vec<RemoteArtifact>, UpdaterError> {
        let mut attempt = 0;
        loop {
            match self.index.fetch_index().await {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_recoverable() && attempt < self.index_retries => {
                    let delay = e.retry_delay(attempt);
                    tracing::warn!(
                        "Release index fetch failed ({}), retrying in {:?} ({}/{})",
                        e, delay, attempt + 1, self.index_retries
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Newest remote build compatible with `host`, or `None` when the index
    /// has nothing for this host.
    pub async fn resolve(&self, host: &HostVersion) -> Result<Option<RemoteArtifact>, UpdaterError> {
        let entries = self.fetch_index().await?;
        let picked = resolve_compatible_build(host, &entries);
        match &picked {
            Some(a) => tracing::info!("Host {} → server build {}", host, a),
            None => tracing::warn!("No server build in the index matches host {}", host),
        }
        Ok(picked)
    }

    pub async fn ensure_cached(&self, artifact: &RemoteArtifact) -> Result<PathBuf, UpdaterError> {
        self.fetcher.ensure_cached(artifact).await
    }

    /// Newest already-downloaded build compatible with `host`.
    pub async fn newest_cached(
        &self,
        host: &HostVersion,
    ) -> Result<Option<(RemoteArtifact, PathBuf)>, UpdaterError> {
        let cached = self.fetcher.cached_artifacts().await?;
        Ok(resolve_compatible_build(host, &cached).map(|a| {
            let path = self.fetcher.cached_path(&a);
            (a, path)
        }))
    }
}
