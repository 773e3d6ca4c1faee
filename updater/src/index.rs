//! Remote release index client
//!
//! The index is a git-tree listing (GitHub `git/trees` API shape); every blob
//! whose file name parses as `<base>-<build>.<ext>` is a published server build.

use serde::Deserialize;

use crate::error::UpdaterError;
use crate::version::RemoteArtifact;

/// Git tree response (필요한 필드만)
#[derive(Debug, Clone, Deserialize)]
pub struct GitTree {
    pub tree: Vec<TreeEntry>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl GitTree {
    /// Published builds, in listing order. Directories and unparseable names
    /// are skipped.
    pub fn artifacts(&self) -> Vec<RemoteArtifact> {
        self.tree
            .iter()
            .filter(|e| e.kind == "blob")
            .filter_map(|e| RemoteArtifact::parse_file_name(&e.path))
            .collect()
    }
}

/// HTTP client for the release index.
pub struct ReleaseIndexClient {
    http: reqwest::Client,
    index_url: String,
}

impl ReleaseIndexClient {
    pub fn new(http: reqwest::Client, index_url: &str) -> Self {
        Self {
            http,
            index_url: index_url.trim().to_string(),
        }
    }

    /// Fetch and parse the index once. Idempotent; callers may retry.
    pub async fn fetch_index(&self) -> Result<Vec<RemoteArtifact>, UpdaterError> {
        tracing::debug!("Fetching release index from {}", self.index_url);

        let response = self.http
            .get(&self.index_url)
            .header("Accept", "application/vnd.github+json")
            .timeout(std::time::Duration::from_secs(crate::HTTP_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| UpdaterError::from_reqwest(&e, "fetch release index"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(UpdaterError::ApiError {
                status_code: status.as_u16(),
                message: body,
            });
        }

        let body = response.text()
            .await
            .map_err(|e| UpdaterError::from_reqwest(&e, "read release index"))?;
        let tree: GitTree = serde_json::from_str(&body)
            .map_err(|e| UpdaterError::InvalidIndex { message: e.to_string() })?;

        if tree.truncated {
            tracing::warn!("Release index listing is truncated; older builds may be missing");
        }

        let artifacts = tree.artifacts();
        tracing::info!("Release index lists {} server builds", artifacts.len());
        Ok(artifacts)
    }
}
