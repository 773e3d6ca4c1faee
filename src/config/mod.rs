use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use processing_ls_updater::UpdateSettings;
use serde::Deserialize;

use crate::supervisor::ReadinessPolicy;
use crate::transport::TransportKind;

/// One immutable configuration snapshot. A change produces a new value.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Configuration {
    /// Processing 설치 루트
    #[serde(alias = "processingPath")]
    pub processing_path: Option<PathBuf>,

    /// 명시적 서버 아카이브 (설정 시 버전 해석과 다운로드를 건너뜀)
    #[serde(alias = "languageServerPath", deserialize_with = "empty_path_as_none")]
    pub language_server_path: Option<PathBuf>,

    #[serde(alias = "autoUpdate")]
    pub auto_update: bool,

    pub transport: TransportKind,

    #[serde(alias = "readinessTimeoutSecs")]
    pub readiness_timeout_secs: u64,

    #[serde(alias = "readyMarker")]
    pub ready_marker: String,

    pub update: UpdateSettings,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            processing_path: None,
            language_server_path: None,
            auto_update: true,
            transport: TransportKind::default(),
            readiness_timeout_secs: 30,
            ready_marker: "Ready".to_string(),
            update: UpdateSettings::default(),
        }
    }
}

fn empty_path_as_none<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(PathBuf::from))
}

impl Configuration {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        toml::from_str(s).context("invalid configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        Self::from_toml_str(&s)
    }

    pub fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            marker: self.ready_marker.clone(),
            timeout: Duration::from_secs(self.readiness_timeout_secs),
        }
    }
}

/// Watches one config file by content. `poll` yields a snapshot only when
/// the bytes on disk differ from the last ones seen.
pub struct ConfigSource {
    path: PathBuf,
    last_contents: Option<String>,
}

impl ConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_contents: None,
        }
    }

    /// Read and parse unconditionally, remembering the contents.
    pub async fn load(&mut self) -> anyhow::Result<Configuration> {
        let s = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("cannot read config file {}", self.path.display()))?;
        let parsed = Configuration::from_toml_str(&s);
        self.last_contents = Some(s);
        parsed
    }

    pub async fn poll(&mut self) -> Option<anyhow::Result<Configuration>> {
        let s = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) => {
                // 편집기가 파일을 교체하는 도중일 수 있으므로 다음 폴링까지 대기
                tracing::debug!("Config file {} unreadable: {}", self.path.display(), e);
                return None;
            }
        };
        if self.last_contents.as_deref() == Some(s.as_str()) {
            return None;
        }
        let parsed = Configuration::from_toml_str(&s);
        self.last_contents = Some(s);
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let cfg = Configuration::from_toml_str("").unwrap();
        assert_eq!(cfg, Configuration::default());
        assert!(cfg.auto_update);
        assert_eq!(cfg.transport, TransportKind::Socket);
        assert_eq!(cfg.readiness().timeout, Duration::from_secs(30));
        assert_eq!(cfg.readiness().marker, "Ready");
    }

    #[test]
    fn editor_option_names_are_accepted() {
        let cfg = Configuration::from_toml_str(
            r#"
            processingPath = "/opt/processing-4.3"
            languageServerPath = ""
            autoUpdate = false
            transport = "stdio"
            readinessTimeoutSecs = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.processing_path, Some(PathBuf::from("/opt/processing-4.3")));
        assert_eq!(cfg.language_server_path, None);
        assert!(!cfg.auto_update);
        assert_eq!(cfg.transport, TransportKind::Stdio);
        assert_eq!(cfg.readiness_timeout_secs, 5);
    }

    #[test]
    fn update_table() {
        let cfg = Configuration::from_toml_str(
            r#"
            processing_path = "/opt/p"
            [update]
            index_url = "http://127.0.0.1:1/index"
            index_retries = 0
            "#,
        )
        .unwrap();
        assert_eq!(cfg.update.index_url, "http://127.0.0.1:1/index");
        assert_eq!(cfg.update.index_retries, 0);
    }

    #[test]
    fn malformed_toml_is_error() {
        assert!(Configuration::from_toml_str("auto_update = \"maybe\"").is_err());
    }

    #[tokio::test]
    async fn poll_reports_only_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("processing-ls.toml");
        std::fs::write(&path, "processing_path = \"/a\"\n").unwrap();

        let mut source = ConfigSource::new(&path);
        let first = source.load().await.unwrap();
        assert_eq!(first.processing_path, Some(PathBuf::from("/a")));
        assert!(source.poll().await.is_none());

        std::fs::write(&path, "processing_path = \"/b\"\n").unwrap();
        let second = source.poll().await.unwrap().unwrap();
        assert_eq!(second.processing_path, Some(PathBuf::from("/b")));
        assert!(source.poll().await.is_none());
    }

    #[tokio::test]
    async fn missing_file_polls_as_unchanged() {
        let tmp = tempfile::tempdir().unwrap();
        let mut source = ConfigSource::new(tmp.path().join("absent.toml"));
        assert!(source.load().await.is_err());
        assert!(source.poll().await.is_none());
    }
}
