//! 업데이터 에러 타입과 재시도 정책
//!
//! ## 지원하는 에러 상황
//! - 네트워크 끊김 / 타임아웃
//! - 다운로드 중단
//! - 파일 시스템 오류
//! - 원격 인덱스 응답 오류

use std::fmt;
use std::time::Duration;
use serde::{Deserialize, Serialize};

/// Failure raised by the remote index client or the artifact fetcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum UpdaterError {
    /// Connection could not be established or was reset
    NetworkError {
        message: String,
        recoverable: bool,
    },
    /// HTTP request timed out
    Timeout {
        operation: String,
        duration_secs: u64,
    },
    /// Non-success HTTP status
    ApiError {
        status_code: u16,
        message: String,
    },
    /// Body stream broke off before completion
    DownloadInterrupted {
        artifact: String,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
    },
    /// Cache directory or temp file I/O failed
    FileSystemError {
        operation: String,
        path: String,
        message: String,
    },
    /// Index document could not be decoded
    InvalidIndex {
        message: String,
    },
}

impl fmt::Display for UpdaterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdaterError::NetworkError { message, .. } => {
                write!(f, "Network error: {}", message)
            }
            UpdaterError::Timeout { operation, duration_secs } => {
                write!(f, "Timeout after {}s: {}", duration_secs, operation)
            }
            UpdaterError::ApiError { status_code, message } => {
                write!(f, "Remote error ({}): {}", status_code, message)
            }
            UpdaterError::DownloadInterrupted { artifact, downloaded_bytes, total_bytes } => {
                match total_bytes {
                    Some(total) => write!(
                        f,
                        "Download interrupted for {}: {}/{} bytes",
                        artifact, downloaded_bytes, total
                    ),
                    None => write!(
                        f,
                        "Download interrupted for {} after {} bytes",
                        artifact, downloaded_bytes
                    ),
                }
            }
            UpdaterError::FileSystemError { operation, path, message } => {
                write!(f, "File system error during {} on '{}': {}", operation, path, message)
            }
            UpdaterError::InvalidIndex { message } => {
                write!(f, "Invalid release index: {}", message)
            }
        }
    }
}

impl std::error::Error for UpdaterError {}

impl UpdaterError {
    /// Whether retrying the same request can succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            UpdaterError::NetworkError { recoverable, .. } => *recoverable,
            UpdaterError::Timeout { .. } => true,
            // 5xx 에러는 재시도 가능, 4xx는 불가능
            UpdaterError::ApiError { status_code, .. } => *status_code >= 500 || *status_code == 429,
            UpdaterError::DownloadInterrupted { .. } => true,
            UpdaterError::FileSystemError { .. } => false,
            UpdaterError::InvalidIndex { .. } => false,
        }
    }

    /// Suggested wait before retry number `attempt` (0-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let base_delay = match self {
            UpdaterError::NetworkError { .. } => Duration::from_secs(2),
            UpdaterError::Timeout { .. } => Duration::from_secs(5),
            UpdaterError::ApiError { status_code, .. } => {
                if *status_code == 429 {
                    // Rate limit: 더 긴 대기
                    Duration::from_secs(30)
                } else {
                    Duration::from_secs(3)
                }
            }
            _ => Duration::from_secs(1),
        };

        let multiplier = 2u64.saturating_pow(attempt);
        let delay_secs = base_delay.as_secs().saturating_mul(multiplier);
        Duration::from_secs(delay_secs.min(60)) // 최대 1분
    }

    /// Convert a reqwest failure, keeping the operation name for diagnostics.
    pub fn from_reqwest(err: &reqwest::Error, operation: &str) -> Self {
        if err.is_timeout() {
            UpdaterError::Timeout {
                operation: operation.to_string(),
                duration_secs: crate::HTTP_TIMEOUT_SECS,
            }
        } else if err.is_connect() {
            UpdaterError::NetworkError {
                message: format!("{}: connection failed", operation),
                recoverable: true,
            }
        } else if let Some(status) = err.status() {
            UpdaterError::ApiError {
                status_code: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            UpdaterError::NetworkError {
                message: format!("{}: {}", operation, err),
                recoverable: err.is_request() || err.is_body(),
            }
        }
    }

    pub fn from_io(err: &std::io::Error, operation: &str, path: &std::path::Path) -> Self {
        UpdaterError::FileSystemError {
            operation: operation.to_string(),
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Whether this failure came from the network rather than local I/O.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            UpdaterError::NetworkError { .. }
                | UpdaterError::Timeout { .. }
                | UpdaterError::ApiError { .. }
                | UpdaterError::DownloadInterrupted { .. }
                | UpdaterError::InvalidIndex { .. }
        )
    }
}
