//! Session-level error taxonomy. Components return these to the
//! `SessionController`, which is the only place that notifies the user.

use processing_ls_updater::UpdaterError;

#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    /// Missing/invalid installation path, unreadable version marker
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Host too old, or no compatible server build published
    #[error("Host version {version} is not supported: {reason}")]
    VersionUnsupported { version: String, reason: String },

    #[error("{0}")]
    Network(#[from] UpdaterError),

    /// Executable missing, spawn failure, or exit before readiness
    #[error("Failed to launch language server: {0}")]
    ProcessLaunch(String),

    #[error("Language server did not signal readiness within {timeout_secs}s")]
    HandshakeTimeout { timeout_secs: u64 },

    /// Transport could not be opened after readiness
    #[error("Failed to connect to language server: {0}")]
    Handshake(String),

    #[error("Protocol client failed: {0}")]
    Client(String),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SessionError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::VersionUnsupported { .. } => "VERSION_UNSUPPORTED",
            Self::Network(_) => "NETWORK_ERROR",
            Self::ProcessLaunch(_) => "PROCESS_LAUNCH_ERROR",
            Self::HandshakeTimeout { .. } => "HANDSHAKE_TIMEOUT",
            Self::Handshake(_) => "HANDSHAKE_ERROR",
            Self::Client(_) => "CLIENT_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_and_launch_failure_have_distinct_codes() {
        let timeout = SessionError::HandshakeTimeout { timeout_secs: 30 };
        let launch = SessionError::ProcessLaunch("exited with status 1".into());
        assert_ne!(timeout.error_code(), launch.error_code());
        assert_eq!(
            timeout.to_string(),
            "Language server did not signal readiness within 30s"
        );
    }

    #[test]
    fn updater_errors_convert_to_network() {
        let err: SessionError = UpdaterError::NetworkError {
            message: "reset".into(),
            recoverable: true,
        }
        .into();
        assert_eq!(err.error_code(), "NETWORK_ERROR");
        assert_eq!(err.to_string(), "Network error: reset");
    }
}
