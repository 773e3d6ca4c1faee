//! Session controller: owns the single server session and rebuilds it on
//! every configuration change.
//!
//! Pipeline per reload: teardown, validate, pick the server archive (explicit
//! path, resolve and fetch, or cache), build the classpath, find `java`,
//! prepare the transport, spawn and await readiness, open the transport,
//! attach the client. Any failure tears everything down again.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use processing_ls_updater::{
    DownloadProgress, HostVersion, RemoteArtifact, Updater, UpdaterError, MIN_SUPPORTED,
};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::classpath::build_classpath;
use crate::client::{Notifier, ProtocolClient};
use crate::config::Configuration;
use crate::error::SessionError;
use crate::platform::PlatformProfile;
use crate::supervisor::{LaunchCommand, State, Supervisor};
use crate::transport::{Endpoint, TransportPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadOutcome {
    Started,
    AlreadyRunning,
    /// A newer reload took over before this one finished
    Superseded,
}

/// Read-only view of the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: State,
    pub pid: Option<u32>,
    pub endpoint: Option<Endpoint>,
    pub artifact: Option<PathBuf>,
    pub host_version: Option<HostVersion>,
}

struct ServerSession {
    supervisor: Supervisor,
    client: Box<dyn ProtocolClient>,
    endpoint: Option<Endpoint>,
    artifact: Option<PathBuf>,
    host_version: Option<HostVersion>,
}

impl ServerSession {
    async fn teardown(&mut self) {
        self.client.detach();
        self.supervisor.stop().await;
        self.endpoint = None;
        self.artifact = None;
        self.host_version = None;
    }
}

struct ServerArchive {
    path: PathBuf,
    host_version: Option<HostVersion>,
}

pub struct SessionController {
    session: tokio::sync::Mutex<ServerSession>,
    config: Mutex<Arc<Configuration>>,
    pending: Mutex<CancellationToken>,
    notifier: Arc<dyn Notifier>,
    profile: PlatformProfile,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionController {
    pub fn new(client: Box<dyn ProtocolClient>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            session: tokio::sync::Mutex::new(ServerSession {
                supervisor: Supervisor::new(),
                client,
                endpoint: None,
                artifact: None,
                host_version: None,
            }),
            config: Mutex::new(Arc::new(Configuration::default())),
            pending: Mutex::new(CancellationToken::new()),
            notifier,
            profile: PlatformProfile::current(),
        }
    }

    /// Use a different installation layout than the one of this OS.
    pub fn with_profile(mut self, profile: PlatformProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn config(&self) -> Arc<Configuration> {
        lock(&self.config).clone()
    }

    /// Replace the configuration snapshot and rebuild the session from it.
    pub async fn reload(&self, config: Configuration) -> Result<ReloadOutcome, SessionError> {
        let config = Arc::new(config);
        *lock(&self.config) = config.clone();
        self.reload_snapshot(config).await
    }

    /// Start with the current snapshot unless a server is already running.
    pub async fn start(&self) -> Result<ReloadOutcome, SessionError> {
        if self.session.lock().await.supervisor.is_running() {
            return Ok(ReloadOutcome::AlreadyRunning);
        }
        self.reload_snapshot(self.config()).await
    }

    pub async fn restart(&self) -> Result<ReloadOutcome, SessionError> {
        self.reload_snapshot(self.config()).await
    }

    /// Tear the session down. Idempotent.
    pub async fn stop(&self) {
        lock(&self.pending).cancel();
        let mut session = self.session.lock().await;
        let was_running = session.supervisor.pid().is_some();
        session.teardown().await;
        if was_running {
            self.notifier.info("Language server stopped");
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let session = self.session.lock().await;
        SessionStatus {
            state: session.supervisor.state(),
            pid: session.supervisor.pid(),
            endpoint: session.endpoint,
            artifact: session.artifact.clone(),
            host_version: session.host_version,
        }
    }

    async fn reload_snapshot(&self, config: Arc<Configuration>) -> Result<ReloadOutcome, SessionError> {
        let token = CancellationToken::new();
        let previous = std::mem::replace(&mut *lock(&self.pending), token.clone());
        previous.cancel();

        let mut session = self.session.lock().await;
        // teardown은 취소 대상이 아님: 새 자원을 잡기 전에 항상 끝까지 수행
        session.teardown().await;
        if token.is_cancelled() {
            tracing::debug!("Reload superseded before start");
            return Ok(ReloadOutcome::Superseded);
        }

        match self.bring_up(&mut session, &config, &token).await {
            Ok(ReloadOutcome::Started) => {
                let pid = session.supervisor.pid().unwrap_or_default();
                let endpoint = session.endpoint.map(|e| e.to_string()).unwrap_or_default();
                self.notifier
                    .info(&format!("Language server running (pid {}, {})", pid, endpoint));
                Ok(ReloadOutcome::Started)
            }
            Ok(outcome) => {
                session.teardown().await;
                tracing::debug!("Reload superseded during start");
                Ok(outcome)
            }
            Err(e) => {
                session.teardown().await;
                self.notifier.error(&e);
                Err(e)
            }
        }
    }

    async fn bring_up(
        &self,
        session: &mut ServerSession,
        config: &Configuration,
        token: &CancellationToken,
    ) -> Result<ReloadOutcome, SessionError> {
        let host_root = validate_root(config.processing_path.as_deref()).await?;

        let archive = match self.server_archive(config, &host_root, token).await? {
            Some(archive) => archive,
            None => return Ok(ReloadOutcome::Superseded),
        };

        let mut classpath = build_classpath(&host_root, &self.profile)
            .await
            .map_err(|e| SessionError::Configuration(e.to_string()))?;
        classpath.push_last(archive.path.clone());

        let java = self
            .profile
            .find_executable(&host_root)
            .await
            .map_err(|e| SessionError::ProcessLaunch(e.to_string()))?;

        if token.is_cancelled() {
            return Ok(ReloadOutcome::Superseded);
        }

        let plan = TransportPlan::prepare(config.transport)?;
        let command = LaunchCommand::language_server(java, &classpath, plan.port());
        session.supervisor.start(&command, &config.readiness()).await?;

        let transport = plan.open(&mut session.supervisor).await?;
        let endpoint = transport.endpoint;
        session.client.attach(transport)?;

        session.endpoint = Some(endpoint);
        session.artifact = Some(archive.path);
        session.host_version = archive.host_version;
        Ok(ReloadOutcome::Started)
    }

    /// Pick the server archive. `None` means the reload was superseded.
    async fn server_archive(
        &self,
        config: &Configuration,
        host_root: &Path,
        token: &CancellationToken,
    ) -> Result<Option<ServerArchive>, SessionError> {
        if let Some(path) = &config.language_server_path {
            if !tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false) {
                return Err(SessionError::Configuration(format!(
                    "language server archive not found: {}",
                    path.display()
                )));
            }
            tracing::info!("Using configured language server {}", path.display());
            return Ok(Some(ServerArchive {
                path: path.clone(),
                host_version: None,
            }));
        }

        let host = read_host_version(&self.profile, host_root).await?;
        if !host.is_supported() {
            return Err(SessionError::VersionUnsupported {
                version: host.to_string(),
                reason: format!("Processing {} or newer is required", MIN_SUPPORTED),
            });
        }
        tracing::info!("Host Processing version {}", host);

        let updater = Updater::new(&config.update)?.with_progress(Arc::new(|p: DownloadProgress| {
            match p.total_bytes {
                Some(total) => tracing::debug!("{}: {}/{} bytes", p.artifact, p.downloaded_bytes, total),
                None => tracing::debug!("{}: {} bytes", p.artifact, p.downloaded_bytes),
            }
        }));

        if !config.auto_update {
            return match updater.newest_cached(&host).await.map_err(cache_error)? {
                Some((artifact, path)) => {
                    tracing::info!("Auto-update disabled, using cached build {}", artifact);
                    Ok(Some(ServerArchive {
                        path,
                        host_version: Some(host),
                    }))
                }
                None => Err(SessionError::Configuration(format!(
                    "auto-update is disabled and no cached language server matches Processing {}",
                    host
                ))),
            };
        }

        let resolved = tokio::select! {
            _ = token.cancelled() => return Ok(None),
            r = updater.resolve(&host) => r,
        };

        let artifact: RemoteArtifact = match resolved {
            Ok(Some(artifact)) => artifact,
            Ok(None) => {
                return Err(SessionError::VersionUnsupported {
                    version: host.to_string(),
                    reason: "no compatible language server build is published".to_string(),
                })
            }
            Err(e) => return cached_fallback(&updater, host, e).await.map(Some),
        };

        let fetched = tokio::select! {
            _ = token.cancelled() => return Ok(None),
            r = updater.ensure_cached(&artifact) => r,
        };

        match fetched {
            Ok(path) => Ok(Some(ServerArchive {
                path,
                host_version: Some(host),
            })),
            Err(e) => cached_fallback(&updater, host, e).await.map(Some),
        }
    }
}

/// Keep working with a stale build when the remote side is unreachable.
/// Local cache failures are not retried against the cache.
async fn cached_fallback(
    updater: &Updater,
    host: HostVersion,
    err: UpdaterError,
) -> Result<ServerArchive, SessionError> {
    if !err.is_network() {
        return Err(cache_error(err));
    }
    match updater.newest_cached(&host).await {
        Ok(Some((artifact, path))) => {
            tracing::warn!("{}; falling back to cached build {}", err, artifact);
            Ok(ServerArchive {
                path,
                host_version: Some(host),
            })
        }
        Ok(None) => Err(SessionError::Network(err)),
        Err(cache_err) => {
            tracing::warn!("Cannot list artifact cache: {}", cache_err);
            Err(SessionError::Network(err))
        }
    }
}

fn cache_error(err: UpdaterError) -> SessionError {
    if err.is_network() {
        SessionError::Network(err)
    } else {
        SessionError::Configuration(format!("artifact cache unusable: {}", err))
    }
}

async fn validate_root(path: Option<&Path>) -> Result<PathBuf, SessionError> {
    let root = path.ok_or_else(|| SessionError::Configuration("processing path is not set".to_string()))?;
    match tokio::fs::metadata(root).await {
        Ok(m) if m.is_dir() => Ok(root.to_path_buf()),
        Ok(_) => Err(SessionError::Configuration(format!(
            "host installation path invalid: {} is not a directory",
            root.display()
        ))),
        Err(e) => Err(SessionError::Configuration(format!(
            "host installation path invalid: {}: {}",
            root.display(),
            e
        ))),
    }
}

/// Host version from the first line of the installation's version file.
pub async fn read_host_version(profile: &PlatformProfile, root: &Path) -> Result<HostVersion, SessionError> {
    let path = profile.version_file_path(root);
    let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
        SessionError::Configuration(format!("cannot read host version from {}: {}", path.display(), e))
    })?;
    let first = contents.lines().next().unwrap_or_default();
    HostVersion::parse(first).ok_or_else(|| {
        SessionError::Configuration(format!(
            "unrecognised host version {:?} in {}",
            first.trim(),
            path.display()
        ))
    })
}
