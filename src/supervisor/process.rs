//! Server process - spawning, readiness detection, and termination
//!
//! - stdout is scanned line by line for the readiness marker
//! - stderr is drained into the log, never used for readiness
//! - after readiness stdout either becomes the message channel (stdio) or
//!   keeps being drained into the log (socket)

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;

use crate::classpath::Classpath;
use crate::error::SessionError;
use crate::transport::TransportKind;

/// Entry point class of the language server.
pub const MAIN_CLASS: &str = "net.kgtkr.processingLanguageServer.main";

/// JVM flags passed before the classpath.
pub const JVM_FLAGS: &[&str] = &["-Djna.nosys=true"];

/// Program and arguments for one launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub transport: TransportKind,
}

impl LaunchCommand {
    /// `<java> -Djna.nosys=true -classpath <cp> <main> [<port>]`
    pub fn language_server(java: PathBuf, classpath: &Classpath, port: Option<u16>) -> Self {
        let mut args: Vec<String> = JVM_FLAGS.iter().map(|s| s.to_string()).collect();
        args.push("-classpath".to_string());
        args.push(classpath.to_arg());
        args.push(MAIN_CLASS.to_string());
        if let Some(port) = port {
            args.push(port.to_string());
        }

        Self {
            program: java,
            args,
            transport: if port.is_some() { TransportKind::Socket } else { TransportKind::Stdio },
        }
    }
}

/// How long to wait for the readiness marker, and what it looks like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub marker: String,
    pub timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            marker: "Ready".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// A spawned language server child.
pub struct ServerProcess {
    child: Child,
    pid: u32,
    stdout: Option<BufReader<ChildStdout>>,
    stdin: Option<ChildStdin>,
    log_tasks: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    pub fn spawn(command: &LaunchCommand) -> Result<Self, SessionError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // stdin은 stdio 전송일 때만 연결
        match command.transport {
            TransportKind::Stdio => cmd.stdin(Stdio::piped()),
            TransportKind::Socket => cmd.stdin(Stdio::null()),
        };

        hide_console_window(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| {
            SessionError::ProcessLaunch(format!("{}: {}", command.program.display(), e))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| SessionError::ProcessLaunch("child exited before it could be tracked".to_string()))?;

        let mut log_tasks = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            log_tasks.push(tokio::spawn(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while let Some(line) = read_lossy_line(&mut reader, &mut buf).await {
                    tracing::info!("[stderr] {}", line);
                }
            }));
        }

        let stdout = child.stdout.take().map(BufReader::new);
        let stdin = child.stdin.take();

        tracing::info!("Spawned language server (pid {})", pid);
        Ok(Self {
            child,
            pid,
            stdout,
            stdin,
            log_tasks,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Read stdout until a line contains `policy.marker`. The first match
    /// wins; bytes after the marker line stay buffered for the stdio channel.
    pub async fn wait_ready(&mut self, policy: &ReadinessPolicy) -> Result<(), SessionError> {
        let reader = self
            .stdout
            .as_mut()
            .ok_or_else(|| SessionError::ProcessLaunch("child stdout is not captured".to_string()))?;

        let marker = policy.marker.as_str();
        let scan = async {
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => return Err(None),
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let text = line.trim_end();
                        tracing::debug!("[stdout] {}", text);
                        if text.contains(marker) {
                            return Ok(());
                        }
                    }
                    Err(e) => return Err(Some(e)),
                }
            }
        };

        let outcome = tokio::time::timeout(policy.timeout, scan).await;
        match outcome {
            Ok(Ok(())) => {
                tracing::info!("Language server (pid {}) is ready", self.pid);
                Ok(())
            }
            Ok(Err(None)) => {
                let status = self.exit_status(Duration::from_secs(1)).await;
                Err(SessionError::ProcessLaunch(match status {
                    Some(status) => format!("exited before signalling readiness ({})", status),
                    None => "closed stdout before signalling readiness".to_string(),
                }))
            }
            Ok(Err(Some(e))) => Err(SessionError::ProcessLaunch(format!(
                "failed to read child stdout: {}",
                e
            ))),
            Err(_) => Err(SessionError::HandshakeTimeout {
                timeout_secs: policy.timeout.as_secs(),
            }),
        }
    }

    /// Keep logging stdout once it is no longer needed for the handshake.
    pub fn drain_stdout(&mut self) {
        if let Some(mut reader) = self.stdout.take() {
            let pid = self.pid;
            self.log_tasks.push(tokio::spawn(async move {
                let mut buf = Vec::new();
                while let Some(line) = read_lossy_line(&mut reader, &mut buf).await {
                    tracing::debug!("[stdout] {}", line);
                }
                tracing::info!("[close] language server (pid {}) closed stdout", pid);
            }));
        }
    }

    /// Hand over stdout (with anything already buffered) and stdin.
    pub fn take_stdio(&mut self) -> Option<(BufReader<ChildStdout>, ChildStdin)> {
        match (self.stdout.take(), self.stdin.take()) {
            (Some(out), Some(inp)) => Some((out, inp)),
            (out, inp) => {
                self.stdout = out;
                self.stdin = inp;
                None
            }
        }
    }

    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn exit_status(&mut self, wait: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(wait, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            _ => None,
        }
    }

    /// Ask the child to exit, wait up to `grace`, then kill. Always reaps.
    pub async fn terminate(&mut self, grace: Duration) {
        // stdin을 닫으면 stdio 모드 서버가 스스로 종료할 수 있음
        self.stdin.take();

        if let Ok(Some(status)) = self.child.try_wait() {
            tracing::debug!("Language server (pid {}) already exited with {}", self.pid, status);
            self.abort_log_tasks();
            return;
        }

        request_exit(&mut self.child, self.pid);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!("Language server (pid {}) exited with {}", self.pid, status);
            }
            Ok(Err(e)) => {
                tracing::warn!("Failed to wait for language server (pid {}): {}", self.pid, e);
                let _ = self.child.kill().await;
            }
            Err(_) => {
                tracing::warn!("Language server (pid {}) did not exit in time, killing", self.pid);
                if let Err(e) = self.child.kill().await {
                    tracing::error!("Failed to kill language server (pid {}): {}", self.pid, e);
                }
            }
        }
        self.abort_log_tasks();
    }

    fn abort_log_tasks(&mut self) {
        self.stdout.take();
        for task in self.log_tasks.drain(..) {
            task.abort();
        }
    }
}

/// Next line with invalid UTF-8 replaced, or `None` at EOF or on a read error.
async fn read_lossy_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => Some(String::from_utf8_lossy(buf).trim_end().to_string()),
        Err(e) => {
            tracing::debug!("Stopped reading language server output: {}", e);
            None
        }
    }
}

#[cfg(windows)]
fn hide_console_window(cmd: &mut Command) {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(not(windows))]
fn hide_console_window(_cmd: &mut Command) {}

#[cfg(unix)]
fn request_exit(child: &mut Child, pid: u32) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::debug!("SIGTERM to pid {} failed: {}, killing", pid, e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child, _pid: u32) {
    let _ = child.start_kill();
}
