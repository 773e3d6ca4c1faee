pub mod process;
pub mod state_machine;

use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{ChildStdin, ChildStdout};

use crate::error::SessionError;
use crate::transport::TransportKind;
pub use process::{LaunchCommand, ReadinessPolicy, ServerProcess};
pub use state_machine::{State, StateMachine};

/// Grace period between the exit request and a hard kill.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Owns at most one language server child and its lifecycle state.
pub struct Supervisor {
    machine: StateMachine,
    process: Option<ServerProcess>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            machine: StateMachine::new(),
            process: None,
        }
    }

    pub fn state(&self) -> State {
        self.machine.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ServerProcess::pid)
    }

    /// Running, and the child has not exited behind our back.
    pub fn is_running(&mut self) -> bool {
        if self.machine.state != State::Running {
            return false;
        }
        match self.process.as_mut() {
            Some(process) => !process.has_exited(),
            None => false,
        }
    }

    /// Spawn the server and wait for its readiness marker. Any previous
    /// child is stopped first, so at most one is ever alive.
    pub async fn start(
        &mut self,
        command: &LaunchCommand,
        readiness: &ReadinessPolicy,
    ) -> Result<u32, SessionError> {
        self.stop().await;
        self.transition(State::Spawning)?;

        tracing::info!(
            "Starting language server: {} {}",
            command.program.display(),
            command.args.join(" ")
        );

        let mut process = match ServerProcess::spawn(command) {
            Ok(process) => process,
            Err(e) => {
                self.transition(State::Failed)?;
                return Err(e);
            }
        };

        if let Err(e) = process.wait_ready(readiness).await {
            tracing::warn!("Language server (pid {}) failed to start: {}", process.pid(), e);
            process.terminate(SHUTDOWN_GRACE).await;
            self.transition(State::Failed)?;
            return Err(e);
        }

        if command.transport == TransportKind::Socket {
            process.drain_stdout();
        }

        let pid = process.pid();
        self.process = Some(process);
        self.transition(State::Running)?;
        Ok(pid)
    }

    /// Terminate the child if any. Safe to call in every state.
    pub async fn stop(&mut self) {
        match self.machine.state {
            State::Stopped => {}
            State::Failed => {
                if let Some(mut process) = self.process.take() {
                    process.terminate(SHUTDOWN_GRACE).await;
                }
                let _ = self.machine.transition(State::Stopped);
            }
            State::Running => {
                let _ = self.machine.transition(State::Stopping);
                if let Some(mut process) = self.process.take() {
                    let pid = process.pid();
                    process.terminate(SHUTDOWN_GRACE).await;
                    tracing::info!("Language server (pid {}) stopped", pid);
                }
                let _ = self.machine.transition(State::Stopped);
            }
            // start()가 진행 중에 취소된 경우: 자식은 kill_on_drop으로 정리됨
            State::Spawning | State::Stopping => {
                if let Some(mut process) = self.process.take() {
                    process.terminate(SHUTDOWN_GRACE).await;
                }
                self.machine.state = State::Stopped;
            }
        }
    }

    /// The child's stdout (already past the readiness line) and stdin.
    pub fn take_stdio(&mut self) -> Option<(BufReader<ChildStdout>, ChildStdin)> {
        self.process.as_mut().and_then(ServerProcess::take_stdio)
    }

    fn transition(&mut self, to: State) -> Result<(), SessionError> {
        self.machine
            .transition(to)
            .map_err(|e| SessionError::Internal(anyhow::anyhow!(e)))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn command(program: PathBuf, transport: TransportKind) -> LaunchCommand {
        LaunchCommand {
            program,
            args: vec![],
            transport,
        }
    }

    fn policy(secs: u64) -> ReadinessPolicy {
        ReadinessPolicy {
            marker: "Ready".to_string(),
            timeout: Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn start_reaches_running_and_stop_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "server.sh", "echo booting\necho Ready\nexec sleep 30");

        let mut sup = Supervisor::new();
        let pid = sup.start(&command(exe, TransportKind::Socket), &policy(10)).await.unwrap();
        assert_eq!(sup.state(), State::Running);
        assert_eq!(sup.pid(), Some(pid));
        assert!(sup.is_running());

        sup.stop().await;
        assert_eq!(sup.state(), State::Stopped);
        assert_eq!(sup.pid(), None);
        sup.stop().await;
        assert_eq!(sup.state(), State::Stopped);
    }

    #[tokio::test]
    async fn exit_before_marker_is_launch_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "crash.sh", "echo starting\nexit 3");

        let mut sup = Supervisor::new();
        let err = sup.start(&command(exe, TransportKind::Socket), &policy(10)).await.unwrap_err();
        assert_eq!(err.error_code(), "PROCESS_LAUNCH_ERROR");
        assert_eq!(sup.state(), State::Failed);
        assert_eq!(sup.pid(), None);

        sup.stop().await;
        assert_eq!(sup.state(), State::Stopped);
    }

    #[tokio::test]
    async fn silent_server_times_out_and_is_killed() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "silent.sh", "exec sleep 30");

        let mut sup = Supervisor::new();
        let err = sup.start(&command(exe, TransportKind::Socket), &policy(1)).await.unwrap_err();
        assert!(matches!(err, SessionError::HandshakeTimeout { timeout_secs: 1 }));
        assert_eq!(sup.state(), State::Failed);
    }

    #[tokio::test]
    async fn marker_on_stderr_does_not_count() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "stderr.sh", "echo Ready 1>&2\nexec sleep 30");

        let mut sup = Supervisor::new();
        let err = sup.start(&command(exe, TransportKind::Socket), &policy(1)).await.unwrap_err();
        assert_eq!(err.error_code(), "HANDSHAKE_TIMEOUT");
    }

    #[tokio::test]
    async fn stdio_channel_starts_after_marker_line() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "echo.sh", "echo Ready\nexec cat");

        let mut sup = Supervisor::new();
        sup.start(&command(exe, TransportKind::Stdio), &policy(10)).await.unwrap();

        let (mut out, mut inp) = sup.take_stdio().unwrap();
        assert!(sup.take_stdio().is_none());

        inp.write_all(b"ping\n").await.unwrap();
        inp.flush().await.unwrap();
        let mut line = String::new();
        out.read_line(&mut line).await.unwrap();
        assert_eq!(line, "ping\n");

        drop(inp);
        sup.stop().await;
        assert_eq!(sup.state(), State::Stopped);
    }

    #[tokio::test]
    async fn invalid_utf8_before_marker_is_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "sjis.sh", "printf '\\203\\130\\n'\necho Ready\nexec sleep 30");

        let mut sup = Supervisor::new();
        sup.start(&command(exe, TransportKind::Socket), &policy(10)).await.unwrap();
        assert_eq!(sup.state(), State::Running);
        sup.stop().await;
    }

    #[tokio::test]
    async fn stdio_bytes_after_marker_survive_invalid_utf8() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "sjis.sh", "printf '\\203\\130\\nReady\\nhello\\n'\nexec cat");

        let mut sup = Supervisor::new();
        sup.start(&command(exe, TransportKind::Stdio), &policy(10)).await.unwrap();

        let (mut out, inp) = sup.take_stdio().unwrap();
        let mut line = String::new();
        out.read_line(&mut line).await.unwrap();
        assert_eq!(line, "hello\n");

        drop(inp);
        sup.stop().await;
    }

    #[tokio::test]
    async fn output_keeps_draining_after_invalid_utf8() {
        let tmp = tempfile::tempdir().unwrap();
        let done = tmp.path().join("done");
        // 읽는 쪽이 사라지면 쓰기가 EPIPE로 실패해 done이 생기지 않음
        let body = format!(
            "echo Ready\n\
             printf '\\377\\n' 1>&2\n\
             printf '\\377\\n'\n\
             head -c 300000 /dev/zero | tr '\\0' x 1>&2 && \\\n\
             head -c 300000 /dev/zero | tr '\\0' x && \\\n\
             echo tail 1>&2 && touch {}\n\
             exec sleep 30",
            done.display()
        );
        let exe = script(tmp.path(), "noisy.sh", &body);

        let mut sup = Supervisor::new();
        sup.start(&command(exe, TransportKind::Socket), &policy(10)).await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while !done.exists() && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(done.exists(), "server output stopped being drained");
        assert!(sup.is_running());
        sup.stop().await;
    }

    #[tokio::test]
    async fn restart_replaces_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "server.sh", "echo Ready\nexec sleep 30");
        let cmd = command(exe, TransportKind::Socket);

        let mut sup = Supervisor::new();
        let first = sup.start(&cmd, &policy(10)).await.unwrap();
        let second = sup.start(&cmd, &policy(10)).await.unwrap();
        assert_ne!(first, second);

        // 이전 자식은 이미 회수되어 존재하지 않아야 함
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(first as i32), None);
        assert!(alive.is_err());

        sup.stop().await;
    }

    #[tokio::test]
    async fn sigterm_ignoring_child_is_killed_after_grace() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = script(tmp.path(), "stubborn.sh", "trap '' TERM\necho Ready\nwhile true; do sleep 1; done");

        let mut sup = Supervisor::new();
        let pid = sup.start(&command(exe, TransportKind::Socket), &policy(10)).await.unwrap();

        let started = std::time::Instant::now();
        sup.stop().await;
        assert!(started.elapsed() >= SHUTDOWN_GRACE);
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
        assert!(alive.is_err());
    }
}
