use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use nodectl_protocol::NodeConfig;
use nodectl_protocol::RunState;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::error::SupervisorError;
use crate::logs::LogHandle;
use crate::release::worker_binary_path;

/// How long a graceful stop may take before the worker is force-killed.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Owns the worker process. At most one live child handle exists at any
/// time; the handle never leaves this type.
#[derive(Debug)]
pub struct ProcessRunner {
    child: Mutex<Option<Child>>,
    logs: LogHandle,
}

impl ProcessRunner {
    pub fn new(logs: LogHandle) -> Self {
        Self {
            child: Mutex::new(None),
            logs,
        }
    }

    /// Launches the worker described by `config` and wires its output into
    /// the log buffer. Fails without touching an existing live process.
    pub fn spawn(&self, config: &NodeConfig) -> Result<()> {
        let executable = worker_binary_path(&config.db_path);
        if !executable.exists() {
            return Err(SupervisorError::ExecutableMissing { path: executable });
        }

        let Ok(mut slot) = self.child.lock() else {
            return Err(SupervisorError::Spawn {
                error: std::io::Error::other("process slot lock poisoned"),
            });
        };
        if let Some(child) = slot.as_mut() {
            // Only a handle whose process is actually gone may be replaced.
            match child.try_wait() {
                Ok(Some(_)) | Err(_) => *slot = None,
                Ok(None) => {
                    return Err(SupervisorError::AlreadyRunning {
                        state: RunState::Running,
                    });
                }
            }
        }

        let mut child = build_command(&executable, config)
            .spawn()
            .map_err(|error| match error.kind() {
                std::io::ErrorKind::NotFound => SupervisorError::ExecutableMissing {
                    path: executable.clone(),
                },
                _ => SupervisorError::Spawn { error },
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, self.logs.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, self.logs.clone(), "stderr"));
        }

        debug!(pid = child.id(), "worker spawned");
        *slot = Some(child);
        Ok(())
    }

    /// Graceful stop with the default grace period, escalating to a forced
    /// kill. Terminating an already-dead or absent process is a no-op.
    pub async fn terminate(&self) -> Result<()> {
        self.terminate_with_grace(TERMINATE_GRACE).await
    }

    pub(crate) async fn terminate_with_grace(&self, grace: Duration) -> Result<()> {
        let taken = match self.child.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(mut child) = taken else {
            return Ok(());
        };

        request_graceful_stop(&mut child);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(?status, "worker exited");
                Ok(())
            }
            Ok(Err(error)) => Err(SupervisorError::Terminate { error }),
            Err(_elapsed) => {
                warn!("worker ignored graceful stop; killing");
                child
                    .start_kill()
                    .map_err(|error| SupervisorError::Terminate { error })?;
                child
                    .wait()
                    .await
                    .map_err(|error| SupervisorError::Terminate { error })?;
                Ok(())
            }
        }
    }

    /// Non-blocking liveness probe. A handle whose process has exited is
    /// reaped here so the single-handle slot frees up.
    pub fn is_alive(&self) -> bool {
        let Ok(mut slot) = self.child.lock() else {
            return false;
        };
        match slot.as_mut() {
            None => false,
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => {
                    *slot = None;
                    false
                }
            },
        }
    }
}

fn build_command(executable: &Path, config: &NodeConfig) -> Command {
    let mut cmd = Command::new(executable);
    cmd.arg("daemon")
        .arg("--api-port")
        .arg(config.api_port.to_string())
        .arg("--db")
        .arg(&config.db_path)
        .arg("--p2p-port")
        .arg(config.p2p_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(target_os = "linux")]
    unsafe {
        // The worker must not outlive its supervisor.
        cmd.pre_exec(|| {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
            Ok(())
        });
    }
    cmd
}

fn request_graceful_stop(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        return;
    }
    let _ = child.start_kill();
}

async fn forward_lines<R>(reader: R, logs: LogHandle, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => logs.append(format!("[{stream}] {line}")),
            Ok(None) => break,
            Err(error) => {
                debug!(%error, stream, "output capture ended");
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::release::worker_binary_name;
    use std::path::Path;
    use tempfile::TempDir;

    fn install_fake_worker(dir: &Path, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(worker_binary_name());
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }

    fn config_for(dir: &Path) -> NodeConfig {
        NodeConfig {
            db_path: dir.to_string_lossy().into_owned(),
            api_port: 8080,
            p2p_port: 2000,
        }
    }

    #[tokio::test]
    async fn spawn_fails_when_binary_is_missing() {
        let dir = TempDir::new().expect("tempdir");
        let runner = ProcessRunner::new(LogHandle::new());
        let err = runner.spawn(&config_for(dir.path())).expect_err("no binary");
        assert!(matches!(err, SupervisorError::ExecutableMissing { .. }));
    }

    #[tokio::test]
    async fn spawn_captures_output_and_reports_liveness() {
        let dir = TempDir::new().expect("tempdir");
        install_fake_worker(dir.path(), "echo ready\nsleep 30");
        let logs = LogHandle::new();
        let runner = ProcessRunner::new(logs.clone());

        runner.spawn(&config_for(dir.path())).expect("spawn");
        assert!(runner.is_alive());

        // Give the reader task a moment to drain the pipe.
        for _ in 0..50 {
            if !logs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(logs.render_text().contains("[stdout] ready"));

        runner.terminate().await.expect("terminate");
        assert!(!runner.is_alive());
    }

    #[tokio::test]
    async fn second_spawn_is_rejected_without_touching_the_first() {
        let dir = TempDir::new().expect("tempdir");
        install_fake_worker(dir.path(), "sleep 30");
        let runner = ProcessRunner::new(LogHandle::new());

        runner.spawn(&config_for(dir.path())).expect("first spawn");
        let err = runner
            .spawn(&config_for(dir.path()))
            .expect_err("second spawn");
        assert!(matches!(err, SupervisorError::AlreadyRunning { .. }));
        assert!(runner.is_alive());

        runner.terminate().await.expect("terminate");
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let runner = ProcessRunner::new(LogHandle::new());
        runner.terminate().await.expect("no-op terminate");

        let dir = TempDir::new().expect("tempdir");
        install_fake_worker(dir.path(), "sleep 30");
        runner.spawn(&config_for(dir.path())).expect("spawn");
        runner.terminate().await.expect("terminate");
        runner.terminate().await.expect("terminate again");
    }

    #[tokio::test]
    async fn stubborn_worker_is_force_killed_after_the_grace_period() {
        let dir = TempDir::new().expect("tempdir");
        install_fake_worker(dir.path(), "trap '' TERM\nwhile true; do sleep 1; done");
        let runner = ProcessRunner::new(LogHandle::new());

        runner.spawn(&config_for(dir.path())).expect("spawn");
        // Let the shell install its TERM trap before signalling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        runner
            .terminate_with_grace(Duration::from_millis(200))
            .await
            .expect("escalated terminate");
        assert!(!runner.is_alive());
    }

    #[tokio::test]
    async fn liveness_observes_external_death() {
        let dir = TempDir::new().expect("tempdir");
        install_fake_worker(dir.path(), "exit 0");
        let runner = ProcessRunner::new(LogHandle::new());

        runner.spawn(&config_for(dir.path())).expect("spawn");
        for _ in 0..50 {
            if !runner.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!runner.is_alive());
    }
}
