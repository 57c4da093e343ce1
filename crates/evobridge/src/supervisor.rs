//! Worker subprocess lifecycle.
//!
//! Spawning is pluggable via [`WorkerSpawner`] so tests can substitute
//! their own process; the default [`CommandSpawner`] runs the configured
//! command with piped stdio. A watcher task owns the child handle, reaps
//! it exactly once, and broadcasts the [`ExitNotice`] on a watch channel
//! that both the bridge's crash path and `stop()` observe.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};

/// Command line, environment, and working directory for the worker.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("worker {0} channel was not captured")]
    MissingChannel(&'static str),
}

/// Extension point for different worker spawn strategies.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError>;
}

/// Default spawner: run the configured command with all three standard
/// streams piped.
pub struct CommandSpawner;

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, command: &WorkerCommand) -> Result<Child, SpawnError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        Ok(cmd.spawn()?)
    }
}

/// How the worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNotice {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitNotice {
    fn from_status(status: &std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("terminated by signal {}", signal),
            (None, None) => "exit status unknown".to_string(),
        }
    }
}

/// Owns the worker process identity and its exit state.
///
/// The child handle itself lives in the watcher task; the supervisor keeps
/// only the pid (for signalling) and the exit broadcast.
pub struct ProcessSupervisor {
    pid: Option<u32>,
    exited: watch::Receiver<Option<ExitNotice>>,
    kill_tx: mpsc::Sender<()>,
}

impl ProcessSupervisor {
    /// Spawn the worker and detach its standard streams for the caller.
    pub fn start(
        spawner: &dyn WorkerSpawner,
        command: &WorkerCommand,
    ) -> Result<(Self, ChildStdin, ChildStdout, ChildStderr), SpawnError> {
        let mut child = spawner.spawn(command)?;
        let stdin = child
            .stdin
            .take()
            .ok_or(SpawnError::MissingChannel("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingChannel("stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingChannel("stderr"))?;

        let pid = child.id();
        tracing::info!(?pid, program = %command.program, "worker spawned");

        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    status = child.wait() => {
                        let notice = match status {
                            Ok(status) => ExitNotice::from_status(&status),
                            Err(e) => {
                                tracing::warn!(error = %e, "failed to reap worker");
                                ExitNotice::unknown()
                            }
                        };
                        tracing::info!(?pid, detail = %notice.describe(), "worker exited");
                        let _ = exit_tx.send(Some(notice));
                        break;
                    }
                    Some(()) = kill_rx.recv() => {
                        tracing::debug!(?pid, "force-killing worker");
                        let _ = child.start_kill();
                    }
                }
            }
        });

        Ok((
            Self {
                pid,
                exited: exit_rx,
                kill_tx,
            },
            stdin,
            stdout,
            stderr,
        ))
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Receiver that flips to `Some(notice)` exactly once, when the worker
    /// exits.
    pub fn subscribe_exit(&self) -> watch::Receiver<Option<ExitNotice>> {
        self.exited.clone()
    }

    pub fn exit_notice(&self) -> Option<ExitNotice> {
        self.exited.borrow().clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_notice().is_some()
    }

    /// Wait until the worker has exited.
    pub async fn wait_exited(&self) -> ExitNotice {
        let mut rx = self.subscribe_exit();
        loop {
            if let Some(notice) = rx.borrow_and_update().clone() {
                return notice;
            }
            if rx.changed().await.is_err() {
                // Watcher gone without a broadcast; nothing more to learn.
                return self.exit_notice().unwrap_or_else(ExitNotice::unknown);
            }
        }
    }

    pub async fn wait_exited_timeout(&self, limit: Duration) -> Option<ExitNotice> {
        tokio::time::timeout(limit, self.wait_exited()).await.ok()
    }

    /// Ask the worker to terminate (SIGTERM on unix). Escalation is the
    /// caller's business; see [`shutdown`](Self::shutdown).
    pub fn terminate(&self) {
        #[cfg(unix)]
        {
            if let Some(pid) = self.pid {
                let pid = nix::unistd::Pid::from_raw(pid as i32);
                if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
                    tracing::debug!(error = %e, "SIGTERM failed (worker already gone?)");
                }
            } else {
                self.force_kill();
            }
        }
        #[cfg(not(unix))]
        self.force_kill();
    }

    /// Kill the worker outright.
    pub fn force_kill(&self) {
        let _ = self.kill_tx.try_send(());
    }

    /// Graceful-then-forceful termination: SIGTERM, wait out the grace
    /// period, then SIGKILL.
    pub async fn shutdown(&self, grace: Duration) -> ExitNotice {
        if let Some(notice) = self.exit_notice() {
            return notice;
        }
        self.terminate();
        if let Some(notice) = self.wait_exited_timeout(grace).await {
            return notice;
        }
        tracing::warn!(pid = ?self.pid, "worker ignored graceful termination, killing");
        self.force_kill();
        self.wait_exited().await
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Last-resort cleanup; a no-op when the worker already exited.
        let _ = self.kill_tx.try_send(());
    }
}
