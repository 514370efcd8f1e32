//! Agent process lifecycle: spawn the child, poll for exit, and terminate it
//! gracefully (SIGTERM to the process group, SIGKILL after the grace period).

use crate::config::AgentConfig;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

/// A live agent process. Exclusively owned by the supervisor loop; dropped
/// (or consumed by [`AgentProcess::shutdown`]) when the child is gone.
#[derive(Debug)]
pub struct AgentProcess {
    child: Child,
    pid: u32,
}

/// How a supervised shutdown ended.
#[derive(Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The child honored SIGTERM within the grace period.
    Graceful { exit_code: Option<i32> },
    /// The child outlived the grace period and was SIGKILLed.
    Killed,
}

/// Errors that can occur while spawning the agent.
#[derive(Debug)]
pub enum SpawnError {
    /// Failed to open the agent log file.
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The OS refused to create the process.
    Spawn { source: std::io::Error },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::LogFile { path, source } => {
                write!(
                    f,
                    "failed to open agent log file {}: {}",
                    path.display(),
                    source
                )
            }
            SpawnError::Spawn { source } => {
                write!(f, "failed to spawn agent process: {}", source)
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::LogFile { source, .. } => Some(source),
            SpawnError::Spawn { source } => Some(source),
        }
    }
}

impl SpawnError {
    /// The underlying OS error, for reporting through the event sink.
    pub fn into_io(self) -> std::io::Error {
        match self {
            SpawnError::LogFile { source, .. } => source,
            SpawnError::Spawn { source } => source,
        }
    }
}

/// Assemble the full argument vector: the script (when configured) first,
/// then the remaining launch arguments in order.
fn build_args(config: &AgentConfig) -> Vec<String> {
    let mut args = Vec::with_capacity(config.args.len() + 1);
    if let Some(script) = &config.script {
        args.push(script.display().to_string());
    }
    args.extend(config.args.iter().cloned());
    args
}

/// Open the agent log file in append mode, with a second handle for stderr.
fn log_handles(path: &Path) -> Result<(Stdio, Stdio), SpawnError> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| SpawnError::LogFile {
            path: path.to_path_buf(),
            source: e,
        })?;
    let stderr = file.try_clone().map_err(|e| SpawnError::LogFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

/// Spawn the agent in its own process group so a later SIGTERM/SIGKILL
/// reaches the whole tree, not just the interpreter.
pub fn spawn(program: &Path, config: &AgentConfig) -> Result<AgentProcess, SpawnError> {
    let args = build_args(config);
    let (stdout, stderr) = match &config.log_file {
        Some(path) => log_handles(path)?,
        None => (Stdio::inherit(), Stdio::inherit()),
    };

    tracing::debug!(
        program = %program.display(),
        args = ?args,
        cwd = %config.working_dir.display(),
        "spawning agent"
    );

    let child = Command::new(program)
        .args(&args)
        .current_dir(&config.working_dir)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr)
        .process_group(0) // New process group for clean kill
        .spawn()
        .map_err(|e| SpawnError::Spawn { source: e })?;

    // id() is Some for a freshly spawned, un-waited child.
    let pid = child.id().unwrap_or_default();
    Ok(AgentProcess { child, pid })
}

impl AgentProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking exit check. `Ok(None)` means still running.
    pub fn poll_exit(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        self.child.try_wait()
    }

    /// Ask the process group to terminate, wait up to `grace`, then SIGKILL.
    ///
    /// Consumes the handle: after this call the child is gone either way.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownOutcome {
        self.signal_group(Signal::SIGTERM);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => ShutdownOutcome::Graceful {
                exit_code: status.code(),
            },
            Ok(Err(e)) => {
                // wait() failing means we lost track of the child; make sure
                // the group is dead before reporting.
                tracing::warn!(pid = self.pid, error = %e, "wait on agent failed during shutdown");
                self.signal_group(Signal::SIGKILL);
                ShutdownOutcome::Killed
            }
            Err(_) => {
                self.signal_group(Signal::SIGKILL);
                // Reap the zombie; SIGKILL cannot be ignored.
                let _ = self.child.wait().await;
                ShutdownOutcome::Killed
            }
        }
    }

    fn signal_group(&self, signal: Signal) {
        // ESRCH just means the group is already gone.
        if let Err(e) = killpg(Pid::from_raw(self.pid as i32), signal) {
            if e != nix::errno::Errno::ESRCH {
                tracing::warn!(pid = self.pid, signal = ?signal, error = %e, "killpg failed");
            }
        }
    }
}
