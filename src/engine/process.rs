//! Engine process spawning and control.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Error spawning or probing the engine binary.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The binary does not exist at the given path.
    #[error("engine binary not found: {0}")]
    NotFound(PathBuf),

    /// The binary exists but cannot be executed.
    #[error("engine binary not executable: {0}")]
    PermissionDenied(PathBuf),

    /// Any other I/O failure while launching.
    #[error("failed to launch engine: {0}")]
    Io(#[from] std::io::Error),
}

impl SpawnError {
    fn from_io(err: std::io::Error, binary: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(binary.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(binary.to_path_buf()),
            _ => Self::Io(err),
        }
    }
}

/// Final status of an exited engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitSummary {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitSummary {
    #[must_use]
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short human-readable form for error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exited with code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "exited".to_string(),
        }
    }
}

/// A running engine child process with piped stdio.
#[derive(Debug)]
pub struct EngineProcess {
    child: Child,
    binary: PathBuf,
    spawned_at: DateTime<Utc>,
}

impl EngineProcess {
    /// Spawn the engine binary with the given arguments and environment.
    ///
    /// All three stdio streams are piped. The child is killed if the handle
    /// is dropped before it exits.
    ///
    /// # Errors
    ///
    /// Returns `SpawnError` when the binary is missing, not executable, or
    /// the spawn fails for another I/O reason.
    pub fn spawn(
        binary: &Path,
        args: &[String],
        env: &HashMap<String, String>,
        working_dir: Option<&Path>,
    ) -> Result<Self, SpawnError> {
        let mut command = Command::new(binary);
        command
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|err| SpawnError::from_io(err, binary))?;
        tracing::debug!(
            binary = %binary.display(),
            pid = child.id(),
            "Spawned engine process"
        );

        Ok(Self {
            child,
            binary: binary.to_path_buf(),
            spawned_at: Utc::now(),
        })
    }

    /// OS process id, if the child is still running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Path of the binary this process was spawned from.
    #[must_use]
    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// When the process was spawned.
    #[must_use]
    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    /// Take ownership of the child's stdin pipe. Returns `None` on second call.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take ownership of the child's stdout pipe. Returns `None` on second call.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take ownership of the child's stderr pipe. Returns `None` on second call.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Check whether the process has exited without blocking.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the status cannot be read.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Wait for the process to exit.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if waiting fails.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the process immediately.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the kill signal cannot be sent.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }

    /// Terminate gracefully: SIGTERM, then SIGKILL after `grace` elapses.
    ///
    /// On non-Unix platforms this kills immediately.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the process cannot be killed.
    pub async fn graceful_terminate(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        #[cfg(unix)]
        {
            self.graceful_terminate_unix(grace).await
        }
        #[cfg(not(unix))]
        {
            self.child.kill().await?;
            self.child.wait().await
        }
    }

    #[cfg(unix)]
    async fn graceful_terminate_unix(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = self.child.id() {
            let nix_pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
            // The process may already be gone; a failed SIGTERM is not fatal.
            let _ = kill(nix_pid, Signal::SIGTERM);

            if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                return status;
            }
            tracing::warn!(pid, "Engine ignored SIGTERM, killing");
        }
        self.child.kill().await?;
        self.child.wait().await
    }
}

/// Run `binary --version` and capture its trimmed stdout.
///
/// # Errors
///
/// Returns `SpawnError` when the binary cannot be launched or the probe
/// exits unsuccessfully.
pub async fn probe_version(binary: &Path) -> Result<String, SpawnError> {
    let output = Command::new(binary)
        .arg("--version")
        .output()
        .await
        .map_err(|err| SpawnError::from_io(err, binary))?;
    if !output.status.success() {
        return Err(SpawnError::Io(std::io::Error::other(format!(
            "version probe {}",
            ExitSummary::from_status(output.status).describe()
        ))));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}
