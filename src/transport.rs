//! Implementation of the transports used by the SLURM runners.
//!
//! A transport runs shell commands on the host that talks to the SLURM
//! controller and moves files between the local job working directory and
//! the remote one. Two transports exist:
//!
//! * [`SudoTransport`] runs commands locally as an impersonated user.
//! * [`SshTransport`] runs commands through a shared SSH session.

use std::path::Path;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub mod ssh;
pub mod sudo;

pub use ssh::SshTransport;
pub use sudo::SudoTransport;

/// The maximum number of bytes of standard error kept in a command error.
const MAX_STDERR_LEN: usize = 4096;

/// The captured output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The standard output of the command.
    pub stdout: String,
    /// The standard error of the command.
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// An error raised by a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The command ran and exited unsuccessfully.
    #[error("command `{command}` failed with {status}: {stderr}")]
    Command {
        /// The command that failed.
        command: String,
        /// A description of the exit status.
        status: String,
        /// The standard error of the command.
        stderr: String,
    },
    /// The session lock could not be acquired in time.
    #[error("timed out after {0:?} waiting for the transport session lock")]
    LockTimeout(Duration),
    /// The command did not complete in time.
    #[error("command `{command}` timed out after {timeout:?}")]
    Timeout {
        /// The command that timed out.
        command: String,
        /// The timeout that expired.
        timeout: Duration,
    },
    /// The connection to the remote host was lost or could not be made.
    #[error("connection to `{host}` failed: {message}")]
    Connection {
        /// The remote host.
        host: String,
        /// A description of the failure.
        message: String,
    },
    /// A local I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns `true` if retrying the operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout(_) | Self::Timeout { .. } | Self::Connection { .. }
        )
    }

    /// Gets the standard error of a failed command, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Command { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// The capabilities of a transport.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug + 'static {
    /// Runs a shell command on the remote host.
    ///
    /// A non-zero exit status is a [`TransportError::Command`].
    async fn run_command(&self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Creates a directory, and its parents, on the remote host.
    async fn create_directory(&self, path: &Path) -> Result<(), TransportError>;

    /// Copies a local file to the remote host.
    async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), TransportError>;

    /// Copies a remote file to the local host.
    async fn fetch_file(&self, remote: &Path, local: &Path) -> Result<(), TransportError>;

    /// Copies the named files of a local directory to a remote directory.
    async fn send_artifacts(
        &self,
        local_dir: &Path,
        remote_dir: &Path,
        files: &[String],
    ) -> Result<(), TransportError> {
        for file in files {
            self.send_file(&local_dir.join(file), &remote_dir.join(file))
                .await?;
        }

        Ok(())
    }

    /// Copies the named files of a remote directory to a local directory.
    ///
    /// Files that do not exist on the remote host are skipped; callers
    /// detect missing results by their absence locally.
    async fn fetch_artifacts(
        &self,
        remote_dir: &Path,
        local_dir: &Path,
        files: &[String],
    ) -> Result<(), TransportError> {
        for file in files {
            match self
                .fetch_file(&remote_dir.join(file), &local_dir.join(file))
                .await
            {
                Ok(()) => {}
                Err(TransportError::Command { stderr, .. }) => {
                    debug!("skipping remote file `{file}`: {stderr}", stderr = stderr.trim());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Releases the resources of the transport.
    async fn close(&self) {}
}

/// Truncates the standard error of a failed command.
fn truncate_stderr(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.len() <= MAX_STDERR_LEN {
        return stderr.to_string();
    }

    let mut start = stderr.len() - MAX_STDERR_LEN;
    while !stderr.is_char_boundary(start) {
        start += 1;
    }

    format!("...{tail}", tail = &stderr[start..])
}

/// Runs a local process to completion, capturing its output regardless of
/// its exit status.
///
/// `label` names the command in errors and logs. Standard input is closed
/// unless the caller configured it.
pub(crate) async fn capture(
    command: &mut Command,
    label: &str,
    timeout: Option<Duration>,
) -> Result<Output, TransportError> {
    command.kill_on_drop(true);

    debug!(command = label, "spawning transport command");
    let output = command.output();
    match timeout {
        Some(timeout) => Ok(tokio::time::timeout(timeout, output).await.map_err(|_| {
            TransportError::Timeout {
                command: label.to_string(),
                timeout,
            }
        })??),
        None => Ok(output.await?),
    }
}

/// Runs a local process to completion, capturing its output.
///
/// A non-zero exit status is a [`TransportError::Command`].
pub(crate) async fn run_process(
    command: &mut Command,
    label: &str,
    timeout: Option<Duration>,
) -> Result<Output, TransportError> {
    let output = capture(command, label, timeout).await?;
    check_status(output, label)
}

/// Converts an unsuccessful process output into a command error.
pub(crate) fn check_status(output: Output, label: &str) -> Result<Output, TransportError> {
    if output.status.success() {
        return Ok(output);
    }

    let status = match output.status.code() {
        Some(code) => format!("exit status {code}"),
        None => "termination by a signal".to_string(),
    };

    Err(TransportError::Command {
        command: label.to_string(),
        status,
        stderr: truncate_stderr(&output.stderr),
    })
}
