//! Implementation of the privileged local transport.
//!
//! Commands run on the local host through `sudo` as the user owning the
//! remote job working directory, which lives on a filesystem shared with the
//! SLURM cluster.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::CommandOutput;
use super::Transport;
use super::TransportError;
use super::run_process;
use crate::runner::quote_path;

/// A transport that runs commands locally as an impersonated user.
#[derive(Debug, Clone, Default)]
pub struct SudoTransport {
    /// The impersonated user; commands run as the current user when `None`.
    user: Option<String>,
}

impl SudoTransport {
    /// Creates a transport running commands as the given user.
    pub fn new(user: Option<String>) -> Self {
        Self { user }
    }

    /// Gets the impersonated user.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Builds the process running a shell command.
    fn command(&self, command: &str) -> Command {
        match &self.user {
            Some(user) => {
                let mut sudo = Command::new("sudo");
                sudo.args(["--set-home", "--non-interactive", "-u"])
                    .arg(user)
                    .args(["sh", "-c", command]);
                sudo
            }
            None => {
                let mut sh = Command::new("sh");
                sh.args(["-c", command]);
                sh
            }
        }
    }

    /// Runs a shell command, returning its raw output.
    async fn run(&self, command: &str) -> Result<std::process::Output, TransportError> {
        debug!(user = self.user(), command, "running command");
        run_process(&mut self.command(command), command, None).await
    }
}

#[async_trait]
impl Transport for SudoTransport {
    async fn run_command(&self, command: &str) -> Result<CommandOutput, TransportError> {
        Ok(self.run(command).await?.into())
    }

    async fn create_directory(&self, path: &Path) -> Result<(), TransportError> {
        self.run(&format!("mkdir -p {path}", path = quote_path(path)))
            .await?;
        Ok(())
    }

    async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        // Without a separate working directory for the user both sides are
        // the same file
        if local == remote {
            return Ok(());
        }

        self.run(&format!(
            "cp {local} {remote}",
            local = quote_path(local),
            remote = quote_path(remote)
        ))
        .await?;
        Ok(())
    }

    async fn fetch_file(&self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        // The impersonated user may not be able to write the local directory,
        // so the contents are read through it and written by this process
        if local == remote {
            return Ok(());
        }

        let output = self
            .run(&format!("cat {remote}", remote = quote_path(remote)))
            .await?;
        tokio::fs::write(local, output.stdout).await?;
        Ok(())
    }
}
