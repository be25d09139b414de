//! Implementation of the SSH transport.
//!
//! The transport drives the OpenSSH client. A control master connection is
//! started on demand and every command is multiplexed over its socket. One
//! command is in flight at a time: callers wait for the session lock for at
//! most the configured lock timeout.
//!
//! Artifacts are moved as compressed archives so that many small files cost a
//! single transfer.

use std::path::Path;
use std::path::PathBuf;
use std::process::Output;
use std::process::Stdio;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_retry2::Retry;
use tokio_retry2::RetryError;
use tokio_retry2::strategy::ExponentialBackoff;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::CommandOutput;
use super::Transport;
use super::TransportError;
use super::capture;
use super::check_status;
use super::run_process;
use crate::config::SshSettings;
use crate::runner::quote_path;

/// The exit status of the OpenSSH client when the connection fails.
const CONNECTION_FAILURE_STATUS: i32 = 255;

/// The number of times starting the control master is retried.
const MASTER_START_RETRIES: usize = 4;

/// The file extension of artifact archives.
const ARCHIVE_EXTENSION: &str = "tar.gz";

/// Distinguishes the control sockets of transports of the same process.
static NEXT_SOCKET: AtomicUsize = AtomicUsize::new(0);

/// The state of the shared session.
#[derive(Debug, Default)]
struct Session {
    /// Whether the control master is believed to be running.
    connected: bool,
}

/// A transport that runs commands through an SSH session.
#[derive(Debug)]
pub struct SshTransport {
    /// The SSH configuration.
    settings: SshSettings,
    /// The path of the control socket.
    control_path: PathBuf,
    /// The session; holding its lock serializes remote commands.
    session: Mutex<Session>,
}

impl SshTransport {
    /// Creates a new SSH transport.
    ///
    /// No connection is made until the first command runs.
    pub fn new(settings: SshSettings) -> Self {
        let control_dir = settings
            .control_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        // Socket paths are limited to about a hundred bytes, so keep the name
        // short
        let control_path = control_dir.join(format!(
            "fr-{pid}-{n}.sock",
            pid = std::process::id(),
            n = NEXT_SOCKET.fetch_add(1, Ordering::SeqCst)
        ));

        Self {
            settings,
            control_path,
            session: Mutex::new(Session::default()),
        }
    }

    /// Gets the path of the control socket.
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Gets the `user@host` destination of the session.
    fn destination(&self) -> String {
        format!(
            "{user}@{host}",
            user = self.settings.user,
            host = self.settings.host
        )
    }

    /// Gets the arguments shared by every `ssh` invocation.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.settings.port.to_string(),
            "-o".to_string(),
            format!(
                "ControlPath={path}",
                path = self.control_path.to_string_lossy()
            ),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!(
                "ConnectTimeout={timeout}",
                timeout = self.settings.connect_timeout
            ),
        ];

        if let Some(key) = &self.settings.key_path {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().into_owned());
        }

        args.push(self.destination());
        args
    }

    /// Makes a single attempt at starting the control master.
    async fn try_start_master(&self) -> Result<(), RetryError<TransportError>> {
        let mut command = Command::new("ssh");
        command
            .args(["-f", "-N", "-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
            .args(self.base_args())
            // The forked master inherits these handles, so they must not be
            // pipes that are waited on
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let timeout = Duration::from_secs(self.settings.connect_timeout.saturating_add(5));
        let status = match tokio::time::timeout(timeout, command.status()).await {
            Ok(Ok(status)) => status,
            // If the system can't spawn the client, retrying will not help
            Ok(Err(e)) => return Err(RetryError::permanent(e.into())),
            Err(_) => {
                return Err(RetryError::transient(TransportError::Timeout {
                    command: "ssh -M".to_string(),
                    timeout,
                }));
            }
        };

        if status.success() {
            Ok(())
        } else {
            Err(RetryError::transient(TransportError::Connection {
                host: self.settings.host.clone(),
                message: format!("starting the control master failed with {status}"),
            }))
        }
    }

    /// Starts the control master, retrying with exponential backoff.
    async fn start_master(&self) -> Result<(), TransportError> {
        info!(
            host = self.settings.host,
            control_path = %self.control_path.display(),
            "starting SSH control master"
        );

        Retry::spawn_notify(
            ExponentialBackoff::from_millis(200)
                .max_delay_millis(10_000)
                .take(MASTER_START_RETRIES),
            || self.try_start_master(),
            |e: &TransportError, _: Duration| {
                warn!(e = %e, "starting SSH control master failed");
            },
        )
        .await
        .map_err(|e| match e {
            e @ TransportError::Io(_) => e,
            e => TransportError::Connection {
                host: self.settings.host.clone(),
                message: e.to_string(),
            },
        })
    }

    /// Builds the client process running a remote command.
    fn client(&self, remote_command: &str) -> Command {
        let mut command = Command::new("ssh");
        command.args(self.base_args()).arg(remote_command);
        command
    }

    /// Runs a remote command under the session lock.
    ///
    /// `stdin` is the local file fed to the command, if any. A dropped
    /// connection is re-established and the command retried once.
    async fn exec(
        &self,
        remote_command: &str,
        stdin: Option<&Path>,
    ) -> Result<Output, TransportError> {
        let lock_timeout = self.settings.lock_timeout();
        let mut session = tokio::time::timeout(lock_timeout, self.session.lock())
            .await
            .map_err(|_| TransportError::LockTimeout(lock_timeout))?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            if !session.connected {
                self.start_master().await?;
                session.connected = true;
            }

            let mut command = self.client(remote_command);
            if let Some(stdin) = stdin {
                command.stdin(std::fs::File::open(stdin)?);
            }

            let output = capture(
                &mut command,
                remote_command,
                Some(self.settings.command_timeout()),
            )
            .await?;

            if output.status.code() != Some(CONNECTION_FAILURE_STATUS) {
                return check_status(output, remote_command);
            }

            session.connected = false;
            let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if attempts > 1 {
                return Err(TransportError::Connection {
                    host: self.settings.host.clone(),
                    message,
                });
            }

            warn!(
                host = self.settings.host,
                stderr = message,
                "SSH connection dropped; reconnecting"
            );
        }
    }

    /// Gets the path of the archive of a directory, next to the directory.
    fn archive_path(dir: &Path) -> PathBuf {
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifacts".to_string());
        dir.with_file_name(format!("{name}.{ARCHIVE_EXTENSION}"))
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn run_command(&self, command: &str) -> Result<CommandOutput, TransportError> {
        Ok(self.exec(command, None).await?.into())
    }

    async fn create_directory(&self, path: &Path) -> Result<(), TransportError> {
        self.exec(&format!("mkdir -p {path}", path = quote_path(path)), None)
            .await?;
        Ok(())
    }

    async fn send_file(&self, local: &Path, remote: &Path) -> Result<(), TransportError> {
        self.exec(
            &format!("cat > {remote}", remote = quote_path(remote)),
            Some(local),
        )
        .await?;
        Ok(())
    }

    async fn fetch_file(&self, remote: &Path, local: &Path) -> Result<(), TransportError> {
        let output = self
            .exec(&format!("cat {remote}", remote = quote_path(remote)), None)
            .await?;
        tokio::fs::write(local, output.stdout).await?;
        Ok(())
    }

    async fn send_artifacts(
        &self,
        local_dir: &Path,
        remote_dir: &Path,
        files: &[String],
    ) -> Result<(), TransportError> {
        if files.is_empty() {
            return Ok(());
        }

        let local_archive = Self::archive_path(local_dir);
        let remote_archive = Self::archive_path(remote_dir);

        let mut tar = Command::new("tar");
        tar.arg("-czf")
            .arg(&local_archive)
            .arg("-C")
            .arg(local_dir)
            .arg("--")
            .args(files);
        run_process(&mut tar, "tar -czf", None).await?;

        let result = async {
            self.send_file(&local_archive, &remote_archive).await?;
            self.exec(
                &format!(
                    "tar -xzf {archive} -C {dir} && rm -f {archive}",
                    archive = quote_path(&remote_archive),
                    dir = quote_path(remote_dir)
                ),
                None,
            )
            .await
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&local_archive).await {
            debug!("failed to remove `{path}`: {e}", path = local_archive.display());
        }

        result.map(|_| ())
    }

    async fn fetch_artifacts(
        &self,
        remote_dir: &Path,
        local_dir: &Path,
        _files: &[String],
    ) -> Result<(), TransportError> {
        // The whole subfolder is archived; files that were never written are
        // simply absent from the archive
        let (Some(remote_parent), Some(local_parent), Some(name)) =
            (remote_dir.parent(), local_dir.parent(), remote_dir.file_name())
        else {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot archive directory `{dir}`",
                    dir = remote_dir.display()
                ),
            )));
        };

        let remote_archive = Self::archive_path(remote_dir);
        let local_archive = Self::archive_path(local_dir);

        self.exec(
            &format!(
                "tar -czf {archive} -C {parent} {name}",
                archive = quote_path(&remote_archive),
                parent = quote_path(remote_parent),
                name = quote_path(Path::new(name))
            ),
            None,
        )
        .await?;

        self.fetch_file(&remote_archive, &local_archive).await?;

        let mut tar = Command::new("tar");
        tar.arg("-xzf")
            .arg(&local_archive)
            .arg("-C")
            .arg(local_parent);
        let extracted = run_process(&mut tar, "tar -xzf", None).await;

        if let Err(e) = tokio::fs::remove_file(&local_archive).await {
            debug!("failed to remove `{path}`: {e}", path = local_archive.display());
        }

        if let Err(e) = self
            .exec(
                &format!("rm -f {archive}", archive = quote_path(&remote_archive)),
                None,
            )
            .await
        {
            warn!("failed to remove remote archive: {e}");
        }

        extracted.map(|_| ())
    }

    async fn close(&self) {
        let mut session = self.session.lock().await;
        if !session.connected {
            return;
        }

        let mut command = Command::new("ssh");
        command
            .args(["-O", "exit", "-o"])
            .arg(format!(
                "ControlPath={path}",
                path = self.control_path.to_string_lossy()
            ))
            .arg(self.destination());

        match capture(&mut command, "ssh -O exit", Some(self.settings.command_timeout())).await {
            Ok(output) if output.status.success() => debug!("SSH control master has exited"),
            Ok(output) => warn!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "failed to stop SSH control master"
            ),
            Err(e) => warn!("failed to stop SSH control master: {e}"),
        }

        session.connected = false;
    }
}
