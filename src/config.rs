//! Implementation of the engine configuration.
//!
//! The configuration is read from a TOML file with one table per concern:
//!
//! ```toml
//! [backend]
//! type = "slurm_ssh"
//!
//! [slurm]
//! partition = "main"
//! mem_per_task = "8 GiB"
//! remote_root = "/scratch/fractal"
//!
//! [slurm.batching]
//! target_cpus_per_job = 16
//!
//! [ssh]
//! host = "login.cluster.example.org"
//! user = "fractal"
//! ```

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use bytesize::ByteSize;
use serde::Deserialize;
use serde::Serialize;

use crate::history::DEFAULT_UPSERT_CHUNK_SIZE;

/// The default SLURM poll interval, in seconds.
const DEFAULT_POLL_INTERVAL: f64 = 5.0;

/// The default number of consecutive recoverable poll failures tolerated.
const DEFAULT_MAX_POLL_FAILURES: u32 = 5;

/// The default shutdown sentinel poll interval of the local backend, in
/// seconds.
const DEFAULT_SHUTDOWN_POLL_INTERVAL: f64 = 1.0;

/// Gets the default value for the SLURM `poll_interval` field.
const fn poll_interval_default() -> f64 {
    DEFAULT_POLL_INTERVAL
}

/// Gets the default value for the SLURM `max_poll_failures` field.
const fn max_poll_failures_default() -> u32 {
    DEFAULT_MAX_POLL_FAILURES
}

/// Gets the default value for the local `shutdown_poll_interval` field.
const fn shutdown_poll_interval_default() -> f64 {
    DEFAULT_SHUTDOWN_POLL_INTERVAL
}

/// Gets the default value for the SLURM `cpus_per_task` field.
const fn cpus_per_task_default() -> u64 {
    1
}

/// Gets the default value for the SLURM `mem_per_task` field.
const fn mem_per_task_default() -> ByteSize {
    ByteSize::gib(4)
}

/// Gets the default value for the `target_cpus_per_job` field.
const fn target_cpus_per_job_default() -> u64 {
    16
}

/// Gets the default value for the `max_cpus_per_job` field.
const fn max_cpus_per_job_default() -> u64 {
    64
}

/// Gets the default value for the `target_mem_per_job` field.
const fn target_mem_per_job_default() -> ByteSize {
    ByteSize::gib(32)
}

/// Gets the default value for the `max_mem_per_job` field.
const fn max_mem_per_job_default() -> ByteSize {
    ByteSize::gib(128)
}

/// Gets the default value for the `target_num_jobs` field.
const fn target_num_jobs_default() -> usize {
    50
}

/// Gets the default value for the `max_num_jobs` field.
const fn max_num_jobs_default() -> usize {
    100
}

/// Gets the default value for the SSH `port` field.
const fn port_default() -> u16 {
    22
}

/// Gets the default value for the SSH `lock_timeout` field.
const fn lock_timeout_default() -> f64 {
    250.0
}

/// Gets the default value for the SSH `command_timeout` field.
const fn command_timeout_default() -> f64 {
    600.0
}

/// Gets the default value for the SSH `connect_timeout` field.
const fn connect_timeout_default() -> u64 {
    10
}

/// Gets the default value for the history `upsert_chunk_size` field.
const fn upsert_chunk_size_default() -> usize {
    DEFAULT_UPSERT_CHUNK_SIZE
}

/// Converts a byte size into whole mebibytes, rounding up.
pub fn to_mebibytes(size: ByteSize) -> u64 {
    size.as_u64().div_ceil(bytesize::MIB)
}

/// Checks that a configured number of seconds is usable as a duration.
fn validate_seconds(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        bail!("configuration value `{name}` must be a positive number of seconds");
    }

    Ok(())
}

/// Represents the engine configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Settings {
    /// The task execution backend to use.
    #[serde(default)]
    pub backend: BackendSettings,
    /// Local backend configuration.
    #[serde(default)]
    pub local: LocalSettings,
    /// SLURM configuration shared by both SLURM backends.
    #[serde(default)]
    pub slurm: SlurmSettings,
    /// SSH configuration; required by the `slurm_ssh` backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshSettings>,
    /// History store configuration.
    #[serde(default)]
    pub history: HistorySettings,
}

impl Settings {
    /// Reads and validates the configuration from a TOML file.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).with_context(|| {
            format!(
                "failed to read configuration file `{path}`",
                path = path.display()
            )
        })?;

        let settings: Self = toml::from_str(&contents).with_context(|| {
            format!(
                "failed to parse configuration file `{path}`",
                path = path.display()
            )
        })?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.local.validate()?;
        self.slurm.validate()?;
        self.history.validate()?;

        match self.backend {
            BackendSettings::Local => {}
            BackendSettings::SlurmSudo => {}
            BackendSettings::SlurmSsh => {
                let Some(ssh) = &self.ssh else {
                    bail!("the `slurm_ssh` backend requires an `ssh` configuration section");
                };

                ssh.validate()?;

                if self.slurm.remote_root.is_none() {
                    bail!("the `slurm_ssh` backend requires the `slurm.remote_root` value");
                }
            }
        }

        Ok(())
    }
}

/// Represents the kind of task execution backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackendSettings {
    /// Run tasks as local processes.
    #[default]
    Local,
    /// Submit SLURM jobs as an impersonated local user.
    SlurmSudo,
    /// Submit SLURM jobs through an SSH session.
    SlurmSsh,
}

/// Represents configuration for the local backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct LocalSettings {
    /// The number of concurrent worker processes of a batch.
    ///
    /// Defaults to running every invocation of a batch at once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_tasks_per_job: Option<usize>,
    /// How often, in seconds, the shutdown sentinel is checked.
    #[serde(default = "shutdown_poll_interval_default")]
    pub shutdown_poll_interval: f64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            parallel_tasks_per_job: None,
            shutdown_poll_interval: DEFAULT_SHUTDOWN_POLL_INTERVAL,
        }
    }
}

impl LocalSettings {
    /// Validates the local backend configuration.
    pub fn validate(&self) -> Result<()> {
        if self.parallel_tasks_per_job == Some(0) {
            bail!("configuration value `local.parallel_tasks_per_job` cannot be zero");
        }

        validate_seconds("local.shutdown_poll_interval", self.shutdown_poll_interval)
    }

    /// Gets the shutdown sentinel poll interval.
    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_poll_interval)
    }
}

/// Represents the GPU-specific SLURM configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SlurmGpuSettings {
    /// The partition GPU tasks are submitted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// The generic resources requested by GPU tasks (e.g. `gpu:1`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gres: Option<String>,
    /// The node constraint of GPU tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
}

/// Represents the batching targets and ceilings of SLURM jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct BatchingSettings {
    /// The number of CPUs a job should aim for.
    #[serde(default = "target_cpus_per_job_default")]
    pub target_cpus_per_job: u64,
    /// The maximum number of CPUs of a job.
    #[serde(default = "max_cpus_per_job_default")]
    pub max_cpus_per_job: u64,
    /// The memory a job should aim for.
    #[serde(default = "target_mem_per_job_default")]
    pub target_mem_per_job: ByteSize,
    /// The maximum memory of a job.
    #[serde(default = "max_mem_per_job_default")]
    pub max_mem_per_job: ByteSize,
    /// The number of jobs a call should aim for.
    #[serde(default = "target_num_jobs_default")]
    pub target_num_jobs: usize,
    /// The maximum number of jobs of a call.
    #[serde(default = "max_num_jobs_default")]
    pub max_num_jobs: usize,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            target_cpus_per_job: target_cpus_per_job_default(),
            max_cpus_per_job: max_cpus_per_job_default(),
            target_mem_per_job: target_mem_per_job_default(),
            max_mem_per_job: max_mem_per_job_default(),
            target_num_jobs: target_num_jobs_default(),
            max_num_jobs: max_num_jobs_default(),
        }
    }
}

impl BatchingSettings {
    /// Validates the batching configuration.
    pub fn validate(&self) -> Result<()> {
        if self.max_cpus_per_job == 0 || self.target_cpus_per_job == 0 {
            bail!("SLURM batching CPU values cannot be zero");
        }

        if self.target_cpus_per_job > self.max_cpus_per_job {
            bail!(
                "configuration value `slurm.batching.target_cpus_per_job` ({target}) cannot \
                 exceed `slurm.batching.max_cpus_per_job` ({max})",
                target = self.target_cpus_per_job,
                max = self.max_cpus_per_job
            );
        }

        if self.max_mem_per_job.as_u64() == 0 || self.target_mem_per_job.as_u64() == 0 {
            bail!("SLURM batching memory values cannot be zero");
        }

        if self.target_mem_per_job > self.max_mem_per_job {
            bail!(
                "configuration value `slurm.batching.target_mem_per_job` ({target}) cannot \
                 exceed `slurm.batching.max_mem_per_job` ({max})",
                target = self.target_mem_per_job,
                max = self.max_mem_per_job
            );
        }

        if self.max_num_jobs == 0 || self.target_num_jobs == 0 {
            bail!("SLURM batching job counts cannot be zero");
        }

        if self.target_num_jobs > self.max_num_jobs {
            bail!(
                "configuration value `slurm.batching.target_num_jobs` ({target}) cannot exceed \
                 `slurm.batching.max_num_jobs` ({max})",
                target = self.target_num_jobs,
                max = self.max_num_jobs
            );
        }

        Ok(())
    }
}

/// Represents the SLURM configuration shared by both SLURM backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SlurmSettings {
    /// The default partition jobs are submitted to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// The account jobs are charged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<String>,
    /// The default number of CPUs of a single invocation.
    #[serde(default = "cpus_per_task_default")]
    pub cpus_per_task: u64,
    /// The default memory of a single invocation.
    #[serde(default = "mem_per_task_default")]
    pub mem_per_task: ByteSize,
    /// The time limit of a job, in any format accepted by `sbatch --time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    /// GPU configuration.
    #[serde(default)]
    pub gpu: SlurmGpuSettings,
    /// Batching targets and ceilings.
    #[serde(default)]
    pub batching: BatchingSettings,
    /// How often, in seconds, the scheduler is polled.
    #[serde(default = "poll_interval_default")]
    pub poll_interval: f64,
    /// The number of consecutive recoverable poll failures tolerated before
    /// the tracked jobs are abandoned.
    #[serde(default = "max_poll_failures_default")]
    pub max_poll_failures: u32,
    /// Additional `#SBATCH` lines added to every submission script.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_lines: Vec<String>,
    /// Shell lines run before the task steps (e.g. environment activation).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub worker_init: Vec<String>,
    /// The remote directory under which job working directories are created.
    ///
    /// Required by the `slurm_ssh` backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_root: Option<PathBuf>,
    /// The user jobs are submitted as when the job does not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sudo_user: Option<String>,
}

impl Default for SlurmSettings {
    fn default() -> Self {
        Self {
            partition: None,
            account: None,
            cpus_per_task: cpus_per_task_default(),
            mem_per_task: mem_per_task_default(),
            time: None,
            gpu: Default::default(),
            batching: Default::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
            extra_lines: Default::default(),
            worker_init: Default::default(),
            remote_root: None,
            sudo_user: None,
        }
    }
}

impl SlurmSettings {
    /// Validates the SLURM configuration.
    pub fn validate(&self) -> Result<()> {
        if self.cpus_per_task == 0 {
            bail!("configuration value `slurm.cpus_per_task` cannot be zero");
        }

        if self.mem_per_task.as_u64() == 0 {
            bail!("configuration value `slurm.mem_per_task` cannot be zero");
        }

        validate_seconds("slurm.poll_interval", self.poll_interval)?;

        for line in &self.extra_lines {
            if !line.starts_with("#SBATCH") {
                bail!("SLURM extra line `{line}` must start with `#SBATCH`");
            }
        }

        self.batching.validate()
    }

    /// Gets the scheduler poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }
}

/// Represents configuration for the SSH session of the `slurm_ssh` backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SshSettings {
    /// The host of the cluster login node.
    pub host: String,
    /// The remote user.
    pub user: String,
    /// The SSH port.
    #[serde(default = "port_default")]
    pub port: u16,
    /// The private key used to authenticate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    /// How long, in seconds, a caller waits for the session lock.
    #[serde(default = "lock_timeout_default")]
    pub lock_timeout: f64,
    /// How long, in seconds, a remote command may run.
    #[serde(default = "command_timeout_default")]
    pub command_timeout: f64,
    /// How long, in seconds, establishing a connection may take.
    #[serde(default = "connect_timeout_default")]
    pub connect_timeout: u64,
    /// The directory holding the control socket of the session.
    ///
    /// Defaults to the system temporary directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_dir: Option<PathBuf>,
}

impl SshSettings {
    /// Creates SSH settings for the given host and user with default values.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: port_default(),
            key_path: None,
            lock_timeout: lock_timeout_default(),
            command_timeout: command_timeout_default(),
            connect_timeout: connect_timeout_default(),
            control_dir: None,
        }
    }

    /// Validates the SSH configuration.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("configuration value `ssh.host` cannot be empty");
        }

        if self.user.is_empty() {
            bail!("configuration value `ssh.user` cannot be empty");
        }

        validate_seconds("ssh.lock_timeout", self.lock_timeout)?;
        validate_seconds("ssh.command_timeout", self.command_timeout)
    }

    /// Gets the session lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.lock_timeout)
    }

    /// Gets the remote command timeout.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.command_timeout)
    }
}

/// Represents configuration for the history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct HistorySettings {
    /// The number of image cache rows written per upsert statement.
    #[serde(default = "upsert_chunk_size_default")]
    pub upsert_chunk_size: usize,
}

impl Default for HistorySettings {
    fn default() -> Self {
        Self {
            upsert_chunk_size: DEFAULT_UPSERT_CHUNK_SIZE,
        }
    }
}

impl HistorySettings {
    /// Validates the history store configuration.
    pub fn validate(&self) -> Result<()> {
        if self.upsert_chunk_size == 0 {
            bail!("configuration value `history.upsert_chunk_size` cannot be zero");
        }

        Ok(())
    }
}
