//! Implementation of the local runner.
//!
//! Invocations run as `bash` processes on the host, each in its own process
//! group so that terminating an invocation also terminates every process it
//! spawned. A `multisubmit` batch runs in groups of at most
//! `parallel_tasks_per_job` concurrent processes; the groups run one after
//! the other.
//!
//! A background watcher polls the shutdown sentinel of the job working
//! directory. Once shutdown is requested, running process groups are killed
//! and every invocation that did not complete is reported as a shutdown
//! error.

use std::fs::File;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::info;
use tracing::instrument::WithSubscriber;
use tracing::warn;

use super::Invocation;
use super::MultisubmitOutcome;
use super::MultisubmitRequest;
use super::ShutdownSignal;
use super::SubmitRequest;
use super::TaskFiles;
use super::TaskOutcome;
use super::TaskRunner;
use super::create_local_subfolder;
use super::invocation_command;
use super::log_tail;
use super::read_output;
use super::record_outcome;
use super::validation::validate_multisubmit;
use super::validation::validate_submit;
use super::write_parameters;
use crate::config::LocalSettings;
use crate::error::JobExecutionError;
use crate::error::RunnerError;
use crate::history::Database;

/// A process group that is killed when dropped.
#[derive(Debug)]
struct ProcessGroup {
    /// The identifier of the group; `None` once the group was killed.
    pgid: Option<u32>,
}

impl ProcessGroup {
    /// Creates a guard for the process group led by the given process.
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    /// Kills every process of the group.
    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Sends `SIGKILL` to a process group.
#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };

    // SAFETY: `killpg` only sends a signal and has no memory safety
    // requirements
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result != 0 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() != Some(libc::ESRCH) {
            warn!("failed to kill process group {pgid}: {e}");
        }
    } else {
        debug!("killed process group {pgid}");
    }
}

/// Process groups only exist on Unix; the child itself is killed on drop.
#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Represents a task runner that executes invocations as local processes.
///
/// <div class="warning">
/// Warning: the local runner spawns processes on the host directly; only use
/// it with trusted tasks. </div>
#[derive(Debug)]
pub struct LocalRunner {
    /// The history store.
    db: Arc<dyn Database>,
    /// The local backend configuration.
    settings: LocalSettings,
    /// The shutdown signal of the job.
    shutdown: ShutdownSignal,
    /// The shutdown sentinel watcher; taken when the runner shuts down.
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalRunner {
    /// Constructs a new local runner for the given job working directory.
    ///
    /// This spawns the shutdown sentinel watcher and must be called from
    /// within a Tokio runtime.
    pub fn new(db: Arc<dyn Database>, root_dir: impl Into<PathBuf>, settings: LocalSettings) -> Self {
        let root_dir = root_dir.into();
        let shutdown = ShutdownSignal::new(&root_dir);
        let watcher = tokio::spawn(
            Self::watch_sentinel(shutdown.clone(), settings.shutdown_poll_interval())
                .with_current_subscriber(),
        );

        Self {
            db,
            settings,
            shutdown,
            watcher: Mutex::new(Some(watcher)),
        }
    }

    /// Polls the shutdown sentinel until shutdown is requested.
    async fn watch_sentinel(signal: ShutdownSignal, interval: Duration) {
        loop {
            tokio::select! {
                _ = signal.token().cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if signal.is_requested() {
                        break;
                    }
                }
            }
        }

        debug!("shutdown sentinel watcher has exited");
    }

    /// Runs a single invocation to completion or until shutdown is requested.
    async fn run_invocation(
        task_command: String,
        invocation: Invocation,
        signal: ShutdownSignal,
    ) -> TaskOutcome {
        let files = &invocation.files;
        let args_file = files.args_file_local();
        let output_file = files.output_file_local();
        let log_file = files.log_file_local();

        write_parameters(&args_file, &invocation.parameters).map_err(|e| {
            JobExecutionError::new(format!(
                "failed to write task arguments `{path}`: {e}",
                path = args_file.display()
            ))
        })?;

        let (stdout, stderr) = File::create(&log_file)
            .and_then(|log| Ok((log.try_clone()?, log)))
            .map_err(|e| {
                JobExecutionError::new(format!(
                    "failed to create task log `{path}`: {e}",
                    path = log_file.display()
                ))
            })?;

        let mut command = Command::new("bash");
        command
            .arg("-c")
            .arg(invocation_command(&task_command, &args_file, &output_file))
            .current_dir(files.wftask_subfolder_local())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            JobExecutionError::new(format!("failed to spawn `bash` for task invocation: {e}"))
        })?;

        let mut group = ProcessGroup::new(child.id());
        let id = child.id().unwrap_or_default();
        debug!(
            "spawned local `bash` process {id} for invocation {index}",
            index = invocation.index
        );

        let status = tokio::select! {
            _ = signal.token().cancelled() => None,
            status = child.wait() => Some(status),
        };

        let Some(status) = status else {
            group.kill();
            child.wait().await.ok();
            info!(
                "invocation {index} was killed by a shutdown request",
                index = invocation.index
            );
            return Err(JobExecutionError::shutdown().into());
        };

        let status = status.map_err(|e| {
            JobExecutionError::new(format!(
                "failed to wait for termination of task process {id}: {e}"
            ))
        })?;

        // Reap anything the task left running in its group
        group.kill();

        let task_error = |message: String| invocation.task_error(message);

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                warn!("task process {id} has terminated with signal {signal}");
                return Err(task_error(format!(
                    "task process terminated with signal {signal}\n{tail}",
                    tail = log_tail(&log_file)
                )));
            }
        }

        if !status.success() {
            let code = status.code().unwrap_or(-1);
            info!("task process {id} has terminated with status code {code}");
            return Err(task_error(log_tail(&log_file)));
        }

        read_output(&output_file).map_err(task_error)
    }
}

#[async_trait]
impl TaskRunner for LocalRunner {
    async fn submit(&self, request: SubmitRequest) -> Result<TaskOutcome, RunnerError> {
        validate_submit(&request)?;

        let command = request.command.clone();
        let invocation = Invocation::single(request);
        let history_unit_id = invocation.history_unit_id;

        let outcome: TaskOutcome = if self.shutdown.is_requested() {
            Err(JobExecutionError::shutdown().into())
        } else if let Err(e) = create_local_subfolder(&invocation.files) {
            Err(e.into())
        } else {
            Self::run_invocation(command, invocation, self.shutdown.clone()).await
        };

        record_outcome(&self.db, history_unit_id, &outcome).await?;
        Ok(outcome)
    }

    async fn multisubmit(
        &self,
        request: MultisubmitRequest,
    ) -> Result<MultisubmitOutcome, RunnerError> {
        validate_multisubmit(&request)?;

        let total = request.list_parameters.len();
        let parallel = request
            .config
            .parallel_tasks_per_job
            .or(self.settings.parallel_tasks_per_job)
            .unwrap_or(total)
            .max(1);

        let subfolder = create_local_subfolder(&request.list_task_files[0]);
        let mut pending = Invocation::batch(
            request.list_parameters,
            request.list_task_files,
            request.list_history_unit_ids,
        );

        info!("running {total} invocations locally, {parallel} at a time");

        let mut outcome = MultisubmitOutcome::default();
        loop {
            let group: Vec<_> = pending.by_ref().take(parallel).collect();
            if group.is_empty() {
                break;
            }

            let failure = match &subfolder {
                Err(e) => Some(e.clone()),
                Ok(()) if self.shutdown.is_requested() => Some(JobExecutionError::shutdown()),
                Ok(()) => None,
            };

            if let Some(e) = failure {
                for invocation in group {
                    let result: TaskOutcome = Err(e.clone().into());
                    record_outcome(&self.db, invocation.history_unit_id, &result).await?;
                    outcome.insert(invocation.index, result);
                }
                continue;
            }

            let units: Vec<_> = group.iter().map(|i| (i.index, i.history_unit_id)).collect();
            let mut spawned = JoinSet::new();
            for invocation in group {
                let command = request.command.clone();
                let signal = self.shutdown.clone();
                spawned.spawn(
                    async move {
                        let index = invocation.index;
                        let unit = invocation.history_unit_id;
                        (index, unit, Self::run_invocation(command, invocation, signal).await)
                    }
                    .with_current_subscriber(),
                );
            }

            while let Some(joined) = spawned.join_next().await {
                match joined {
                    Ok((index, unit, result)) => {
                        record_outcome(&self.db, unit, &result).await?;
                        outcome.insert(index, result);
                    }
                    Err(e) => warn!("local invocation task failed to complete: {e}"),
                }
            }

            // Invocations whose task panicked have no outcome yet
            for (index, unit) in units {
                if !outcome.results.contains_key(&index) && !outcome.errors.contains_key(&index) {
                    let result: TaskOutcome = Err(JobExecutionError::new(format!(
                        "invocation {index} did not complete"
                    ))
                    .into());
                    record_outcome(&self.db, unit, &result).await?;
                    outcome.insert(index, result);
                }
            }
        }

        Ok(outcome)
    }

    async fn shutdown(&self) {
        self.shutdown.trigger();

        let watcher = match self.watcher.lock() {
            Ok(mut watcher) => watcher.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                warn!("shutdown sentinel watcher failed: {e}");
            }
        }

        debug!("local runner has shut down");
    }
}

impl Drop for LocalRunner {
    fn drop(&mut self) {
        // Lets the watcher exit if the runner was never shut down
        self.shutdown.trigger();
    }
}
