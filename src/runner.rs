//! Implementation of task runners.
//!
//! A task runner executes the invocations of workflow tasks on a backend and
//! records the outcome of every invocation in its history unit. Three
//! runners exist:
//!
//! * [`LocalRunner`] runs invocations as local processes.
//! * [`SudoSlurmRunner`] submits SLURM jobs as an impersonated local user.
//! * [`SshSlurmRunner`] submits SLURM jobs through an SSH session.
//!
//! A runner is an owned resource: it is constructed for one orchestrator run
//! and [`TaskRunner::shutdown`] is called when that run ends.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ExecutionError;
use crate::error::JobExecutionError;
use crate::error::RunnerError;
use crate::error::TaskExecutionError;
use crate::history::Database;
use crate::history::HistoryStatus;
use crate::models::JsonMap;
use crate::models::TaskMeta;
use crate::models::TaskType;

pub mod batching;
pub mod files;
pub mod local;
pub mod slurm;
pub mod validation;

pub use files::TaskFiles;
pub use local::LocalRunner;
pub use slurm::SlurmRunner;
pub use slurm::SshSlurmRunner;
pub use slurm::SudoSlurmRunner;

/// The name of the shutdown sentinel file of a job working directory.
pub const SHUTDOWN_FILE_NAME: &str = "SHUTDOWN";

/// The number of trailing log lines reported for a failed invocation.
const LOG_TAIL_LINES: usize = 20;

/// The outcome of a single invocation: its output, or the captured failure.
///
/// An invocation that writes no output file succeeds with `null`.
pub type TaskOutcome = Result<JsonValue, ExecutionError>;

/// A request to run a single invocation.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// The command line of the task.
    pub command: String,
    /// The parameters passed to the task.
    pub parameters: JsonMap,
    /// The type of the task.
    pub task_type: TaskType,
    /// The history unit recording the invocation.
    pub history_unit_id: i64,
    /// The files of the invocation.
    pub task_files: TaskFiles,
    /// The resource hints of the invocation.
    pub config: TaskMeta,
}

/// A request to run many invocations of the same command.
#[derive(Debug, Clone)]
pub struct MultisubmitRequest {
    /// The command line of the task.
    pub command: String,
    /// The parameters of each invocation.
    pub list_parameters: Vec<JsonMap>,
    /// The type of the task.
    pub task_type: TaskType,
    /// The history unit recording each invocation.
    pub list_history_unit_ids: Vec<i64>,
    /// The files of each invocation.
    pub list_task_files: Vec<TaskFiles>,
    /// The resource hints shared by the invocations.
    pub config: TaskMeta,
}

/// The outcome of a `multisubmit` call, keyed by invocation index.
///
/// Every index of the call appears in exactly one of the two maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultisubmitOutcome {
    /// The outputs of the successful invocations.
    pub results: BTreeMap<usize, JsonValue>,
    /// The failures of the unsuccessful invocations.
    pub errors: BTreeMap<usize, ExecutionError>,
}

impl MultisubmitOutcome {
    /// Records the outcome of an invocation.
    pub fn insert(&mut self, index: usize, outcome: TaskOutcome) {
        match outcome {
            Ok(result) => {
                self.results.insert(index, result);
            }
            Err(e) => {
                self.errors.insert(index, e);
            }
        }
    }
}

/// The capabilities of a task runner.
#[async_trait]
pub trait TaskRunner: Send + Sync + std::fmt::Debug {
    /// Runs a single invocation.
    ///
    /// The history unit of the invocation is marked `done` or `failed` when
    /// the invocation completes. Malformed calls fail before anything runs.
    async fn submit(&self, request: SubmitRequest) -> Result<TaskOutcome, RunnerError>;

    /// Runs many invocations of the same command.
    ///
    /// A failing invocation never affects its siblings: each history unit is
    /// marked `done` or `failed` on its own.
    async fn multisubmit(
        &self,
        request: MultisubmitRequest,
    ) -> Result<MultisubmitOutcome, RunnerError>;

    /// Shuts down the runner.
    ///
    /// In-flight calls return shutdown errors and background tasks are
    /// joined before this returns.
    async fn shutdown(&self);
}

/// A single invocation of a runner call.
#[derive(Debug, Clone)]
pub(crate) struct Invocation {
    /// The index of the invocation within its call.
    pub(crate) index: usize,
    /// The parameters of the invocation.
    pub(crate) parameters: JsonMap,
    /// The files of the invocation.
    pub(crate) files: TaskFiles,
    /// The history unit of the invocation.
    pub(crate) history_unit_id: i64,
}

impl Invocation {
    /// Gets the invocation of a `submit` call.
    pub(crate) fn single(request: SubmitRequest) -> Self {
        Self {
            index: 0,
            parameters: request.parameters,
            files: request.task_files,
            history_unit_id: request.history_unit_id,
        }
    }

    /// Gets the invocations of a `multisubmit` call.
    pub(crate) fn batch(
        list_parameters: Vec<JsonMap>,
        list_task_files: Vec<TaskFiles>,
        list_history_unit_ids: Vec<i64>,
    ) -> impl Iterator<Item = Self> {
        list_parameters
            .into_iter()
            .zip(list_task_files)
            .zip(list_history_unit_ids)
            .enumerate()
            .map(|(index, ((parameters, files), history_unit_id))| Self {
                index,
                parameters,
                files,
                history_unit_id,
            })
    }

    /// Builds the error reported when the task of this invocation fails.
    pub(crate) fn task_error(&self, message: String) -> ExecutionError {
        TaskExecutionError {
            task_name: self.files.task_name.clone(),
            workflow_task_order: self.files.task_order,
            message,
        }
        .into()
    }
}

/// Creates the local subfolder of an invocation.
pub(crate) fn create_local_subfolder(files: &TaskFiles) -> Result<(), JobExecutionError> {
    let subfolder = files.wftask_subfolder_local();
    std::fs::create_dir_all(&subfolder).map_err(|e| {
        JobExecutionError::new(format!(
            "failed to create directory `{path}`: {e}",
            path = subfolder.display()
        ))
    })
}

/// A shutdown signal: an explicit request or the presence of the sentinel
/// file of the job working directory.
#[derive(Debug, Clone)]
pub(crate) struct ShutdownSignal {
    /// The token cancelled once shutdown is requested.
    token: CancellationToken,
    /// The path of the sentinel file.
    sentinel: PathBuf,
}

impl ShutdownSignal {
    /// Creates a new signal for the given job working directory.
    pub(crate) fn new(root_dir: &Path) -> Self {
        Self {
            token: CancellationToken::new(),
            sentinel: files::shutdown_sentinel(root_dir),
        }
    }

    /// Gets the path of the sentinel file.
    pub(crate) fn sentinel(&self) -> &Path {
        &self.sentinel
    }

    /// Gets the cancellation token of the signal.
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Requests shutdown.
    pub(crate) fn trigger(&self) {
        self.token.cancel();
    }

    /// Checks for a shutdown request, triggering the signal when the sentinel
    /// file exists.
    pub(crate) fn is_requested(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }

        if self.sentinel.exists() {
            warn!(
                "shutdown sentinel `{path}` found",
                path = self.sentinel.display()
            );
            self.token.cancel();
            return true;
        }

        false
    }
}

/// Builds the shell command line of an invocation.
pub(crate) fn invocation_command(command: &str, args_file: &Path, output_file: &Path) -> String {
    format!(
        "{command} --args-json {args} --out-json {out}",
        args = quote_path(args_file),
        out = quote_path(output_file)
    )
}

/// Quotes a string for use in a shell command line.
pub(crate) fn quote(s: &str) -> String {
    shlex::try_quote(s)
        .map(|q| q.into_owned())
        .unwrap_or_else(|_| format!("'{s}'"))
}

/// Quotes a path for use in a shell command line.
pub(crate) fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

/// Writes the parameters of an invocation to its arguments file.
pub(crate) fn write_parameters(path: &Path, parameters: &JsonMap) -> std::io::Result<()> {
    let contents = serde_json::to_vec(parameters)?;
    std::fs::write(path, contents)
}

/// Reads the output of an invocation.
///
/// A missing or empty output file is a `null` output.
pub(crate) fn read_output(path: &Path) -> Result<JsonValue, String> {
    match std::fs::read_to_string(path) {
        Ok(contents) if contents.trim().is_empty() => Ok(JsonValue::Null),
        Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
            format!(
                "failed to parse task output `{path}`: {e}",
                path = path.display()
            )
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(JsonValue::Null),
        Err(e) => Err(format!(
            "failed to read task output `{path}`: {e}",
            path = path.display()
        )),
    }
}

/// Reads the last lines of an invocation log.
pub(crate) fn log_tail(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let lines: Vec<_> = contents.lines().collect();
            lines[lines.len().saturating_sub(LOG_TAIL_LINES)..].join("\n")
        }
        Err(_) => format!("log file `{path}` is not available", path = path.display()),
    }
}

/// Records the outcome of an invocation in its history unit.
pub(crate) async fn record_outcome(
    db: &Arc<dyn Database>,
    history_unit_id: i64,
    outcome: &TaskOutcome,
) -> Result<(), RunnerError> {
    let status = match outcome {
        Ok(_) => HistoryStatus::Done,
        Err(_) => HistoryStatus::Failed,
    };

    db.update_history_unit_status(history_unit_id, status)
        .await?;
    Ok(())
}
