//! Error types shared by the task runners and the orchestrator.

use thiserror::Error;

use crate::history::DatabaseError;

/// The substring every shutdown-induced [`JobExecutionError`] carries.
pub const SHUTDOWN_ERROR_MESSAGE: &str = "job execution was interrupted by a shutdown request";

/// A malformed task runner call.
///
/// Validation errors are raised before any process or SLURM job is created.
#[derive(Debug, Clone, Error)]
#[error("invalid task runner call: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    /// Creates a new validation error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A batching or resource configuration that violates a hard ceiling of the
/// SLURM configuration.
#[derive(Debug, Clone, Error)]
#[error("invalid SLURM configuration: {0}")]
pub struct SlurmConfigError(pub String);

impl SlurmConfigError {
    /// Creates a new SLURM configuration error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A failure of the task's own code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task `{task_name}` (workflow task order {workflow_task_order}) failed: {message}")]
pub struct TaskExecutionError {
    /// The name of the failing task.
    pub task_name: String,
    /// The order of the failing workflow task.
    pub workflow_task_order: i64,
    /// The error message, usually the tail of the task log.
    pub message: String,
}

/// An infrastructure failure: transport, scheduler rejection or an
/// interruption by a shutdown request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{info}")]
pub struct JobExecutionError {
    /// A description of the failure.
    pub info: String,
    /// The captured standard error excerpt, if any.
    pub stderr: Option<String>,
}

impl JobExecutionError {
    /// Creates a new job execution error.
    pub fn new(info: impl Into<String>) -> Self {
        Self {
            info: info.into(),
            stderr: None,
        }
    }

    /// Creates the error reported for work interrupted by a shutdown request.
    pub fn shutdown() -> Self {
        Self::new(SHUTDOWN_ERROR_MESSAGE)
    }

    /// Attaches a captured standard error excerpt.
    pub fn with_stderr(mut self, stderr: impl Into<String>) -> Self {
        self.stderr = Some(stderr.into());
        self
    }

    /// Returns `true` if the error was caused by a shutdown request.
    pub fn is_shutdown(&self) -> bool {
        self.info.contains("shutdown")
    }

    /// Formats the error along with its standard error excerpt.
    pub fn details(&self) -> String {
        match &self.stderr {
            Some(stderr) if !stderr.is_empty() => format!("{}\n{stderr}", self.info),
            _ => self.info.clone(),
        }
    }
}

/// An execution failure captured for a single task invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    /// The task itself failed.
    #[error(transparent)]
    Task(#[from] TaskExecutionError),
    /// The infrastructure running the task failed.
    #[error(transparent)]
    Job(#[from] JobExecutionError),
}

impl ExecutionError {
    /// Returns `true` if the error was caused by a shutdown request.
    pub fn is_shutdown(&self) -> bool {
        match self {
            Self::Task(_) => false,
            Self::Job(e) => e.is_shutdown(),
        }
    }
}

/// An error raised synchronously by a task runner call.
///
/// Failures of individual invocations are never reported through this type;
/// they are returned as [`ExecutionError`] values.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The call was malformed.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The resource configuration violates a hard ceiling.
    #[error(transparent)]
    SlurmConfig(#[from] SlurmConfigError),
    /// Recording a unit status failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}
