//! Domain models consumed by the execution engine.
//!
//! These are the workflow, dataset and job records that are owned by the
//! surrounding platform. The engine only reads them, with the exception of
//! the job status/log and the dataset image list which it writes back at the
//! end of each task or job.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use serde::Deserialize;
use serde::Serialize;
use sqlx::FromRow;
use sqlx::Type as SqlxType;
use sqlx::types::Json;

/// A JSON object, as used for task arguments and task parameters.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// The type of a workflow task.
///
/// The type determines which commands of a task are run and how the images of
/// a dataset are distributed over the invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum TaskType {
    /// One invocation per image.
    Parallel,
    /// One invocation over the full list of images.
    NonParallel,
    /// An initialization invocation over the full list of images followed by
    /// one invocation per item of its parallelization list.
    Compound,
    /// One invocation that creates images; no image list exists yet.
    ConverterNonParallel,
    /// A compound task whose initialization step creates images.
    ConverterCompound,
}

impl TaskType {
    /// Returns `true` if the task type creates images rather than consuming
    /// them.
    pub fn is_converter(&self) -> bool {
        matches!(self, Self::ConverterNonParallel | Self::ConverterCompound)
    }

    /// Returns `true` if the task type has a parallel component.
    pub fn has_parallel_component(&self) -> bool {
        matches!(
            self,
            Self::Parallel | Self::Compound | Self::ConverterCompound
        )
    }

    /// Returns `true` if the task type has a non-parallel component.
    pub fn has_non_parallel_component(&self) -> bool {
        !matches!(self, Self::Parallel)
    }

    /// Gets the string representation of the task type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parallel => "parallel",
            Self::NonParallel => "non_parallel",
            Self::Compound => "compound",
            Self::ConverterNonParallel => "converter_non_parallel",
            Self::ConverterCompound => "converter_compound",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "non_parallel" => Ok(Self::NonParallel),
            "compound" => Ok(Self::Compound),
            "converter_non_parallel" => Ok(Self::ConverterNonParallel),
            "converter_compound" => Ok(Self::ConverterCompound),
            _ => Err(format!("invalid task type: {s}")),
        }
    }
}

/// Per-component resource hints of a workflow task.
///
/// Every field is optional; unset fields fall back to the backend
/// configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct TaskMeta {
    /// The number of CPUs requested by a single invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus_per_task: Option<u64>,
    /// The memory, in MiB, requested by a single invocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mem_per_task_mb: Option<u64>,
    /// Whether an invocation needs a GPU.
    pub needs_gpu: bool,
    /// The SLURM partition to submit to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    /// Override of the number of invocations per SLURM job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tasks_per_job: Option<usize>,
    /// Override of the number of concurrent invocations per job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tasks_per_job: Option<usize>,
    /// Additional `#SBATCH` lines for the submission script.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_lines: Vec<String>,
}

/// A single step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowTask {
    /// Unique identifier.
    pub id: i64,
    /// The workflow this task belongs to.
    pub workflow_id: i64,
    /// The position of the task within its workflow.
    #[sqlx(rename = "task_order")]
    pub order: i64,
    /// The name of the underlying task.
    pub task_name: String,
    /// The type of the task.
    pub task_type: TaskType,
    /// The command line of the non-parallel component.
    pub command_non_parallel: Option<String>,
    /// The command line of the parallel component.
    pub command_parallel: Option<String>,
    /// The arguments of the non-parallel component.
    pub args_non_parallel: Json<JsonMap>,
    /// The arguments of the parallel component.
    pub args_parallel: Json<JsonMap>,
    /// The resource hints of the non-parallel component.
    pub meta_non_parallel: Json<TaskMeta>,
    /// The resource hints of the parallel component.
    pub meta_parallel: Json<TaskMeta>,
    /// The image types an input image must (or must not) have.
    pub type_filters: Json<IndexMap<String, bool>>,
}

/// A new workflow task to insert.
#[derive(Debug, Clone)]
pub struct NewWorkflowTask {
    /// The workflow the task belongs to.
    pub workflow_id: i64,
    /// The position of the task within its workflow.
    pub order: i64,
    /// The name of the underlying task.
    pub task_name: String,
    /// The type of the task.
    pub task_type: TaskType,
    /// The command line of the non-parallel component.
    pub command_non_parallel: Option<String>,
    /// The command line of the parallel component.
    pub command_parallel: Option<String>,
    /// The arguments of the non-parallel component.
    pub args_non_parallel: JsonMap,
    /// The arguments of the parallel component.
    pub args_parallel: JsonMap,
    /// The resource hints of the non-parallel component.
    pub meta_non_parallel: TaskMeta,
    /// The resource hints of the parallel component.
    pub meta_parallel: TaskMeta,
    /// The image types an input image must (or must not) have.
    pub type_filters: IndexMap<String, bool>,
}

impl NewWorkflowTask {
    /// Creates a new workflow task with no commands, arguments or filters.
    pub fn new(
        workflow_id: i64,
        order: i64,
        task_name: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            workflow_id,
            order,
            task_name: task_name.into(),
            task_type,
            command_non_parallel: None,
            command_parallel: None,
            args_non_parallel: Default::default(),
            args_parallel: Default::default(),
            meta_non_parallel: Default::default(),
            meta_parallel: Default::default(),
            type_filters: Default::default(),
        }
    }
}

/// An image of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SingleImage {
    /// The unique URL of the image.
    pub zarr_url: String,
    /// The URL of the image this image was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    /// Scalar attributes of the image.
    #[serde(default)]
    pub attributes: IndexMap<String, serde_json::Value>,
    /// Boolean types of the image.
    #[serde(default)]
    pub types: IndexMap<String, bool>,
}

impl SingleImage {
    /// Creates a new image with no origin, attributes or types.
    pub fn new(zarr_url: impl Into<String>) -> Self {
        Self {
            zarr_url: zarr_url.into(),
            origin: None,
            attributes: Default::default(),
            types: Default::default(),
        }
    }
}

/// A dataset: a directory of images and the list describing them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Dataset {
    /// Unique identifier.
    pub id: i64,
    /// The name of the dataset.
    pub name: String,
    /// The directory under which every image of the dataset lives.
    pub zarr_dir: String,
    /// The images of the dataset.
    pub images: Json<Vec<SingleImage>>,
}

/// The status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    /// The job was submitted and is running.
    Submitted,
    /// The job completed successfully.
    Done,
    /// The job failed.
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One execution attempt of a range of workflow tasks against a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Unique identifier.
    pub id: i64,
    /// The dataset the job runs against.
    pub dataset_id: i64,
    /// The workflow the job runs.
    pub workflow_id: i64,
    /// The status of the job.
    pub status: JobStatus,
    /// The local working directory of the job.
    pub working_dir: String,
    /// The working directory of the job as seen by the SLURM user.
    pub working_dir_user: Option<String>,
    /// The user SLURM jobs are submitted as.
    pub slurm_user: Option<String>,
    /// The index of the first workflow task to run.
    pub first_task_index: i64,
    /// The index of the last workflow task to run (inclusive).
    pub last_task_index: i64,
    /// The log of the job; set when the job reaches a terminal state.
    pub log: Option<String>,
    /// When the job was submitted.
    pub start_timestamp: DateTime<Utc>,
    /// When the job reached a terminal state.
    pub end_timestamp: Option<DateTime<Utc>>,
}

/// A new job to insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// The dataset the job runs against.
    pub dataset_id: i64,
    /// The workflow the job runs.
    pub workflow_id: i64,
    /// The local working directory of the job.
    pub working_dir: String,
    /// The working directory of the job as seen by the SLURM user.
    pub working_dir_user: Option<String>,
    /// The user SLURM jobs are submitted as.
    pub slurm_user: Option<String>,
    /// The index of the first workflow task to run.
    pub first_task_index: i64,
    /// The index of the last workflow task to run (inclusive).
    pub last_task_index: i64,
}
