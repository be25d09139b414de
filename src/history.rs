//! The history tracking store.
//!
//! Every backend records the outcome of the work it runs here. Two write
//! paths are shared across concurrent task executions:
//!
//! * [`Database::modify_history_unit`] updates a single history unit under a
//!   row-level lock that spans the whole read-mutate-write-commit sequence.
//! * [`Database::upsert_image_cache`] writes image cache rows with an
//!   insert-or-update-on-conflict statement, in independently committed
//!   chunks.
//!
//! The store also exposes the job, dataset and workflow task accessors the
//! orchestrator needs.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Dataset;
use crate::models::Job;
use crate::models::JobStatus;
use crate::models::NewJob;
use crate::models::NewWorkflowTask;
use crate::models::SingleImage;
use crate::models::WorkflowTask;

pub mod models;
pub mod sqlite;

pub use models::HistoryImageCache;
pub use models::HistoryRun;
pub use models::HistoryStatus;
pub use models::HistoryUnit;
pub use models::ImageStatus;
pub use models::NewHistoryUnit;
pub use models::StatusSummary;
pub use sqlite::SqliteDatabase;

/// The default number of image cache rows written per upsert statement.
pub const DEFAULT_UPSERT_CHUNK_SIZE: usize = 2000;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A database error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// A migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A referenced row does not exist.
    #[error("{entity} {id} does not exist")]
    NotFound {
        /// The kind of the missing row.
        entity: &'static str,
        /// The identifier of the missing row.
        id: i64,
    },

    /// A validation error.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// A mutation applied to a history unit while its row is locked.
pub type UnitModifier = Box<dyn FnOnce(&mut HistoryUnit) + Send>;

/// A database trait containing the operations of the execution engine.
#[async_trait]
pub trait Database: Send + Sync + std::fmt::Debug {
    /// Creates a new dataset.
    async fn create_dataset(
        &self,
        name: &str,
        zarr_dir: &str,
        images: &[SingleImage],
    ) -> Result<Dataset>;

    /// Gets a dataset by ID.
    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>>;

    /// Replaces the image list of a dataset.
    async fn update_dataset_images(&self, id: i64, images: &[SingleImage]) -> Result<()>;

    /// Creates a new workflow task.
    async fn create_workflow_task(&self, task: NewWorkflowTask) -> Result<WorkflowTask>;

    /// Lists the tasks of a workflow in execution order.
    async fn list_workflow_tasks(&self, workflow_id: i64) -> Result<Vec<WorkflowTask>>;

    /// Creates a new job with status `submitted`.
    async fn create_job(&self, job: NewJob) -> Result<Job>;

    /// Gets a job by ID.
    async fn get_job(&self, id: i64) -> Result<Option<Job>>;

    /// Updates the status of a job.
    ///
    /// Terminal statuses also record the end timestamp and the job log.
    async fn update_job_status(&self, id: i64, status: JobStatus, log: Option<&str>)
    -> Result<()>;

    /// Creates a new history run with status `submitted`.
    async fn create_history_run(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
        job_id: i64,
        num_available_images: i64,
    ) -> Result<HistoryRun>;

    /// Gets a history run by ID.
    async fn get_history_run(&self, id: i64) -> Result<Option<HistoryRun>>;

    /// Lists the history runs of a dataset and workflow task, oldest first.
    async fn list_history_runs(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
    ) -> Result<Vec<HistoryRun>>;

    /// Updates the status of a history run.
    async fn update_history_run_status(&self, id: i64, status: HistoryStatus) -> Result<()>;

    /// Deletes a history run along with its units.
    ///
    /// Returns `true` if a run was deleted, `false` if the run was not found.
    async fn delete_history_run(&self, id: i64) -> Result<bool>;

    /// Creates the units of a history run with status `submitted`.
    ///
    /// The units are returned in the order they were given.
    async fn create_history_units(
        &self,
        history_run_id: i64,
        units: Vec<NewHistoryUnit>,
    ) -> Result<Vec<HistoryUnit>>;

    /// Gets a history unit by ID.
    async fn get_history_unit(&self, id: i64) -> Result<Option<HistoryUnit>>;

    /// Lists the units of a history run, in creation order.
    async fn list_history_units(&self, history_run_id: i64) -> Result<Vec<HistoryUnit>>;

    /// Applies a mutation to a history unit under a row-level lock.
    ///
    /// The lock is held from the read until the commit of the update, so
    /// concurrent modifications of the same unit serialize.
    async fn modify_history_unit(&self, id: i64, modify: UnitModifier) -> Result<HistoryUnit>;

    /// Sets the status of a history unit under a row-level lock.
    async fn update_history_unit_status(
        &self,
        id: i64,
        status: HistoryStatus,
    ) -> Result<HistoryUnit> {
        self.modify_history_unit(
            id,
            Box::new(move |unit: &mut HistoryUnit| unit.status = status),
        )
        .await
    }

    /// Sets the status of many history units at once.
    async fn bulk_update_history_unit_status(
        &self,
        ids: &[i64],
        status: HistoryStatus,
    ) -> Result<()>;

    /// Inserts or updates image cache rows.
    ///
    /// Rows are written in chunks, each committed independently; for a key
    /// written more than once the last write wins.
    async fn upsert_image_cache(&self, rows: &[HistoryImageCache]) -> Result<()>;

    /// Gets the image cache row of an image.
    async fn get_image_cache(
        &self,
        zarr_url: &str,
        dataset_id: i64,
        workflowtask_id: i64,
    ) -> Result<Option<HistoryImageCache>>;

    /// Gets the current status of an image for a workflow task.
    async fn image_status(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
        zarr_url: &str,
    ) -> Result<Option<ImageStatus>>;

    /// Lists the current status of every image processed by a workflow task.
    async fn image_statuses(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
    ) -> Result<Vec<ImageStatus>>;

    /// Counts the images of a workflow task per current status.
    async fn status_summary(&self, dataset_id: i64, workflowtask_id: i64)
    -> Result<StatusSummary>;
}
