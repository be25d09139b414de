//! SQLite implementation of the history tracking store.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::QueryBuilder;
use sqlx::Sqlite;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqliteSynchronous;
use sqlx::types::Json;
use tracing::debug;

use super::Database;
use super::DatabaseError;
use super::DEFAULT_UPSERT_CHUNK_SIZE;
use super::Result;
use super::UnitModifier;
use super::models::HistoryImageCache;
use super::models::HistoryRun;
use super::models::HistoryStatus;
use super::models::HistoryUnit;
use super::models::ImageStatus;
use super::models::NewHistoryUnit;
use super::models::StatusSummary;
use crate::config::HistorySettings;
use crate::models::Dataset;
use crate::models::Job;
use crate::models::JobStatus;
use crate::models::NewJob;
use crate::models::NewWorkflowTask;
use crate::models::SingleImage;
use crate::models::WorkflowTask;

/// SQLite connection string prefix.
const SQLITE_CONNECTION_PREFIX: &str = "sqlite:";

/// Enable foreign key constraint enforcement for referential integrity.
const SQLITE_FOREIGN_KEYS: &str = "on";

/// Configure 5-second timeout when database is locked to prevent spurious
/// failures.
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// Store temporary tables and indices in memory for faster operations.
const SQLITE_TEMP_STORE: &str = "memory";

/// The columns of the `dataset` table.
const DATASET_COLUMNS: &str = "id, name, zarr_dir, images";

/// The columns of the `workflow_task` table.
const WORKFLOW_TASK_COLUMNS: &str = "id, workflow_id, task_order, task_name, task_type, \
                                     command_non_parallel, command_parallel, args_non_parallel, \
                                     args_parallel, meta_non_parallel, meta_parallel, type_filters";

/// The columns of the `job` table.
const JOB_COLUMNS: &str = "id, dataset_id, workflow_id, status, working_dir, working_dir_user, \
                           slurm_user, first_task_index, last_task_index, log, start_timestamp, \
                           end_timestamp";

/// The columns of the `history_run` table.
const HISTORY_RUN_COLUMNS: &str =
    "id, dataset_id, workflowtask_id, job_id, status, num_available_images, timestamp_started";

/// The columns of the `history_unit` table.
const HISTORY_UNIT_COLUMNS: &str = "id, history_run_id, logfile, status, zarr_urls";

/// SQLite database implementation.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    /// The underlying SQLite connection pool.
    pool: SqlitePool,
    /// The number of image cache rows written per upsert statement.
    upsert_chunk_size: usize,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection from a path.
    ///
    /// Migrations are run upon a successful connection pool being established.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let database_url = format!("{}//{}", SQLITE_CONNECTION_PREFIX, path.display());
        let options = SqliteConnectOptions::from_str(&database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("temp_store", SQLITE_TEMP_STORE)
            .pragma("foreign_keys", SQLITE_FOREIGN_KEYS)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT);

        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Creates a new SQLite connection from an existing pool.
    ///
    /// This method also runs the embedded migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            upsert_chunk_size: DEFAULT_UPSERT_CHUNK_SIZE,
        })
    }

    /// Sets the number of image cache rows written per upsert statement.
    pub fn with_upsert_chunk_size(mut self, chunk_size: usize) -> Self {
        self.upsert_chunk_size = chunk_size.max(1);
        self
    }

    /// Applies the history configuration.
    pub fn with_settings(self, settings: &HistorySettings) -> Self {
        self.with_upsert_chunk_size(settings.upsert_chunk_size)
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn create_dataset(
        &self,
        name: &str,
        zarr_dir: &str,
        images: &[SingleImage],
    ) -> Result<Dataset> {
        if zarr_dir.is_empty() {
            return Err(DatabaseError::Validation(String::from(
                "`zarr_dir` cannot be empty for a dataset",
            )));
        }

        let id = sqlx::query("insert into dataset (name, zarr_dir, images) values (?, ?, ?)")
            .bind(name)
            .bind(zarr_dir)
            .bind(Json(images))
            .execute(&self.pool)
            .await?
            .last_insert_rowid();

        self.get_dataset(id).await?.ok_or(DatabaseError::NotFound {
            entity: "dataset",
            id,
        })
    }

    async fn get_dataset(&self, id: i64) -> Result<Option<Dataset>> {
        let dataset: Option<Dataset> =
            sqlx::query_as(&format!("select {DATASET_COLUMNS} from dataset where id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(dataset)
    }

    async fn update_dataset_images(&self, id: i64, images: &[SingleImage]) -> Result<()> {
        let result = sqlx::query("update dataset set images = ? where id = ?")
            .bind(Json(images))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "dataset",
                id,
            });
        }

        Ok(())
    }

    async fn create_workflow_task(&self, task: NewWorkflowTask) -> Result<WorkflowTask> {
        let id = sqlx::query(
            "insert into workflow_task (workflow_id, task_order, task_name, task_type, \
             command_non_parallel, command_parallel, args_non_parallel, args_parallel, \
             meta_non_parallel, meta_parallel, type_filters) values (?, ?, ?, ?, ?, ?, ?, ?, ?, \
             ?, ?)",
        )
        .bind(task.workflow_id)
        .bind(task.order)
        .bind(&task.task_name)
        .bind(task.task_type)
        .bind(&task.command_non_parallel)
        .bind(&task.command_parallel)
        .bind(Json(&task.args_non_parallel))
        .bind(Json(&task.args_parallel))
        .bind(Json(&task.meta_non_parallel))
        .bind(Json(&task.meta_parallel))
        .bind(Json(&task.type_filters))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        let task: WorkflowTask = sqlx::query_as(&format!(
            "select {WORKFLOW_TASK_COLUMNS} from workflow_task where id = ?"
        ))
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(task)
    }

    async fn list_workflow_tasks(&self, workflow_id: i64) -> Result<Vec<WorkflowTask>> {
        let tasks: Vec<WorkflowTask> = sqlx::query_as(&format!(
            "select {WORKFLOW_TASK_COLUMNS} from workflow_task where workflow_id = ? order by \
             task_order"
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(tasks)
    }

    async fn create_job(&self, job: NewJob) -> Result<Job> {
        if job.first_task_index < 0 || job.last_task_index < job.first_task_index {
            return Err(DatabaseError::Validation(format!(
                "invalid task range {first}..={last} for a job",
                first = job.first_task_index,
                last = job.last_task_index
            )));
        }

        let id = sqlx::query(
            "insert into job (dataset_id, workflow_id, status, working_dir, working_dir_user, \
             slurm_user, first_task_index, last_task_index, start_timestamp) values (?, ?, ?, ?, \
             ?, ?, ?, ?, ?)",
        )
        .bind(job.dataset_id)
        .bind(job.workflow_id)
        .bind(JobStatus::Submitted)
        .bind(&job.working_dir)
        .bind(&job.working_dir_user)
        .bind(&job.slurm_user)
        .bind(job.first_task_index)
        .bind(job.last_task_index)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_job(id)
            .await?
            .ok_or(DatabaseError::NotFound { entity: "job", id })
    }

    async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        let job: Option<Job> = sqlx::query_as(&format!("select {JOB_COLUMNS} from job where id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(job)
    }

    async fn update_job_status(
        &self,
        id: i64,
        status: JobStatus,
        log: Option<&str>,
    ) -> Result<()> {
        let end_timestamp = match status {
            JobStatus::Submitted => None,
            JobStatus::Done | JobStatus::Failed => Some(Utc::now()),
        };

        let result = sqlx::query(
            "update job set status = ?, log = coalesce(?, log), end_timestamp = ? where id = ?",
        )
        .bind(status)
        .bind(log)
        .bind(end_timestamp)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound { entity: "job", id });
        }

        Ok(())
    }

    async fn create_history_run(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
        job_id: i64,
        num_available_images: i64,
    ) -> Result<HistoryRun> {
        let id = sqlx::query(
            "insert into history_run (dataset_id, workflowtask_id, job_id, status, \
             num_available_images, timestamp_started) values (?, ?, ?, ?, ?, ?)",
        )
        .bind(dataset_id)
        .bind(workflowtask_id)
        .bind(job_id)
        .bind(HistoryStatus::Submitted)
        .bind(num_available_images)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.get_history_run(id)
            .await?
            .ok_or(DatabaseError::NotFound {
                entity: "history run",
                id,
            })
    }

    async fn get_history_run(&self, id: i64) -> Result<Option<HistoryRun>> {
        let run: Option<HistoryRun> = sqlx::query_as(&format!(
            "select {HISTORY_RUN_COLUMNS} from history_run where id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(run)
    }

    async fn list_history_runs(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
    ) -> Result<Vec<HistoryRun>> {
        let runs: Vec<HistoryRun> = sqlx::query_as(&format!(
            "select {HISTORY_RUN_COLUMNS} from history_run where dataset_id = ? and \
             workflowtask_id = ? order by id"
        ))
        .bind(dataset_id)
        .bind(workflowtask_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }

    async fn update_history_run_status(&self, id: i64, status: HistoryStatus) -> Result<()> {
        let result = sqlx::query("update history_run set status = ? where id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "history run",
                id,
            });
        }

        Ok(())
    }

    async fn delete_history_run(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("delete from history_run where id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn create_history_units(
        &self,
        history_run_id: i64,
        units: Vec<NewHistoryUnit>,
    ) -> Result<Vec<HistoryUnit>> {
        let mut tx = self.pool.begin().await?;
        let mut created = Vec::with_capacity(units.len());

        for unit in units {
            let id = sqlx::query(
                "insert into history_unit (history_run_id, logfile, status, zarr_urls) values (?, \
                 ?, ?, ?)",
            )
            .bind(history_run_id)
            .bind(&unit.logfile)
            .bind(HistoryStatus::Submitted)
            .bind(Json(&unit.zarr_urls))
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            created.push(HistoryUnit {
                id,
                history_run_id,
                logfile: unit.logfile,
                status: HistoryStatus::Submitted,
                zarr_urls: Json(unit.zarr_urls),
            });
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_history_unit(&self, id: i64) -> Result<Option<HistoryUnit>> {
        let unit: Option<HistoryUnit> = sqlx::query_as(&format!(
            "select {HISTORY_UNIT_COLUMNS} from history_unit where id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(unit)
    }

    async fn list_history_units(&self, history_run_id: i64) -> Result<Vec<HistoryUnit>> {
        let units: Vec<HistoryUnit> = sqlx::query_as(&format!(
            "select {HISTORY_UNIT_COLUMNS} from history_unit where history_run_id = ? order by id"
        ))
        .bind(history_run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(units)
    }

    async fn modify_history_unit(&self, id: i64, modify: UnitModifier) -> Result<HistoryUnit> {
        let mut tx = self.pool.begin().await?;

        // The first statement of the transaction is a write so the database
        // write lock is taken before the row is read.
        let locked = sqlx::query("update history_unit set id = id where id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if locked.rows_affected() == 0 {
            return Err(DatabaseError::NotFound {
                entity: "history unit",
                id,
            });
        }

        let mut unit: HistoryUnit = sqlx::query_as(&format!(
            "select {HISTORY_UNIT_COLUMNS} from history_unit where id = ?"
        ))
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;

        modify(&mut unit);
        unit.id = id;

        sqlx::query("update history_unit set logfile = ?, status = ?, zarr_urls = ? where id = ?")
            .bind(&unit.logfile)
            .bind(unit.status)
            .bind(&unit.zarr_urls)
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(id, status = %unit.status, "history unit updated");
        Ok(unit)
    }

    async fn bulk_update_history_unit_status(
        &self,
        ids: &[i64],
        status: HistoryStatus,
    ) -> Result<()> {
        for chunk in ids.chunks(self.upsert_chunk_size) {
            let mut builder = QueryBuilder::<Sqlite>::new("update history_unit set status = ");
            builder.push_bind(status);
            builder.push(" where id in (");
            let mut separated = builder.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            builder.build().execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn upsert_image_cache(&self, rows: &[HistoryImageCache]) -> Result<()> {
        for chunk in rows.chunks(self.upsert_chunk_size) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "insert into history_image_cache (zarr_url, dataset_id, workflowtask_id, \
                 latest_history_unit_id) ",
            );

            builder.push_values(chunk, |mut row, entry| {
                row.push_bind(entry.zarr_url.as_str())
                    .push_bind(entry.dataset_id)
                    .push_bind(entry.workflowtask_id)
                    .push_bind(entry.latest_history_unit_id);
            });

            builder.push(
                " on conflict (zarr_url, dataset_id, workflowtask_id) do update set \
                 latest_history_unit_id = excluded.latest_history_unit_id",
            );

            builder.build().execute(&self.pool).await?;
            debug!(rows = chunk.len(), "image cache chunk upserted");
        }

        Ok(())
    }

    async fn get_image_cache(
        &self,
        zarr_url: &str,
        dataset_id: i64,
        workflowtask_id: i64,
    ) -> Result<Option<HistoryImageCache>> {
        let row: Option<HistoryImageCache> = sqlx::query_as(
            "select zarr_url, dataset_id, workflowtask_id, latest_history_unit_id from \
             history_image_cache where zarr_url = ? and dataset_id = ? and workflowtask_id = ?",
        )
        .bind(zarr_url)
        .bind(dataset_id)
        .bind(workflowtask_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn image_status(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
        zarr_url: &str,
    ) -> Result<Option<ImageStatus>> {
        let status: Option<ImageStatus> = sqlx::query_as(
            "select c.zarr_url, u.status, u.logfile from history_image_cache c join history_unit \
             u on u.id = c.latest_history_unit_id where c.dataset_id = ? and c.workflowtask_id = \
             ? and c.zarr_url = ?",
        )
        .bind(dataset_id)
        .bind(workflowtask_id)
        .bind(zarr_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(status)
    }

    async fn image_statuses(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
    ) -> Result<Vec<ImageStatus>> {
        let statuses: Vec<ImageStatus> = sqlx::query_as(
            "select c.zarr_url, u.status, u.logfile from history_image_cache c join history_unit \
             u on u.id = c.latest_history_unit_id where c.dataset_id = ? and c.workflowtask_id = \
             ? order by c.zarr_url",
        )
        .bind(dataset_id)
        .bind(workflowtask_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(statuses)
    }

    async fn status_summary(
        &self,
        dataset_id: i64,
        workflowtask_id: i64,
    ) -> Result<StatusSummary> {
        let counts: Vec<(HistoryStatus, i64)> = sqlx::query_as(
            "select u.status, count(*) from history_image_cache c join history_unit u on u.id = \
             c.latest_history_unit_id where c.dataset_id = ? and c.workflowtask_id = ? group by \
             u.status",
        )
        .bind(dataset_id)
        .bind(workflowtask_id)
        .fetch_all(&self.pool)
        .await?;

        let num_available_images: Option<i64> = sqlx::query_scalar(
            "select num_available_images from history_run where dataset_id = ? and \
             workflowtask_id = ? order by id desc limit 1",
        )
        .bind(dataset_id)
        .bind(workflowtask_id)
        .fetch_optional(&self.pool)
        .await?;

        let mut summary = StatusSummary {
            num_available_images,
            ..Default::default()
        };

        for (status, count) in counts {
            match status {
                HistoryStatus::Submitted => summary.num_submitted_images = count,
                HistoryStatus::Done => summary.num_done_images = count,
                HistoryStatus::Failed => summary.num_failed_images = count,
            }
        }

        Ok(summary)
    }
}
