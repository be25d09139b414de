//! The submission orchestrator.
//!
//! [`submit_workflow`] drives a single job: it selects the backend, runs the
//! job's range of workflow tasks in order and writes every outcome back into
//! the store. Task runners record the status of each history unit; the
//! orchestrator owns the status of history runs, of the job and the dataset
//! image list.
//!
//! The orchestrator never returns an error: every failure is recorded in the
//! job row and its log.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use serde_json::Value as JsonValue;
use tracing::Instrument;
use tracing::error;
use tracing::info;
use tracing::info_span;
use tracing::instrument::WithSubscriber;
use tracing::warn;

use crate::config::BackendSettings;
use crate::config::Settings;
use crate::error::ExecutionError;
use crate::error::RunnerError;
use crate::history;
use crate::history::Database;
use crate::history::HistoryImageCache;
use crate::history::HistoryRun;
use crate::history::HistoryStatus;
use crate::history::HistoryUnit;
use crate::history::ImageStatus;
use crate::history::NewHistoryUnit;
use crate::history::StatusSummary;
use crate::images::InitTaskOutput;
use crate::images::TaskOutput;
use crate::images::apply_task_output;
use crate::images::filter_images;
use crate::images::normalize_zarr_url;
use crate::logging::JobLog;
use crate::models::Job;
use crate::models::JobStatus;
use crate::models::JsonMap;
use crate::models::SingleImage;
use crate::models::TaskType;
use crate::models::WorkflowTask;
use crate::runner::LocalRunner;
use crate::runner::MultisubmitOutcome;
use crate::runner::MultisubmitRequest;
use crate::runner::SshSlurmRunner;
use crate::runner::SubmitRequest;
use crate::runner::SudoSlurmRunner;
use crate::runner::TaskFiles;
use crate::runner::TaskOutcome;
use crate::runner::TaskRunner;
use crate::runner::files::INIT_COMPONENT;
use crate::runner::files::NON_PARALLEL_COMPONENT;
use crate::runner::files::compound_component;
use crate::runner::files::parallel_component;
use crate::runner::validation::ZARR_URL_KEY;
use crate::runner::validation::ZARR_URLS_KEY;
use crate::transport::SshTransport;
use crate::transport::SudoTransport;

/// The parameter holding the dataset directory of a non-parallel invocation.
const ZARR_DIR_KEY: &str = "zarr_dir";

/// The parameter holding the initialization arguments of a compute
/// invocation of a compound task.
const INIT_ARGS_KEY: &str = "init_args";

/// Runs the workflow tasks of a job and records the outcome.
///
/// The job status is set to `done` or `failed` and the job log is copied into
/// the job row. A job that does not exist is only logged.
pub async fn submit_workflow(
    workflow_id: i64,
    dataset_id: i64,
    job_id: i64,
    settings: Arc<Settings>,
    db: Arc<dyn Database>,
) {
    let job = match db.get_job(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => {
            error!("cannot run job {job_id}: the job does not exist");
            return;
        }
        Err(e) => {
            error!("cannot run job {job_id}: {e}");
            return;
        }
    };

    let root_dir = PathBuf::from(&job.working_dir);
    let log = std::fs::create_dir_all(&root_dir)
        .with_context(|| {
            format!(
                "failed to create job working directory `{path}`",
                path = root_dir.display()
            )
        })
        .and_then(|()| JobLog::create(&root_dir));

    let log = match log {
        Ok(log) => log,
        Err(e) => {
            error!("job {job_id} failed: {e:#}");
            if let Err(e) = db
                .update_job_status(job_id, JobStatus::Failed, Some(&format!("{e:#}")))
                .await
            {
                error!("failed to record the failure of job {job_id}: {e}");
            }
            return;
        }
    };

    let result = async {
        let span = info_span!("job", id = job_id);
        async {
            info!(
                "starting job {job_id} (workflow {workflow_id}, dataset {dataset_id}, tasks \
                 {first}..={last})",
                first = job.first_task_index,
                last = job.last_task_index
            );

            let result = run_job(&job, workflow_id, dataset_id, &settings, &db, &root_dir).await;
            match &result {
                Ok(()) => info!("job {job_id} completed successfully"),
                Err(e) => error!("{diagnostic}", diagnostic = describe_error(e)),
            }

            result
        }
        .instrument(span)
        .await
    }
    .with_subscriber(log.dispatch().clone())
    .await;

    let status = match result {
        Ok(()) => JobStatus::Done,
        Err(_) => JobStatus::Failed,
    };

    if let Err(e) = db
        .update_job_status(job_id, status, Some(&log.contents()))
        .await
    {
        error!("failed to record the status of job {job_id}: {e}");
    }
}

/// Formats the diagnostic recorded for a failed job.
pub fn describe_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<ExecutionError>() {
        Some(ExecutionError::Task(e)) => format!(
            "TASK ERROR: task `{name}` (workflow task order {order}) failed\n{message}",
            name = e.task_name,
            order = e.workflow_task_order,
            message = e.message
        ),
        Some(ExecutionError::Job(e)) => format!("JOB ERROR:\n{details}", details = e.details()),
        None => match e.downcast_ref::<RunnerError>() {
            Some(e) => format!("JOB ERROR:\n{e}"),
            None => format!("UNKNOWN ERROR:\n{e:#}"),
        },
    }
}

/// Loads the job inputs, constructs the runner and runs the tasks.
///
/// The runner is shut down whatever the outcome.
async fn run_job(
    job: &Job,
    workflow_id: i64,
    dataset_id: i64,
    settings: &Settings,
    db: &Arc<dyn Database>,
    root_dir: &Path,
) -> Result<()> {
    settings.validate()?;

    let dataset = db
        .get_dataset(dataset_id)
        .await?
        .with_context(|| format!("dataset {dataset_id} does not exist"))?;
    let tasks = db.list_workflow_tasks(workflow_id).await?;
    let tasks = select_tasks(&tasks, job.first_task_index, job.last_task_index)?;

    let (runner, root_dir_remote) = build_runner(job, root_dir, settings, db.clone())?;
    info!(
        "using the `{backend:?}` backend with remote working directory `{remote}`",
        backend = settings.backend,
        remote = root_dir_remote.display()
    );

    let mut execution = JobExecution {
        runner: runner.as_ref(),
        db,
        job,
        dataset_id: dataset.id,
        zarr_dir: dataset.zarr_dir,
        images: dataset.images.0,
        root_dir_local: root_dir,
        root_dir_remote: &root_dir_remote,
    };

    let mut result = Ok(());
    for wftask in tasks {
        result = execution.run_task(wftask).await;
        if result.is_err() {
            break;
        }
    }

    runner.shutdown().await;
    result
}

/// Selects the workflow tasks of a job by their position in the workflow.
fn select_tasks(tasks: &[WorkflowTask], first: i64, last: i64) -> Result<&[WorkflowTask]> {
    let (Ok(first_index), Ok(last_index)) = (usize::try_from(first), usize::try_from(last))
    else {
        bail!("invalid task range {first}..={last}");
    };

    if first_index > last_index || last_index >= tasks.len() {
        bail!(
            "invalid task range {first}..={last} for a workflow of {n} tasks",
            n = tasks.len()
        );
    }

    Ok(&tasks[first_index..=last_index])
}

/// Constructs the runner of the configured backend.
///
/// Returns the runner along with the remote job working directory.
fn build_runner(
    job: &Job,
    root_dir: &Path,
    settings: &Settings,
    db: Arc<dyn Database>,
) -> Result<(Box<dyn TaskRunner>, PathBuf)> {
    match &settings.backend {
        BackendSettings::Local => Ok((
            Box::new(LocalRunner::new(db, root_dir, settings.local.clone())),
            root_dir.to_path_buf(),
        )),
        BackendSettings::SlurmSudo => {
            let remote = job
                .working_dir_user
                .as_deref()
                .map(PathBuf::from)
                .unwrap_or_else(|| root_dir.to_path_buf());
            let user = job
                .slurm_user
                .clone()
                .or_else(|| settings.slurm.sudo_user.clone());
            let transport = Arc::new(SudoTransport::new(user));

            Ok((
                Box::new(SudoSlurmRunner::new(
                    transport,
                    db,
                    root_dir,
                    settings.slurm.clone(),
                )),
                remote,
            ))
        }
        BackendSettings::SlurmSsh => {
            let ssh = settings
                .ssh
                .clone()
                .context("the `slurm_ssh` backend requires an `[ssh]` configuration section")?;
            let remote_root = settings
                .slurm
                .remote_root
                .as_ref()
                .context("the `slurm_ssh` backend requires `slurm.remote_root`")?;
            let name = root_dir.file_name().with_context(|| {
                format!(
                    "job working directory `{path}` has no name",
                    path = root_dir.display()
                )
            })?;
            let transport = Arc::new(SshTransport::new(ssh));

            Ok((
                Box::new(SshSlurmRunner::new(
                    transport,
                    db,
                    root_dir,
                    settings.slurm.clone(),
                )),
                remote_root.join(name),
            ))
        }
    }
}

/// Fails with the first error of a `multisubmit` call, or interprets the
/// outputs of its invocations.
fn collect_outputs(outcome: MultisubmitOutcome) -> Result<Vec<TaskOutput>> {
    if let Some((_, e)) = outcome.errors.into_iter().next() {
        return Err(e.into());
    }

    outcome
        .results
        .into_values()
        .map(|value| Ok(TaskOutput::from_value(value)?))
        .collect()
}

/// The state of a running job.
struct JobExecution<'a> {
    /// The runner of the job.
    runner: &'a dyn TaskRunner,
    /// The store.
    db: &'a Arc<dyn Database>,
    /// The job.
    job: &'a Job,
    /// The dataset processed by the job.
    dataset_id: i64,
    /// The directory of the dataset images.
    zarr_dir: String,
    /// The current image list of the dataset.
    images: Vec<SingleImage>,
    /// The local job working directory.
    root_dir_local: &'a Path,
    /// The job working directory on the host running the tasks.
    root_dir_remote: &'a Path,
}

impl JobExecution<'_> {
    /// Gets the files of an invocation of a workflow task.
    fn files(&self, wftask: &WorkflowTask, component: impl Into<String>) -> TaskFiles {
        TaskFiles::new(
            self.root_dir_local,
            self.root_dir_remote,
            &wftask.task_name,
            wftask.order,
            component,
        )
    }

    /// Runs a workflow task and applies its outputs to the image list.
    async fn run_task(&mut self, wftask: &WorkflowTask) -> Result<()> {
        // Converters create their images; they never process existing ones
        let zarr_urls: Vec<_> = if wftask.task_type.is_converter() {
            Vec::new()
        } else {
            filter_images(&self.images, &wftask.type_filters.0)
                .into_iter()
                .map(|i| i.zarr_url)
                .collect()
        };

        info!(
            "running workflow task {order} (`{name}`, {task_type}) on {n} images",
            order = wftask.order,
            name = wftask.task_name,
            task_type = wftask.task_type,
            n = zarr_urls.len()
        );

        let run = self
            .db
            .create_history_run(
                self.dataset_id,
                wftask.id,
                self.job.id,
                i64::try_from(zarr_urls.len()).unwrap_or(i64::MAX),
            )
            .await?;

        let mut images = self.images.clone();
        let result = match self.execute(wftask, &run, zarr_urls).await {
            Ok(outputs) => TaskOutput::merge(outputs)
                .and_then(|output| apply_task_output(&mut images, &output, &self.zarr_dir))
                .map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };

        let status = match &result {
            Ok(()) => HistoryStatus::Done,
            Err(_) => HistoryStatus::Failed,
        };
        self.db.update_history_run_status(run.id, status).await?;
        result?;

        if images != self.images {
            self.db
                .update_dataset_images(self.dataset_id, &images)
                .await?;
            self.images = images;
        }

        info!(
            "workflow task {order} (`{name}`) completed",
            order = wftask.order,
            name = wftask.task_name
        );
        Ok(())
    }

    /// Runs the invocations of a workflow task.
    async fn execute(
        &self,
        wftask: &WorkflowTask,
        run: &HistoryRun,
        zarr_urls: Vec<String>,
    ) -> Result<Vec<TaskOutput>> {
        match wftask.task_type {
            TaskType::NonParallel | TaskType::ConverterNonParallel => {
                let value = self
                    .submit(wftask, run, NON_PARALLEL_COMPONENT, zarr_urls)
                    .await??;
                Ok(vec![TaskOutput::from_value(value)?])
            }
            TaskType::Parallel => {
                if zarr_urls.is_empty() {
                    warn!("no image matches the type filters of a parallel task");
                    return Ok(Vec::new());
                }

                let list_parameters = zarr_urls
                    .into_iter()
                    .map(|zarr_url| {
                        let mut parameters = wftask.args_parallel.0.clone();
                        parameters.insert(ZARR_URL_KEY.to_string(), JsonValue::String(zarr_url));
                        parameters
                    })
                    .collect();

                collect_outputs(
                    self.multisubmit(wftask, run, list_parameters, parallel_component)
                        .await?,
                )
            }
            TaskType::Compound | TaskType::ConverterCompound => {
                let value = self
                    .submit(wftask, run, INIT_COMPONENT, zarr_urls)
                    .await??;
                let init = InitTaskOutput::from_value(value)?;
                if init.parallelization_list.is_empty() {
                    info!("the initialization of a compound task returned no invocations");
                    return Ok(Vec::new());
                }

                let list_parameters = init
                    .parallelization_list
                    .into_iter()
                    .map(|item| {
                        let mut parameters = wftask.args_parallel.0.clone();
                        parameters.insert(
                            ZARR_URL_KEY.to_string(),
                            JsonValue::String(normalize_zarr_url(&item.zarr_url).to_string()),
                        );
                        parameters.insert(
                            INIT_ARGS_KEY.to_string(),
                            JsonValue::Object(item.init_args),
                        );
                        parameters
                    })
                    .collect();

                collect_outputs(
                    self.multisubmit(wftask, run, list_parameters, compound_component)
                        .await?,
                )
            }
        }
    }

    /// Creates history units and points the image cache at them.
    ///
    /// Each unit is given as the files of its invocation and the images it
    /// covers.
    async fn create_units(
        &self,
        wftask: &WorkflowTask,
        run: &HistoryRun,
        units: Vec<(&TaskFiles, Vec<String>)>,
    ) -> Result<Vec<HistoryUnit>> {
        let units = units
            .into_iter()
            .map(|(files, zarr_urls)| NewHistoryUnit {
                logfile: Some(files.log_file_local().to_string_lossy().into_owned()),
                zarr_urls,
            })
            .collect();

        let units = self.db.create_history_units(run.id, units).await?;
        let cache: Vec<_> = units
            .iter()
            .flat_map(|unit| {
                unit.zarr_urls.iter().map(|zarr_url| HistoryImageCache {
                    zarr_url: zarr_url.clone(),
                    dataset_id: self.dataset_id,
                    workflowtask_id: wftask.id,
                    latest_history_unit_id: unit.id,
                })
            })
            .collect();

        self.db.upsert_image_cache(&cache).await?;
        Ok(units)
    }

    /// Runs the non-parallel command of a workflow task over the given images.
    async fn submit(
        &self,
        wftask: &WorkflowTask,
        run: &HistoryRun,
        component: &str,
        zarr_urls: Vec<String>,
    ) -> Result<TaskOutcome> {
        let command = wftask.command_non_parallel.clone().with_context(|| {
            format!(
                "task `{name}` has no non-parallel command",
                name = wftask.task_name
            )
        })?;

        let mut parameters: JsonMap = wftask.args_non_parallel.0.clone();
        parameters.insert(
            ZARR_DIR_KEY.to_string(),
            JsonValue::String(self.zarr_dir.clone()),
        );
        if !wftask.task_type.is_converter() {
            parameters.insert(
                ZARR_URLS_KEY.to_string(),
                JsonValue::Array(zarr_urls.iter().cloned().map(JsonValue::String).collect()),
            );
        }

        let task_files = self.files(wftask, component);
        let units = self
            .create_units(wftask, run, vec![(&task_files, zarr_urls)])
            .await?;
        let history_unit_id = units
            .first()
            .map(|u| u.id)
            .context("no history unit was created")?;

        let outcome = self
            .runner
            .submit(SubmitRequest {
                command,
                parameters,
                task_type: wftask.task_type,
                history_unit_id,
                task_files,
                config: wftask.meta_non_parallel.0.clone(),
            })
            .await;

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.reject_units(&[history_unit_id], e).await),
        }
    }

    /// Runs the parallel command of a workflow task once per parameter set.
    ///
    /// Every parameter set holds the image it processes.
    async fn multisubmit(
        &self,
        wftask: &WorkflowTask,
        run: &HistoryRun,
        list_parameters: Vec<JsonMap>,
        component: fn(usize) -> String,
    ) -> Result<MultisubmitOutcome> {
        let command = wftask.command_parallel.clone().with_context(|| {
            format!(
                "task `{name}` has no parallel command",
                name = wftask.task_name
            )
        })?;

        let list_task_files: Vec<_> = (0..list_parameters.len())
            .map(|index| self.files(wftask, component(index)))
            .collect();

        let units = list_task_files
            .iter()
            .zip(&list_parameters)
            .map(|(files, parameters)| {
                let zarr_url = parameters
                    .get(ZARR_URL_KEY)
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                (files, zarr_url.into_iter().collect())
            })
            .collect();
        let units = self.create_units(wftask, run, units).await?;
        let list_history_unit_ids: Vec<_> = units.iter().map(|u| u.id).collect();

        let outcome = self
            .runner
            .multisubmit(MultisubmitRequest {
                command,
                list_parameters,
                task_type: wftask.task_type,
                list_history_unit_ids: list_history_unit_ids.clone(),
                list_task_files,
                config: wftask.meta_parallel.0.clone(),
            })
            .await;

        match outcome {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.reject_units(&list_history_unit_ids, e).await),
        }
    }

    /// Marks the units of a call the runner refused as failed.
    ///
    /// A refused call runs none of its invocations.
    async fn reject_units(&self, ids: &[i64], e: RunnerError) -> anyhow::Error {
        if let Err(update) = self
            .db
            .bulk_update_history_unit_status(ids, HistoryStatus::Failed)
            .await
        {
            error!("failed to mark {n} history units as failed: {update}", n = ids.len());
        }

        e.into()
    }
}

/// Gets the current status of an image for a workflow task.
pub async fn image_status(
    db: &dyn Database,
    dataset_id: i64,
    workflowtask_id: i64,
    zarr_url: &str,
) -> history::Result<Option<ImageStatus>> {
    db.image_status(dataset_id, workflowtask_id, normalize_zarr_url(zarr_url))
        .await
}

/// Lists the current status of every image processed by a workflow task.
pub async fn image_statuses(
    db: &dyn Database,
    dataset_id: i64,
    workflowtask_id: i64,
) -> history::Result<Vec<ImageStatus>> {
    db.image_statuses(dataset_id, workflowtask_id).await
}

/// Counts the images of a workflow task per current status.
pub async fn status_summary(
    db: &dyn Database,
    dataset_id: i64,
    workflowtask_id: i64,
) -> history::Result<StatusSummary> {
    db.status_summary(dataset_id, workflowtask_id).await
}

/// Lists the history runs of a dataset and workflow task, oldest first.
pub async fn list_history_runs(
    db: &dyn Database,
    dataset_id: i64,
    workflowtask_id: i64,
) -> history::Result<Vec<HistoryRun>> {
    db.list_history_runs(dataset_id, workflowtask_id).await
}

/// Lists the units of a history run, in creation order.
pub async fn list_history_units(
    db: &dyn Database,
    history_run_id: i64,
) -> history::Result<Vec<HistoryUnit>> {
    db.list_history_units(history_run_id).await
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::JobExecutionError;
    use crate::error::TaskExecutionError;

    #[test]
    fn task_ranges() {
        let tasks: Vec<_> = (0..3)
            .map(|order| WorkflowTask {
                id: order + 1,
                workflow_id: 1,
                order,
                task_name: format!("task {order}"),
                task_type: TaskType::NonParallel,
                command_non_parallel: Some("true".to_string()),
                command_parallel: None,
                args_non_parallel: Default::default(),
                args_parallel: Default::default(),
                meta_non_parallel: Default::default(),
                meta_parallel: Default::default(),
                type_filters: Default::default(),
            })
            .collect();

        assert_eq!(select_tasks(&tasks, 1, 2).unwrap().len(), 2);
        assert_eq!(select_tasks(&tasks, 0, 0).unwrap()[0].order, 0);
        assert!(select_tasks(&tasks, 2, 1).is_err());
        assert!(select_tasks(&tasks, 0, 3).is_err());
        assert!(select_tasks(&tasks, -1, 0).is_err());
    }

    #[test]
    fn diagnostics() {
        let task = anyhow::Error::from(ExecutionError::from(TaskExecutionError {
            task_name: "measure".to_string(),
            workflow_task_order: 2,
            message: "ValueError: bad".to_string(),
        }));
        let diagnostic = describe_error(&task);
        assert!(diagnostic.starts_with("TASK ERROR: task `measure` (workflow task order 2)"));
        assert!(diagnostic.ends_with("ValueError: bad"));

        let job = anyhow::Error::from(ExecutionError::from(
            JobExecutionError::new("SLURM job 7 failed").with_stderr("oom-kill"),
        ));
        assert_eq!(describe_error(&job), "JOB ERROR:\nSLURM job 7 failed\noom-kill");

        let other = anyhow::anyhow!("dataset 3 does not exist");
        assert_eq!(describe_error(&other), "UNKNOWN ERROR:\ndataset 3 does not exist");
    }
}
