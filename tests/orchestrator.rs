//! End-to-end tests of workflow submission with the local backend.

mod common;

use std::path::Path;
use std::sync::Arc;

use fractal_runner::Settings;
use fractal_runner::config::BackendSettings;
use fractal_runner::history::Database;
use fractal_runner::history::HistoryStatus;
use fractal_runner::models::JobStatus;
use fractal_runner::models::NewJob;
use fractal_runner::models::NewWorkflowTask;
use fractal_runner::models::SingleImage;
use fractal_runner::models::TaskMeta;
use fractal_runner::models::TaskType;
use fractal_runner::models::WorkflowTask;
use fractal_runner::orchestrator;
use fractal_runner::submit_workflow;
use pretty_assertions::assert_eq;
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::tempdir;

/// The identifier of the workflow of the tests.
const WORKFLOW_ID: i64 = 1;

/// Creates the three tasks of the test workflow: a converter creating two
/// images, a parallel task measuring them and a compound task projecting the
/// 3D images.
async fn workflow(db: &Arc<dyn Database>, task: &str, fail_measure: bool) -> Vec<WorkflowTask> {
    let mut convert =
        NewWorkflowTask::new(WORKFLOW_ID, 0, "Create OME-Zarr", TaskType::ConverterNonParallel);
    convert.command_non_parallel = Some(format!("{task} convert"));

    let mut measure = NewWorkflowTask::new(WORKFLOW_ID, 1, "measure", TaskType::Parallel);
    measure.command_parallel = Some(format!("{task} measure"));
    if fail_measure {
        measure.args_parallel = common::parameters(json!({"fail": true}));
    }

    let mut project = NewWorkflowTask::new(WORKFLOW_ID, 2, "project", TaskType::Compound);
    project.command_non_parallel = Some(format!("{task} init"));
    project.command_parallel = Some(format!("{task} project"));
    project.type_filters = [("is_3D".to_string(), true)].into_iter().collect();

    let mut tasks = Vec::new();
    for new in [convert, measure, project] {
        tasks.push(db.create_workflow_task(new).await.unwrap());
    }

    tasks
}

/// Creates a dataset and a job running the given task range.
async fn job(db: &Arc<dyn Database>, root: &Path, first: i64, last: i64) -> (i64, i64) {
    job_with_images(db, root, first, last, &[]).await
}

/// Creates a dataset holding the given images and a job running the given
/// task range.
async fn job_with_images(
    db: &Arc<dyn Database>,
    root: &Path,
    first: i64,
    last: i64,
    images: &[SingleImage],
) -> (i64, i64) {
    let zarr_dir = root.join("zarr");
    let dataset = db
        .create_dataset("plate", &zarr_dir.to_string_lossy(), images)
        .await
        .unwrap();
    let job = db
        .create_job(NewJob {
            dataset_id: dataset.id,
            workflow_id: WORKFLOW_ID,
            working_dir: root.join("job").to_string_lossy().into_owned(),
            working_dir_user: None,
            slurm_user: None,
            first_task_index: first,
            last_task_index: last,
        })
        .await
        .unwrap();

    (dataset.id, job.id)
}

#[sqlx::test]
async fn workflows_update_the_dataset(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let task = common::install_task(root.path());

    let tasks = workflow(&db, &task, false).await;
    let (dataset_id, job_id) = job(&db, root.path(), 0, 2).await;

    submit_workflow(
        WORKFLOW_ID,
        dataset_id,
        job_id,
        Arc::new(Settings::default()),
        db.clone(),
    )
    .await;

    let job = db.get_job(job_id).await.unwrap().unwrap();
    let log = job.log.clone().unwrap_or_default();
    assert_eq!(job.status, JobStatus::Done, "{log}");
    assert!(job.end_timestamp.is_some());
    assert!(log.contains("completed successfully"), "{log}");

    let zarr_dir = root.path().join("zarr").to_string_lossy().into_owned();
    let images = db.get_dataset(dataset_id).await.unwrap().unwrap().images.0;
    let urls: Vec<_> = images.iter().map(|i| i.zarr_url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            format!("{zarr_dir}/plate.zarr/A/01/0"),
            format!("{zarr_dir}/plate.zarr/A/02/0"),
            format!("{zarr_dir}/plate.zarr/A/01/0_mip"),
            format!("{zarr_dir}/plate.zarr/A/02/0_mip"),
        ]
    );

    let projection = &images[2];
    assert_eq!(
        projection.origin.as_deref(),
        Some(format!("{zarr_dir}/plate.zarr/A/01/0").as_str())
    );
    assert_eq!(projection.types.get("is_3D"), Some(&false));
    assert_eq!(projection.attributes.get("measured"), Some(&json!(true)));
    assert_eq!(images[0].types.get("is_3D"), Some(&true));

    for wftask in &tasks {
        let runs = orchestrator::list_history_runs(db.as_ref(), dataset_id, wftask.id)
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, HistoryStatus::Done);
    }

    // The converter saw no images; the compound task has one init unit and
    // one compute unit per image
    let runs = orchestrator::list_history_runs(db.as_ref(), dataset_id, tasks[2].id)
        .await
        .unwrap();
    assert_eq!(runs[0].num_available_images, 2);
    let units = orchestrator::list_history_units(db.as_ref(), runs[0].id)
        .await
        .unwrap();
    assert_eq!(units.len(), 3);
    assert!(units.iter().all(|u| u.status == HistoryStatus::Done));

    let summary = orchestrator::status_summary(db.as_ref(), dataset_id, tasks[1].id)
        .await
        .unwrap();
    assert_eq!(summary.num_done_images, 2);
    assert_eq!(summary.num_failed_images, 0);
    assert_eq!(summary.num_available_images, Some(2));

    let status = orchestrator::image_status(
        db.as_ref(),
        dataset_id,
        tasks[1].id,
        &format!("{zarr_dir}/plate.zarr/A/02/0/"),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(status.status, HistoryStatus::Done);
    assert!(
        status
            .logfile
            .as_deref()
            .is_some_and(|l| l.ends_with("1_measure/0000001-log.txt"))
    );

    let statuses = orchestrator::image_statuses(db.as_ref(), dataset_id, tasks[2].id)
        .await
        .unwrap();
    assert_eq!(statuses.len(), 2);

    let working_dir = root.path().join("job");
    assert!(working_dir.join("workflow.log").exists());
    assert!(
        working_dir
            .join("0_create_ome_zarr")
            .join("non_par-args.json")
            .exists()
    );
    assert!(working_dir.join("2_project").join("init-out.json").exists());
}

#[sqlx::test]
async fn task_failures_stop_the_workflow(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let task = common::install_task(root.path());

    let tasks = workflow(&db, &task, true).await;
    let (dataset_id, job_id) = job(&db, root.path(), 0, 2).await;

    submit_workflow(
        WORKFLOW_ID,
        dataset_id,
        job_id,
        Arc::new(Settings::default()),
        db.clone(),
    )
    .await;

    let job = db.get_job(job_id).await.unwrap().unwrap();
    let log = job.log.unwrap_or_default();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(log.contains("TASK ERROR: task `measure`"), "{log}");
    assert!(log.contains("ValueError: bad input"), "{log}");

    // The converter's images were kept
    let images = db.get_dataset(dataset_id).await.unwrap().unwrap().images.0;
    assert_eq!(images.len(), 2);
    assert!(images.iter().all(|i| !i.attributes.contains_key("measured")));

    let runs = orchestrator::list_history_runs(db.as_ref(), dataset_id, tasks[1].id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, HistoryStatus::Failed);

    let summary = orchestrator::status_summary(db.as_ref(), dataset_id, tasks[1].id)
        .await
        .unwrap();
    assert_eq!(summary.num_failed_images, 2);

    assert!(
        orchestrator::list_history_runs(db.as_ref(), dataset_id, tasks[2].id)
            .await
            .unwrap()
            .is_empty()
    );
}

#[sqlx::test]
async fn invalid_task_ranges_fail_the_job(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let task = common::install_task(root.path());

    workflow(&db, &task, false).await;
    let (dataset_id, job_id) = job(&db, root.path(), 1, 5).await;

    submit_workflow(
        WORKFLOW_ID,
        dataset_id,
        job_id,
        Arc::new(Settings::default()),
        db.clone(),
    )
    .await;

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(
        job.log
            .unwrap_or_default()
            .contains("invalid task range 1..=5 for a workflow of 3 tasks")
    );
}

#[sqlx::test]
async fn unknown_jobs_are_ignored(pool: SqlitePool) {
    let db = common::database(pool).await;

    submit_workflow(
        WORKFLOW_ID,
        1,
        42,
        Arc::new(Settings::default()),
        db.clone(),
    )
    .await;

    assert!(db.get_job(42).await.unwrap().is_none());
}

#[sqlx::test]
async fn converters_cover_no_existing_images(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let task = common::install_task(root.path());

    let mut convert =
        NewWorkflowTask::new(WORKFLOW_ID, 0, "Create OME-Zarr", TaskType::ConverterNonParallel);
    convert.command_non_parallel = Some(format!("{task} convert"));
    let convert = db.create_workflow_task(convert).await.unwrap();

    let existing = root
        .path()
        .join("zarr/old.zarr/B/01/0")
        .to_string_lossy()
        .into_owned();
    let (dataset_id, job_id) =
        job_with_images(&db, root.path(), 0, 0, &[SingleImage::new(&existing)]).await;

    submit_workflow(
        WORKFLOW_ID,
        dataset_id,
        job_id,
        Arc::new(Settings::default()),
        db.clone(),
    )
    .await;

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Done, "{}", job.log.unwrap_or_default());

    let runs = orchestrator::list_history_runs(db.as_ref(), dataset_id, convert.id)
        .await
        .unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].num_available_images, 0);

    let units = orchestrator::list_history_units(db.as_ref(), runs[0].id)
        .await
        .unwrap();
    assert_eq!(units.len(), 1);
    assert!(units[0].zarr_urls.0.is_empty());

    assert!(
        orchestrator::image_status(db.as_ref(), dataset_id, convert.id, &existing)
            .await
            .unwrap()
            .is_none()
    );

    // The existing image is kept next to the converted ones
    let images = db.get_dataset(dataset_id).await.unwrap().unwrap().images.0;
    assert_eq!(images.len(), 3);
    assert_eq!(images[0].zarr_url, existing);
}

#[sqlx::test]
async fn refused_submissions_fail_their_units(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();

    // No SLURM job can hold this many CPUs, so nothing is ever submitted
    let mut measure = NewWorkflowTask::new(WORKFLOW_ID, 0, "measure", TaskType::NonParallel);
    measure.command_non_parallel = Some("true".to_string());
    measure.meta_non_parallel = TaskMeta {
        cpus_per_task: Some(100_000),
        ..Default::default()
    };
    let measure = db.create_workflow_task(measure).await.unwrap();

    let zarr_url = root
        .path()
        .join("zarr/plate.zarr/A/01/0")
        .to_string_lossy()
        .into_owned();
    let (dataset_id, job_id) =
        job_with_images(&db, root.path(), 0, 0, &[SingleImage::new(&zarr_url)]).await;

    let settings = Settings {
        backend: BackendSettings::SlurmSudo,
        ..Default::default()
    };
    submit_workflow(WORKFLOW_ID, dataset_id, job_id, Arc::new(settings), db.clone()).await;

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let runs = orchestrator::list_history_runs(db.as_ref(), dataset_id, measure.id)
        .await
        .unwrap();
    assert_eq!(runs[0].status, HistoryStatus::Failed);
    let units = orchestrator::list_history_units(db.as_ref(), runs[0].id)
        .await
        .unwrap();
    assert_eq!(
        units.iter().map(|u| u.status).collect::<Vec<_>>(),
        vec![HistoryStatus::Failed]
    );

    let status = orchestrator::image_status(db.as_ref(), dataset_id, measure.id, &zarr_url)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, HistoryStatus::Failed);
}

#[sqlx::test]
async fn invalid_parallelization_lists_fail_their_units(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let task = common::install_task(root.path());

    let mut project = NewWorkflowTask::new(WORKFLOW_ID, 0, "project", TaskType::Compound);
    project.command_non_parallel = Some(format!("{task} init_twice"));
    project.command_parallel = Some(format!("{task} project"));
    let project = db.create_workflow_task(project).await.unwrap();

    let zarr_url = root
        .path()
        .join("zarr/plate.zarr/A/01/0")
        .to_string_lossy()
        .into_owned();
    let (dataset_id, job_id) =
        job_with_images(&db, root.path(), 0, 0, &[SingleImage::new(&zarr_url)]).await;

    submit_workflow(
        WORKFLOW_ID,
        dataset_id,
        job_id,
        Arc::new(Settings::default()),
        db.clone(),
    )
    .await;

    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);

    let runs = orchestrator::list_history_runs(db.as_ref(), dataset_id, project.id)
        .await
        .unwrap();
    assert_eq!(runs[0].status, HistoryStatus::Failed);

    // The initialization ran; the compute invocations were refused
    let units = orchestrator::list_history_units(db.as_ref(), runs[0].id)
        .await
        .unwrap();
    assert_eq!(
        units.iter().map(|u| u.status).collect::<Vec<_>>(),
        vec![
            HistoryStatus::Done,
            HistoryStatus::Failed,
            HistoryStatus::Failed
        ]
    );

    let status = orchestrator::image_status(db.as_ref(), dataset_id, project.id, &zarr_url)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, HistoryStatus::Failed);

    let summary = orchestrator::status_summary(db.as_ref(), dataset_id, project.id)
        .await
        .unwrap();
    assert_eq!(summary.num_submitted_images, 0);
}
