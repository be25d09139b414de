//! Local runner tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use fractal_runner::config::LocalSettings;
use fractal_runner::error::ExecutionError;
use fractal_runner::error::RunnerError;
use fractal_runner::history::HistoryStatus;
use fractal_runner::models::TaskMeta;
use fractal_runner::models::TaskType;
use fractal_runner::runner::LocalRunner;
use fractal_runner::runner::MultisubmitRequest;
use fractal_runner::runner::SubmitRequest;
use fractal_runner::runner::TaskFiles;
use fractal_runner::runner::TaskRunner;
use fractal_runner::runner::files::NON_PARALLEL_COMPONENT;
use fractal_runner::runner::files::parallel_component;
use pretty_assertions::assert_eq;
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::tempdir;

#[sqlx::test]
async fn failures_stay_with_their_invocation(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let bin = tempdir().unwrap();
    let task = common::install_task(bin.path());

    let records = common::records(&db, TaskType::Parallel, root.path()).await;
    let units = common::units(&db, records.run_id, 4).await;

    let runner = LocalRunner::new(
        db.clone(),
        root.path(),
        LocalSettings {
            parallel_tasks_per_job: Some(2),
            ..Default::default()
        },
    );

    let outcome = runner
        .multisubmit(MultisubmitRequest {
            command: format!("{task} measure"),
            list_parameters: (0..4)
                .map(|i| {
                    common::parameters(json!({
                        "zarr_url": format!("/zarr/plate.zarr/A/0{i}/0"),
                        "fail": i == 2,
                    }))
                })
                .collect(),
            task_type: TaskType::Parallel,
            list_history_unit_ids: units,
            list_task_files: (0..4)
                .map(|i| TaskFiles::local(root.path(), "measure", 0, parallel_component(i)))
                .collect(),
            config: TaskMeta::default(),
        })
        .await
        .unwrap();

    assert_eq!(outcome.results.keys().copied().collect::<Vec<_>>(), vec![0, 1, 3]);
    assert_eq!(
        outcome.results[&3],
        json!({
            "image_list_updates": [
                {"zarr_url": "/zarr/plate.zarr/A/03/0", "attributes": {"measured": true}}
            ]
        })
    );

    match &outcome.errors[&2] {
        ExecutionError::Task(e) => {
            assert_eq!(e.task_name, "measure");
            assert!(e.message.contains("ValueError: bad input"), "{}", e.message);
        }
        other => panic!("unexpected error `{other}`"),
    }

    assert_eq!(
        common::unit_statuses(&db, records.run_id).await,
        vec![
            HistoryStatus::Done,
            HistoryStatus::Done,
            HistoryStatus::Failed,
            HistoryStatus::Done
        ]
    );

    let subfolder = root.path().join("0_measure");
    assert!(subfolder.join("0000002-log.txt").exists());
    assert!(subfolder.join("0000000-args.json").exists());

    runner.shutdown().await;
}

#[sqlx::test]
async fn submit_passes_parameters(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let bin = tempdir().unwrap();
    let task = common::install_task(bin.path());

    let records = common::records(&db, TaskType::NonParallel, root.path()).await;
    let units = common::units(&db, records.run_id, 1).await;

    let runner = LocalRunner::new(db.clone(), root.path(), LocalSettings::default());
    let parameters = common::parameters(json!({
        "zarr_urls": ["/zarr/plate.zarr/A/01/0"],
        "zarr_dir": "/zarr",
        "threshold": 0.5,
    }));

    let result = runner
        .submit(SubmitRequest {
            command: format!("{task} echo"),
            parameters: parameters.clone(),
            task_type: TaskType::NonParallel,
            history_unit_id: units[0],
            task_files: TaskFiles::local(root.path(), "measure", 0, NON_PARALLEL_COMPONENT),
            config: TaskMeta::default(),
        })
        .await
        .unwrap()
        .unwrap();

    assert_eq!(result, serde_json::Value::Object(parameters));
    assert_eq!(
        common::unit_statuses(&db, records.run_id).await,
        vec![HistoryStatus::Done]
    );

    runner.shutdown().await;
}

#[sqlx::test]
async fn malformed_calls_run_nothing(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();

    let records = common::records(&db, TaskType::NonParallel, root.path()).await;
    let units = common::units(&db, records.run_id, 2).await;

    let runner = LocalRunner::new(db.clone(), root.path(), LocalSettings::default());

    // A non-parallel task requires its image list
    let result = runner
        .submit(SubmitRequest {
            command: "true".to_string(),
            parameters: common::parameters(json!({"zarr_dir": "/zarr"})),
            task_type: TaskType::NonParallel,
            history_unit_id: units[0],
            task_files: TaskFiles::local(root.path(), "measure", 0, NON_PARALLEL_COMPONENT),
            config: TaskMeta::default(),
        })
        .await;
    assert!(matches!(result, Err(RunnerError::Validation(_))));

    // Two invocations cannot process the same image
    let result = runner
        .multisubmit(MultisubmitRequest {
            command: "true".to_string(),
            list_parameters: vec![
                common::parameters(json!({"zarr_url": "/zarr/plate.zarr/A/01/0"})),
                common::parameters(json!({"zarr_url": "/zarr/plate.zarr/A/01/0"})),
            ],
            task_type: TaskType::Parallel,
            list_history_unit_ids: units.clone(),
            list_task_files: (0..2)
                .map(|i| TaskFiles::local(root.path(), "measure", 0, parallel_component(i)))
                .collect(),
            config: TaskMeta::default(),
        })
        .await;
    assert!(matches!(result, Err(RunnerError::Validation(_))));

    assert_eq!(
        common::unit_statuses(&db, records.run_id).await,
        vec![HistoryStatus::Submitted, HistoryStatus::Submitted]
    );
    assert!(!root.path().join("0_measure").exists());

    runner.shutdown().await;
}

#[sqlx::test]
async fn shutdown_sentinel_kills_invocations(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let bin = tempdir().unwrap();
    let task = common::install_task(bin.path());

    let records = common::records(&db, TaskType::Parallel, root.path()).await;
    let units = common::units(&db, records.run_id, 2).await;

    let runner = Arc::new(LocalRunner::new(
        db.clone(),
        root.path(),
        LocalSettings {
            parallel_tasks_per_job: None,
            shutdown_poll_interval: 0.05,
        },
    ));

    let list_task_files: Vec<_> = (0..2)
        .map(|i| TaskFiles::local(root.path(), "measure", 0, parallel_component(i)))
        .collect();
    let pid_files: Vec<_> = list_task_files
        .iter()
        .map(|f| {
            let mut path = f.args_file_local().into_os_string();
            path.push(".pid");
            std::path::PathBuf::from(path)
        })
        .collect();

    let request = MultisubmitRequest {
        command: format!("{task} sleep"),
        list_parameters: (0..2)
            .map(|i| common::parameters(json!({"zarr_url": format!("/zarr/plate.zarr/A/0{i}/0")})))
            .collect(),
        task_type: TaskType::Parallel,
        list_history_unit_ids: units,
        list_task_files,
        config: TaskMeta::default(),
    };

    let call = tokio::spawn({
        let runner = runner.clone();
        async move { runner.multisubmit(request).await }
    });

    let mut pids = Vec::new();
    for path in &pid_files {
        assert!(common::wait_for_file(path).await, "task never started");
        pids.push(
            std::fs::read_to_string(path)
                .unwrap()
                .trim()
                .parse::<u32>()
                .unwrap(),
        );
    }

    std::fs::write(root.path().join("SHUTDOWN"), "").unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(10), call)
        .await
        .expect("shutdown was not noticed")
        .unwrap()
        .unwrap();

    assert!(outcome.results.is_empty());
    assert_eq!(outcome.errors.len(), 2);
    assert!(outcome.errors.values().all(ExecutionError::is_shutdown));
    assert_eq!(
        common::unit_statuses(&db, records.run_id).await,
        vec![HistoryStatus::Failed, HistoryStatus::Failed]
    );

    // Reparented children may take a moment to be reaped
    for pid in pids {
        let mut alive = common::is_alive(pid);
        for _ in 0..50 {
            if !alive {
                break;
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
            alive = common::is_alive(pid);
        }

        assert!(!alive, "process {pid} outlived the shutdown");
    }

    // Later calls fail without running anything
    let units = common::units(&db, records.run_id, 1).await;
    let result = runner
        .submit(SubmitRequest {
            command: format!("{task} echo"),
            parameters: common::parameters(json!({"zarr_urls": []})),
            task_type: TaskType::NonParallel,
            history_unit_id: units[0],
            task_files: TaskFiles::local(root.path(), "measure", 0, NON_PARALLEL_COMPONENT),
            config: TaskMeta::default(),
        })
        .await
        .unwrap();
    assert!(result.unwrap_err().is_shutdown());

    runner.shutdown().await;
}
