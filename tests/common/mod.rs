//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

use fractal_runner::history::Database;
use fractal_runner::history::HistoryStatus;
use fractal_runner::history::NewHistoryUnit;
use fractal_runner::history::SqliteDatabase;
use fractal_runner::models::JsonMap;
use fractal_runner::models::NewJob;
use fractal_runner::models::NewWorkflowTask;
use fractal_runner::models::TaskType;
use fractal_runner::models::WorkflowTask;
use serde_json::Value as JsonValue;
use sqlx::SqlitePool;

/// A task used by the tests.
///
/// The first argument selects the behavior; the remaining arguments are the
/// `--args-json` and `--out-json` options every invocation receives. Any
/// invocation whose arguments contain `"fail":true` fails. The `init_twice`
/// behavior lists every image twice in its parallelization list.
const TASK_SCRIPT: &str = r#"#!/usr/bin/env bash
set -eu

mode="$1"
shift
while [ $# -gt 0 ]; do
    case "$1" in
        --args-json) args="$2"; shift 2 ;;
        --out-json) out="$2"; shift 2 ;;
        *) shift ;;
    esac
done

json=$(cat "$args")
value() {
    printf '%s' "$json" | sed -n "s/.*\"$1\":\"\([^\"]*\)\".*/\1/p"
}

if printf '%s' "$json" | grep -q '"fail":true'; then
    echo "processing $(value zarr_url)"
    echo "ValueError: bad input" >&2
    exit 1
fi

case "$mode" in
    convert)
        dir=$(value zarr_dir)
        printf '{"image_list_updates":[{"zarr_url":"%s/plate.zarr/A/01/0","types":{"is_3D":true}},{"zarr_url":"%s/plate.zarr/A/02/0","types":{"is_3D":true}}]}' \
            "$dir" "$dir" > "$out"
        ;;
    measure)
        printf '{"image_list_updates":[{"zarr_url":"%s","attributes":{"measured":true}}]}' \
            "$(value zarr_url)" > "$out"
        ;;
    init|init_twice)
        urls=$(printf '%s' "$json" | sed -n 's/.*"zarr_urls":\[\([^]]*\)\].*/\1/p')
        items=""
        IFS=, read -ra list <<< "$urls"
        for url in "${list[@]}"; do
            item="{\"zarr_url\":$url,\"init_args\":{\"suffix\":\"mip\"}}"
            items="$items${items:+,}$item"
            if [ "$mode" = init_twice ]; then
                items="$items,$item"
            fi
        done
        printf '{"parallelization_list":[%s]}' "$items" > "$out"
        ;;
    project)
        url=$(value zarr_url)
        printf '{"image_list_updates":[{"zarr_url":"%s_%s","origin":"%s","types":{"is_3D":false}}]}' \
            "$url" "$(value suffix)" "$url" > "$out"
        ;;
    echo)
        cp "$args" "$out"
        ;;
    sleep)
        sleep 300 &
        echo $! > "$args.pid.tmp"
        mv "$args.pid.tmp" "$args.pid"
        wait
        ;;
esac
"#;

/// Installs the test task into a directory and returns its path.
pub fn install_task(dir: &Path) -> String {
    let path = dir.join("task.sh");
    std::fs::write(&path, TASK_SCRIPT).expect("failed to write task");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to make task executable");
    path.to_string_lossy().into_owned()
}

/// Opens the store on a test pool.
pub async fn database(pool: SqlitePool) -> Arc<dyn Database> {
    Arc::new(
        SqliteDatabase::from_pool(pool)
            .await
            .expect("failed to create database"),
    )
}

/// The records every runner call references.
pub struct Records {
    /// The dataset.
    pub dataset_id: i64,
    /// The workflow task.
    pub wftask: WorkflowTask,
    /// The job.
    pub job_id: i64,
    /// The history run of the workflow task.
    pub run_id: i64,
}

/// Creates a dataset, a workflow task of the given type, a job and a run.
pub async fn records(db: &Arc<dyn Database>, task_type: TaskType, working_dir: &Path) -> Records {
    let dataset = db
        .create_dataset("plate", "/zarr", &[])
        .await
        .expect("failed to create dataset");
    let wftask = db
        .create_workflow_task(NewWorkflowTask::new(1, 0, "measure", task_type))
        .await
        .expect("failed to create workflow task");
    let job = db
        .create_job(NewJob {
            dataset_id: dataset.id,
            workflow_id: 1,
            working_dir: working_dir.to_string_lossy().into_owned(),
            working_dir_user: None,
            slurm_user: None,
            first_task_index: 0,
            last_task_index: 0,
        })
        .await
        .expect("failed to create job");
    let run = db
        .create_history_run(dataset.id, wftask.id, job.id, 0)
        .await
        .expect("failed to create history run");

    Records {
        dataset_id: dataset.id,
        wftask,
        job_id: job.id,
        run_id: run.id,
    }
}

/// Creates the given number of units in a run.
pub async fn units(db: &Arc<dyn Database>, run_id: i64, count: usize) -> Vec<i64> {
    db.create_history_units(run_id, vec![NewHistoryUnit::default(); count])
        .await
        .expect("failed to create history units")
        .into_iter()
        .map(|u| u.id)
        .collect()
}

/// Lists the statuses of the units of a run.
pub async fn unit_statuses(db: &Arc<dyn Database>, run_id: i64) -> Vec<HistoryStatus> {
    db.list_history_units(run_id)
        .await
        .expect("failed to list history units")
        .into_iter()
        .map(|u| u.status)
        .collect()
}

/// Converts a JSON object into task parameters.
pub fn parameters(value: JsonValue) -> JsonMap {
    match value {
        JsonValue::Object(map) => map,
        other => panic!("expected an object, found `{other}`"),
    }
}

/// Checks whether a process is still running (zombies count as gone).
pub fn is_alive(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z" && state != "X"),
        Err(_) => false,
    }
}

/// Waits for a file to appear, for at most ten seconds.
pub async fn wait_for_file(path: &Path) -> bool {
    for _ in 0..200 {
        if path.exists() {
            return true;
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    false
}
