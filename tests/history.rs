//! History store tests.

mod common;

use std::sync::Arc;

use fractal_runner::config::HistorySettings;
use fractal_runner::history::Database;
use fractal_runner::history::HistoryImageCache;
use fractal_runner::history::HistoryStatus;
use fractal_runner::history::HistoryUnit;
use fractal_runner::history::NewHistoryUnit;
use fractal_runner::history::SqliteDatabase;
use fractal_runner::models::TaskType;
use pretty_assertions::assert_eq;
use sqlx::SqlitePool;
use tempfile::tempdir;

#[sqlx::test]
async fn concurrent_modifications_serialize(pool: SqlitePool) {
    let db = common::database(pool).await;
    let root = tempdir().unwrap();
    let records = common::records(&db, TaskType::Parallel, root.path()).await;
    let units = common::units(&db, records.run_id, 1).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let db = db.clone();
        let id = units[0];
        handles.push(tokio::spawn(async move {
            db.modify_history_unit(
                id,
                Box::new(move |unit: &mut HistoryUnit| {
                    unit.zarr_urls.0.push(format!("/zarr/plate.zarr/A/0{i}/0"))
                }),
            )
            .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let unit = db.get_history_unit(units[0]).await.unwrap().unwrap();
    let mut urls = unit.zarr_urls.0;
    urls.sort();
    assert_eq!(
        urls,
        (0..8)
            .map(|i| format!("/zarr/plate.zarr/A/0{i}/0"))
            .collect::<Vec<_>>()
    );
    assert_eq!(unit.status, HistoryStatus::Submitted);
}

#[sqlx::test]
async fn image_cache_keeps_the_last_write(pool: SqlitePool) {
    // One row per statement
    let db: Arc<dyn Database> = Arc::new(
        SqliteDatabase::from_pool(pool)
            .await
            .unwrap()
            .with_settings(&HistorySettings {
                upsert_chunk_size: 1,
            }),
    );
    let root = tempdir().unwrap();
    let records = common::records(&db, TaskType::Parallel, root.path()).await;

    let url = "/zarr/plate.zarr/A/01/0".to_string();
    let units = db
        .create_history_units(
            records.run_id,
            vec![
                NewHistoryUnit {
                    logfile: Some("first.log".to_string()),
                    zarr_urls: vec![url.clone()],
                },
                NewHistoryUnit {
                    logfile: Some("second.log".to_string()),
                    zarr_urls: vec![url.clone()],
                },
            ],
        )
        .await
        .unwrap();

    let row = |unit: i64| HistoryImageCache {
        zarr_url: url.clone(),
        dataset_id: records.dataset_id,
        workflowtask_id: records.wftask.id,
        latest_history_unit_id: unit,
    };

    db.upsert_image_cache(&[row(units[0].id), row(units[1].id)])
        .await
        .unwrap();
    assert_eq!(
        db.get_image_cache(&url, records.dataset_id, records.wftask.id)
            .await
            .unwrap()
            .unwrap()
            .latest_history_unit_id,
        units[1].id
    );

    db.upsert_image_cache(&[row(units[0].id)]).await.unwrap();
    db.update_history_unit_status(units[0].id, HistoryStatus::Failed)
        .await
        .unwrap();

    let status = db
        .image_status(records.dataset_id, records.wftask.id, &url)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.status, HistoryStatus::Failed);
    assert_eq!(status.logfile.as_deref(), Some("first.log"));
}
