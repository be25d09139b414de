//! Models that back the history entities.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sqlx::FromRow;
use sqlx::Type as SqlxType;
use sqlx::types::Json;

/// The status of a history run or history unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum HistoryStatus {
    /// The work was submitted and has not completed.
    Submitted,
    /// The work completed successfully.
    Done,
    /// The work failed.
    Failed,
}

impl HistoryStatus {
    /// Returns `true` if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Submitted)
    }
}

impl fmt::Display for HistoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HistoryStatus::Submitted => write!(f, "submitted"),
            HistoryStatus::Done => write!(f, "done"),
            HistoryStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for HistoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submitted" => Ok(HistoryStatus::Submitted),
            "done" => Ok(HistoryStatus::Done),
            "failed" => Ok(HistoryStatus::Failed),
            _ => Err(format!("invalid history status: {s}")),
        }
    }
}

/// The execution of one workflow task of a job against a dataset.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HistoryRun {
    /// Unique identifier.
    pub id: i64,
    /// The dataset the workflow task ran against.
    pub dataset_id: i64,
    /// The workflow task that ran; unset once the workflow task is deleted.
    pub workflowtask_id: Option<i64>,
    /// The job the run belongs to.
    pub job_id: i64,
    /// The coarse-grained status of the run.
    pub status: HistoryStatus,
    /// The number of images available to the workflow task.
    pub num_available_images: i64,
    /// When execution of the workflow task began.
    pub timestamp_started: DateTime<Utc>,
}

/// A single schedulable execution atom of a history run.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HistoryUnit {
    /// Unique identifier.
    pub id: i64,
    /// The run the unit belongs to.
    pub history_run_id: i64,
    /// The path of the unit's log file.
    pub logfile: Option<String>,
    /// The status of the unit.
    pub status: HistoryStatus,
    /// The images covered by the unit.
    pub zarr_urls: Json<Vec<String>>,
}

/// A new history unit to insert.
#[derive(Debug, Clone, Default)]
pub struct NewHistoryUnit {
    /// The path of the unit's log file.
    pub logfile: Option<String>,
    /// The images covered by the unit.
    pub zarr_urls: Vec<String>,
}

/// A pointer from an image of a dataset and workflow task to the history unit
/// that most recently processed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct HistoryImageCache {
    /// The URL of the image.
    pub zarr_url: String,
    /// The dataset of the image.
    pub dataset_id: i64,
    /// The workflow task that processed the image.
    pub workflowtask_id: i64,
    /// The most recent history unit covering the image.
    pub latest_history_unit_id: i64,
}

/// The current status of an image for a workflow task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ImageStatus {
    /// The URL of the image.
    pub zarr_url: String,
    /// The status of the most recent unit covering the image.
    pub status: HistoryStatus,
    /// The log file of the most recent unit covering the image.
    pub logfile: Option<String>,
}

/// Image counts per status for a dataset and workflow task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    /// The number of images whose latest unit is still submitted.
    pub num_submitted_images: i64,
    /// The number of images whose latest unit is done.
    pub num_done_images: i64,
    /// The number of images whose latest unit failed.
    pub num_failed_images: i64,
    /// The number of images available to the most recent run, if any.
    pub num_available_images: Option<i64>,
}
