//! Workload execution engine for Fractal workflows.
//!
//! A job runs a contiguous range of the tasks of a workflow over the images
//! of a dataset. The [`orchestrator`] walks the tasks in order, hands every
//! task invocation to a [`runner::TaskRunner`] and records the progress of
//! each invocation in the [`history`] store:
//!
//! * [`runner::LocalRunner`] runs invocations as child processes of the
//!   current process.
//! * [`runner::SudoSlurmRunner`] batches invocations into SLURM jobs
//!   submitted as another user of the same host.
//! * [`runner::SshSlurmRunner`] batches invocations into SLURM jobs submitted
//!   on a remote cluster over a shared SSH connection.
//!
//! Every job writes its own log (see [`logging`]) which is copied into the
//! job row when the job ends.

pub mod config;
pub mod error;
pub mod history;
pub mod images;
pub mod logging;
pub mod models;
pub mod orchestrator;
pub mod runner;
pub mod transport;

pub use config::Settings;
pub use history::Database;
pub use history::SqliteDatabase;
pub use orchestrator::submit_workflow;
