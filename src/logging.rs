//! The per-job log.
//!
//! Every job writes its log to `workflow.log` in its working directory. The
//! log is a [`tracing`] subscriber of its own; it is installed for the future
//! running the job, not globally, so concurrent jobs of the same process
//! never share a log.

use std::fs::File;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use tracing::Dispatch;
use tracing_subscriber::EnvFilter;

/// The name of the log file of a job working directory.
pub const WORKFLOW_LOG_FILE_NAME: &str = "workflow.log";

/// The default filter directives of a job log.
pub const DEFAULT_LOG_DIRECTIVES: &str = "info,sqlx=warn";

/// The log of a job.
#[derive(Debug, Clone)]
pub struct JobLog {
    /// The path of the log file.
    path: PathBuf,
    /// The subscriber writing to the log file.
    dispatch: Dispatch,
}

impl JobLog {
    /// Creates the log file of the given job working directory, truncating
    /// any previous log.
    pub fn create(root_dir: &Path) -> Result<Self> {
        Self::with_directives(root_dir, DEFAULT_LOG_DIRECTIVES)
    }

    /// Creates the log file of the given job working directory with the given
    /// filter directives.
    pub fn with_directives(root_dir: &Path, directives: &str) -> Result<Self> {
        let path = root_dir.join(WORKFLOW_LOG_FILE_NAME);
        let file = File::create(&path).with_context(|| {
            format!("failed to create log file `{path}`", path = path.display())
        })?;

        let filter = EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter `{directives}`"))?;

        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_env_filter(filter)
            .with_writer(file)
            .with_ansi(false)
            .with_target(false)
            .finish();

        Ok(Self {
            path,
            dispatch: Dispatch::new(subscriber),
        })
    }

    /// Gets the path of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Gets the subscriber writing to the log file.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Reads the contents of the log file.
    ///
    /// An unreadable log reads as an explanation of why it is unreadable.
    pub fn contents(&self) -> String {
        std::fs::read_to_string(&self.path).unwrap_or_else(|e| {
            format!(
                "failed to read log file `{path}`: {e}",
                path = self.path.display()
            )
        })
    }
}
