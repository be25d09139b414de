//! The on-disk layout of task invocations.
//!
//! Every workflow task execution gets its own subfolder of the job working
//! directory, both locally and on the remote host:
//!
//! ```text
//! <root>/
//! ├─ workflow.log                      # The job log
//! ├─ SHUTDOWN                          # The shutdown sentinel, when requested
//! ├─ 0_create_ome_zarr/                # One subfolder per workflow task
//! │  ├─ non_par-args.json              # The arguments of an invocation
//! │  ├─ non_par-out.json               # The output of an invocation
//! │  ├─ non_par-log.txt                # The log of an invocation
//! │  ├─ non_par-exitcode.txt           # The exit status (SLURM only)
//! │  ├─ slurm-non_par.sh               # A submission script (SLURM only)
//! │  ├─ slurm-non_par.out              # Its standard output (SLURM only)
//! │  ├─ slurm-non_par.err              # Its standard error (SLURM only)
//! ├─ 1_illumination_correction/
//! │  ├─ 0000000-args.json
//! │  ├─ ...
//! ```

use std::path::Path;
use std::path::PathBuf;

/// The component name of a non-parallel invocation.
pub const NON_PARALLEL_COMPONENT: &str = "non_par";

/// The component name of the initialization invocation of a compound task.
pub const INIT_COMPONENT: &str = "init";

/// Gets the component name of the parallel invocation with the given index.
pub fn parallel_component(index: usize) -> String {
    format!("{index:07}")
}

/// Gets the component name of the compute invocation of a compound task with
/// the given index.
pub fn compound_component(index: usize) -> String {
    format!("compute-{index:07}")
}

/// Replaces every character that is not ASCII alphanumeric with `_` and
/// lowercases the rest.
pub fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// The files of a single task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFiles {
    /// The local job working directory.
    pub root_dir_local: PathBuf,
    /// The job working directory on the host running the invocation.
    pub root_dir_remote: PathBuf,
    /// The name of the task.
    pub task_name: String,
    /// The order of the workflow task.
    pub task_order: i64,
    /// The component of the invocation.
    pub component: String,
}

impl TaskFiles {
    /// Creates the files of an invocation whose job working directory is
    /// mirrored on a remote host.
    pub fn new(
        root_dir_local: impl Into<PathBuf>,
        root_dir_remote: impl Into<PathBuf>,
        task_name: impl Into<String>,
        task_order: i64,
        component: impl Into<String>,
    ) -> Self {
        Self {
            root_dir_local: root_dir_local.into(),
            root_dir_remote: root_dir_remote.into(),
            task_name: task_name.into(),
            task_order,
            component: component.into(),
        }
    }

    /// Creates the files of an invocation that runs on the local host.
    pub fn local(
        root_dir: impl Into<PathBuf>,
        task_name: impl Into<String>,
        task_order: i64,
        component: impl Into<String>,
    ) -> Self {
        let root_dir = root_dir.into();
        Self {
            root_dir_remote: root_dir.clone(),
            root_dir_local: root_dir,
            task_name: task_name.into(),
            task_order,
            component: component.into(),
        }
    }

    /// Gets the files of another component of the same workflow task.
    pub fn with_component(&self, component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            ..self.clone()
        }
    }

    /// Gets the name of the workflow task subfolder.
    pub fn subfolder_name(&self) -> String {
        format!(
            "{order}_{name}",
            order = self.task_order,
            name = sanitize(&self.task_name)
        )
    }

    /// Gets the local workflow task subfolder.
    pub fn wftask_subfolder_local(&self) -> PathBuf {
        self.root_dir_local.join(self.subfolder_name())
    }

    /// Gets the remote workflow task subfolder.
    pub fn wftask_subfolder_remote(&self) -> PathBuf {
        self.root_dir_remote.join(self.subfolder_name())
    }

    /// Gets the prefix of the invocation's file names.
    pub fn prefix(&self) -> String {
        sanitize_component(&self.component)
    }

    /// Gets the name of the arguments file.
    pub fn args_file_name(&self) -> String {
        format!("{prefix}-args.json", prefix = self.prefix())
    }

    /// Gets the name of the output file.
    pub fn output_file_name(&self) -> String {
        format!("{prefix}-out.json", prefix = self.prefix())
    }

    /// Gets the name of the log file.
    pub fn log_file_name(&self) -> String {
        format!("{prefix}-log.txt", prefix = self.prefix())
    }

    /// Gets the name of the exit status file.
    pub fn exitcode_file_name(&self) -> String {
        format!("{prefix}-exitcode.txt", prefix = self.prefix())
    }

    /// Gets the local arguments file.
    pub fn args_file_local(&self) -> PathBuf {
        self.wftask_subfolder_local().join(self.args_file_name())
    }

    /// Gets the remote arguments file.
    pub fn args_file_remote(&self) -> PathBuf {
        self.wftask_subfolder_remote().join(self.args_file_name())
    }

    /// Gets the local output file.
    pub fn output_file_local(&self) -> PathBuf {
        self.wftask_subfolder_local().join(self.output_file_name())
    }

    /// Gets the remote output file.
    pub fn output_file_remote(&self) -> PathBuf {
        self.wftask_subfolder_remote().join(self.output_file_name())
    }

    /// Gets the local log file.
    pub fn log_file_local(&self) -> PathBuf {
        self.wftask_subfolder_local().join(self.log_file_name())
    }

    /// Gets the remote log file.
    pub fn log_file_remote(&self) -> PathBuf {
        self.wftask_subfolder_remote().join(self.log_file_name())
    }

    /// Gets the local exit status file.
    pub fn exitcode_file_local(&self) -> PathBuf {
        self.wftask_subfolder_local().join(self.exitcode_file_name())
    }

    /// Gets the remote exit status file.
    pub fn exitcode_file_remote(&self) -> PathBuf {
        self.wftask_subfolder_remote().join(self.exitcode_file_name())
    }

    /// Gets the names of the files an invocation produces.
    pub fn result_file_names(&self) -> Vec<String> {
        vec![
            self.output_file_name(),
            self.log_file_name(),
            self.exitcode_file_name(),
        ]
    }
}

/// Sanitizes a component name, keeping the `-` separators.
fn sanitize_component(component: &str) -> String {
    component
        .split('-')
        .map(sanitize)
        .collect::<Vec<_>>()
        .join("-")
}

/// Gets the path of the shutdown sentinel of a job working directory.
pub fn shutdown_sentinel(root_dir: &Path) -> PathBuf {
    root_dir.join(super::SHUTDOWN_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn layout() {
        let files = TaskFiles {
            root_dir_local: PathBuf::from("/local/job_1"),
            root_dir_remote: PathBuf::from("/remote/job_1"),
            task_name: "Illumination Correction".to_string(),
            task_order: 1,
            component: parallel_component(3),
        };

        assert_eq!(files.subfolder_name(), "1_illumination_correction");
        assert_eq!(
            files.args_file_local(),
            Path::new("/local/job_1/1_illumination_correction/0000003-args.json")
        );
        assert_eq!(
            files.output_file_remote(),
            Path::new("/remote/job_1/1_illumination_correction/0000003-out.json")
        );
        assert_eq!(
            files.with_component(compound_component(2)).log_file_local(),
            Path::new("/local/job_1/1_illumination_correction/compute-0000002-log.txt")
        );
        assert_eq!(
            files.with_component(NON_PARALLEL_COMPONENT).exitcode_file_name(),
            "non_par-exitcode.txt"
        );
    }

    #[test]
    fn local_files_share_roots() {
        let files = TaskFiles::local("/job", "cellpose", 0, INIT_COMPONENT);
        assert_eq!(files.wftask_subfolder_local(), files.wftask_subfolder_remote());
        assert_eq!(shutdown_sentinel(Path::new("/job")), Path::new("/job/SHUTDOWN"));
    }

    #[test]
    fn sanitizing() {
        assert_eq!(sanitize("Create OME-Zarr (v2)"), "create_ome_zarr__v2_");
    }
}
