//! SLURM job configuration and submission scripts.

use std::fmt::Write as _;
use std::path::PathBuf;

use super::super::Invocation;
use super::super::batching::BatchingParameters;
use super::super::invocation_command;
use super::super::quote;
use super::super::quote_path;
use crate::config::SlurmSettings;
use crate::config::to_mebibytes;
use crate::error::SlurmConfigError;
use crate::models::TaskMeta;

/// The maximum length of a SLURM job name.
const SLURM_JOB_NAME_MAX_LENGTH: usize = 1024;

/// The prefix every extra submission script line must have.
const SBATCH_PREFIX: &str = "#SBATCH";

/// The resources and directives of the jobs of a single runner call.
///
/// This is the SLURM configuration overridden by the resource hints of the
/// workflow task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmTaskConfig {
    /// The partition jobs are submitted to.
    pub partition: Option<String>,
    /// The account jobs are charged to.
    pub account: Option<String>,
    /// The number of CPUs of a single invocation.
    pub cpus_per_task: u64,
    /// The memory, in MiB, of a single invocation.
    pub mem_per_task_mb: u64,
    /// The generic resources requested for GPU tasks.
    pub gres: Option<String>,
    /// The node constraint requested for GPU tasks.
    pub constraint: Option<String>,
    /// The time limit of a job.
    pub time: Option<String>,
    /// Additional `#SBATCH` lines.
    pub extra_lines: Vec<String>,
    /// Shell lines run before the task steps.
    pub worker_init: Vec<String>,
    /// An override of the number of invocations per job.
    pub tasks_per_job: Option<usize>,
    /// An override of the number of concurrent invocations per job.
    pub parallel_tasks_per_job: Option<usize>,
}

impl SlurmTaskConfig {
    /// Resolves the configuration of a call from the SLURM settings and the
    /// resource hints of the workflow task.
    pub fn resolve(settings: &SlurmSettings, meta: &TaskMeta) -> Result<Self, SlurmConfigError> {
        let gpu = meta.needs_gpu.then_some(&settings.gpu);
        let partition = meta
            .partition
            .clone()
            .or_else(|| gpu.and_then(|g| g.partition.clone()))
            .or_else(|| settings.partition.clone());

        let mut extra_lines = settings.extra_lines.clone();
        for line in &meta.extra_lines {
            if !line.starts_with(SBATCH_PREFIX) {
                return Err(SlurmConfigError::new(format!(
                    "extra line `{line}` must start with `{SBATCH_PREFIX}`"
                )));
            }

            if !extra_lines.contains(line) {
                extra_lines.push(line.clone());
            }
        }

        Ok(Self {
            partition,
            account: settings.account.clone(),
            cpus_per_task: meta.cpus_per_task.unwrap_or(settings.cpus_per_task),
            mem_per_task_mb: meta
                .mem_per_task_mb
                .unwrap_or_else(|| to_mebibytes(settings.mem_per_task)),
            gres: gpu.and_then(|g| g.gres.clone()),
            constraint: gpu.and_then(|g| g.constraint.clone()),
            time: settings.time.clone(),
            extra_lines,
            worker_init: settings.worker_init.clone(),
            tasks_per_job: meta.tasks_per_job,
            parallel_tasks_per_job: meta.parallel_tasks_per_job,
        })
    }

    /// Gets the batching inputs of a call with the given number of
    /// invocations.
    pub fn batching_parameters(
        &self,
        settings: &SlurmSettings,
        tot_tasks: usize,
    ) -> BatchingParameters {
        let batching = &settings.batching;
        BatchingParameters {
            tot_tasks,
            cpus_per_task: self.cpus_per_task,
            mem_per_task: self.mem_per_task_mb,
            target_cpus_per_job: batching.target_cpus_per_job,
            max_cpus_per_job: batching.max_cpus_per_job,
            target_mem_per_job: to_mebibytes(batching.target_mem_per_job),
            max_mem_per_job: to_mebibytes(batching.max_mem_per_job),
            target_num_jobs: batching.target_num_jobs,
            max_num_jobs: batching.max_num_jobs,
            tasks_per_job: self.tasks_per_job,
            parallel_tasks_per_job: self.parallel_tasks_per_job,
        }
    }
}

/// The state of a SLURM job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlurmJobState {
    /// The script is written but not submitted.
    Prepared,
    /// The job was accepted by the scheduler.
    Submitted,
    /// The job finished and every invocation left a result.
    Completed,
    /// The job finished and at least one invocation left no result.
    Failed,
    /// The job was cancelled.
    Cancelled,
}

/// A SLURM job running a group of invocations.
#[derive(Debug, Clone)]
pub struct SlurmJob {
    /// The label of the job, unique within its workflow task subfolder.
    pub label: String,
    /// The invocations of the job.
    pub(crate) invocations: Vec<Invocation>,
    /// The number of concurrent invocations of the job.
    pub parallel_tasks: usize,
    /// The scheduler identifier, once submitted.
    pub slurm_id: Option<String>,
    /// The state of the job.
    pub state: SlurmJobState,
}

impl SlurmJob {
    /// Creates a prepared job for the given invocations.
    ///
    /// The job is labelled after its first invocation.
    pub(crate) fn new(invocations: Vec<Invocation>, parallel_tasks: usize) -> Self {
        let label = invocations
            .first()
            .map(|i| i.files.prefix())
            .unwrap_or_default();
        Self {
            label,
            parallel_tasks: parallel_tasks.clamp(1, invocations.len().max(1)),
            invocations,
            slurm_id: None,
            state: SlurmJobState::Prepared,
        }
    }

    /// Gets the name of the submission script.
    pub fn script_file_name(&self) -> String {
        format!("slurm-{label}.sh", label = self.label)
    }

    /// Gets the name of the file receiving the standard output of the job.
    pub fn stdout_file_name(&self) -> String {
        format!("slurm-{label}.out", label = self.label)
    }

    /// Gets the name of the file receiving the standard error of the job.
    pub fn stderr_file_name(&self) -> String {
        format!("slurm-{label}.err", label = self.label)
    }

    /// Gets the remote workflow task subfolder of the job.
    pub fn subfolder_remote(&self) -> Option<PathBuf> {
        self.invocations
            .first()
            .map(|i| i.files.wftask_subfolder_remote())
    }

    /// Gets the local workflow task subfolder of the job.
    pub fn subfolder_local(&self) -> Option<PathBuf> {
        self.invocations
            .first()
            .map(|i| i.files.wftask_subfolder_local())
    }

    /// Gets the names of the files uploaded before submission.
    pub fn input_file_names(&self) -> Vec<String> {
        let mut files: Vec<_> = self
            .invocations
            .iter()
            .map(|i| i.files.args_file_name())
            .collect();
        files.push(self.script_file_name());
        files
    }

    /// Gets the names of the files fetched once the job finished.
    pub fn result_file_names(&self) -> Vec<String> {
        let mut files: Vec<_> = self
            .invocations
            .iter()
            .flat_map(|i| i.files.result_file_names())
            .collect();
        files.push(self.stdout_file_name());
        files.push(self.stderr_file_name());
        files
    }

    /// Gets the SLURM job name.
    fn job_name(&self) -> String {
        let mut name = self
            .invocations
            .first()
            .map(|i| i.files.subfolder_name())
            .unwrap_or_default();
        name.truncate(SLURM_JOB_NAME_MAX_LENGTH);
        name
    }

    /// Renders the submission script of the job.
    ///
    /// Invocations run as background `srun` steps in waves of at most
    /// `parallel_tasks` steps; each wave is awaited before the next starts.
    /// Every step records its exit status in the exit code file of its
    /// invocation.
    pub fn render_script(&self, command: &str, config: &SlurmTaskConfig) -> String {
        let subfolder = self.subfolder_remote().unwrap_or_default();
        let mem_per_job = config
            .mem_per_task_mb
            .saturating_mul(self.parallel_tasks as u64);

        let mut script = String::from("#!/bin/bash\n");
        let mut directive = |line: String| {
            script.push_str(SBATCH_PREFIX);
            script.push(' ');
            script.push_str(&line);
            script.push('\n');
        };

        if let Some(partition) = &config.partition {
            directive(format!("--partition={partition}"));
        }

        directive(format!("--ntasks={n}", n = self.parallel_tasks));
        directive(format!("--cpus-per-task={n}", n = config.cpus_per_task));
        directive(format!("--mem={mem_per_job}M"));
        directive(format!("--job-name={name}", name = self.job_name()));
        directive(format!(
            "--err={path}",
            path = subfolder.join(self.stderr_file_name()).display()
        ));
        directive(format!(
            "--out={path}",
            path = subfolder.join(self.stdout_file_name()).display()
        ));
        directive(format!("-D {path}", path = subfolder.display()));

        if let Some(account) = &config.account {
            directive(format!("--account={account}"));
        }

        if let Some(gres) = &config.gres {
            directive(format!("--gres={gres}"));
        }

        if let Some(constraint) = &config.constraint {
            directive(format!("--constraint={constraint}"));
        }

        if let Some(time) = &config.time {
            directive(format!("--time={time}"));
        }

        for line in &config.extra_lines {
            script.push_str(line);
            script.push('\n');
        }

        script.push('\n');
        for line in &config.worker_init {
            script.push_str(line);
            script.push('\n');
        }

        for wave in self.invocations.chunks(self.parallel_tasks) {
            script.push('\n');
            for invocation in wave {
                let files = &invocation.files;
                let step = format!(
                    "{invocation} > {log} 2>&1; echo $? > {exitcode}",
                    invocation = invocation_command(
                        command,
                        &files.args_file_remote(),
                        &files.output_file_remote()
                    ),
                    log = quote_path(&files.log_file_remote()),
                    exitcode = quote_path(&files.exitcode_file_remote())
                );

                // Writing to a `String` cannot fail
                let _ = writeln!(
                    script,
                    "srun --ntasks=1 --cpus-per-task={cpus} --mem={mem}M --exclusive bash -c {step} &",
                    cpus = config.cpus_per_task,
                    mem = config.mem_per_task_mb,
                    step = quote(&step)
                );
            }

            script.push_str("wait\n");
        }

        script
    }
}
