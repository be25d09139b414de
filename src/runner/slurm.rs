//! Implementation of the SLURM runners.
//!
//! A runner call is split into SLURM jobs by the batching heuristics. For each
//! job a submission script is rendered locally and uploaded together with the
//! arguments files through the [`Transport`]; the job is then submitted with
//! `sbatch` and the scheduler is polled with `squeue` until every job has
//! finished. The results of finished jobs are fetched back into the local job
//! working directory and read from there.
//!
//! Shutdown is advisory: the poll loop notices an explicit request or the
//! shutdown sentinel, cancels the tracked jobs with `scancel` and reports every
//! unfinished invocation as a shutdown error.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::Invocation;
use super::MultisubmitOutcome;
use super::MultisubmitRequest;
use super::ShutdownSignal;
use super::SubmitRequest;
use super::TaskOutcome;
use super::TaskRunner;
use super::batching::Batching;
use super::batching::compute_batching;
use super::create_local_subfolder;
use super::log_tail;
use super::read_output;
use super::record_outcome;
use super::validation::validate_multisubmit;
use super::validation::validate_submit;
use super::write_parameters;
use crate::config::SlurmSettings;
use crate::error::JobExecutionError;
use crate::error::RunnerError;
use crate::history::Database;
use crate::models::TaskMeta;
use crate::transport::SshTransport;
use crate::transport::SudoTransport;
use crate::transport::Transport;
use crate::transport::TransportError;

pub mod script;

pub use script::SlurmJob;
pub use script::SlurmJobState;
pub use script::SlurmTaskConfig;

/// The states `squeue` reports for jobs that will not run any further.
const TERMINAL_STATES: &[&str] = &[
    "BOOT_FAIL",
    "CANCELLED",
    "COMPLETED",
    "DEADLINE",
    "FAILED",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "TIMEOUT",
];

/// The `squeue` error reported when none of the queried jobs is known.
const INVALID_JOB_ID: &str = "Invalid job id specified";

/// Substrings of job standard error lines that are scheduler retry noise
/// rather than errors.
const BENIGN_STDERR_NEEDLES: &[&str] = &[
    "Job step creation temporarily disabled, retrying",
    "Step created for StepId",
    "Requested nodes are busy",
];

/// A SLURM runner using the privileged local transport.
pub type SudoSlurmRunner = SlurmRunner<SudoTransport>;

/// A SLURM runner using the SSH transport.
pub type SshSlurmRunner = SlurmRunner<SshTransport>;

/// Removes scheduler retry noise from the standard error of a job.
pub fn filter_benign_stderr(stderr: &str) -> String {
    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| {
            !BENIGN_STDERR_NEEDLES
                .iter()
                .any(|needle| line.contains(needle))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parses the output of `sbatch --parsable` into a job identifier.
pub fn parse_sbatch_output(stdout: &str) -> Option<String> {
    let line = stdout.lines().map(str::trim).find(|l| !l.is_empty())?;
    let id = line.split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit())).then(|| id.to_string())
}

/// Parses the output of `squeue --format='%i %T'` into job states.
pub fn parse_squeue_output(stdout: &str) -> HashMap<String, String> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let id = parts.next()?;
            let state = parts.next()?;
            Some((id.to_string(), state.to_string()))
        })
        .collect()
}

/// The result of a scheduler query.
#[derive(Debug)]
enum PollResult {
    /// The identifiers of the queried jobs that have finished.
    Finished(BTreeSet<String>),
    /// The query failed in a way that may resolve on its own.
    Degraded(TransportError),
}

/// Represents a task runner that submits invocations as SLURM jobs.
#[derive(Debug)]
pub struct SlurmRunner<T: Transport> {
    /// The transport to the host talking to the scheduler.
    transport: Arc<T>,
    /// The history store.
    db: Arc<dyn Database>,
    /// The SLURM configuration.
    settings: SlurmSettings,
    /// The shutdown signal of the job.
    shutdown: ShutdownSignal,
    /// The identifiers of the submitted jobs that have not finished.
    tracked: Mutex<BTreeSet<String>>,
}

impl<T: Transport> SlurmRunner<T> {
    /// Constructs a new SLURM runner for the given local job working
    /// directory.
    pub fn new(
        transport: Arc<T>,
        db: Arc<dyn Database>,
        root_dir: impl Into<PathBuf>,
        settings: SlurmSettings,
    ) -> Self {
        let root_dir = root_dir.into();
        Self {
            transport,
            db,
            settings,
            shutdown: ShutdownSignal::new(&root_dir),
            tracked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Gets the transport of the runner.
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Gets the identifiers of the submitted jobs that have not finished.
    pub fn tracked_jobs(&self) -> Vec<String> {
        self.tracked().iter().cloned().collect()
    }

    /// Locks the set of tracked jobs.
    fn tracked(&self) -> MutexGuard<'_, BTreeSet<String>> {
        match self.tracked.lock() {
            Ok(tracked) => tracked,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resolves the job configuration and batching of a call.
    fn plan(
        &self,
        meta: &TaskMeta,
        tot_tasks: usize,
        single: bool,
    ) -> Result<(SlurmTaskConfig, Batching), RunnerError> {
        let mut config = SlurmTaskConfig::resolve(&self.settings, meta)?;
        if single {
            // A single invocation is a single job whatever the overrides say
            config.tasks_per_job = None;
            config.parallel_tasks_per_job = None;
        }

        let batching = compute_batching(&config.batching_parameters(&self.settings, tot_tasks))?;
        debug!(
            tasks_per_job = batching.tasks_per_job,
            parallel_tasks_per_job = batching.parallel_tasks_per_job,
            "computed SLURM batching for {tot_tasks} invocations"
        );
        Ok((config, batching))
    }

    /// Cancels jobs with `scancel`, ignoring failures.
    async fn cancel(&self, ids: &[String]) {
        if ids.is_empty() {
            return;
        }

        {
            let mut tracked = self.tracked();
            for id in ids {
                tracked.remove(id);
            }
        }

        let command = format!("scancel {ids}", ids = ids.join(" "));
        match self.transport.run_command(&command).await {
            Ok(_) => info!("cancelled SLURM jobs {ids}", ids = ids.join(", ")),
            Err(e) => warn!("failed to cancel SLURM jobs: {e}"),
        }
    }

    /// Queries the scheduler for the jobs that have finished.
    async fn poll(&self, ids: &[String]) -> Result<PollResult, TransportError> {
        let command = format!(
            "squeue --noheader --format='%i %T' --states=all --jobs={ids}",
            ids = ids.join(",")
        );

        match self.transport.run_command(&command).await {
            Ok(output) => {
                let states = parse_squeue_output(&output.stdout);
                Ok(PollResult::Finished(
                    ids.iter()
                        .filter(|id| match states.get(*id) {
                            Some(state) => TERMINAL_STATES.contains(&state.as_str()),
                            None => true,
                        })
                        .cloned()
                        .collect(),
                ))
            }
            Err(e) if e.stderr().is_some_and(|s| s.contains(INVALID_JOB_ID)) => {
                Ok(PollResult::Finished(ids.iter().cloned().collect()))
            }
            Err(e) if e.is_recoverable() => Ok(PollResult::Degraded(e)),
            Err(e) => Err(e),
        }
    }

    /// Writes the arguments files and submission scripts of the jobs and
    /// uploads them.
    async fn prepare(
        &self,
        command: &str,
        config: &SlurmTaskConfig,
        jobs: &[SlurmJob],
    ) -> Result<(), JobExecutionError> {
        for job in jobs {
            let (Some(local), Some(remote)) = (job.subfolder_local(), job.subfolder_remote())
            else {
                continue;
            };

            for invocation in &job.invocations {
                create_local_subfolder(&invocation.files)?;
                let args_file = invocation.files.args_file_local();
                write_parameters(&args_file, &invocation.parameters).map_err(|e| {
                    JobExecutionError::new(format!(
                        "failed to write task arguments `{path}`: {e}",
                        path = args_file.display()
                    ))
                })?;
            }

            let script_file = local.join(job.script_file_name());
            std::fs::write(&script_file, job.render_script(command, config)).map_err(|e| {
                JobExecutionError::new(format!(
                    "failed to write submission script `{path}`: {e}",
                    path = script_file.display()
                ))
            })?;

            let transfer = async {
                self.transport.create_directory(&remote).await?;
                self.transport
                    .send_artifacts(&local, &remote, &job.input_file_names())
                    .await
            };

            transfer.await.map_err(|e| {
                JobExecutionError::new(format!(
                    "failed to upload the files of SLURM job `{label}`",
                    label = job.label
                ))
                .with_stderr(e.to_string())
            })?;
        }

        Ok(())
    }

    /// Submits the prepared jobs.
    ///
    /// If any submission fails, the jobs submitted so far are cancelled.
    async fn submit_jobs(&self, jobs: &mut [SlurmJob]) -> Result<(), JobExecutionError> {
        let mut submitted = Vec::with_capacity(jobs.len());
        for job in jobs.iter_mut() {
            if self.shutdown.is_requested() {
                self.cancel(&submitted).await;
                return Err(JobExecutionError::shutdown());
            }

            let Some(remote) = job.subfolder_remote() else {
                continue;
            };

            let script = remote.join(job.script_file_name());
            let command = format!(
                "sbatch --parsable {script}",
                script = super::quote_path(&script)
            );
            debug!(command, "submitting SLURM job");

            let result = match self.transport.run_command(&command).await {
                Ok(output) => parse_sbatch_output(&output.stdout).ok_or_else(|| {
                    JobExecutionError::new(format!(
                        "unexpected `sbatch` output for job `{label}`",
                        label = job.label
                    ))
                    .with_stderr(output.stdout)
                }),
                Err(e) => Err(JobExecutionError::new(format!(
                    "failed to submit SLURM job `{label}`",
                    label = job.label
                ))
                .with_stderr(e.to_string())),
            };

            match result {
                Ok(id) => {
                    info!(
                        "submitted SLURM job {id} for {n} invocations",
                        n = job.invocations.len()
                    );
                    self.tracked().insert(id.clone());
                    submitted.push(id.clone());
                    job.slurm_id = Some(id);
                    job.state = SlurmJobState::Submitted;
                }
                Err(e) => {
                    error!("{e}");
                    self.cancel(&submitted).await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Fetches the results of finished jobs and records the outcome of each
    /// of their invocations.
    async fn collect(
        &self,
        jobs: Vec<SlurmJob>,
        first_error: &mut Option<JobExecutionError>,
        outcome: &mut MultisubmitOutcome,
    ) -> Result<(), RunnerError> {
        for mut job in jobs {
            let (Some(local), Some(remote)) = (job.subfolder_local(), job.subfolder_remote())
            else {
                continue;
            };

            let fetched = self
                .transport
                .fetch_artifacts(&remote, &local, &job.result_file_names())
                .await;

            if let Err(e) = &fetched {
                warn!(
                    "failed to fetch the results of SLURM job `{label}`: {e}",
                    label = job.label
                );
            }

            let mut missing = false;
            for invocation in &job.invocations {
                let result = match std::fs::read_to_string(invocation.files.exitcode_file_local())
                {
                    Ok(code) => Some(Self::invocation_outcome(invocation, code.trim())),
                    Err(_) => None,
                };

                let result: TaskOutcome = match result {
                    Some(result) => result,
                    None => {
                        missing = true;
                        let e = first_error.get_or_insert_with(|| {
                            Self::missing_result_error(&job, &local, fetched.as_ref().err())
                        });
                        Err(e.clone().into())
                    }
                };

                record_outcome(&self.db, invocation.history_unit_id, &result).await?;
                outcome.insert(invocation.index, result);
            }

            job.state = if missing {
                SlurmJobState::Failed
            } else {
                SlurmJobState::Completed
            };
            debug!(
                "SLURM job `{label}` ({id}) is {state:?}",
                label = job.label,
                id = job.slurm_id.as_deref().unwrap_or_default(),
                state = job.state
            );
        }

        Ok(())
    }

    /// Gets the outcome of an invocation from its exit status.
    fn invocation_outcome(invocation: &Invocation, code: &str) -> TaskOutcome {
        match code.parse::<i32>() {
            Ok(0) => read_output(&invocation.files.output_file_local())
                .map_err(|e| invocation.task_error(e)),
            Ok(code) => {
                info!(
                    "invocation {index} has terminated with status code {code}",
                    index = invocation.index
                );
                Err(invocation.task_error(log_tail(&invocation.files.log_file_local())))
            }
            Err(_) => Err(JobExecutionError::new(format!(
                "invalid exit status `{code}` for invocation {index}",
                index = invocation.index
            ))
            .into()),
        }
    }

    /// Builds the error reported for invocations that left no result.
    fn missing_result_error(
        job: &SlurmJob,
        local: &std::path::Path,
        fetch_error: Option<&TransportError>,
    ) -> JobExecutionError {
        let id = job.slurm_id.as_deref().unwrap_or_default();
        let stderr = std::fs::read_to_string(local.join(job.stderr_file_name()))
            .map(|s| filter_benign_stderr(&s))
            .unwrap_or_default();

        let error = JobExecutionError::new(format!(
            "SLURM job {id} finished without producing results for all of its tasks"
        ));

        match (stderr.is_empty(), fetch_error) {
            (false, _) => error.with_stderr(stderr),
            (true, Some(e)) => error.with_stderr(e.to_string()),
            (true, None) => error,
        }
    }

    /// Runs the invocations of a call as SLURM jobs and records their
    /// outcomes.
    async fn run(
        &self,
        command: &str,
        invocations: Vec<Invocation>,
        config: &SlurmTaskConfig,
        batching: Batching,
    ) -> Result<MultisubmitOutcome, RunnerError> {
        let mut outcome = MultisubmitOutcome::default();

        let mut jobs: Vec<_> = invocations
            .chunks(batching.tasks_per_job)
            .map(|chunk| SlurmJob::new(chunk.to_vec(), batching.parallel_tasks_per_job))
            .collect();

        let submitted = if self.shutdown.is_requested() {
            Err(JobExecutionError::shutdown())
        } else {
            match self.prepare(command, config, &jobs).await {
                Ok(()) => self.submit_jobs(&mut jobs).await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = submitted {
            for invocation in &invocations {
                let result: TaskOutcome = Err(e.clone().into());
                record_outcome(&self.db, invocation.history_unit_id, &result).await?;
                outcome.insert(invocation.index, result);
            }

            return Ok(outcome);
        }

        let mut first_error = None;
        let mut failures = 0;
        let interval = self.settings.poll_interval();
        while !jobs.is_empty() {
            let cancelled = tokio::select! {
                _ = self.shutdown.token().cancelled() => true,
                _ = tokio::time::sleep(interval) => self.shutdown.is_requested(),
            };

            let ids: Vec<_> = jobs.iter().filter_map(|j| j.slurm_id.clone()).collect();
            let abandon = if cancelled {
                warn!("shutdown requested; cancelling {n} SLURM jobs", n = ids.len());
                Some(JobExecutionError::shutdown())
            } else {
                match self.poll(&ids).await {
                    Ok(PollResult::Finished(finished)) => {
                        failures = 0;
                        let (done, running): (Vec<_>, Vec<_>) = jobs.into_iter().partition(|j| {
                            j.slurm_id.as_ref().is_some_and(|id| finished.contains(id))
                        });
                        jobs = running;

                        {
                            let mut tracked = self.tracked();
                            for id in done.iter().filter_map(|j| j.slurm_id.as_ref()) {
                                tracked.remove(id);
                            }
                        }

                        self.collect(done, &mut first_error, &mut outcome).await?;
                        None
                    }
                    Ok(PollResult::Degraded(e)) => {
                        failures += 1;
                        warn!(
                            "SLURM status query failed ({failures}/{max}): {e}",
                            max = self.settings.max_poll_failures
                        );

                        (failures > self.settings.max_poll_failures).then(|| {
                            JobExecutionError::new(format!(
                                "lost contact with the SLURM scheduler after {failures} failed \
                                 status queries"
                            ))
                            .with_stderr(e.to_string())
                        })
                    }
                    Err(e) => {
                        error!("SLURM status query failed: {e}");
                        Some(
                            JobExecutionError::new("failed to query the SLURM scheduler")
                                .with_stderr(e.to_string()),
                        )
                    }
                }
            };

            if let Some(e) = abandon {
                self.cancel(&ids).await;
                for mut job in jobs.drain(..) {
                    job.state = SlurmJobState::Cancelled;
                    for invocation in &job.invocations {
                        let result: TaskOutcome = Err(e.clone().into());
                        record_outcome(&self.db, invocation.history_unit_id, &result).await?;
                        outcome.insert(invocation.index, result);
                    }
                }
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl<T: Transport> TaskRunner for SlurmRunner<T> {
    async fn submit(&self, request: SubmitRequest) -> Result<TaskOutcome, RunnerError> {
        validate_submit(&request)?;
        let (config, batching) = self.plan(&request.config, 1, true)?;

        let command = request.command.clone();
        let mut outcome = self
            .run(&command, vec![Invocation::single(request)], &config, batching)
            .await?;

        let result = match outcome.results.remove(&0) {
            Some(result) => Ok(result),
            None => Err(outcome
                .errors
                .remove(&0)
                .unwrap_or_else(|| JobExecutionError::new("the invocation did not complete").into())),
        };

        Ok(result)
    }

    async fn multisubmit(
        &self,
        request: MultisubmitRequest,
    ) -> Result<MultisubmitOutcome, RunnerError> {
        validate_multisubmit(&request)?;
        let total = request.list_parameters.len();
        let (config, batching) = self.plan(&request.config, total, false)?;

        info!(
            "running {total} invocations in {jobs} SLURM jobs",
            jobs = batching.num_jobs(total)
        );

        let invocations = Invocation::batch(
            request.list_parameters,
            request.list_task_files,
            request.list_history_unit_ids,
        )
        .collect();

        self.run(&request.command, invocations, &config, batching)
            .await
    }

    async fn shutdown(&self) {
        self.shutdown.trigger();

        let ids: Vec<_> = self.tracked().iter().cloned().collect();
        self.cancel(&ids).await;
        self.transport.close().await;

        debug!("SLURM runner has shut down");
    }
}
