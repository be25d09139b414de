//! Batching heuristics for SLURM jobs.
//!
//! A call that runs `tot_tasks` invocations is split into SLURM jobs of
//! `tasks_per_job` invocations each, of which at most `parallel_tasks_per_job`
//! run concurrently inside one job.
//!
//! The per-job CPU and memory ceilings and the maximum number of jobs are
//! hard limits. Within them, the number of concurrent invocations of a job
//! is grown towards the per-job CPU and memory targets, and when that still
//! leaves more jobs than `target_num_jobs`, jobs are made longer (more waves
//! of concurrent invocations) rather than more numerous.
//!
//! The targets cap the concurrency of a job before the number of jobs is
//! minimized. With a CPU target of 4 and a ceiling of 8, eight single-CPU
//! invocations run as two jobs of four, not as one job of eight.

use crate::error::SlurmConfigError;

/// The inputs of [`compute_batching`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingParameters {
    /// The total number of invocations of the call.
    pub tot_tasks: usize,
    /// The number of CPUs of a single invocation.
    pub cpus_per_task: u64,
    /// The memory, in MiB, of a single invocation.
    pub mem_per_task: u64,
    /// The number of CPUs a job should aim for.
    pub target_cpus_per_job: u64,
    /// The maximum number of CPUs of a job.
    pub max_cpus_per_job: u64,
    /// The memory, in MiB, a job should aim for.
    pub target_mem_per_job: u64,
    /// The maximum memory, in MiB, of a job.
    pub max_mem_per_job: u64,
    /// The number of jobs the call should aim for.
    pub target_num_jobs: usize,
    /// The maximum number of jobs of the call.
    pub max_num_jobs: usize,
    /// A caller override of the number of invocations per job.
    pub tasks_per_job: Option<usize>,
    /// A caller override of the number of concurrent invocations per job.
    pub parallel_tasks_per_job: Option<usize>,
}

/// The outcome of [`compute_batching`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batching {
    /// The number of invocations per job.
    pub tasks_per_job: usize,
    /// The number of concurrent invocations per job.
    pub parallel_tasks_per_job: usize,
}

impl Batching {
    /// Gets the number of jobs needed for the given number of invocations.
    pub fn num_jobs(&self, tot_tasks: usize) -> usize {
        tot_tasks.div_ceil(self.tasks_per_job)
    }
}

/// Rounds `value` up to the next multiple of `multiple`.
fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Computes the number of invocations per job and the number of concurrent
/// invocations per job.
///
/// The result always satisfies `tasks_per_job >= parallel_tasks_per_job >= 1`
/// and `ceil(tot_tasks / tasks_per_job) <= max_num_jobs`. An override that
/// cannot be honored without breaking a hard ceiling is an error.
pub fn compute_batching(params: &BatchingParameters) -> Result<Batching, SlurmConfigError> {
    if params.tot_tasks == 0 {
        return Err(SlurmConfigError::new("there are no tasks to batch"));
    }

    if params.cpus_per_task == 0 || params.mem_per_task == 0 {
        return Err(SlurmConfigError::new(
            "the CPUs and memory of a task cannot be zero",
        ));
    }

    if params.max_num_jobs == 0 {
        return Err(SlurmConfigError::new(
            "the maximum number of jobs cannot be zero",
        ));
    }

    if params.cpus_per_task > params.max_cpus_per_job {
        return Err(SlurmConfigError::new(format!(
            "a task requests {cpus} CPUs but a job is limited to {max} CPUs",
            cpus = params.cpus_per_task,
            max = params.max_cpus_per_job
        )));
    }

    if params.mem_per_task > params.max_mem_per_job {
        return Err(SlurmConfigError::new(format!(
            "a task requests {mem} MiB of memory but a job is limited to {max} MiB",
            mem = params.mem_per_task,
            max = params.max_mem_per_job
        )));
    }

    // The largest number of concurrent tasks that fits in the per-job ceilings
    let ceiling = usize::try_from(
        (params.max_cpus_per_job / params.cpus_per_task)
            .min(params.max_mem_per_job / params.mem_per_task),
    )
    .unwrap_or(usize::MAX)
    .max(1);

    let mut parallel = match params.parallel_tasks_per_job {
        Some(0) => {
            return Err(SlurmConfigError::new(
                "`parallel_tasks_per_job` cannot be zero",
            ));
        }
        Some(parallel) if parallel > ceiling => {
            return Err(SlurmConfigError::new(format!(
                "`parallel_tasks_per_job` of {parallel} needs {cpus} CPUs and {mem} MiB of \
                 memory per job, exceeding the limits of {max_cpus} CPUs and {max_mem} MiB",
                cpus = params.cpus_per_task.saturating_mul(parallel as u64),
                mem = params.mem_per_task.saturating_mul(parallel as u64),
                max_cpus = params.max_cpus_per_job,
                max_mem = params.max_mem_per_job
            )));
        }
        Some(parallel) => parallel,
        None => {
            let target = usize::try_from(
                (params.target_cpus_per_job / params.cpus_per_task)
                    .min(params.target_mem_per_job / params.mem_per_task),
            )
            .unwrap_or(usize::MAX);

            target.clamp(1, ceiling).min(params.tot_tasks)
        }
    };

    let tasks_per_job = match params.tasks_per_job {
        Some(0) => return Err(SlurmConfigError::new("`tasks_per_job` cannot be zero")),
        Some(tasks) => {
            if tasks < parallel {
                if params.parallel_tasks_per_job.is_some() {
                    return Err(SlurmConfigError::new(format!(
                        "`tasks_per_job` ({tasks}) cannot be smaller than \
                         `parallel_tasks_per_job` ({parallel})"
                    )));
                }

                parallel = tasks;
            }

            let num_jobs = params.tot_tasks.div_ceil(tasks);
            if num_jobs > params.max_num_jobs {
                return Err(SlurmConfigError::new(format!(
                    "`tasks_per_job` of {tasks} needs {num_jobs} jobs for {tot} tasks, exceeding \
                     the limit of {max} jobs",
                    tot = params.tot_tasks,
                    max = params.max_num_jobs
                )));
            }

            tasks
        }
        None => {
            // One wave per job, unless that leaves more jobs than the target
            let mut tasks = parallel;
            let limit = params.target_num_jobs.clamp(1, params.max_num_jobs);
            if params.tot_tasks.div_ceil(tasks) > limit {
                tasks = round_up(params.tot_tasks.div_ceil(limit), parallel);
            }

            tasks
        }
    };

    Ok(Batching {
        tasks_per_job,
        parallel_tasks_per_job: parallel,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Creates parameters with generous targets and ceilings.
    fn params(tot_tasks: usize) -> BatchingParameters {
        BatchingParameters {
            tot_tasks,
            cpus_per_task: 1,
            mem_per_task: 1000,
            target_cpus_per_job: 4,
            max_cpus_per_job: 8,
            target_mem_per_job: 8000,
            max_mem_per_job: 16000,
            target_num_jobs: 4,
            max_num_jobs: 10,
            tasks_per_job: None,
            parallel_tasks_per_job: None,
        }
    }

    #[test]
    fn fills_jobs_to_the_targets() {
        let batching = compute_batching(&params(8)).unwrap();
        assert_eq!(
            batching,
            Batching {
                tasks_per_job: 4,
                parallel_tasks_per_job: 4
            }
        );
        assert_eq!(batching.num_jobs(8), 2);
    }

    #[test]
    fn memory_target_limits_parallelism() {
        let mut p = params(8);
        p.mem_per_task = 4000;
        let batching = compute_batching(&p).unwrap();
        assert_eq!(batching.parallel_tasks_per_job, 2);
        assert_eq!(batching.tasks_per_job, 2);
    }

    #[test]
    fn few_tasks_use_a_single_job() {
        let batching = compute_batching(&params(3)).unwrap();
        assert_eq!(
            batching,
            Batching {
                tasks_per_job: 3,
                parallel_tasks_per_job: 3
            }
        );
    }

    #[test]
    fn many_tasks_stack_waves() {
        let batching = compute_batching(&params(100)).unwrap();
        assert_eq!(batching.parallel_tasks_per_job, 4);
        assert_eq!(batching.tasks_per_job, 28);
        assert_eq!(batching.num_jobs(100), 4);
    }

    #[test]
    fn invariants_hold() {
        for tot_tasks in 1..200 {
            for cpus_per_task in 1..=8 {
                for max_num_jobs in [1, 3, 10] {
                    let mut p = params(tot_tasks);
                    p.cpus_per_task = cpus_per_task;
                    p.max_num_jobs = max_num_jobs;
                    p.target_num_jobs = max_num_jobs;

                    let batching = compute_batching(&p).unwrap();
                    assert!(batching.parallel_tasks_per_job >= 1);
                    assert!(batching.tasks_per_job >= batching.parallel_tasks_per_job);
                    assert!(batching.num_jobs(tot_tasks) <= max_num_jobs);
                    assert!(
                        batching.parallel_tasks_per_job as u64 * cpus_per_task
                            <= p.max_cpus_per_job
                    );
                }
            }
        }
    }

    #[test]
    fn overrides_are_honored() {
        let mut p = params(10);
        p.tasks_per_job = Some(5);
        p.parallel_tasks_per_job = Some(5);
        assert_eq!(
            compute_batching(&p).unwrap(),
            Batching {
                tasks_per_job: 5,
                parallel_tasks_per_job: 5
            }
        );

        let mut p = params(10);
        p.tasks_per_job = Some(2);
        assert_eq!(
            compute_batching(&p).unwrap(),
            Batching {
                tasks_per_job: 2,
                parallel_tasks_per_job: 2
            }
        );
    }

    #[test]
    fn overrides_violating_ceilings_fail() {
        let mut p = params(10);
        p.parallel_tasks_per_job = Some(9);
        let e = compute_batching(&p).unwrap_err();
        assert!(e.to_string().contains("exceeding the limits of 8 CPUs"));

        let mut p = params(100);
        p.tasks_per_job = Some(5);
        let e = compute_batching(&p).unwrap_err();
        assert!(e.to_string().contains("needs 20 jobs"));

        let mut p = params(10);
        p.tasks_per_job = Some(2);
        p.parallel_tasks_per_job = Some(4);
        assert!(compute_batching(&p).is_err());
    }

    #[test]
    fn tasks_exceeding_job_limits_fail() {
        let mut p = params(10);
        p.cpus_per_task = 9;
        assert!(compute_batching(&p).is_err());

        let mut p = params(10);
        p.mem_per_task = 17000;
        assert!(compute_batching(&p).is_err());

        assert!(compute_batching(&params(0)).is_err());
    }
}
