//! The master's scheduling loop.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::allocator::{Allocator, Dispatch, Instance};
use crate::checkpoint::CheckpointLog;
use crate::config::Config;
use crate::error::{Result, SchedulerError};
use crate::job::JobRecord;

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    /// Abort on the first dispatch failure or failed job.
    pub job_failure_fatal: bool,
    /// Sleep between loop iterations that made no progress.
    pub poll_interval: Duration,
    pub heartbeat: Duration,
}

impl RunnerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            job_failure_fatal: config.job_failure_fatal,
            poll_interval: config.poll_interval(),
            heartbeat: config.heartbeat(),
        }
    }
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            job_failure_fatal: false,
            poll_interval: Duration::from_millis(10),
            heartbeat: Duration::from_secs(60),
        }
    }
}

/// Queue order: more ranks first, then higher estimated cost first.
pub fn compare_jobs(a: &JobRecord, b: &JobRecord) -> Ordering {
    b.requested_ranks
        .cmp(&a.requested_ranks)
        .then_with(|| b.estimated_cost.cmp(&a.estimated_cost))
}

/// Sorts jobs into queue order. Jobs that compare equal keep their file order.
pub fn sort_queue(jobs: &mut [JobRecord]) {
    jobs.sort_by(compare_jobs);
}

pub struct Runner<A> {
    allocator: A,
    checkpoint: CheckpointLog,
    queue: VecDeque<Arc<JobRecord>>,
    historic: Vec<Instance>,
    options: RunnerOptions,
}

impl<A: Allocator> Runner<A> {
    /// Builds the pending queue: jobs already in `checkpoint` are dropped, the
    /// rest are adjusted by the allocator and sorted.
    pub fn new(
        allocator: A,
        checkpoint: CheckpointLog,
        jobs: Vec<JobRecord>,
        options: RunnerOptions,
    ) -> Self {
        let total = jobs.len();
        let mut pending: Vec<JobRecord> = jobs
            .into_iter()
            .filter(|job| !checkpoint.is_done(&job.id))
            .collect();
        for job in pending.iter_mut() {
            allocator.preprocess_job(job);
        }
        sort_queue(&mut pending);
        if pending.len() < total {
            info!(
                skipped = total - pending.len(),
                "Skipping jobs already completed by a previous run"
            );
        }
        Self {
            allocator,
            checkpoint,
            queue: pending.into_iter().map(Arc::new).collect(),
            historic: vec![],
            options,
        }
    }

    /// Jobs not dispatched yet, in the order they will be tried.
    pub fn pending(&self) -> impl Iterator<Item = &JobRecord> {
        self.queue.iter().map(|job| job.as_ref())
    }

    pub fn historic(&self) -> &[Instance] {
        &self.historic
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn into_allocator(self) -> A {
        self.allocator
    }

    /// Runs every pending job, then terminates the allocator's ranks.
    ///
    /// Returns every instance that finished, in completion order.
    pub async fn run(&mut self) -> Result<Vec<Instance>> {
        let total = self.queue.len();
        let started = Instant::now();
        let mut last_heartbeat = started;
        info!(
            jobs = total,
            ranks = self.allocator.pool_size(),
            "Starting scheduling loop"
        );

        while !self.queue.is_empty() || !self.allocator.all_ranks_available() {
            if last_heartbeat.elapsed() >= self.options.heartbeat {
                info!(
                    pending = self.queue.len(),
                    finished = self.historic.len(),
                    ranks_in_use = self.allocator.ranks_in_use(),
                    "Runner is still alive after {}s",
                    started.elapsed().as_secs()
                );
                last_heartbeat = Instant::now();
            }

            let head = self
                .queue
                .front()
                .filter(|job| self.allocator.can_allocate(job.requested_ranks))
                .cloned();
            let progressed = match head {
                Some(job) => self.dispatch(job)?,
                None => false,
            };
            if !progressed && !self.collect_finished(total)? {
                tokio::time::sleep(self.options.poll_interval).await;
            }
        }

        self.allocator.terminate()?;
        info!(finished = self.historic.len(), "All jobs done");
        Ok(std::mem::take(&mut self.historic))
    }

    /// Tries to start the job at the head of the queue. Returns whether it started.
    fn dispatch(&mut self, job: Arc<JobRecord>) -> Result<bool> {
        let instance = self.allocator.allocate(job.requested_ranks, job.clone())?;
        match self.allocator.execute(instance)? {
            Dispatch::Started => {
                self.queue.pop_front();
                debug!(job = job.id.as_str(), ranks = job.requested_ranks, "Dispatched job");
                Ok(true)
            }
            Dispatch::Rejected { instance, reason } => {
                self.allocator.free(&instance)?;
                if self.options.job_failure_fatal {
                    return Err(SchedulerError::DispatchFailed {
                        job: job.id.clone(),
                        reason,
                    });
                }
                warn!(job = job.id.as_str(), "Could not dispatch job, will retry: {reason}");
                Ok(false)
            }
        }
    }

    /// Records and releases every instance that finished. Returns whether any did.
    ///
    /// The whole batch is checkpointed and freed before a failure is reported.
    fn collect_finished(&mut self, total: usize) -> Result<bool> {
        let finished = self.allocator.check_finished_instances()?;
        let any = !finished.is_empty();
        let mut first_failure = None;
        for instance in finished {
            self.checkpoint.mark_done(instance.id())?;
            self.allocator.free(&instance)?;
            info!(
                job = instance.id(),
                elapsed_ms = instance.elapsed_ms(),
                "End of job ({}/{total})",
                self.historic.len() + 1
            );
            if !instance.succeeded() && first_failure.is_none() {
                first_failure = Some(SchedulerError::JobFailed {
                    job: instance.id().to_string(),
                    code: instance.exit_code().unwrap_or(-1),
                });
            }
            self.historic.push(instance);
        }
        match first_failure {
            Some(e) if self.options.job_failure_fatal => Err(e),
            _ => Ok(any),
        }
    }
}
