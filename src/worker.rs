//! The worker side: one task per worker rank, each running the group protocol.
//!
//! A worker sits in `Idle` until its group's leader hears from the master and
//! relays the signal. A split shrinks the group the worker belongs to, a job
//! runs the payload on every member, and a terminate ends the task. The leader
//! reports every finished job to the master.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::comm::{
    Completion, Fabric, Group, JobTicket, MasterEndpoint, RankLayout, RankRange, Signal,
    WorkerGroup,
};
use crate::error::{Result, SchedulerError};

/// Exit code reported when the payload could not be started.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Where a job runs, as seen from one of its ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    /// Global rank of this worker.
    pub rank: usize,
    /// Position of this worker inside the group. The leader is 0.
    pub position: usize,
    /// Number of ranks the job runs on.
    pub ranks: usize,
    /// Worker number of the group leader.
    pub first_rank: usize,
}

impl Placement {
    pub fn is_leader(&self) -> bool {
        self.position == 0
    }
}

/// The work done for one job on one rank.
#[async_trait]
pub trait Payload: Send + Sync {
    /// Runs `ticket` and returns its exit code. Only the leader's code is reported.
    async fn run(&self, ticket: &JobTicket, placement: Placement) -> i32;
}

/// Runs an executable once per job, on the group leader.
pub struct CommandPayload {
    program: PathBuf,
    log_dir: PathBuf,
}

impl CommandPayload {
    pub const LOG_DIR: &'static str = "per_job_logs";

    pub fn new(program: &Path, output_dir: &Path) -> Self {
        Self {
            program: program.to_path_buf(),
            log_dir: output_dir.join(Self::LOG_DIR),
        }
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.log_dir.join(format!("{job_id}_out.txt"))
    }

    async fn spawn(&self, ticket: &JobTicket, placement: Placement) -> std::io::Result<i32> {
        let log = tokio::fs::File::create(self.log_path(&ticket.job_id))
            .await?
            .into_std()
            .await;
        let status = tokio::process::Command::new(&self.program)
            .args(&ticket.argv)
            .env("RANKSPLIT_RANKS", placement.ranks.to_string())
            .env("RANKSPLIT_FIRST_RANK", placement.first_rank.to_string())
            .env("RANKSPLIT_JOB_ID", &ticket.job_id)
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .kill_on_drop(true)
            .status()
            .await?;
        // No code when the process was killed by a signal.
        Ok(status.code().unwrap_or(-1))
    }
}

#[async_trait]
impl Payload for CommandPayload {
    async fn run(&self, ticket: &JobTicket, placement: Placement) -> i32 {
        if !placement.is_leader() {
            return 0;
        }
        match self.spawn(ticket, placement).await {
            Ok(code) => code,
            Err(e) => {
                error!(
                    job = ticket.job_id.as_str(),
                    program = ?self.program,
                    "Failed to run payload: {e}"
                );
                SPAWN_FAILURE_CODE
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Splitting(usize),
    Executing(JobTicket),
    Terminated,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Splitting(k) => write!(f, "splitting at {k}"),
            WorkerState::Executing(ticket) => write!(f, "executing {}", ticket.job_id),
            WorkerState::Terminated => write!(f, "terminated"),
        }
    }
}

impl From<Signal> for WorkerState {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Split { first_size } => WorkerState::Splitting(first_size),
            Signal::Job(ticket) => WorkerState::Executing(ticket),
            Signal::Terminate => WorkerState::Terminated,
        }
    }
}

/// One worker rank and the group it currently belongs to.
pub struct Worker<G> {
    group: G,
    layout: RankLayout,
    payload: Arc<dyn Payload>,
    epoch: Instant,
}

impl<G: Group> Worker<G> {
    /// `epoch` is the instant job start offsets are measured from.
    pub fn new(group: G, layout: RankLayout, payload: Arc<dyn Payload>, epoch: Instant) -> Self {
        Self {
            group,
            layout,
            payload,
            epoch,
        }
    }

    /// Waits for the next signal of the group, from the master if this worker leads.
    async fn next_signal(&mut self) -> Result<Signal> {
        if self.group.is_leader() {
            let signal = self.group.next_master_signal().await?;
            self.group.broadcast(Some(signal)).await
        } else {
            self.group.broadcast(None).await
        }
    }

    #[instrument(level = "debug", skip_all, fields(job = ticket.job_id.as_str()))]
    async fn execute(&mut self, ticket: JobTicket) -> Result<()> {
        let leader = self.group.leader();
        let placement = Placement {
            rank: self.group.global_rank(),
            position: self.group.position(),
            ranks: self.group.size(),
            first_rank: self
                .layout
                .internal(leader)
                .ok_or_else(|| SchedulerError::Protocol {
                    rank: leader,
                    reason: "group is led by a non-worker rank".to_string(),
                })?,
        };
        let started = Instant::now();
        let exit_code = self.payload.run(&ticket, placement).await;
        self.group.join().await?;
        if self.group.is_leader() {
            let completion = Completion {
                exit_code,
                start_offset_ms: started.saturating_duration_since(self.epoch).as_millis() as u64,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            info!(
                job = ticket.job_id.as_str(),
                rank = placement.rank,
                ranks = placement.ranks,
                exit_code,
                elapsed_ms = completion.elapsed_ms,
                "Job finished"
            );
            self.group.report(completion).await?;
        }
        Ok(())
    }

    /// Runs the protocol until the group is terminated.
    pub async fn run(mut self) -> Result<()> {
        let rank = self.group.global_rank();
        let mut state = WorkerState::Idle;
        loop {
            debug!(rank, %state, "Worker state");
            state = match state {
                WorkerState::Idle => self.next_signal().await?.into(),
                WorkerState::Splitting(first_size) => {
                    self.group = self.group.split(first_size)?;
                    WorkerState::Idle
                }
                WorkerState::Executing(ticket) => {
                    self.execute(ticket).await?;
                    WorkerState::Idle
                }
                WorkerState::Terminated => break,
            };
        }
        Ok(())
    }
}

/// How worker ranks are grouped when the cluster starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grouping {
    /// A single group spanning every worker, to be split on demand.
    World,
    /// Every worker is its own group of one.
    PerRank,
}

/// The set of running worker tasks.
pub struct Cluster {
    handles: Vec<JoinHandle<Result<()>>>,
}

impl Cluster {
    /// Spawns one task per worker rank and returns the master's end of the fabric.
    pub fn launch(
        layout: RankLayout,
        capacity: usize,
        grouping: Grouping,
        payload: Arc<dyn Payload>,
        epoch: Instant,
    ) -> Result<(MasterEndpoint, Cluster)> {
        if layout.workers() == 0 {
            return Err(SchedulerError::InvalidConfig(
                "at least one worker rank is required".to_string(),
            ));
        }
        let (fabric, mut mailboxes) = Fabric::new(layout, capacity);
        let worker_mailboxes = mailboxes.split_off(1);
        let master = match mailboxes.pop() {
            Some(mailbox) => MasterEndpoint::new(fabric.clone(), mailbox),
            None => {
                return Err(SchedulerError::InvalidConfig(
                    "no mailbox for the master rank".to_string(),
                ))
            }
        };

        let mut handles = Vec::with_capacity(layout.workers());
        for mailbox in worker_mailboxes {
            let members = match grouping {
                Grouping::World => RankRange {
                    first: layout.global(0),
                    size: layout.workers(),
                },
                Grouping::PerRank => RankRange {
                    first: mailbox.rank(),
                    size: 1,
                },
            };
            let group = WorkerGroup::new(layout.master(), members, fabric.clone(), mailbox)?;
            let worker = Worker::new(group, layout, payload.clone(), epoch);
            handles.push(tokio::spawn(worker.run()));
        }
        debug!(workers = layout.workers(), ?grouping, "Launched worker ranks");
        Ok((master, Cluster { handles }))
    }

    /// Waits for every worker to exit, returning the first error any of them hit.
    pub async fn shutdown(self) -> Result<()> {
        let mut first_error = None;
        for (i, result) in join_all(self.handles).await.into_iter().enumerate() {
            let result = result.unwrap_or_else(|e| {
                Err(SchedulerError::Protocol {
                    rank: i + 1,
                    reason: format!("worker task failed: {e}"),
                })
            });
            if let Err(e) = result {
                error!(rank = i + 1, "Worker exited with error: {e}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stops every worker immediately. Running payload processes are killed.
    pub fn abort(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}
