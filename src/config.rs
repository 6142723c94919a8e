//! Configuration for Ranksplit.
//!
//! Holds the clap structs for command line arguments and flags.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{Result, SchedulerError};

#[derive(Parser, Debug, Clone)]
#[command(version, author)]
pub struct Config {
    /// Executable every job runs, followed by the job's arguments
    pub payload: PathBuf,

    /// Commands file: `<id> <ranks> <estimated cost> <args...>` per line
    pub commands_file: PathBuf,

    /// Directory for the checkpoint log, per-job logs and statistics
    pub output_dir: PathBuf,

    /// Allocation strategy used to place jobs on ranks
    #[arg(long, value_enum, default_value = "split")]
    pub scheduler: Implementation,

    /// Total number of ranks, including the master rank
    #[arg(long, short = 'n', default_value = "4")]
    pub ranks: usize,

    /// Abort the whole run as soon as a job fails or cannot be dispatched
    #[arg(long)]
    pub job_failure_fatal: bool,

    /// Milliseconds to sleep between idle iterations of the scheduling loop
    #[arg(long, default_value = "10")]
    pub poll_interval_ms: u64,

    /// Seconds between two liveness messages of the scheduling loop
    #[arg(long, default_value = "60")]
    pub heartbeat_secs: u64,

    /// Number of queued messages on a worker rank above which job dispatch backs off
    #[arg(long, default_value = "16")]
    pub mailbox_capacity: usize,
}

impl Config {
    /// Number of ranks that can run jobs. One rank is reserved for the master.
    pub fn worker_ranks(&self) -> usize {
        self.ranks.saturating_sub(1)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ranks < 2 {
            return Err(SchedulerError::InvalidConfig(format!(
                "at least 2 ranks are needed (one master, one worker), got {}",
                self.ranks
            )));
        }
        if self.mailbox_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "mailbox capacity must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_secs == 0 {
            return Err(SchedulerError::InvalidConfig(
                "heartbeat period must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, ValueEnum)]
pub enum Implementation {
    /// Bisect worker groups so jobs get exactly the ranks they ask for
    #[value(name = "split")]
    Split,
    /// Run every job on a single rank
    #[value(name = "onecore")]
    OneCore,
}
