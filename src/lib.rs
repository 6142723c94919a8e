//! Ranksplit: runs a file of multi-rank commands on a fixed pool of ranks.

// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to parse and represent jobs.
pub mod job;
// Durable record of completed jobs.
pub mod checkpoint;
// Message passing between ranks.
pub mod comm;
// Worker-side protocol and job execution.
pub mod worker;
// The allocator contract.
pub mod allocator;
// Allocation by splitting worker groups.
pub mod split;
// One job per rank.
pub mod onecore;
// The scheduling loop.
pub mod runner;
// Post-run statistics.
pub mod statistics;

pub use allocator::{Allocator, Dispatch, Instance, InstanceState, Slot};
pub use checkpoint::CheckpointLog;
pub use comm::{MasterEndpoint, MasterLink, RankLayout};
pub use config::{Config, Implementation};
pub use error::{Result, SchedulerError};
pub use job::{ArgvRenderer, JobRecord, JobSet};
pub use onecore::OneCorePool;
pub use runner::{compare_jobs, sort_queue, Runner, RunnerOptions};
pub use split::PartitionedRankPool;
pub use statistics::{RunReport, RunStatistics};
pub use worker::{Cluster, CommandPayload, Grouping, Payload, Placement};

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

/// Runs every pending job of `config.commands_file` with `payload` and returns
/// the statistics of the run.
pub async fn run(config: &Config, payload: Arc<dyn Payload>) -> Result<RunStatistics> {
    config.validate()?;
    let log_dir = config.output_dir.join(CommandPayload::LOG_DIR);
    std::fs::create_dir_all(&log_dir).map_err(|e| {
        SchedulerError::InvalidConfig(format!("cannot create {}: {e}", log_dir.display()))
    })?;

    let jobs = JobSet::load(&config.commands_file)?;
    let mut renderer = ArgvRenderer::new(&config.output_dir);
    renderer.compile_all(jobs.jobs())?;
    let checkpoint = CheckpointLog::open(&config.output_dir)?;
    info!(
        jobs = jobs.len(),
        done = checkpoint.len(),
        scheduler = ?config.scheduler,
        "Loaded commands file"
    );

    let layout = RankLayout::new(config.worker_ranks());
    let options = RunnerOptions::from_config(config);
    let epoch = Instant::now();
    match config.scheduler {
        Implementation::Split => {
            let (master, cluster) = Cluster::launch(
                layout,
                config.mailbox_capacity,
                Grouping::World,
                payload,
                epoch,
            )?;
            let pool = PartitionedRankPool::new(layout, master, renderer);
            drive(pool, cluster, checkpoint, jobs, options, epoch).await
        }
        Implementation::OneCore => {
            let (master, cluster) = Cluster::launch(
                layout,
                config.mailbox_capacity,
                Grouping::PerRank,
                payload,
                epoch,
            )?;
            let pool = OneCorePool::new(layout, master, renderer);
            drive(pool, cluster, checkpoint, jobs, options, epoch).await
        }
    }
}

async fn drive<A: Allocator>(
    allocator: A,
    cluster: Cluster,
    checkpoint: CheckpointLog,
    jobs: JobSet,
    options: RunnerOptions,
    epoch: Instant,
) -> Result<RunStatistics> {
    let pool_size = allocator.pool_size();
    let mut runner = Runner::new(allocator, checkpoint, jobs.into_jobs(), options);
    match runner.run().await {
        Ok(historic) => {
            cluster.shutdown().await?;
            Ok(RunStatistics::new(historic, pool_size, epoch.elapsed()))
        }
        Err(e) => {
            cluster.abort();
            Err(e)
        }
    }
}
