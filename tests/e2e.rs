//! End-to-end tests for Ranksplit scheduling.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clap::Parser;
use tempfile::{NamedTempFile, TempDir};
use tokio::sync::Mutex;

use ranksplit::comm::JobTicket;
use ranksplit::{CheckpointLog, Config, Payload, Placement, SchedulerError};

/// Record of one rank's share of a job.
#[derive(Debug, Clone)]
pub struct ExecutedJob {
    pub job_id: String,
    pub argv: Vec<String>,
    pub placement: Placement,
    pub started: Instant,
    pub finished: Instant,
}

/// Mock payload for testing that doesn't actually execute commands.
pub struct MockPayload {
    executed: Arc<Mutex<Vec<ExecutedJob>>>,
    exit_codes: HashMap<String, i32>,
    delay_ms: u64,
}

impl MockPayload {
    pub fn new() -> Self {
        Self {
            executed: Arc::new(Mutex::new(Vec::new())),
            exit_codes: HashMap::new(),
            delay_ms: 0,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_exit_code(mut self, job_id: &str, code: i32) -> Self {
        self.exit_codes.insert(job_id.to_string(), code);
        self
    }

    pub fn executed(&self) -> Arc<Mutex<Vec<ExecutedJob>>> {
        Arc::clone(&self.executed)
    }
}

#[async_trait]
impl Payload for MockPayload {
    async fn run(&self, ticket: &JobTicket, placement: Placement) -> i32 {
        let started = Instant::now();
        if self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        self.executed.lock().await.push(ExecutedJob {
            job_id: ticket.job_id.clone(),
            argv: ticket.argv.clone(),
            placement,
            started,
            finished: Instant::now(),
        });
        self.exit_codes.get(&ticket.job_id).copied().unwrap_or(0)
    }
}

/// Writes `contents` as a commands file.
fn commands_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn config(commands: &Path, output: &Path, extra: &[&str]) -> Config {
    let mut args = vec!["ranksplit", "--poll-interval-ms", "1"];
    args.extend_from_slice(extra);
    let commands = commands.to_str().unwrap();
    let output = output.to_str().unwrap();
    args.extend_from_slice(&["./payload", commands, output]);
    Config::parse_from(args)
}

/// Runs `commands` on `ranks` ranks (master included) and returns every rank's record.
async fn run_scheduling_test(
    commands: &str,
    output: &TempDir,
    extra: &[&str],
    payload: MockPayload,
) -> Result<Vec<ExecutedJob>, SchedulerError> {
    let file = commands_file(commands);
    let config = config(file.path(), output.path(), extra);
    let executed = payload.executed();
    ranksplit::run(&config, Arc::new(payload)).await?;
    let records = executed.lock().await.clone();
    Ok(records)
}

/// Groups per-rank records by job id.
fn by_job(records: &[ExecutedJob]) -> BTreeMap<String, Vec<ExecutedJob>> {
    let mut jobs: BTreeMap<String, Vec<ExecutedJob>> = BTreeMap::new();
    for record in records {
        jobs.entry(record.job_id.clone()).or_default().push(record.clone());
    }
    jobs
}

const MIXED: &str = "\
# id ranks cost args
big 4 100 --threads {{ranks}}
mid 2 50 --first {{first_rank}}
small_a 1 10 {{job_id}}
small_b 1 20 {{job_id}}
other 3 40
tiny 1 1
";

// =============================================================================
// E2E Tests for the split scheduler
// =============================================================================

#[tokio::test]
async fn test_e2e_every_job_runs_on_requested_ranks() {
    let output = tempfile::tempdir().unwrap();
    let payload = MockPayload::new().with_delay_ms(5);
    let records = run_scheduling_test(MIXED, &output, &["-n", "5"], payload)
        .await
        .unwrap();

    let jobs = by_job(&records);
    let expected = [("big", 4), ("mid", 2), ("small_a", 1), ("small_b", 1), ("other", 3), ("tiny", 1)];
    assert_eq!(jobs.len(), expected.len());
    for (id, ranks) in expected {
        let shares = &jobs[id];
        assert_eq!(shares.len(), ranks, "job {id} ran on the wrong number of ranks");
        let mut positions: Vec<_> = shares.iter().map(|r| r.placement.position).collect();
        positions.sort();
        assert_eq!(positions, (0..ranks).collect::<Vec<_>>());
        assert!(shares.iter().all(|r| r.placement.ranks == ranks));
    }
}

#[tokio::test]
async fn test_e2e_templates_are_rendered_with_placement() {
    let output = tempfile::tempdir().unwrap();
    let records = run_scheduling_test(MIXED, &output, &["-n", "5"], MockPayload::new())
        .await
        .unwrap();
    let jobs = by_job(&records);
    assert_eq!(jobs["big"][0].argv, vec!["--threads", "4"]);
    assert_eq!(jobs["small_a"][0].argv, vec!["small_a"]);
    let mid = &jobs["mid"][0];
    assert_eq!(mid.argv, vec!["--first".to_string(), mid.placement.first_rank.to_string()]);
}

#[tokio::test]
async fn test_e2e_concurrent_jobs_never_share_ranks() {
    let output = tempfile::tempdir().unwrap();
    let payload = MockPayload::new().with_delay_ms(20);
    let records = run_scheduling_test(MIXED, &output, &["-n", "7"], payload)
        .await
        .unwrap();

    for a in &records {
        for b in &records {
            if a.job_id == b.job_id {
                continue;
            }
            let overlap_in_time = a.started < b.finished && b.started < a.finished;
            if overlap_in_time {
                assert_ne!(
                    a.placement.rank, b.placement.rank,
                    "{} and {} ran on the same rank at the same time",
                    a.job_id, b.job_id
                );
            }
        }
    }
    // Once "big" is done, "other", "mid" and "small_b" fit side by side.
    let concurrent = records.iter().any(|a| {
        records.iter().any(|b| {
            a.job_id != b.job_id && a.started < b.finished && b.started < a.finished
        })
    });
    assert!(concurrent, "no two jobs ever ran at the same time");
}

#[tokio::test]
async fn test_e2e_largest_job_starts_first() {
    let output = tempfile::tempdir().unwrap();
    let payload = MockPayload::new().with_delay_ms(10);
    let records = run_scheduling_test(MIXED, &output, &["-n", "5"], payload)
        .await
        .unwrap();
    // "big" takes every worker, so nothing else can start until it is done.
    let big_end = by_job(&records)["big"].iter().map(|r| r.finished).max().unwrap();
    assert!(records
        .iter()
        .filter(|r| r.job_id != "big")
        .all(|r| r.started >= big_end));
}

#[tokio::test]
async fn test_e2e_oversized_job_is_clamped() {
    let output = tempfile::tempdir().unwrap();
    let records = run_scheduling_test("huge 64 1\n", &output, &["-n", "3"], MockPayload::new())
        .await
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_e2e_splits_survive_single_message_mailboxes() {
    let commands: String = (0..200).map(|i| format!("job{i} 1 {i}\n")).collect();
    for _ in 0..5 {
        let output = tempfile::tempdir().unwrap();
        let payload = MockPayload::new().with_delay_ms(1);
        let records = run_scheduling_test(
            &commands,
            &output,
            &["-n", "33", "--mailbox-capacity", "1"],
            payload,
        )
        .await
        .unwrap();
        assert_eq!(by_job(&records).len(), 200);
        assert!(records.iter().all(|r| (1..=32).contains(&r.placement.rank)));
    }
}

// =============================================================================
// E2E Tests for checkpointing
// =============================================================================

#[tokio::test]
async fn test_e2e_checkpoint_makes_rerun_idempotent() {
    let output = tempfile::tempdir().unwrap();
    let file = commands_file(MIXED);
    let config = config(file.path(), output.path(), &["-n", "4"]);

    let first = MockPayload::new();
    let executed = first.executed();
    let stats = ranksplit::run(&config, Arc::new(first)).await.unwrap();
    assert_eq!(stats.historic().len(), 6);
    assert!(!executed.lock().await.is_empty());

    // Second run: everything is already done.
    let second = MockPayload::new();
    let executed = second.executed();
    let stats = ranksplit::run(&config, Arc::new(second)).await.unwrap();
    assert!(stats.historic().is_empty());
    assert!(executed.lock().await.is_empty());

    // Wiping the log runs everything again.
    std::fs::remove_file(CheckpointLog::open(output.path()).unwrap().path()).unwrap();
    let third = MockPayload::new();
    let executed = third.executed();
    let stats = ranksplit::run(&config, Arc::new(third)).await.unwrap();
    assert_eq!(stats.historic().len(), 6);
    assert_eq!(by_job(&executed.lock().await).len(), 6);
}

#[tokio::test]
async fn test_e2e_partial_checkpoint_skips_done_jobs() {
    let output = tempfile::tempdir().unwrap();
    {
        let mut log = CheckpointLog::open(output.path()).unwrap();
        log.mark_done("big").unwrap();
        log.mark_done("tiny").unwrap();
    }
    let records = run_scheduling_test(MIXED, &output, &["-n", "5"], MockPayload::new())
        .await
        .unwrap();
    let jobs = by_job(&records);
    assert!(!jobs.contains_key("big"));
    assert!(!jobs.contains_key("tiny"));
    assert_eq!(jobs.len(), 4);
}

// =============================================================================
// E2E Tests for failures
// =============================================================================

#[tokio::test]
async fn test_e2e_failed_job_is_not_fatal_by_default() {
    let output = tempfile::tempdir().unwrap();
    let file = commands_file(MIXED);
    let config = config(file.path(), output.path(), &["-n", "5"]);
    let payload = MockPayload::new().with_exit_code("mid", 1);
    let stats = ranksplit::run(&config, Arc::new(payload)).await.unwrap();
    assert_eq!(stats.historic().len(), 6);
    assert_eq!(stats.failed_jobs(), 1);
}

#[tokio::test]
async fn test_e2e_failed_job_aborts_when_fatal() {
    let output = tempfile::tempdir().unwrap();
    let payload = MockPayload::new().with_exit_code("big", 3);
    let result =
        run_scheduling_test(MIXED, &output, &["-n", "5", "--job-failure-fatal"], payload).await;
    match result {
        Err(SchedulerError::JobFailed { job, code }) => {
            assert_eq!(job, "big");
            assert_eq!(code, 3);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_e2e_malformed_commands_file_runs_nothing() {
    let output = tempfile::tempdir().unwrap();
    let payload = MockPayload::new();
    let executed = payload.executed();
    let result = run_scheduling_test("ok 1 1\nbroken 2\n", &output, &[], payload).await;
    assert!(matches!(result, Err(SchedulerError::MalformedLine { line: 2, .. })));
    assert!(executed.lock().await.is_empty());
}

#[tokio::test]
async fn test_e2e_broken_template_runs_nothing() {
    let output = tempfile::tempdir().unwrap();
    let result =
        run_scheduling_test("a 1 1 {{#each}}\n", &output, &[], MockPayload::new()).await;
    assert!(matches!(result, Err(SchedulerError::InvalidTemplate { .. })));
}

// =============================================================================
// E2E Tests for the one-core scheduler
// =============================================================================

#[tokio::test]
async fn test_e2e_onecore_runs_every_job_on_one_rank() {
    let output = tempfile::tempdir().unwrap();
    let payload = MockPayload::new().with_delay_ms(5);
    let records = run_scheduling_test(MIXED, &output, &["-n", "3", "--scheduler", "onecore"], payload)
        .await
        .unwrap();
    let jobs = by_job(&records);
    assert_eq!(jobs.len(), 6);
    assert!(jobs.values().all(|shares| shares.len() == 1));
    assert!(records.iter().all(|r| r.placement.ranks == 1 && r.placement.rank <= 2));
    // "big" asked for 4 ranks but was rendered with the single rank it got.
    assert_eq!(jobs["big"][0].argv, vec!["--threads", "1"]);
}

// =============================================================================
// E2E Tests for statistics
// =============================================================================

#[tokio::test]
async fn test_e2e_statistics_are_exported() {
    let output = tempfile::tempdir().unwrap();
    let file = commands_file(MIXED);
    let config = config(file.path(), output.path(), &["-n", "5"]);
    let payload = MockPayload::new().with_delay_ms(5);
    let stats = ranksplit::run(&config, Arc::new(payload)).await.unwrap();
    let ratio = stats.load_balance_ratio();
    assert!(ratio > 0.0 && ratio <= 1.0, "ratio {ratio} out of range");

    let (svg, report) = stats.export(output.path()).unwrap().unwrap();
    assert_eq!(
        std::fs::read_to_string(svg).unwrap().matches("<rect").count(),
        6
    );
    let report: ranksplit::RunReport =
        serde_yaml::from_str(&std::fs::read_to_string(report).unwrap()).unwrap();
    assert_eq!(report.pool_size, 4);
    assert_eq!(report.instances.len(), 6);
}
