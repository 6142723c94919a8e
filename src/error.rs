use thiserror::Error;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to read commands file {path}: {source}")]
    CommandsFile {
        path: String,
        source: std::io::Error,
    },
    #[error("Invalid syntax in commands file at line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },
    #[error("Job id '{0}' appears more than once in the commands file")]
    DuplicateJob(String),
    #[error("Job '{job}' has an invalid argument template: {reason}")]
    InvalidTemplate { job: String, reason: String },
    #[error("Failed to access the checkpoint log: {0}")]
    Checkpoint(#[source] std::io::Error),
    #[error("Control channel to rank {rank} is broken: {reason}")]
    Transport { rank: usize, reason: String },
    #[error("Protocol violation on rank {rank}: {reason}")]
    Protocol { rank: usize, reason: String },
    #[error("No free slot can hold {requested} ranks")]
    NoFittingSlot { requested: usize },
    #[error("Invalid rank request: {0}")]
    InvalidRequest(String),
    #[error("Cannot terminate the pool while {0} ranks are still in use")]
    PoolBusy(usize),
    #[error("Failed to dispatch job '{job}': {reason}")]
    DispatchFailed { job: String, reason: String },
    #[error("Job '{job}' failed with exit code {code}")]
    JobFailed { job: String, code: i32 },
    #[error("Failed to export statistics: {0}")]
    Statistics(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
