use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use handlebars::Handlebars;
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Result, SchedulerError};

/// One unit of work read from the commands file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    /// Unique identifier, also the key of the checkpoint log.
    pub id: String,
    /// Number of ranks the job runs on. Never 0 once loaded.
    pub requested_ranks: usize,
    /// Relative cost estimate, only used to order the queue.
    pub estimated_cost: u64,
    /// Arguments passed to the payload. Each entry is a template.
    pub argv: Vec<String>,
}

impl JobRecord {
    pub fn new(id: &str, requested_ranks: usize, estimated_cost: u64, argv: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            requested_ranks,
            estimated_cost,
            argv,
        }
    }

    /// Parses one line of a commands file. Returns `None` for blank and comment-only lines.
    ///
    /// `number` is the 1-based line number used in error messages.
    pub fn parse_line(line: &str, number: usize) -> Result<Option<Self>> {
        let line = match memchr::memchr(b'#', line.as_bytes()) {
            Some(i) => &line[..i],
            None => line,
        };
        let mut fields = line.split_whitespace();
        let id = match fields.next() {
            Some(id) => id,
            None => return Ok(None),
        };
        let malformed = |reason: String| SchedulerError::MalformedLine {
            line: number,
            reason,
        };

        let ranks = fields
            .next()
            .ok_or_else(|| malformed(format!("job '{id}' has no rank count")))?;
        let mut requested_ranks: usize = ranks
            .parse()
            .map_err(|_| malformed(format!("job '{id}' has an invalid rank count '{ranks}'")))?;
        let cost = fields
            .next()
            .ok_or_else(|| malformed(format!("job '{id}' has no estimated cost")))?;
        let estimated_cost: u64 = cost
            .parse()
            .map_err(|_| malformed(format!("job '{id}' has an invalid estimated cost '{cost}'")))?;

        if requested_ranks == 0 {
            warn!(job = id, line = number, "Found a job with 0 ranks, assigning 1 rank instead");
            requested_ranks = 1;
        }

        let argv = fields.map(str::to_string).collect();
        Ok(Some(Self::new(id, requested_ranks, estimated_cost, argv)))
    }
}

impl fmt::Display for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {{ranks: {}, cost: {}}}",
            self.id,
            self.argv.iter().join(" "),
            self.requested_ranks,
            self.estimated_cost
        )
    }
}

/// All jobs of a commands file, in file order.
#[derive(Debug, Clone, Default)]
pub struct JobSet {
    jobs: Vec<JobRecord>,
}

impl JobSet {
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|source| SchedulerError::CommandsFile {
                path: path.to_string_lossy().into_owned(),
                source,
            })?;
        let jobs = Self::parse(&contents)?;
        debug!(path = ?path, jobs = jobs.len(), "Loaded commands file");
        Ok(jobs)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut jobs = vec![];
        for (i, line) in contents.lines().enumerate() {
            if let Some(job) = JobRecord::parse_line(line, i + 1)? {
                jobs.push(job);
            }
        }
        Self::from_jobs(jobs)
    }

    pub fn from_jobs(jobs: Vec<JobRecord>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(jobs.len());
        for job in &jobs {
            if !seen.insert(job.id.as_str()) {
                return Err(SchedulerError::DuplicateJob(job.id.clone()));
            }
        }
        Ok(Self { jobs })
    }

    pub fn jobs(&self) -> &[JobRecord] {
        &self.jobs
    }

    pub fn into_jobs(self) -> Vec<JobRecord> {
        self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Values a job argument template can refer to.
#[derive(Serialize)]
struct ArgvContext<'a> {
    job_id: &'a str,
    ranks: usize,
    first_rank: usize,
    output_dir: &'a str,
}

/// Fills in argument templates (`{{ranks}}`, `{{first_rank}}`, ...) at dispatch time.
pub struct ArgvRenderer {
    registry: Handlebars<'static>,
    output_dir: String,
}

impl ArgvRenderer {
    pub fn new(output_dir: &Path) -> Self {
        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        handlebars_misc_helpers::register(&mut registry);
        Self {
            registry,
            output_dir: output_dir.to_string_lossy().into_owned(),
        }
    }

    /// Compiles every argument template of every job, so that a broken template
    /// is reported before any job starts.
    pub fn compile_all(&mut self, jobs: &[JobRecord]) -> Result<()> {
        for job in jobs {
            self.compile(job)?;
        }
        Ok(())
    }

    pub fn compile(&mut self, job: &JobRecord) -> Result<()> {
        for arg in &job.argv {
            if !self.registry.has_template(arg) {
                self.registry
                    .register_template_string(arg, arg)
                    .map_err(|e| SchedulerError::InvalidTemplate {
                        job: job.id.clone(),
                        reason: e.to_string(),
                    })?;
            }
        }
        Ok(())
    }

    /// Renders the arguments of `job` placed on `ranks` ranks starting at `first_rank`.
    pub fn render(&mut self, job: &JobRecord, first_rank: usize, ranks: usize) -> Result<Vec<String>> {
        self.compile(job)?;
        let context = ArgvContext {
            job_id: &job.id,
            ranks,
            first_rank,
            output_dir: &self.output_dir,
        };
        job.argv
            .iter()
            .map(|arg| {
                self.registry
                    .render(arg, &context)
                    .map_err(|e| SchedulerError::DispatchFailed {
                        job: job.id.clone(),
                        reason: e.to_string(),
                    })
            })
            .collect()
    }
}
