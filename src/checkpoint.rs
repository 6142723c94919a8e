//! Durable record of completed jobs.
//!
//! The log is a plain text file with one job id per line, appended to as jobs
//! finish. A restarted run reads it back and skips everything it lists. A crash
//! between a job finishing and its id being appended re-runs that job, so
//! completion is at-least-once.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, SchedulerError};

const CHECKPOINT_FILE: &str = "checkpoint_commands.txt";

pub struct CheckpointLog {
    path: PathBuf,
    done: HashSet<String>,
    writer: File,
}

impl CheckpointLog {
    /// Opens the log inside `output_dir`, loading every id recorded by earlier runs.
    pub fn open(output_dir: &Path) -> Result<Self> {
        let path = output_dir.join(CHECKPOINT_FILE);
        let mut done = HashSet::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                for id in contents.split_whitespace() {
                    debug!(job = id, "Checkpoint detected");
                    done.insert(id.to_string());
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SchedulerError::Checkpoint(e)),
        }
        if !done.is_empty() {
            info!(jobs = done.len(), path = ?path, "Resuming from checkpoint");
        }
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(SchedulerError::Checkpoint)?;
        Ok(Self { path, done, writer })
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.done.contains(id)
    }

    /// Appends `id` to the log and syncs it to disk before returning.
    pub fn mark_done(&mut self, id: &str) -> Result<()> {
        writeln!(self.writer, "{id}").map_err(SchedulerError::Checkpoint)?;
        self.writer.flush().map_err(SchedulerError::Checkpoint)?;
        self.writer.sync_data().map_err(SchedulerError::Checkpoint)?;
        self.done.insert(id.to_string());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.done.len()
    }

    pub fn is_empty(&self) -> bool {
        self.done.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
