//! The contract every allocation strategy implements, and the pieces they share.
//!
//! Ranks inside an allocator are numbered from 0 to `workers - 1`; [`RankLayout`]
//! converts to the global numbering used on the wire.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::comm::{Completion, JobTicket, LinkError, MasterLink, RankLayout, Signal};
use crate::error::{Result, SchedulerError};
use crate::job::{ArgvRenderer, JobRecord};

/// A contiguous range of worker ranks, either free or bound to one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot {
    pub start_rank: usize,
    pub size: usize,
}

impl Slot {
    pub fn new(start_rank: usize, size: usize) -> Self {
        Self { start_rank, size }
    }

    /// The lowest rank of the slot, which leads its worker group.
    pub fn leader(&self) -> usize {
        self.start_rank
    }

    pub fn ranks(&self) -> Range<usize> {
        self.start_rank..self.start_rank + self.size
    }

    pub fn overlaps(&self, other: &Slot) -> bool {
        self.start_rank < other.start_rank + other.size
            && other.start_rank < self.start_rank + self.size
    }

    /// The slots holding the first `first_size` ranks and the rest.
    pub fn split_at(&self, first_size: usize) -> (Slot, Slot) {
        debug_assert!(first_size > 0 && first_size < self.size);
        (
            Slot::new(self.start_rank, first_size),
            Slot::new(self.start_rank + first_size, self.size - first_size),
        )
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}:{}]", self.start_rank, self.start_rank + self.size - 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Finished,
}

/// A job bound to the slot it runs on.
#[derive(Debug, Clone)]
pub struct Instance {
    job: Arc<JobRecord>,
    slot: Slot,
    state: InstanceState,
    start_offset_ms: u64,
    elapsed_ms: u64,
    exit_code: Option<i32>,
}

impl Instance {
    pub fn new(job: Arc<JobRecord>, slot: Slot) -> Self {
        Self {
            job,
            slot,
            state: InstanceState::Pending,
            start_offset_ms: 0,
            elapsed_ms: 0,
            exit_code: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn start_rank(&self) -> usize {
        self.slot.start_rank
    }

    pub fn rank_count(&self) -> usize {
        self.slot.size
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn mark_running(&mut self) {
        self.state = InstanceState::Running;
    }

    pub fn finish(&mut self, completion: Completion) {
        self.state = InstanceState::Finished;
        self.start_offset_ms = completion.start_offset_ms;
        self.elapsed_ms = completion.elapsed_ms;
        self.exit_code = Some(completion.exit_code);
    }

    /// Milliseconds between the start of the run and the start of the job.
    pub fn start_offset_ms(&self) -> u64 {
        self.start_offset_ms
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Outcome of handing an instance to its ranks.
#[derive(Debug)]
pub enum Dispatch {
    Started,
    /// The job could not be started; the slot is still held by `instance`
    /// and must be freed by the caller.
    Rejected { instance: Instance, reason: String },
}

/// A strategy for placing jobs on worker ranks.
pub trait Allocator {
    /// At least one free slot exists.
    fn ranks_available(&self) -> bool;

    /// A job asking for `requested` ranks can be allocated right now.
    fn can_allocate(&self, requested: usize) -> bool {
        requested > 0 && self.ranks_available()
    }

    /// No instance holds any rank.
    fn all_ranks_available(&self) -> bool;

    /// Binds `job` to a free slot of `requested` ranks.
    fn allocate(&mut self, requested: usize, job: Arc<JobRecord>) -> Result<Instance>;

    /// Starts a pending instance on its ranks. On success the allocator keeps it
    /// until [`Allocator::check_finished_instances`] hands it back.
    fn execute(&mut self, instance: Instance) -> Result<Dispatch>;

    /// Returns the slot of a pending or finished instance to the free pool.
    fn free(&mut self, instance: &Instance) -> Result<()>;

    /// Instances whose ranks reported completion since the last call. Never blocks.
    fn check_finished_instances(&mut self) -> Result<Vec<Instance>>;

    /// Shuts down every free worker group. Fails while ranks are still in use.
    fn terminate(&mut self) -> Result<()>;

    /// Adjusts a job's rank request to what this allocator can serve.
    fn preprocess_job(&self, _job: &mut JobRecord) {}

    /// Number of worker ranks managed.
    fn pool_size(&self) -> usize;

    fn ranks_in_use(&self) -> usize;
}

/// Drives worker groups for an allocator: renders and sends jobs, tracks
/// running instances by leader rank and collects their completions.
pub struct Dispatcher<L> {
    layout: RankLayout,
    link: L,
    renderer: ArgvRenderer,
    running: BTreeMap<usize, Instance>,
}

impl<L: MasterLink> Dispatcher<L> {
    pub fn new(layout: RankLayout, link: L, renderer: ArgvRenderer) -> Self {
        Self {
            layout,
            link,
            renderer,
            running: BTreeMap::new(),
        }
    }

    pub fn layout(&self) -> RankLayout {
        self.layout
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Sends a control signal that must go through.
    pub fn signal(&mut self, slot: Slot, signal: Signal) -> Result<()> {
        let leader = self.layout.global(slot.leader());
        debug!(%slot, leader, ?signal, "Signalling worker group");
        self.link
            .send_signal(leader, signal)
            .map_err(|e| e.into_error(leader))
    }

    pub fn dispatch(&mut self, mut instance: Instance) -> Result<Dispatch> {
        let slot = instance.slot();
        if self.running.contains_key(&slot.leader()) {
            return Err(SchedulerError::Protocol {
                rank: self.layout.global(slot.leader()),
                reason: format!("slot {slot} already runs a job"),
            });
        }
        let argv = match self.renderer.render(instance.job(), slot.start_rank, slot.size) {
            Ok(argv) => argv,
            Err(e) => {
                return Ok(Dispatch::Rejected {
                    instance,
                    reason: e.to_string(),
                })
            }
        };
        let ticket = JobTicket {
            job_id: instance.id().to_string(),
            argv,
        };
        let leader = self.layout.global(slot.leader());
        match self.link.send_signal(leader, Signal::Job(ticket)) {
            Ok(()) => {
                instance.mark_running();
                self.running.insert(slot.leader(), instance);
                Ok(Dispatch::Started)
            }
            Err(LinkError::Busy) => Ok(Dispatch::Rejected {
                instance,
                reason: format!("rank {leader} cannot take another message yet"),
            }),
            Err(e) => Err(e.into_error(leader)),
        }
    }

    pub fn poll_finished(&mut self) -> Result<Vec<Instance>> {
        let leaders: Vec<usize> = self.running.keys().copied().collect();
        let mut finished = vec![];
        for leader in leaders {
            let completion = match self.link.poll_completion(self.layout.global(leader))? {
                Some(completion) => completion,
                None => continue,
            };
            if let Some(mut instance) = self.running.remove(&leader) {
                instance.finish(completion);
                if completion.exit_code != 0 {
                    warn!(
                        job = instance.id(),
                        code = completion.exit_code,
                        "Command failed with non-zero exit code"
                    );
                }
                finished.push(instance);
            }
        }
        if !finished.is_empty() {
            debug!(count = finished.len(), "Collected finished instances");
        }
        Ok(finished)
    }

    pub fn is_running(&self, slot: &Slot) -> bool {
        self.running
            .get(&slot.leader())
            .map(|instance| instance.slot() == *slot)
            .unwrap_or(false)
    }

    pub fn running_slots(&self) -> Vec<Slot> {
        self.running.values().map(Instance::slot).collect()
    }
}

/// Logs the placement of a freshly allocated instance.
pub(crate) fn log_allocation(instance: &Instance) {
    info!(
        job = instance.id(),
        ranks = instance.rank_count(),
        "Allocated {}",
        instance.slot()
    );
}
