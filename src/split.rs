//! Allocation by bisecting live worker groups.
//!
//! The pool starts as one slot spanning every worker rank. A request smaller
//! than the slot it is drawn from makes the slot's group split in two: the
//! leader gets a SPLIT signal with the size of the first child, relays it to
//! its members, and every member switches to the child it falls in. The first
//! child runs the job, the second goes back to the free queue.
//!
//! Splits are permanent. A freed slot returns to the queue with its size
//! unchanged and never merges with its sibling, so the pool only gets more
//! fragmented over a run, and a request larger than every free slot waits for
//! a large enough slot to be freed.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::allocator::{log_allocation, Allocator, Dispatch, Dispatcher, Instance, InstanceState, Slot};
use crate::comm::{MasterLink, RankLayout, Signal};
use crate::error::{Result, SchedulerError};
use crate::job::{ArgvRenderer, JobRecord};

pub struct PartitionedRankPool<L> {
    free: VecDeque<Slot>,
    ranks_in_use: usize,
    dispatcher: Dispatcher<L>,
}

impl<L: MasterLink> PartitionedRankPool<L> {
    pub fn new(layout: RankLayout, link: L, renderer: ArgvRenderer) -> Self {
        let mut free = VecDeque::new();
        if layout.workers() > 0 {
            free.push_back(Slot::new(0, layout.workers()));
        }
        Self {
            free,
            ranks_in_use: 0,
            dispatcher: Dispatcher::new(layout, link, renderer),
        }
    }

    /// Free slots in the order they will be considered.
    pub fn free_slots(&self) -> impl Iterator<Item = &Slot> {
        self.free.iter()
    }

    /// Slots of instances currently running on their ranks.
    pub fn running_slots(&self) -> Vec<Slot> {
        self.dispatcher.running_slots()
    }

    pub fn link_mut(&mut self) -> &mut L {
        self.dispatcher.link_mut()
    }

    /// Splits `slot`'s worker group, returning the two children.
    fn split(&mut self, slot: Slot, first_size: usize) -> Result<(Slot, Slot)> {
        if first_size == 0 || first_size >= slot.size {
            return Err(SchedulerError::InvalidRequest(format!(
                "cannot split {slot} to {first_size} ranks"
            )));
        }
        self.dispatcher.signal(slot, Signal::Split { first_size })?;
        let (first, second) = slot.split_at(first_size);
        debug!(parent = %slot, %first, %second, "Split slot");
        Ok((first, second))
    }
}

impl<L: MasterLink> Allocator for PartitionedRankPool<L> {
    fn ranks_available(&self) -> bool {
        !self.free.is_empty()
    }

    fn can_allocate(&self, requested: usize) -> bool {
        requested > 0 && self.free.iter().any(|slot| slot.size >= requested)
    }

    fn all_ranks_available(&self) -> bool {
        self.ranks_in_use == 0
    }

    fn allocate(&mut self, requested: usize, job: Arc<JobRecord>) -> Result<Instance> {
        if requested == 0 {
            return Err(SchedulerError::InvalidRequest(format!(
                "job '{}' asks for 0 ranks",
                job.id
            )));
        }
        let mut slot = self
            .free
            .iter()
            .position(|slot| slot.size >= requested)
            .and_then(|index| self.free.remove(index))
            .ok_or(SchedulerError::NoFittingSlot { requested })?;
        if slot.size > requested {
            let (first, second) = self.split(slot, requested)?;
            self.free.push_back(second);
            slot = first;
        }
        self.ranks_in_use += slot.size;
        let instance = Instance::new(job, slot);
        log_allocation(&instance);
        Ok(instance)
    }

    fn execute(&mut self, instance: Instance) -> Result<Dispatch> {
        self.dispatcher.dispatch(instance)
    }

    fn free(&mut self, instance: &Instance) -> Result<()> {
        let slot = instance.slot();
        if instance.state() == InstanceState::Running || self.dispatcher.is_running(&slot) {
            return Err(SchedulerError::InvalidRequest(format!(
                "job '{}' is still running on {slot}",
                instance.id()
            )));
        }
        if self.free.iter().any(|free| free.overlaps(&slot)) {
            return Err(SchedulerError::InvalidRequest(format!(
                "{slot} of job '{}' is already free",
                instance.id()
            )));
        }
        self.ranks_in_use = self.ranks_in_use.checked_sub(slot.size).ok_or_else(|| {
            SchedulerError::InvalidRequest(format!("{slot} was never allocated"))
        })?;
        self.free.push_back(slot);
        Ok(())
    }

    fn check_finished_instances(&mut self) -> Result<Vec<Instance>> {
        self.dispatcher.poll_finished()
    }

    fn terminate(&mut self) -> Result<()> {
        if self.ranks_in_use > 0 {
            return Err(SchedulerError::PoolBusy(self.ranks_in_use));
        }
        while let Some(slot) = self.free.pop_front() {
            self.dispatcher.signal(slot, Signal::Terminate)?;
        }
        Ok(())
    }

    fn preprocess_job(&self, job: &mut JobRecord) {
        let workers = self.dispatcher.layout().workers();
        if job.requested_ranks > workers {
            warn!(
                job = job.id.as_str(),
                requested = job.requested_ranks,
                workers,
                "Job asks for more ranks than the pool holds, clamping"
            );
            job.requested_ranks = workers.max(1);
        }
    }

    fn pool_size(&self) -> usize {
        self.dispatcher.layout().workers()
    }

    fn ranks_in_use(&self) -> usize {
        self.ranks_in_use
    }
}
