//! One job per worker rank.
//!
//! Every worker is its own group of size one from the start, so no rank is
//! ever split. Useful for sweeps of sequential commands.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::warn;

use crate::allocator::{log_allocation, Allocator, Dispatch, Dispatcher, Instance, InstanceState, Slot};
use crate::comm::{MasterLink, RankLayout, Signal};
use crate::error::{Result, SchedulerError};
use crate::job::{ArgvRenderer, JobRecord};

pub struct OneCorePool<L> {
    free: VecDeque<usize>,
    dispatcher: Dispatcher<L>,
}

impl<L: MasterLink> OneCorePool<L> {
    pub fn new(layout: RankLayout, link: L, renderer: ArgvRenderer) -> Self {
        Self {
            free: (0..layout.workers()).collect(),
            dispatcher: Dispatcher::new(layout, link, renderer),
        }
    }

    pub fn link_mut(&mut self) -> &mut L {
        self.dispatcher.link_mut()
    }
}

impl<L: MasterLink> Allocator for OneCorePool<L> {
    fn ranks_available(&self) -> bool {
        !self.free.is_empty()
    }

    fn can_allocate(&self, requested: usize) -> bool {
        requested == 1 && self.ranks_available()
    }

    fn all_ranks_available(&self) -> bool {
        self.free.len() == self.pool_size()
    }

    fn allocate(&mut self, requested: usize, job: Arc<JobRecord>) -> Result<Instance> {
        if requested != 1 {
            return Err(SchedulerError::InvalidRequest(format!(
                "job '{}' asks for {requested} ranks, only single-rank jobs are served",
                job.id
            )));
        }
        let rank = self
            .free
            .pop_front()
            .ok_or(SchedulerError::NoFittingSlot { requested })?;
        let instance = Instance::new(job, Slot::new(rank, 1));
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
        if slot.size != 1 || slot.start_rank >= self.pool_size() || self.free.contains(&slot.start_rank) {
            return Err(SchedulerError::InvalidRequest(format!(
                "{slot} of job '{}' is not allocated",
                instance.id()
            )));
        }
        self.free.push_back(slot.start_rank);
        Ok(())
    }

    fn check_finished_instances(&mut self) -> Result<Vec<Instance>> {
        self.dispatcher.poll_finished()
    }

    fn terminate(&mut self) -> Result<()> {
        let in_use = self.ranks_in_use();
        if in_use > 0 {
            return Err(SchedulerError::PoolBusy(in_use));
        }
        while let Some(rank) = self.free.pop_front() {
            self.dispatcher.signal(Slot::new(rank, 1), Signal::Terminate)?;
        }
        Ok(())
    }

    fn preprocess_job(&self, job: &mut JobRecord) {
        if job.requested_ranks != 1 {
            warn!(
                job = job.id.as_str(),
                requested = job.requested_ranks,
                "Running multi-rank job on a single rank"
            );
            job.requested_ranks = 1;
        }
    }

    fn pool_size(&self) -> usize {
        self.dispatcher.layout().workers()
    }

    fn ranks_in_use(&self) -> usize {
        self.pool_size() - self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::allocator::testing::{job, RecordingLink};

    fn pool(workers: usize) -> OneCorePool<RecordingLink> {
        OneCorePool::new(
            RankLayout::new(workers),
            RecordingLink::default(),
            ArgvRenderer::new(Path::new("out")),
        )
    }

    #[test]
    fn test_allocates_ranks_in_order() {
        let mut pool = pool(3);
        let a = pool.allocate(1, job("a", 1)).unwrap();
        let b = pool.allocate(1, job("b", 1)).unwrap();
        assert_eq!(a.slot(), Slot::new(0, 1));
        assert_eq!(b.slot(), Slot::new(1, 1));
        assert_eq!(pool.ranks_in_use(), 2);
        assert!(pool.link_mut().splits().is_empty());
    }

    #[test]
    fn test_multi_rank_request_is_rejected() {
        let mut pool = pool(3);
        assert!(!pool.can_allocate(2));
        assert!(matches!(
            pool.allocate(2, job("a", 2)),
            Err(SchedulerError::InvalidRequest(_))
        ));
        assert!(pool.all_ranks_available());
    }

    #[test]
    fn test_exhausted_pool() {
        let mut pool = pool(1);
        let a = pool.allocate(1, job("a", 1)).unwrap();
        assert!(!pool.can_allocate(1));
        assert!(matches!(
            pool.allocate(1, job("b", 1)),
            Err(SchedulerError::NoFittingSlot { requested: 1 })
        ));
        pool.free(&a).unwrap();
        assert!(pool.can_allocate(1));
        assert!(matches!(pool.free(&a), Err(SchedulerError::InvalidRequest(_))));
    }

    #[test]
    fn test_run_and_terminate() {
        let mut pool = pool(2);
        let a = pool.allocate(1, job("a", 1)).unwrap();
        pool.execute(a).unwrap();
        assert!(matches!(pool.terminate(), Err(SchedulerError::PoolBusy(1))));

        pool.link_mut().complete(1, 0, 40);
        let finished = pool.check_finished_instances().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].elapsed_ms(), 40);
        pool.free(&finished[0]).unwrap();

        pool.terminate().unwrap();
        let terminated: Vec<_> = pool
            .link_mut()
            .sent
            .iter()
            .filter(|(_, signal)| *signal == Signal::Terminate)
            .map(|(rank, _)| *rank)
            .collect();
        assert_eq!(terminated, vec![2, 1]);
    }

    #[test]
    fn test_preprocess_forces_single_rank() {
        let pool = pool(4);
        let mut record = JobRecord::new("a", 3, 0, vec![]);
        pool.preprocess_job(&mut record);
        assert_eq!(record.requested_ranks, 1);
    }
}
