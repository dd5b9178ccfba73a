/// Facts a distributed-capable learner reports about its communicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributedCapability {
    pub worker_rank: usize,
    pub num_workers: usize,
    /// Sample count after which this learner starts true parallel updates.
    pub parallelize_after: u64,
}

/// Parameter learner owned by the optimizer. The session only asks one
/// question of it: whether it is distributed, and with which facts.
pub trait Learner {
    fn distributed(&self) -> Option<DistributedCapability> {
        None
    }
}

/// This worker's place in the run, derived once at session construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTopology {
    pub worker_rank: usize,
    pub num_workers: usize,
    /// Sample count after which sharding activates. Zero when no learner
    /// is distributed: a single worker is trivially parallel from the
    /// start.
    pub parallel_after_samples: u64,
}

impl Default for WorkerTopology {
    fn default() -> Self {
        Self {
            worker_rank: 0,
            num_workers: 1,
            parallel_after_samples: 0,
        }
    }
}

impl WorkerTopology {
    /// Rank and worker count come from any distributed learner; the
    /// activation threshold is the maximum across all of them, so sharding
    /// stays off until every distributed component is ready.
    pub fn from_learners(learners: &[Box<dyn Learner>]) -> Self {
        let mut topology = Self::default();
        for capability in learners.iter().filter_map(|learner| learner.distributed()) {
            topology.parallel_after_samples = topology
                .parallel_after_samples
                .max(capability.parallelize_after);
            topology.worker_rank = capability.worker_rank;
            topology.num_workers = capability.num_workers;
        }
        topology
    }

    /// Effective `(worker_rank, num_workers)` at `samples_seen`. Before
    /// the activation threshold every worker reads the same data as rank 0
    /// of 1.
    pub fn shard_at(&self, samples_seen: u64) -> (usize, usize) {
        if self.parallel_after_samples > samples_seen {
            (0, 1)
        } else {
            (self.worker_rank, self.num_workers)
        }
    }
}
