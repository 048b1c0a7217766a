//! Scheduling policies.
//!
//! Two interchangeable strategies implement the same contract: `install`
//! at engine init, `schedule` to insert a ready task from a worker,
//! `select` to pick the next task for a worker, and `remove` at teardown.
//! Policies are a closed set dispatched through a tagged enum.

pub mod ap;
pub mod pbq;

use crate::task::Task;
use crate::topology::Topology;
pub use ap::ApScheduler;
pub use pbq::PbqScheduler;

/// Which scheduling policy an engine uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Absolute priority: one shared ordered list per NUMA domain.
    /// Strict priority order, no locality.
    Ap,
    /// Priority-biased queues: per-worker bounded buffers probed in
    /// topology-distance order, spilling to the domain's system queue.
    Pbq,
}

/// A scheduling policy instance, installed for a fixed worker count.
pub enum Policy {
    Ap(ApScheduler),
    Pbq(PbqScheduler),
}

impl Policy {
    /// Builds and installs the policy for `workers` execution streams.
    ///
    /// All queue allocation and the publication of neighbor views happen
    /// here, before any worker starts selecting.
    pub fn install(kind: SchedulerKind, topology: &Topology, workers: usize) -> Policy {
        match kind {
            SchedulerKind::Ap => Policy::Ap(ApScheduler::install(topology, workers)),
            SchedulerKind::Pbq => Policy::Pbq(PbqScheduler::install(topology, workers)),
        }
    }

    /// Inserts `task` from `worker`. `distance` is the probe distance the
    /// producing worker last observed, used to bias overflow placement.
    pub fn schedule(&self, worker: usize, task: Box<Task>, distance: i32) {
        match self {
            Policy::Ap(s) => s.schedule(worker, task, distance),
            Policy::Pbq(s) => s.schedule(worker, task, distance),
        }
    }

    /// Picks the next task for `worker`, together with the probe distance
    /// it was found at. Returns `None` when no work is visible.
    pub fn select(&self, worker: usize) -> Option<(Box<Task>, i32)> {
        match self {
            Policy::Ap(s) => s.select(worker),
            Policy::Pbq(s) => s.select(worker),
        }
    }

    /// Number of tasks currently queued across all workers.
    pub fn queued_tasks(&self) -> usize {
        match self {
            Policy::Ap(s) => s.queued_tasks(),
            Policy::Pbq(s) => s.queued_tasks(),
        }
    }

    /// Drains every queue at teardown, returning the number of tasks that
    /// were still pending.
    pub fn remove(&self) -> usize {
        match self {
            Policy::Ap(s) => s.remove(),
            Policy::Pbq(s) => s.remove(),
        }
    }
}
