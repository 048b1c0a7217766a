//! Priority-biased queues scheduler.
//!
//! Each worker owns a bounded priority buffer sized to its NUMA domain.
//! `select` probes the worker's own buffer, then its neighbors' buffers in
//! increasing topology distance (tie-break: round-robin starting at
//! `self + 1`), and finally the domain's shared system queue. The probe
//! index is returned as a distance hint so producers can bias overflow
//! away from remote queues.

use crate::hbbuffer::HbBuffer;
use crate::task::{priority_cmp, Task};
use crate::topology::Topology;
use crossbeam::deque::{Injector, Steal};
use std::sync::Arc;
use tracing::trace;

struct PbqWorker {
    task_queue: Arc<HbBuffer>,
    /// Neighbor buffers ordered from closest to farthest.
    hierarch_queues: Vec<Arc<HbBuffer>>,
    system_queue: Arc<Injector<Box<Task>>>,
}

pub struct PbqScheduler {
    workers: Vec<PbqWorker>,
}

impl PbqScheduler {
    pub fn install(topology: &Topology, workers: usize) -> Self {
        // One system queue per NUMA domain, shared by its local buffers as
        // the overflow target.
        let domains = topology.num_nodes.max(1);
        let system_queues: Vec<Arc<Injector<Box<Task>>>> =
            (0..domains).map(|_| Arc::new(Injector::new())).collect();

        let queues: Vec<Arc<HbBuffer>> = (0..workers)
            .map(|w| {
                let domain = topology.node_of(w) % domains;
                let capacity = 4 * topology.node_size(w).max(1);
                Arc::new(HbBuffer::new(capacity, system_queues[domain].clone()))
            })
            .collect();

        let worker_objs = (0..workers)
            .map(|w| {
                let hierarch_queues = neighbor_order(topology, w, workers)
                    .into_iter()
                    .map(|id| queues[id].clone())
                    .collect();
                PbqWorker {
                    task_queue: queues[w].clone(),
                    hierarch_queues,
                    system_queue: system_queues[topology.node_of(w) % domains].clone(),
                }
            })
            .collect();

        PbqScheduler {
            workers: worker_objs,
        }
    }

    pub fn schedule(&self, worker: usize, task: Box<Task>, distance: i32) {
        self.workers[worker]
            .task_queue
            .push_all_by_priority(vec![task], distance);
    }

    pub fn select(&self, worker: usize) -> Option<(Box<Task>, i32)> {
        let me = &self.workers[worker];

        if let Some(task) = me.task_queue.pop_best(priority_cmp) {
            return Some((task, 0));
        }
        for (i, queue) in me.hierarch_queues.iter().enumerate() {
            if let Some(task) = queue.pop_best(priority_cmp) {
                trace!(worker, probe = i + 1, "stole task from neighbor queue");
                return Some((task, (i + 1) as i32));
            }
        }
        loop {
            match me.system_queue.steal() {
                Steal::Success(task) => {
                    let distance = 1 + me.hierarch_queues.len() as i32;
                    trace!(worker, "took task from system queue");
                    return Some((task, distance));
                }
                Steal::Retry => continue,
                Steal::Empty => return None,
            }
        }
    }

    pub fn queued_tasks(&self) -> usize {
        let local: usize = self.workers.iter().map(|w| w.task_queue.len()).sum();
        // system queues are shared across a domain; count each once
        let mut counted = std::collections::HashSet::new();
        let mut shared = 0;
        for w in &self.workers {
            if counted.insert(Arc::as_ptr(&w.system_queue)) {
                shared += w.system_queue.len();
            }
        }
        local + shared
    }

    pub fn remove(&self) -> usize {
        let mut drained = 0;
        for w in &self.workers {
            while w.task_queue.pop_best(priority_cmp).is_some() {
                drained += 1;
            }
        }
        let mut counted = std::collections::HashSet::new();
        for w in &self.workers {
            if !counted.insert(Arc::as_ptr(&w.system_queue)) {
                continue;
            }
            loop {
                match w.system_queue.steal() {
                    Steal::Success(_) => drained += 1,
                    Steal::Retry => continue,
                    Steal::Empty => break,
                }
            }
        }
        drained
    }
}

/// Orders every other worker by ascending distance from `worker`,
/// tie-breaking round-robin from `worker + 1`, mirroring the level walk
/// of the hierarchical queue setup. Falls back to plain round-robin order
/// when no topology information is available.
fn neighbor_order(topology: &Topology, worker: usize, workers: usize) -> Vec<usize> {
    let rr: Vec<usize> = (1..workers).map(|i| (worker + i) % workers).collect();

    if topology.nb_levels() == -1 {
        return rr;
    }

    let mut ordered = Vec::with_capacity(rr.len());
    for level in 0..=topology.nb_levels() {
        for &id in &rr {
            let d = topology.distance(worker, id);
            if d == 2 * level || d == 2 * level + 1 {
                ordered.push(id);
            }
        }
        if ordered.len() == rr.len() {
            break;
        }
    }
    // workers at distances outside the level walk still get probed last
    for &id in &rr {
        if !ordered.contains(&id) {
            ordered.push(id);
        }
    }
    ordered
}
