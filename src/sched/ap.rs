//! Absolute-priority scheduler.
//!
//! The whole NUMA domain shares one priority-ordered list. `schedule`
//! inserts in priority order, `select` pops the front. Trivially fair on
//! priority, with no locality at all.

use crate::task::Task;
use crate::topology::Topology;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub struct ApScheduler {
    /// Worker index to domain-list index.
    domain_of: Vec<usize>,
    /// One shared ordered list per NUMA domain.
    lists: Vec<Arc<Mutex<VecDeque<Box<Task>>>>>,
}

impl ApScheduler {
    pub fn install(topology: &Topology, workers: usize) -> Self {
        let domains = topology.num_nodes.max(1);
        let lists = (0..domains)
            .map(|_| Arc::new(Mutex::new(VecDeque::new())))
            .collect();
        let domain_of = (0..workers)
            .map(|w| topology.node_of(w) % domains)
            .collect();
        ApScheduler { domain_of, lists }
    }

    fn list(&self, worker: usize) -> &Arc<Mutex<VecDeque<Box<Task>>>> {
        let domain = self.domain_of.get(worker).copied().unwrap_or(0);
        &self.lists[domain]
    }

    pub fn schedule(&self, worker: usize, task: Box<Task>, _distance: i32) {
        let mut list = self.list(worker).lock().unwrap();
        // stable insert: after the last entry of equal priority
        let pos = list
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(list.len());
        list.insert(pos, task);
    }

    pub fn select(&self, worker: usize) -> Option<(Box<Task>, i32)> {
        let task = self.list(worker).lock().unwrap().pop_front()?;
        Some((task, 0))
    }

    pub fn queued_tasks(&self) -> usize {
        self.lists.iter().map(|l| l.lock().unwrap().len()).sum()
    }

    pub fn remove(&self) -> usize {
        let mut drained = 0;
        for list in &self.lists {
            let mut list = list.lock().unwrap();
            drained += list.len();
            list.clear();
        }
        drained
    }
}
