//! Bounded hierarchical priority buffer.
//!
//! Each worker owns one `HbBuffer` for its local tasks. The buffer is
//! single-producer (the owning worker) / multi-consumer (any neighbor may
//! steal through [`HbBuffer::pop_best`]). When a push overflows the
//! capacity, the lowest-priority suffix spills to the parent queue - the
//! per-NUMA-domain system queue.
//!
//! `pop_best` never blocks: if the buffer is contended it returns `None`
//! and the caller moves on to the next queue in its hierarchy.

use crate::task::Task;
use crossbeam::deque::Injector;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub struct HbBuffer {
    capacity: usize,
    /// Tasks sorted by descending priority; insertion is stable so equal
    /// priorities keep FIFO order.
    items: Mutex<VecDeque<Box<Task>>>,
    /// Overflow target shared with every buffer of the NUMA domain.
    overflow: Arc<Injector<Box<Task>>>,
}

impl HbBuffer {
    pub fn new(capacity: usize, overflow: Arc<Injector<Box<Task>>>) -> Self {
        HbBuffer {
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            overflow,
        }
    }

    /// Inserts a chain of tasks in priority order. If the buffer exceeds
    /// its capacity, the lowest-priority suffix overflows to the parent
    /// queue.
    ///
    /// `_distance` is the probe distance the tasks were selected at; it is
    /// accepted for contract compatibility and currently unused by the
    /// insertion itself.
    pub fn push_all_by_priority(&self, tasks: Vec<Box<Task>>, _distance: i32) {
        let mut items = self.items.lock().unwrap();
        for task in tasks {
            // stable insert: after the last entry of equal priority
            let pos = items
                .iter()
                .position(|t| t.priority < task.priority)
                .unwrap_or(items.len());
            items.insert(pos, task);
        }
        while items.len() > self.capacity {
            if let Some(task) = items.pop_back() {
                self.overflow.push(task);
            }
        }
    }

    /// Removes and returns the best task under `cmp` (the task that sorts
    /// first). Returns `None` if the buffer is empty or currently
    /// contended - the caller probes the next queue instead of blocking.
    pub fn pop_best(&self, cmp: fn(&Task, &Task) -> Ordering) -> Option<Box<Task>> {
        let mut items = self.items.try_lock().ok()?;
        if items.is_empty() {
            return None;
        }
        let mut best = 0;
        for i in 1..items.len() {
            if cmp(&items[i], &items[best]) == Ordering::Less {
                best = i;
            }
        }
        items.remove(best)
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
