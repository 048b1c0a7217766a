//! Per-device stream pipeline bookkeeping.
//!
//! Every device drives a fixed set of streams: stream 0 stages data in,
//! stream 1 stages data out, the remaining streams execute kernels. Each
//! stream owns a ring of (event, task) slots; the driver submits into
//! `start` and retires completed events from `end`. The ring is wait-free
//! from the driver's side - event queries are the only synchronization
//! with the device.

use crate::device::backend::EventId;
use crate::device::offload::OffloadTask;
use std::collections::VecDeque;

/// Streams per device: stage-in, stage-out, and two execute streams.
pub const MAX_STREAMS: usize = 4;
/// Ring capacity of in-flight events per stream.
pub const MAX_EVENTS_PER_STREAM: usize = 4;

/// Stream index staging host-to-device transfers.
pub const STAGE_IN_STREAM: usize = 0;
/// Stream index staging device-to-host transfers.
pub const STAGE_OUT_STREAM: usize = 1;
/// First execute stream.
pub const FIRST_EXEC_STREAM: usize = 2;

#[derive(Debug)]
pub struct ExecStream {
    pub index: usize,
    /// Tasks waiting to enter this stream, sorted by priority.
    pub pending: VecDeque<OffloadTask>,
    slots: Vec<Option<(EventId, OffloadTask)>>,
    start: usize,
    end: usize,
    /// Tasks retired from this stream over its lifetime.
    pub executed: u64,
}

impl ExecStream {
    pub fn new(index: usize, max_events: usize) -> Self {
        ExecStream {
            index,
            pending: VecDeque::new(),
            slots: (0..max_events.max(1)).map(|_| None).collect(),
            start: 0,
            end: 0,
            executed: 0,
        }
    }

    /// Whether the submission slot is free.
    pub fn has_room(&self) -> bool {
        self.slots[self.start].is_none()
    }

    /// Queues a task on the pending FIFO in priority order (stable, so
    /// equal priorities stay FIFO).
    pub fn push_pending(&mut self, task: OffloadTask) {
        let pos = self
            .pending
            .iter()
            .position(|t| t.priority() < task.priority())
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, task);
    }

    /// Re-queues a task that could not make progress, keeping priority
    /// order.
    pub fn push_back_pending(&mut self, task: OffloadTask) {
        self.push_pending(task);
    }

    pub fn pop_pending(&mut self) -> Option<OffloadTask> {
        self.pending.pop_front()
    }

    /// Records a submitted task in the ring.
    pub fn record(&mut self, event: EventId, task: OffloadTask) {
        debug_assert!(self.has_room());
        self.slots[self.start] = Some((event, task));
        self.start = (self.start + 1) % self.slots.len();
    }

    /// The event to poll next, if any work is in flight.
    pub fn oldest_event(&self) -> Option<EventId> {
        self.slots[self.end].as_ref().map(|(ev, _)| *ev)
    }

    /// Peeks at the task behind the oldest event.
    pub fn oldest_task(&self) -> Option<&OffloadTask> {
        self.slots[self.end].as_ref().map(|(_, t)| t)
    }

    /// Retires the oldest slot after its event completed.
    pub fn retire(&mut self) -> Option<OffloadTask> {
        let (_, task) = self.slots[self.end].take()?;
        self.end = (self.end + 1) % self.slots.len();
        self.executed += 1;
        Some(task)
    }

    /// Whether no event ring slot is occupied.
    pub fn ring_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Whether nothing is in flight and nothing is pending.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.ring_empty()
    }

    /// Drains the pending FIFO (used when a device is disabled).
    pub fn drain_pending(&mut self) -> Vec<OffloadTask> {
        self.pending.drain(..).collect()
    }

    /// Empties every ring slot, abandoning in-flight events (used when a
    /// device is disabled).
    pub fn drain_ring(&mut self) -> Vec<OffloadTask> {
        let drained = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.take().map(|(_, task)| task))
            .collect();
        self.start = 0;
        self.end = 0;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, TaskFunction};
    use std::sync::Arc;

    fn otask(priority: i32) -> OffloadTask {
        let f = Arc::new(TaskFunction::cpu_only("t", vec![], |_| {}));
        OffloadTask::kernel(Task::new(f).with_priority(priority))
    }

    #[test]
    fn test_pending_is_priority_ordered() {
        let mut stream = ExecStream::new(0, 2);
        stream.push_pending(otask(1));
        stream.push_pending(otask(9));
        stream.push_pending(otask(5));
        assert_eq!(stream.pop_pending().unwrap().priority(), 9);
        assert_eq!(stream.pop_pending().unwrap().priority(), 5);
        assert_eq!(stream.pop_pending().unwrap().priority(), 1);
    }

    #[test]
    fn test_ring_fills_and_retires_in_order() {
        let mut stream = ExecStream::new(0, 2);
        assert!(stream.has_room());
        stream.record(EventId(1), otask(1));
        stream.record(EventId(2), otask(2));
        assert!(!stream.has_room());

        assert_eq!(stream.oldest_event(), Some(EventId(1)));
        let first = stream.retire().unwrap();
        assert_eq!(first.priority(), 1);
        assert!(stream.has_room());
        assert_eq!(stream.oldest_event(), Some(EventId(2)));
    }

    #[test]
    fn test_idle_tracking() {
        let mut stream = ExecStream::new(0, 2);
        assert!(stream.is_idle());
        stream.push_pending(otask(1));
        assert!(!stream.is_idle());
        let t = stream.pop_pending().unwrap();
        stream.record(EventId(1), t);
        assert!(!stream.is_idle());
        stream.retire();
        assert!(stream.is_idle());
    }
}
