//! Completion tracking for scheduled task batches.
//!
//! A [`Counter`] is attached to every task of a batch at submission and
//! ticks down as the engine retires them. Failed tasks tick the counter
//! too, so waiters are never left hanging, but failures are accounted
//! separately: a drained batch can be told apart from a clean one.
//! Waiters poll; nothing here blocks a worker thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct CounterState {
    remaining: AtomicUsize,
    failures: AtomicUsize,
}

/// Shared countdown over a batch of scheduled tasks.
#[derive(Clone, Debug)]
pub struct Counter {
    state: Arc<CounterState>,
}

impl Counter {
    /// A counter expecting `count` task completions.
    pub fn for_tasks(count: usize) -> Self {
        Counter {
            state: Arc::new(CounterState {
                remaining: AtomicUsize::new(count),
                failures: AtomicUsize::new(0),
            }),
        }
    }

    /// Grows the batch by `count` tasks scheduled after the fact.
    pub fn add_tasks(&self, count: usize) {
        self.state.remaining.fetch_add(count, Ordering::SeqCst);
    }

    /// Marks one task of the batch complete.
    pub fn task_done(&self) {
        let prev = self.state.remaining.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "more completions than scheduled tasks");
    }

    /// Marks one task of the batch failed. The batch still progresses
    /// towards completion; the failure stays visible in [`failures`].
    ///
    /// [`failures`]: Counter::failures
    pub fn task_failed(&self) {
        self.state.failures.fetch_add(1, Ordering::SeqCst);
        self.task_done();
    }

    /// Tasks still outstanding.
    pub fn remaining(&self) -> usize {
        self.state.remaining.load(Ordering::SeqCst)
    }

    /// Tasks of the batch that failed.
    pub fn failures(&self) -> usize {
        self.state.failures.load(Ordering::SeqCst)
    }

    /// Whether every task of the batch has been accounted for.
    pub fn is_complete(&self) -> bool {
        self.remaining() == 0
    }

    /// Complete, with not a single failure.
    pub fn is_clean(&self) -> bool {
        self.is_complete() && self.failures() == 0
    }
}
