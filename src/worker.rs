//! Worker threads.
//!
//! One thread per execution stream. Workers pin themselves to a core
//! when requested, synchronize on a barrier so no one selects before all
//! queues are published, then idle-spin on `select`/`dispatch` through
//! [`Engine::progress`]. There is no suspension inside the loop; a
//! worker that finds no work yields the CPU and retries.

use crate::engine::Engine;
use core_affinity::CoreId;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Parameters for spawning one worker thread.
pub(crate) struct WorkerParams {
    pub id: usize,
    pub engine: Arc<Engine>,
    pub barrier: Arc<Barrier>,
    pub core_id: Option<CoreId>,
}

/// A running worker thread.
pub struct Worker {
    id: usize,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(params: WorkerParams) -> Worker {
        let id = params.id;
        let handle = thread::spawn(move || {
            if let Some(core_id) = params.core_id {
                core_affinity::set_for_current(core_id);
            }
            // all workers see fully published queues after this point
            params.barrier.wait();
            debug!(worker = params.id, "worker loop starting");
            Worker::run_loop(&params.engine, params.id);
        });

        Worker {
            id,
            handle: Some(handle),
        }
    }

    fn run_loop(engine: &Engine, id: usize) {
        loop {
            if engine.is_shutdown() {
                break;
            }
            if !engine.progress(id) {
                thread::yield_now();
            }
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Waits for the worker thread to finish.
    pub fn join(mut self) -> thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}
