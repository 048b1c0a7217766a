//! Accelerator device management.
//!
//! A [`Device`] bundles everything one accelerator owns: its backend
//! handle, memory pool, LRU lists, stream pipeline, pending FIFO and
//! statistics. All mutable device state lives behind a single mutex that
//! only the elected *driver* worker locks; concurrent workers hand their
//! tasks over through the lock-free pending FIFO.

pub mod backend;
pub mod dyld;
pub mod lru;
pub mod memory;
pub mod offload;
pub mod stream;

use crate::config::DeviceConfig;
use crate::device::backend::DeviceBackend;
use crate::device::dyld::ResolvedKernel;
use crate::device::lru::LruList;
use crate::device::memory::{reservation_segments, ZonePool};
use crate::device::offload::OffloadTask;
use crate::device::stream::{ExecStream, FIRST_EXEC_STREAM, MAX_EVENTS_PER_STREAM, MAX_STREAMS};
use crate::error::DeviceError;
use crossbeam::queue::SegQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::{debug, info};

/// Device index of the CPU.
pub const CPU_DEVICE: usize = 0;
/// Device index reserved for the recursive device; never selected.
pub const RECURSIVE_DEVICE: usize = 1;
/// First accelerator device index.
pub const ACCEL_BASE: usize = 2;

/// How many times single precision is faster than double, per capability
/// major version.
pub const STOD_RATE: [f32; 3] = [8.0, 2.0, 3.0];

/// Cores per streaming multiprocessor by compute capability.
pub fn cores_per_multiprocessor(major: u8, minor: u8) -> Option<u32> {
    match (major, minor) {
        (1, _) => Some(8),
        (2, 0) => Some(32),
        (2, 1) => Some(48),
        (3, _) => Some(192),
        _ => None,
    }
}

const DRIVER_IDLE: u32 = 0;
const DRIVER_DRIVING: u32 = 1;

/// Mutable device state, touched only by the current driver.
pub struct DeviceState {
    pub backend: Box<dyn DeviceBackend>,
    pub pool: ZonePool,
    pub free_lru: LruList,
    pub owned_lru: LruList,
    pub streams: Vec<ExecStream>,
    /// Resolved dynamic kernel symbols by function name.
    pub kernels: HashMap<&'static str, ResolvedKernel>,
    exec_rr: usize,
}

impl DeviceState {
    /// Round-robin choice of the next execute stream.
    pub fn next_exec_stream(&mut self) -> usize {
        let nb_exec = self.streams.len() - FIRST_EXEC_STREAM;
        self.exec_rr = (self.exec_rr + 1) % nb_exec;
        FIRST_EXEC_STREAM + self.exec_rr
    }

    /// Whether no stream has in-flight or pending work.
    pub fn is_idle(&self) -> bool {
        self.streams.iter().all(|s| s.is_idle())
    }

    /// Whether no stream holds an in-flight event (pending FIFOs may
    /// still be populated).
    pub fn nothing_in_flight(&self) -> bool {
        self.streams.iter().all(|s| s.ring_empty())
    }

    /// Splits one stream out of the state so a phase function can borrow
    /// the rest of the device alongside it.
    pub(crate) fn split_stream(&mut self, index: usize) -> (&mut ExecStream, DevCtx<'_>) {
        let DeviceState {
            backend,
            pool,
            free_lru,
            owned_lru,
            streams,
            kernels,
            ..
        } = self;
        let stream = &mut streams[index];
        (
            stream,
            DevCtx {
                backend: backend.as_mut(),
                pool,
                free_lru,
                owned_lru,
                kernels,
            },
        )
    }
}

/// Borrowed view of the non-stream parts of a device's state.
pub(crate) struct DevCtx<'a> {
    pub backend: &'a mut dyn DeviceBackend,
    pub pool: &'a mut ZonePool,
    pub free_lru: &'a mut LruList,
    pub owned_lru: &'a mut LruList,
    pub kernels: &'a HashMap<&'static str, ResolvedKernel>,
}

/// One registered accelerator.
pub struct Device {
    /// Global device index (>= `ACCEL_BASE`).
    pub index: usize,
    pub name: String,
    /// Single-precision capability weight.
    pub sweight: f32,
    /// Double-precision capability weight.
    pub dweight: f32,
    /// Compute capability as `major * 10 + minor`.
    pub capability: u32,
    pub enabled: AtomicBool,
    /// Tasks handed over by non-driver workers.
    pub pending: SegQueue<OffloadTask>,
    driver: AtomicU32,
    pub peer_access_mask: AtomicU32,
    /// Times a worker won the driver election; observable by tests.
    pub takeovers: AtomicU64,
    pub executed_tasks: AtomicU64,
    pub transferred_in: AtomicU64,
    pub transferred_out: AtomicU64,
    pub required_in: AtomicU64,
    pub required_out: AtomicU64,
    pub state: Mutex<DeviceState>,
}

impl Device {
    /// Registers a device: computes its capability weights and reserves
    /// the managed memory arena.
    pub fn new(
        index: usize,
        mut backend: Box<dyn DeviceBackend>,
        cfg: &DeviceConfig,
    ) -> Result<Device, DeviceError> {
        let props = backend.props();
        let (major, minor) = props.capability;
        let cores = cores_per_multiprocessor(major, minor).ok_or_else(|| {
            DeviceError::Api(format!("unsupported compute capability {major}.{minor}"))
        })?;

        let sweight =
            props.multiprocessors as f32 * cores as f32 * props.clock_khz as f32 * 2.0 / 1e6;
        let dweight = sweight / STOD_RATE[usize::from(major - 1).min(2)];

        let (free_mem, _total) = backend.mem_info();
        let nb_segments = reservation_segments(
            free_mem,
            cfg.memory_use,
            cfg.memory_number_of_blocks,
            cfg.memory_block_size,
        )?;
        backend.reserve_arena(nb_segments * cfg.memory_block_size)?;
        debug!(
            device = index,
            segments = nb_segments,
            segment_size = cfg.memory_block_size,
            "reserved device arena"
        );

        let streams = (0..MAX_STREAMS)
            .map(|i| ExecStream::new(i, MAX_EVENTS_PER_STREAM))
            .collect();

        if cfg.verbose > 0 {
            info!(
                device = index,
                multiprocessors = props.multiprocessors,
                clock_khz = props.clock_khz,
                concurrent_kernels = props.concurrent_kernels,
                cores_per_sm = cores,
                "device capabilities"
            );
        }

        info!(
            device = index,
            name = %props.name,
            capability = %format!("{major}.{minor}"),
            sweight,
            dweight,
            "device registered"
        );

        Ok(Device {
            index,
            name: props.name,
            sweight,
            dweight,
            capability: major as u32 * 10 + minor as u32,
            enabled: AtomicBool::new(true),
            pending: SegQueue::new(),
            driver: AtomicU32::new(DRIVER_IDLE),
            peer_access_mask: AtomicU32::new(0),
            takeovers: AtomicU64::new(0),
            executed_tasks: AtomicU64::new(0),
            transferred_in: AtomicU64::new(0),
            transferred_out: AtomicU64::new(0),
            required_in: AtomicU64::new(0),
            required_out: AtomicU64::new(0),
            state: Mutex::new(DeviceState {
                backend,
                pool: ZonePool::new(nb_segments, cfg.memory_block_size),
                free_lru: LruList::new(),
                owned_lru: LruList::new(),
                streams,
                kernels: HashMap::new(),
                exec_rr: 0,
            }),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Tries to win the driver election. The winner is the only worker
    /// allowed to lock `state` until it releases the role.
    pub fn try_become_driver(&self) -> bool {
        let won = self
            .driver
            .compare_exchange(
                DRIVER_IDLE,
                DRIVER_DRIVING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if won {
            self.takeovers.fetch_add(1, Ordering::SeqCst);
        }
        won
    }

    /// Relinquishes the driver role. Callers must re-check the pending
    /// FIFO afterwards and re-elect themselves if work raced in, or a
    /// task pushed between the last pop and this release would be lost.
    pub fn release_driver(&self) {
        self.driver.store(DRIVER_IDLE, Ordering::SeqCst);
    }

    pub fn is_driving(&self) -> bool {
        self.driver.load(Ordering::SeqCst) == DRIVER_DRIVING
    }
}
