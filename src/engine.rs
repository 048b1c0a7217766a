//! The engine: process-wide runtime state with an `init`/`fini`
//! lifecycle.
//!
//! An [`Engine`] owns the topology, the scheduling policy, the data
//! registry and the registered accelerator devices. Workers drive it
//! either from spawned threads ([`Engine::start`]) or explicitly through
//! [`Engine::progress`], which is how the deterministic tests run it.

use crate::config::EngineConfig;
use crate::counter::Counter;
use crate::data::{DataKey, DataTable, HOST_DEVICE};
use crate::device::backend::{DeviceBackend, StreamId};
use crate::device::offload::{offload_task, HookReturn, OffloadTask};
use crate::device::stream::STAGE_OUT_STREAM;
use crate::device::{Device, ACCEL_BASE, CPU_DEVICE};
use crate::error::{DeviceError, EngineError};
use crate::sched::Policy;
use crate::task::{DeviceClass, Task, TaskFunction, TaskStatus};
use crate::topology::Topology;
use crate::worker::{Worker, WorkerParams};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Nominal selection weight of one CPU core, on the same scale as the
/// accelerator `sweight` values.
const CPU_CORE_WEIGHT: f32 = 4096.0;

/// A set of task functions registered together against the devices.
/// Symbol resolution failures clear the corresponding device bit.
pub struct TaskHandle {
    pub functions: Vec<Arc<TaskFunction>>,
    devices_mask: AtomicU64,
}

impl TaskHandle {
    pub fn new(functions: Vec<Arc<TaskFunction>>) -> Self {
        TaskHandle {
            functions,
            devices_mask: AtomicU64::new(u64::MAX),
        }
    }

    /// Devices this handle may still run on.
    pub fn mask(&self) -> u64 {
        self.devices_mask.load(Ordering::SeqCst)
    }
}

pub struct Engine {
    config: EngineConfig,
    topology: Topology,
    policy: Policy,
    data: Mutex<DataTable>,
    devices: Vec<Arc<Device>>,
    /// Selection load per global device index (f32 bits).
    device_load: Vec<AtomicU32>,
    /// Selection weight per global device index.
    device_sweight: Vec<f32>,
    executed: AtomicU64,
    failed: AtomicU64,
    shutdown: AtomicBool,
    threads: Mutex<Vec<Worker>>,
}

impl Engine {
    /// Builds an engine with no accelerator devices.
    pub fn build(config: EngineConfig) -> Arc<Engine> {
        Engine::build_with_backends(config, Vec::new())
    }

    /// Builds an engine, registering one device per provided backend
    /// (subject to the configured device mask).
    pub fn build_with_backends(
        config: EngineConfig,
        backends: Vec<Box<dyn DeviceBackend>>,
    ) -> Arc<Engine> {
        let detected = Topology::detect();
        let nodes = detected.num_nodes.min(config.workers.max(1));
        let topology = Topology::with_nodes(config.workers.max(1), nodes);
        Engine::build_with_topology(config, topology, backends)
    }

    /// Builds an engine over an explicit topology. Tests use this to pin
    /// down NUMA layouts.
    pub fn build_with_topology(
        config: EngineConfig,
        topology: Topology,
        backends: Vec<Box<dyn DeviceBackend>>,
    ) -> Arc<Engine> {
        let workers = config.workers.max(1);
        let policy = Policy::install(config.scheduler, &topology, workers);

        let mut devices: Vec<Arc<Device>> = Vec::new();
        for (i, backend) in backends.into_iter().enumerate() {
            // enabled > 0 caps the accelerator count; providing backends
            // at all is the activation signal otherwise
            if config.device.enabled > 0 && devices.len() >= config.device.enabled {
                debug!(physical = i, "device beyond the enabled count");
                break;
            }
            if config.device.mask & (1 << i) == 0 {
                debug!(physical = i, "device masked out");
                continue;
            }
            let index = ACCEL_BASE + devices.len();
            match Device::new(index, backend, &config.device) {
                Ok(dev) => devices.push(Arc::new(dev)),
                Err(e) => warn!(physical = i, error = %e, "skipping device"),
            }
        }

        // Peer-access discovery between the registered devices.
        let props: Vec<_> = devices
            .iter()
            .map(|d| d.state.lock().unwrap().backend.props())
            .collect();
        for (i, dev) in devices.iter().enumerate() {
            let mut mask = 0u32;
            for (j, other) in props.iter().enumerate() {
                if i == j {
                    continue;
                }
                if dev.state.lock().unwrap().backend.can_access_peer(other) {
                    mask |= 1 << devices[j].index;
                }
            }
            dev.peer_access_mask.store(mask, Ordering::SeqCst);
        }

        let nb_slots = ACCEL_BASE + devices.len();
        let mut device_sweight = vec![0.0f32; nb_slots];
        device_sweight[CPU_DEVICE] = workers as f32 * CPU_CORE_WEIGHT;
        for dev in &devices {
            device_sweight[dev.index] = dev.sweight;
        }
        let device_load = (0..nb_slots).map(|_| AtomicU32::new(0)).collect();

        info!(
            workers,
            devices = devices.len(),
            scheduler = ?config.scheduler,
            "engine initialized"
        );

        Arc::new(Engine {
            config,
            topology,
            policy,
            data: Mutex::new(DataTable::new(nb_slots)),
            devices,
            device_load,
            device_sweight,
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn num_workers(&self) -> usize {
        self.config.workers.max(1)
    }

    pub fn nb_accelerators(&self) -> usize {
        self.devices.len()
    }

    pub fn accelerator(&self, index: usize) -> Option<&Arc<Device>> {
        self.devices.get(index.checked_sub(ACCEL_BASE)?)
    }

    pub fn accelerators(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub(crate) fn data_table(&self) -> MutexGuard<'_, DataTable> {
        self.data.lock().unwrap()
    }

    /// Registers a datum with its initial host contents.
    pub fn register_data(&self, key: DataKey, bytes: Vec<u8>) {
        self.data_table().register(key, bytes);
    }

    /// Snapshot of a datum's host bytes.
    pub fn host_bytes(&self, key: DataKey) -> Option<Vec<u8>> {
        self.data_table().get(key).map(|d| d.host_bytes().to_vec())
    }

    /// Runs `f` with the data registry locked; used by tests to check
    /// coherence invariants.
    pub fn with_data<R>(&self, f: impl FnOnce(&DataTable) -> R) -> R {
        f(&self.data_table())
    }

    /// Mutable counterpart of [`with_data`]. Registry mutation outside
    /// the engine is only safe while no device driver is active.
    ///
    /// [`with_data`]: Engine::with_data
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut DataTable) -> R) -> R {
        f(&mut self.data_table())
    }

    /// Resolves dynamic kernel symbols for `handle` on every registered
    /// device; a device supporting none of the handle's functions loses
    /// its bit in the handle's device mask.
    pub fn register_handle(&self, handle: &TaskHandle) {
        for device in &self.devices {
            let mut supported = false;
            let mut state = device.state.lock().unwrap();
            for function in &handle.functions {
                for inc in &function.incarnations {
                    if inc.class != DeviceClass::Accelerator {
                        continue;
                    }
                    match inc.dyld {
                        Some(dyld) => {
                            match crate::device::dyld::resolve(
                                dyld,
                                device.capability,
                                &self.config.device.path,
                            ) {
                                Ok(kernel) => {
                                    state.kernels.insert(function.name, kernel);
                                    supported = true;
                                }
                                Err(e) => {
                                    debug!(
                                        device = device.index,
                                        function = function.name,
                                        error = %e,
                                        "kernel symbol unresolved"
                                    );
                                }
                            }
                        }
                        None => {
                            if inc.submit.is_some() {
                                supported = true;
                            }
                        }
                    }
                }
            }
            drop(state);
            if !supported {
                handle
                    .devices_mask
                    .fetch_and(!(1u64 << device.index), Ordering::SeqCst);
                debug!(device = device.index, "handle cannot run on device");
            }
        }
    }

    /// Inserts a ready task from `worker`.
    pub fn schedule(&self, worker: usize, mut task: Box<Task>, distance: i32) {
        task.status = TaskStatus::Queued;
        self.policy.schedule(worker, task, distance);
    }

    /// Picks the next task for `worker` together with its probe distance.
    pub fn select(&self, worker: usize) -> Option<(Box<Task>, i32)> {
        self.policy.select(worker)
    }

    /// Selects and dispatches one task for `worker`. Returns whether any
    /// work was done.
    pub fn progress(&self, worker: usize) -> bool {
        match self.policy.select(worker) {
            Some((task, _distance)) => {
                self.dispatch(worker, task);
                true
            }
            None => false,
        }
    }

    /// Drains visible work from `worker`'s point of view; returns the
    /// number of dispatches.
    pub fn progress_all(&self, worker: usize) -> usize {
        let mut dispatched = 0;
        while self.progress(worker) {
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch(&self, worker: usize, mut task: Box<Task>) {
        task.status = TaskStatus::Running;

        if task.class == DeviceClass::Accelerator
            && task.function.supports(DeviceClass::Accelerator)
        {
            let device_index = self.best_device(&task);
            if device_index >= ACCEL_BASE {
                match offload_task(self, worker, task, device_index) {
                    HookReturn::Done | HookReturn::Async | HookReturn::Disable => return,
                }
            }
        }

        match task
            .function
            .incarnation_for(DeviceClass::Cpu)
            .and_then(|inc| inc.hook.clone())
        {
            Some(hook) => {
                hook(&mut task);
                self.complete_task(task);
            }
            None => {
                self.fail_task(
                    task,
                    DeviceError::NotFound("no CPU incarnation to fall back to".into()),
                );
            }
        }
    }

    /// Dispatches `task` straight into the offload engine for a specific
    /// device, bypassing the selector.
    pub fn offload_to(
        &self,
        worker: usize,
        task: Box<Task>,
        device_index: usize,
    ) -> Result<(), EngineError> {
        let device = self
            .accelerator(device_index)
            .ok_or_else(|| EngineError::NotFound(format!("device {device_index}")))?;
        if !device.is_enabled() {
            return Err(EngineError::DeviceDisabled(device_index));
        }
        if !task.function.supports(DeviceClass::Accelerator) {
            return Err(EngineError::NotFound(format!(
                "{} has no device incarnation",
                task.function.name
            )));
        }
        self.load_add(
            device_index,
            task.ratio as f32 * self.device_sweight[device_index],
        );
        let _ = offload_task(self, worker, task, device_index);
        Ok(())
    }

    /// Picks the device for a task: sticky to the accelerator already
    /// owning a written datum, otherwise the least loaded device weighted
    /// by single-precision capability.
    pub fn best_device(&self, task: &Task) -> usize {
        // Stickiness: a WRITE flow whose datum lives on an accelerator
        // keeps the task there.
        {
            let table = self.data_table();
            for (i, flow) in task.function.flows.iter().enumerate() {
                if !flow.flags.is_write() {
                    continue;
                }
                let Some(input) = task.data[i].data_in else {
                    continue;
                };
                let Some(datum) = table.get(input.key) else {
                    continue;
                };
                let owner = datum.owner_device;
                if owner >= ACCEL_BASE
                    && task.devices_mask & (1 << owner) != 0
                    && self.accelerator(owner).is_some_and(|d| d.is_enabled())
                {
                    return owner;
                }
            }
        }

        let ratio = task.ratio as f32;
        let cpu_possible = task.function.supports(DeviceClass::Cpu);
        let mut best = CPU_DEVICE;
        let mut best_weight = if cpu_possible {
            self.load_of(CPU_DEVICE) + ratio * self.device_sweight[CPU_DEVICE]
        } else {
            f32::INFINITY
        };

        for device in &self.devices {
            if !device.is_enabled() || task.devices_mask & (1 << device.index) == 0 {
                continue;
            }
            let weight = self.load_of(device.index) + ratio * self.device_sweight[device.index];
            if weight < best_weight {
                best = device.index;
                best_weight = weight;
            }
        }

        if best >= ACCEL_BASE {
            self.load_add(best, ratio * self.device_sweight[best]);
        }
        best
    }

    pub fn device_load(&self, index: usize) -> f32 {
        self.load_of(index)
    }

    fn load_of(&self, index: usize) -> f32 {
        f32::from_bits(self.device_load[index].load(Ordering::SeqCst))
    }

    fn load_add(&self, index: usize, delta: f32) {
        let _ = self.device_load[index].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
            Some((f32::from_bits(bits) + delta).to_bits())
        });
    }

    fn load_sub(&self, index: usize, delta: f32) {
        let _ = self.device_load[index].fetch_update(Ordering::SeqCst, Ordering::SeqCst, |bits| {
            Some((f32::from_bits(bits) - delta).max(0.0).to_bits())
        });
    }

    pub(crate) fn complete_task(&self, mut task: Box<Task>) {
        task.status = TaskStatus::Complete;
        debug!(task = ?task, "task complete");
        if let Some(counter) = task.take_counter() {
            counter.task_done();
        }
        self.executed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn fail_task(&self, mut task: Box<Task>, err: DeviceError) {
        task.status = TaskStatus::Failed;
        error!(task = ?task, error = %err, "task failed");
        if let Some(counter) = task.take_counter() {
            counter.task_failed();
        }
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn complete_offloaded(&self, device: &Device, otask: OffloadTask) {
        let task = otask
            .into_kernel_task()
            .expect("write-back tasks never complete upward");
        self.load_sub(device.index, task.ratio as f32 * self.device_sweight[device.index]);
        device.executed_tasks.fetch_add(1, Ordering::SeqCst);
        self.complete_task(task);
    }

    pub(crate) fn fail_offloaded(&self, device: &Device, otask: OffloadTask, err: DeviceError) {
        if let Some(task) = otask.into_kernel_task() {
            self.load_sub(device.index, task.ratio as f32 * self.device_sweight[device.index]);
            self.fail_task(task, err);
        }
    }

    /// Returns a task that could not run on `device` to the scheduler,
    /// undoing the selection load it was charged.
    pub(crate) fn reschedule_offloaded(&self, device: &Device, worker: usize, task: Box<Task>) {
        self.load_sub(device.index, task.ratio as f32 * self.device_sweight[device.index]);
        self.schedule(worker, task, 0);
    }

    /// Spawns one worker thread per execution stream. Workers are pinned
    /// to cores when configured and synchronize on a barrier before the
    /// first select.
    pub fn start(self: &Arc<Self>) {
        let workers = self.num_workers();
        let barrier = Arc::new(Barrier::new(workers));
        let core_ids = if self.config.pin_workers {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut threads = self.threads.lock().unwrap();
        for id in 0..workers {
            let core_id = if core_ids.is_empty() {
                None
            } else {
                Some(core_ids[id % core_ids.len()])
            };
            threads.push(Worker::spawn(WorkerParams {
                id,
                engine: self.clone(),
                barrier: barrier.clone(),
                core_id,
            }));
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stops the worker threads and waits for them.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut threads = self.threads.lock().unwrap();
        for worker in threads.drain(..) {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    /// Synchronously writes every device-owned copy back to the host.
    pub fn flush_devices(&self) -> Result<(), EngineError> {
        for device in &self.devices {
            let mut state = device.state.lock().unwrap();
            let mut table = self.data_table();
            let keys: Vec<DataKey> = state.owned_lru.iter().collect();
            for key in keys {
                let Some(datum) = table.get_mut(key) else {
                    continue;
                };
                let Some(ptr) = datum.copy(device.index).and_then(|c| c.device_ptr) else {
                    continue;
                };
                state
                    .backend
                    .memcpy_d2h(StreamId(STAGE_OUT_STREAM), datum.host_bytes_mut(), ptr)
                    .map_err(|e| EngineError::OutOfResource(e.to_string()))?;
                let version = datum.copy(device.index).map_or(0, |c| c.version);
                if let Some(copy) = datum.copy_mut(device.index) {
                    copy.coherency = crate::data::Coherency::Shared;
                    copy.transfer = crate::data::TransferStatus::Complete;
                }
                if let Some(host) = datum.copy_mut(HOST_DEVICE) {
                    host.coherency = crate::data::Coherency::Shared;
                    host.version = version;
                }
                datum.owner_device = HOST_DEVICE;
                state.owned_lru.remove(key);
                state.free_lru.push_back(key);
            }
        }
        Ok(())
    }

    /// Tears the engine down: stops workers, flushes device-owned data,
    /// drains the scheduler queues and releases device arenas.
    pub fn fini(&self) {
        self.stop();
        if let Err(e) = self.flush_devices() {
            error!(error = %e, "flush at teardown failed");
        }
        let leftover = self.policy.remove();
        if leftover > 0 {
            warn!(tasks = leftover, "queued tasks dropped at teardown");
        }
        for device in &self.devices {
            let mut state = device.state.lock().unwrap();
            for key in state.owned_lru.iter() {
                warn!(
                    device = device.index,
                    key,
                    "device still owns the authoritative copy at teardown, discarding it"
                );
            }
            if let Err(e) = state.backend.release_arena() {
                error!(device = device.index, error = %e, "arena release failed");
            }
        }
    }

    pub fn executed_tasks(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn failed_tasks(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn queued_tasks(&self) -> usize {
        self.policy.queued_tasks()
    }

    /// Convenience wrapper: schedules a CPU closure as a task and returns
    /// its completion counter.
    pub fn run<F>(&self, worker: usize, work: F) -> Counter
    where
        F: Fn(&mut Task) + Send + Sync + 'static,
    {
        let counter = Counter::for_tasks(1);
        let function = Arc::new(TaskFunction::cpu_only("adhoc", vec![], work));
        let task = Task::new(function).with_counter(counter.clone());
        self.schedule(worker, task, 0);
        counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedulerKind;

    #[test]
    fn test_single_cpu_task_executes() {
        let engine = Engine::build(EngineConfig::new(2, SchedulerKind::Ap));
        let function = Arc::new(TaskFunction::cpu_only("noop", vec![], |_| {}));
        engine.schedule(0, Task::new(function).with_priority(5), 0);
        assert!(engine.progress(0));
        assert_eq!(engine.executed_tasks(), 1);
        assert_eq!(engine.queued_tasks(), 0);
    }

    #[test]
    fn test_run_decrements_counter() {
        let engine = Engine::build(EngineConfig::new(1, SchedulerKind::Pbq));
        let counter = engine.run(0, |_| {});
        assert!(!counter.is_complete());
        engine.progress_all(0);
        assert!(counter.is_complete());
    }

    #[test]
    fn test_worker_threads_drain_queue() {
        let engine = Engine::build(EngineConfig::new(2, SchedulerKind::Pbq));
        let counter = Counter::for_tasks(16);
        for _ in 0..16 {
            let function = Arc::new(TaskFunction::cpu_only("noop", vec![], |_| {}));
            let task = Task::new(function).with_counter(counter.clone());
            engine.schedule(0, task, 0);
        }
        engine.start();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while !counter.is_complete() && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        engine.stop();
        assert!(counter.is_complete());
        assert_eq!(engine.executed_tasks(), 16);
    }

    #[test]
    fn test_load_accounting_stays_non_negative() {
        let engine = Engine::build(EngineConfig::new(1, SchedulerKind::Ap));
        engine.load_sub(CPU_DEVICE, 5.0);
        assert!(engine.device_load(CPU_DEVICE) >= 0.0);
    }
}
