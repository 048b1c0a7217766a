//! Offload state machine.
//!
//! Every accelerator task traverses reserve -> stage-in -> execute ->
//! stage-out -> epilog. The phases are driven by an explicit state
//! machine polled by the device's driver worker: `progress_stream` moves
//! tasks through one stream's ring, `drive` chains the streams together
//! and completes tasks as they fall out of stage-out.
//!
//! Memory pressure is handled inside reserve: the free LRU is evicted
//! until the allocation fits, and when nothing evictable remains the task
//! backs out and is retried later. A backend API failure poisons the
//! whole device and reroutes its pending work to the CPU scheduler.

use crate::data::{Coherency, CopyRef, DataKey, DataTable, TransferStatus, HOST_DEVICE};
use crate::device::backend::{DeviceBackend, StreamId};
use crate::device::dyld::KernelFn;
use crate::device::memory::DevPtr;
use crate::device::stream::{STAGE_IN_STREAM, STAGE_OUT_STREAM};
use crate::device::{DevCtx, Device, DeviceState};
use crate::engine::Engine;
use crate::error::DeviceError;
use crate::task::{DeviceClass, Task};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

/// Most owned copies one synthesized write-back task bundles.
pub const W2R_BATCH: usize = 2;

/// Pending entries considered by the space-needed sort.
const NB_SORT: usize = 10;

/// Result of dispatching a task into the offload engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookReturn {
    /// The task completed synchronously.
    Done,
    /// The task progresses asynchronously under some driver.
    Async,
    /// The device failed and has been disabled.
    Disable,
}

/// What a task is doing on the device.
pub enum OffloadKind {
    /// A user task executing a kernel.
    Kernel(Box<Task>),
    /// A synthesized transfer staging owned copies back to the host.
    WriteBack(Vec<CopyRef>),
}

/// Wrapper a task travels in while it is on a device.
pub struct OffloadTask {
    pub kind: OffloadKind,
}

impl std::fmt::Debug for OffloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            OffloadKind::Kernel(task) => f
                .debug_struct("OffloadTask::Kernel")
                .field("id", &task.id)
                .finish(),
            OffloadKind::WriteBack(copies) => f
                .debug_struct("OffloadTask::WriteBack")
                .field("copies", copies)
                .finish(),
        }
    }
}

impl OffloadTask {
    pub fn kernel(task: Box<Task>) -> Self {
        OffloadTask {
            kind: OffloadKind::Kernel(task),
        }
    }

    pub fn writeback(copies: Vec<CopyRef>) -> Self {
        OffloadTask {
            kind: OffloadKind::WriteBack(copies),
        }
    }

    /// Write-back tasks jump every queue.
    pub fn priority(&self) -> i32 {
        match &self.kind {
            OffloadKind::Kernel(task) => task.priority,
            OffloadKind::WriteBack(_) => i32::MAX,
        }
    }

    pub fn is_writeback(&self) -> bool {
        matches!(self.kind, OffloadKind::WriteBack(_))
    }

    pub fn into_kernel_task(self) -> Option<Box<Task>> {
        match self.kind {
            OffloadKind::Kernel(task) => Some(task),
            OffloadKind::WriteBack(_) => None,
        }
    }
}

/// Context handed to a task's `submit` incarnation.
pub struct KernelLaunch<'a> {
    device_index: usize,
    stream: StreamId,
    backend: &'a mut dyn DeviceBackend,
    kernels: &'a HashMap<&'static str, crate::device::dyld::ResolvedKernel>,
    flows: Vec<Option<(DevPtr, usize)>>,
    task: &'a Task,
}

impl KernelLaunch<'_> {
    pub fn device_index(&self) -> usize {
        self.device_index
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn task(&self) -> &Task {
        self.task
    }

    /// Mutable device-side view of the buffer bound to `flow`.
    pub fn flow_slice(&mut self, flow: usize) -> Result<&mut [u8], DeviceError> {
        let (ptr, len) = self.flows.get(flow).copied().flatten().ok_or_else(|| {
            DeviceError::NotFound(format!("flow {flow} has no device buffer"))
        })?;
        self.backend.arena_slice(ptr, len)
    }

    /// A dynamically resolved kernel symbol for this device, if the
    /// handle registration found one.
    pub fn kernel(&self, name: &str) -> Option<KernelFn> {
        self.kernels.get(name).map(|k| k.get())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    StageIn,
    Submit,
    StageOut,
}

/// Reserves device space for every non-CTL flow of `task`, evicting from
/// the free LRU under pressure. On failure every copy reserved by this
/// call goes back to the head of the LRU and the task backs out with
/// [`DeviceError::NeedRetry`].
fn reserve_device_space(
    device: &Device,
    ctx: &mut DevCtx<'_>,
    table: &mut DataTable,
    task: &mut Task,
) -> Result<(), DeviceError> {
    let dev = device.index;
    let nb_flows = task.function.nb_flows();
    let mut reserved: Vec<DataKey> = Vec::new();

    for i in 0..nb_flows {
        let flow = &task.function.flows[i];
        if flow.flags.is_ctl() {
            continue;
        }
        let Some(input) = task.data[i].data_in else {
            return Err(DeviceError::NotFound(format!(
                "flow {i} of {} is unbound",
                task.function.name
            )));
        };
        let key = input.key;

        if table.get_copy(key, dev).is_some() {
            task.data[i].data_out = Some(CopyRef::new(key, dev));
            continue;
        }
        let Some(nb_bytes) = table.get(key).map(|d| d.nb_bytes) else {
            return Err(DeviceError::NotFound(format!(
                "datum {key:#x} is not registered"
            )));
        };

        let ptr = loop {
            if let Some(ptr) = ctx.pool.alloc(nb_bytes) {
                break ptr;
            }
            if !evict_one(dev, ctx, table, task) {
                warn!(
                    device = dev,
                    missing = nb_flows - i,
                    requested = nb_flows,
                    "request for device space failed, backing out"
                );
                for key in reserved.drain(..).rev() {
                    ctx.free_lru.push_front(key);
                }
                return Err(DeviceError::NeedRetry);
            }
        };

        table.attach(key, crate::data::DataCopy::device(dev, ptr), dev);
        task.data[i].data_out = Some(CopyRef::new(key, dev));
        reserved.push(key);
    }

    for key in reserved {
        ctx.free_lru.push_back(key);
    }
    Ok(())
}

/// Pops eviction candidates off the free LRU until one can be freed.
/// Candidates with readers are left loose (stage-out re-lists them);
/// inputs of the requesting task are put back where they were.
fn evict_one(dev: usize, ctx: &mut DevCtx<'_>, table: &mut DataTable, task: &Task) -> bool {
    let mut kept: Vec<DataKey> = Vec::new();
    let mut freed = false;

    while let Some(candidate) = ctx.free_lru.pop_front() {
        let Some(copy) = table.get_copy(candidate, dev) else {
            continue; // stale entry, the copy is already gone
        };
        if copy.readers != 0 {
            continue;
        }
        if task
            .data
            .iter()
            .any(|b| b.data_in.map(|r| r.key) == Some(candidate))
        {
            kept.push(candidate);
            continue;
        }

        let copy = table.detach(candidate, dev).expect("candidate vanished");
        if let Some(ptr) = copy.device_ptr {
            ctx.pool.free(ptr);
        }
        debug!(device = dev, key = candidate, "evicted device copy");
        freed = true;
        break;
    }

    for key in kept.into_iter().rev() {
        ctx.free_lru.push_front(key);
    }
    freed
}

/// Schedules the host-to-device transfers `task` needs, marking each
/// touched copy with its pusher.
fn stage_in(
    device: &Device,
    ctx: &mut DevCtx<'_>,
    table: &mut DataTable,
    task: &mut Task,
    stream: StreamId,
) -> Result<(), DeviceError> {
    let dev = device.index;

    for i in 0..task.function.nb_flows() {
        let flags = task.function.flows[i].flags;
        if flags.is_ctl() {
            continue;
        }
        let out = task.data[i].data_out.expect("flow was not reserved");
        let key = out.key;

        if flags.is_write() {
            let readers = table.get_copy(key, dev).map_or(0, |c| c.readers);
            if readers > 0 {
                error!(
                    device = dev,
                    key,
                    readers,
                    task = ?task,
                    "write access to data with existing readers, prevent this with CTL dependencies"
                );
                return Err(DeviceError::AntiDependency { key, readers });
            }
            // pinned until the task completes
            ctx.free_lru.remove(key);
            ctx.owned_lru.remove(key);
        }

        let nb_bytes = table.get(key).map(|d| d.nb_bytes).unwrap_or(0);
        device
            .required_in
            .fetch_add(nb_bytes as u64, Ordering::Relaxed);

        let src = table.transfer_ownership_to(key, dev, flags);
        if src == -1 {
            continue;
        }
        if src != HOST_DEVICE as i32 {
            // Transfers are staged through the host; a device-resident
            // authoritative copy is written back before successors read it.
            warn!(device = dev, key, src, "staging from a non-host copy through the host");
        }

        let datum = table.get_mut(key).expect("datum vanished");
        let host_version = datum.copy(HOST_DEVICE).map_or(0, |c| c.version);
        let ptr = datum
            .copy(dev)
            .and_then(|c| c.device_ptr)
            .expect("reserved copy has no device pointer");
        debug!(
            device = dev,
            key, nb_bytes, "staging data host to device"
        );
        ctx.backend.memcpy_h2d(stream, ptr, datum.host_bytes())?;
        device
            .transferred_in
            .fetch_add(nb_bytes as u64, Ordering::Relaxed);

        let copy = datum.copy_mut(dev).expect("reserved copy vanished");
        copy.version = host_version;
        copy.transfer = TransferStatus::UnderTransfer;
        copy.push_task = Some(task.id);
    }
    Ok(())
}

/// Invokes the task's device incarnation on an execute stream.
fn submit_kernel(
    device: &Device,
    ctx: &mut DevCtx<'_>,
    table: &mut DataTable,
    task: &mut Task,
    stream_index: usize,
) -> Result<(), DeviceError> {
    let dev = device.index;

    let mut flows: Vec<Option<(DevPtr, usize)>> = Vec::with_capacity(task.function.nb_flows());
    for i in 0..task.function.nb_flows() {
        let flags = task.function.flows[i].flags;
        if flags.is_ctl() {
            flows.push(None);
            continue;
        }
        let out = task.data[i].data_out.expect("flow was not reserved");
        let copy = table
            .get_copy(out.key, dev)
            .expect("staged copy vanished before execute");
        debug_assert_eq!(
            copy.transfer,
            TransferStatus::Complete,
            "executing before stage-in completed"
        );
        flows.push(copy.device_ptr.map(|p| {
            (p, table.get(out.key).map(|d| d.nb_bytes).unwrap_or(0))
        }));
    }

    let Some(submit) = task
        .function
        .incarnation_for(DeviceClass::Accelerator)
        .and_then(|inc| inc.submit.clone())
    else {
        return Err(DeviceError::NotFound(format!(
            "{} has no device incarnation",
            task.function.name
        )));
    };

    let mut launch = KernelLaunch {
        device_index: dev,
        stream: StreamId(stream_index),
        backend: &mut *ctx.backend,
        kernels: ctx.kernels,
        flows,
        task,
    };
    debug!(device = dev, task = ?launch.task, stream = stream_index, "submitting kernel");
    submit(&mut launch)
}

/// Stages written data out and releases read pins.
fn stage_out(
    device: &Device,
    ctx: &mut DevCtx<'_>,
    table: &mut DataTable,
    otask: &mut OffloadTask,
    stream: StreamId,
) -> Result<(), DeviceError> {
    let dev = device.index;

    match &mut otask.kind {
        OffloadKind::WriteBack(copies) => {
            for cr in copies.iter() {
                let datum = table.get_mut(cr.key).expect("write-back datum vanished");
                let nb_bytes = datum.nb_bytes;
                let ptr = datum
                    .copy(dev)
                    .and_then(|c| c.device_ptr)
                    .expect("write-back copy has no device pointer");
                debug!(device = dev, key = cr.key, "write-back device to host");
                ctx.backend.memcpy_d2h(stream, datum.host_bytes_mut(), ptr)?;
                device
                    .required_out
                    .fetch_add(nb_bytes as u64, Ordering::Relaxed);
                device
                    .transferred_out
                    .fetch_add(nb_bytes as u64, Ordering::Relaxed);
            }
            Ok(())
        }
        OffloadKind::Kernel(task) => {
            for i in 0..task.function.nb_flows() {
                let flags = task.function.flows[i].flags;
                if flags.is_ctl() {
                    continue;
                }
                let Some(out) = task.data[i].data_out else {
                    continue;
                };
                if out.device != dev {
                    continue;
                }
                let key = out.key;

                if flags.is_read() {
                    let copy = table
                        .get_copy_mut(key, dev)
                        .expect("read copy vanished before stage-out");
                    copy.readers -= 1;
                    debug_assert!(copy.readers >= 0);
                    let now_free = copy.readers == 0;
                    if !flags.is_write() {
                        if now_free {
                            // most recently used end of the free LRU
                            ctx.free_lru.remove(key);
                            ctx.free_lru.push_back(key);
                        }
                        task.data[i].data_out = Some(CopyRef::new(key, HOST_DEVICE));
                        continue;
                    }
                }

                if flags.is_write() {
                    let datum = table.get_mut(key).expect("written datum vanished");
                    let nb_bytes = datum.nb_bytes;
                    device
                        .required_out
                        .fetch_add(nb_bytes as u64, Ordering::Relaxed);
                    if task.pushout(i) {
                        let ptr = datum
                            .copy(dev)
                            .and_then(|c| c.device_ptr)
                            .expect("written copy has no device pointer");
                        debug!(device = dev, key, "staging data device to host");
                        ctx.backend.memcpy_d2h(stream, datum.host_bytes_mut(), ptr)?;
                        device
                            .transferred_out
                            .fetch_add(nb_bytes as u64, Ordering::Relaxed);
                    }
                }
            }
            Ok(())
        }
    }
}

/// Publishes the results of a completed task: written copies move from
/// owned to shared (or stay owned awaiting write-back), versions are
/// advanced and mirrored, and `data_out` is swapped to the host copy so
/// successors see the host copy by default.
///
/// Applying the epilog twice is a no-op: the second pass finds every
/// `data_out` already pointing at the host.
pub(crate) fn epilog(device: &Device, state: &mut DeviceState, table: &mut DataTable, task: &mut Task) {
    let dev = device.index;

    for i in 0..task.function.nb_flows() {
        let flags = task.function.flows[i].flags;
        if flags.is_ctl() || !flags.is_write() {
            continue;
        }
        let Some(out) = task.data[i].data_out else {
            continue;
        };
        if out.device != dev {
            continue;
        }
        let key = out.key;
        let datum = table.get_mut(key).expect("written datum vanished");

        let version;
        {
            let copy = datum.copy_mut(dev).expect("written copy vanished");
            debug_assert_eq!(copy.coherency, Coherency::Owned);
            copy.version += 1;
            copy.transfer = TransferStatus::Complete;
            copy.push_task = None;
            version = copy.version;
        }

        if task.pushout(i) {
            datum.copy_mut(dev).unwrap().coherency = Coherency::Shared;
            let host = datum.copy_mut(HOST_DEVICE).expect("host copy missing");
            host.coherency = Coherency::Shared;
            host.version = version;
            datum.owner_device = HOST_DEVICE;
            state.free_lru.push_back(key);
        } else {
            // still authoritative on the device; written back lazily
            state.owned_lru.push_back(key);
        }
        task.data[i].data_out = Some(CopyRef::new(key, HOST_DEVICE));
    }
}

/// Bundles up to [`W2R_BATCH`] oldest owned copies into a transfer-only
/// task that stages them back to the host.
pub(crate) fn create_writeback_task(
    device: &Device,
    state: &mut DeviceState,
    table: &mut DataTable,
) -> Option<OffloadTask> {
    let dev = device.index;
    let mut bundled: Vec<CopyRef> = Vec::new();

    let candidates: Vec<DataKey> = state.owned_lru.iter().collect();
    for key in candidates {
        if bundled.len() >= W2R_BATCH {
            break;
        }
        let Some(datum) = table.get(key) else {
            continue;
        };
        let Some(copy) = datum.copy(dev) else {
            continue;
        };
        if copy.readers != 0 || datum.copy(HOST_DEVICE).map_or(0, |c| c.readers) != 0 {
            continue;
        }
        state.owned_lru.remove(key);
        table.get_copy_mut(key, dev).unwrap().readers += 1;
        bundled.push(CopyRef::new(key, dev));
    }

    if bundled.is_empty() {
        None
    } else {
        debug!(device = dev, copies = bundled.len(), "synthesized write-back task");
        Some(OffloadTask::writeback(bundled))
    }
}

/// Completes a write-back: the staged copies become shared, the host
/// mirrors their versions, and the copies rejoin the free LRU.
pub(crate) fn writeback_fini(
    device: &Device,
    state: &mut DeviceState,
    table: &mut DataTable,
    copies: &[CopyRef],
) {
    let dev = device.index;
    for cr in copies {
        let datum = table.get_mut(cr.key).expect("write-back datum vanished");
        let version;
        {
            let copy = datum.copy_mut(dev).expect("write-back copy vanished");
            copy.coherency = Coherency::Shared;
            copy.transfer = TransferStatus::Complete;
            copy.readers -= 1;
            debug_assert!(copy.readers >= 0);
            version = copy.version;
        }
        let host = datum.copy_mut(HOST_DEVICE).expect("host copy missing");
        host.coherency = Coherency::Shared;
        host.version = version;
        datum.owner_device = HOST_DEVICE;
        state.free_lru.push_back(cr.key);
    }
}

/// Device segments a task still needs: non-CTL read flows with no copy
/// on the device yet.
fn space_needed(table: &DataTable, task: &Task, dev: usize) -> usize {
    let mut needed = 0;
    for i in 0..task.function.nb_flows() {
        let flags = task.function.flows[i].flags;
        if flags.is_ctl() || !flags.is_read() {
            continue;
        }
        let Some(input) = task.data[i].data_in else {
            continue;
        };
        if table.get_copy(input.key, dev).is_none() {
            needed += 1;
        }
    }
    needed
}

/// Sorts the head of the stage-in pending FIFO so the tasks needing the
/// least device space go first. Runs only when the pipeline stalled, and
/// only under the driver role, so no locking is involved.
pub(crate) fn sort_pending(state: &mut DeviceState, table: &DataTable, dev: usize) {
    let pending = &mut state.streams[STAGE_IN_STREAM].pending;
    let n = pending.len().min(NB_SORT);
    if n < 2 {
        return;
    }
    let mut head: Vec<OffloadTask> = pending.drain(..n).collect();
    head.sort_by_key(|t| match &t.kind {
        OffloadKind::Kernel(task) => space_needed(table, task, dev),
        OffloadKind::WriteBack(_) => 0,
    });
    for t in head.into_iter().rev() {
        pending.push_front(t);
    }
}

/// Runs one phase of a task. `Err(NeedRetry)` re-queues the task,
/// `Err` of a device-fatal kind poisons the device, any other `Err`
/// fails only the task.
fn run_phase(
    device: &Device,
    ctx: &mut DevCtx<'_>,
    table: &mut DataTable,
    phase: Phase,
    otask: &mut OffloadTask,
    stream_index: usize,
) -> Result<(), DeviceError> {
    match phase {
        Phase::StageIn => match &mut otask.kind {
            OffloadKind::Kernel(task) => {
                reserve_device_space(device, ctx, table, task)?;
                stage_in(device, ctx, table, task, StreamId(stream_index))
            }
            OffloadKind::WriteBack(_) => Ok(()),
        },
        Phase::Submit => match &mut otask.kind {
            OffloadKind::Kernel(task) => submit_kernel(device, ctx, table, task, stream_index),
            OffloadKind::WriteBack(_) => Ok(()),
        },
        Phase::StageOut => stage_out(device, ctx, table, otask, StreamId(stream_index)),
    }
}

/// Checks whether every transfer a completed stage-in task depends on is
/// published. Only the pusher of a transfer may publish it; a task that
/// piggybacked on another task's transfer waits until the pusher's event
/// retires.
fn stage_in_transfers_ready(otask: &OffloadTask, table: &mut DataTable, dev: usize) -> bool {
    let OffloadKind::Kernel(task) = &otask.kind else {
        return true;
    };
    for i in 0..task.function.nb_flows() {
        let flags = task.function.flows[i].flags;
        if flags.is_ctl() {
            continue;
        }
        let Some(out) = task.data[i].data_out else {
            continue;
        };
        let Some(copy) = table.get_copy_mut(out.key, dev) else {
            continue;
        };
        if copy.push_task == Some(task.id) {
            copy.transfer = TransferStatus::Complete;
            continue;
        }
        if copy.transfer != TransferStatus::Complete {
            return false;
        }
    }
    true
}

pub(crate) struct StreamProgress {
    pub completed: Option<OffloadTask>,
    pub failed: Option<(OffloadTask, DeviceError)>,
}

/// Progresses one stream: feed `input` into the pending FIFO, submit
/// pending tasks while the event ring has room, then poll the oldest
/// event and retire the task behind it. Mirrors the documented
/// three-step loop; after a completion the ring is refilled once more.
pub(crate) fn progress_stream(
    device: &Device,
    state: &mut DeviceState,
    table: &mut DataTable,
    stream_index: usize,
    phase: Phase,
    input: Option<OffloadTask>,
) -> Result<StreamProgress, DeviceError> {
    let (stream, mut ctx) = state.split_stream(stream_index);
    let mut progress = StreamProgress {
        completed: None,
        failed: None,
    };

    if let Some(task) = input {
        stream.push_pending(task);
    }

    loop {
        while progress.failed.is_none() && stream.has_room() {
            let Some(mut task) = stream.pop_pending() else {
                break;
            };
            match run_phase(device, &mut ctx, table, phase, &mut task, stream_index) {
                Ok(()) => {
                    let event = match ctx.backend.event_record(StreamId(stream_index)) {
                        Ok(event) => event,
                        Err(e) => {
                            stream.push_back_pending(task);
                            return Err(e);
                        }
                    };
                    stream.record(event, task);
                }
                Err(DeviceError::NeedRetry) => {
                    debug!(
                        device = device.index,
                        stream = stream_index,
                        "no room on the device, task re-queued"
                    );
                    stream.push_back_pending(task);
                    break;
                }
                Err(e) if e.is_fatal_for_device() => {
                    // leave the task where the disable path can drain it
                    stream.push_back_pending(task);
                    return Err(e);
                }
                Err(e) => {
                    progress.failed = Some((task, e));
                }
            }
        }

        if progress.completed.is_some() || progress.failed.is_some() {
            break;
        }
        let Some(event) = stream.oldest_event() else {
            break;
        };
        if !ctx.backend.event_query(event)? {
            break;
        }
        if stream_index == STAGE_IN_STREAM {
            let ready = stream_in_ready(stream.oldest_task(), table, device.index);
            if !ready {
                break;
            }
        }
        progress.completed = stream.retire();
        // loop once more to refill the freed slot
    }

    Ok(progress)
}

fn stream_in_ready(task: Option<&OffloadTask>, table: &mut DataTable, dev: usize) -> bool {
    match task {
        Some(t) => stage_in_transfers_ready(t, table, dev),
        None => true,
    }
}

struct PassResult {
    completed: Option<OffloadTask>,
    failed: Vec<(OffloadTask, DeviceError)>,
    stalled: bool,
}

/// One full pass over the device pipeline: stage-in, execute, write-back
/// synthesis when idle, stage-out, epilog.
fn pipeline_pass(
    device: &Device,
    state: &mut DeviceState,
    table: &mut DataTable,
    input: Option<OffloadTask>,
) -> Result<PassResult, DeviceError> {
    let mut failed = Vec::new();

    let p0 = progress_stream(device, state, table, STAGE_IN_STREAM, Phase::StageIn, input)?;
    if let Some(f) = p0.failed {
        failed.push(f);
    }
    let staged = p0.completed;
    let had_push = staged.is_some();

    let exec_index = state.next_exec_stream();
    let p1 = progress_stream(device, state, table, exec_index, Phase::Submit, staged)?;
    if let Some(f) = p1.failed {
        failed.push(f);
    }
    let mut to_pop = p1.completed;
    let had_submit = to_pop.is_some();

    if !had_push && !had_submit {
        to_pop = create_writeback_task(device, state, table);
    }

    let p2 = progress_stream(
        device,
        state,
        table,
        STAGE_OUT_STREAM,
        Phase::StageOut,
        to_pop,
    )?;
    if let Some(f) = p2.failed {
        failed.push(f);
    }
    let had_pop = p2.completed.is_some();

    let mut completed = None;
    if let Some(mut done) = p2.completed {
        match &mut done.kind {
            OffloadKind::WriteBack(copies) => {
                let copies = std::mem::take(copies);
                writeback_fini(device, state, table, &copies);
            }
            OffloadKind::Kernel(task) => {
                epilog(device, state, table, task);
                completed = Some(done);
            }
        }
    }

    Ok(PassResult {
        completed,
        failed,
        stalled: !had_submit && !had_pop,
    })
}

/// Entry point of the offload engine for one task.
///
/// The caller's worker elects itself driver of the device through a CAS;
/// losers enqueue their task on the pending FIFO and return [`Async`]
/// immediately. The winner drives the pipeline until the device drains,
/// re-checking the pending FIFO after releasing the role so a task
/// pushed during the handover is never lost.
///
/// [`Async`]: HookReturn::Async
pub(crate) fn offload_task(
    engine: &Engine,
    worker: usize,
    task: Box<Task>,
    device_index: usize,
) -> HookReturn {
    let device = engine.accelerator(device_index).expect("unknown device");
    device.pending.push(OffloadTask::kernel(task));
    if !device.try_become_driver() {
        return HookReturn::Async;
    }
    drive(engine, worker, device)
}

/// Placement retries before a task bounced by pool exhaustion fails.
const DEVICE_RETRY_LIMIT: u32 = 3;

fn drive(engine: &Engine, worker: usize, device: &Device) -> HookReturn {
    let mut stalled = false;

    loop {
        let in_hand = device.pending.pop();

        let pass = {
            let mut state = device.state.lock().unwrap();
            let mut table = engine.data_table();
            if stalled && in_hand.is_none() {
                sort_pending(&mut state, &table, device.index);
            }
            match pipeline_pass(device, &mut state, &mut table, in_hand) {
                Ok(pass) => {
                    let wedged =
                        pass.stalled && pass.completed.is_none() && state.nothing_in_flight();
                    stalled = pass.stalled;
                    Ok((pass, state.is_idle(), wedged))
                }
                Err(e) => Err(e),
            }
        };

        match pass {
            Err(e) => return disable_device(engine, worker, device, e),
            Ok((pass, idle, wedged)) => {
                for (t, e) in pass.failed {
                    engine.fail_offloaded(device, t, e);
                }
                if let Some(done) = pass.completed {
                    engine.complete_offloaded(device, done);
                    continue;
                }
                if wedged {
                    // Nothing is in flight, so no future completion can
                    // free memory for the backed-out tasks. Hand them
                    // back to the CPU scheduler instead of spinning.
                    reinject_backed_out(engine, worker, device);
                }
                if idle && device.pending.is_empty() {
                    device.release_driver();
                    // a producer may have pushed between the last pop and
                    // the release; re-elect rather than lose its task
                    if !device.pending.is_empty() && device.try_become_driver() {
                        continue;
                    }
                    return HookReturn::Async;
                }
            }
        }
    }
}

/// Reroutes tasks stuck in the stream pending FIFOs of a wedged device
/// back to the scheduler, failing tasks that exhausted their retries.
fn reinject_backed_out(engine: &Engine, worker: usize, device: &Device) {
    let mut drained: Vec<OffloadTask> = Vec::new();
    {
        let mut state = device.state.lock().unwrap();
        for stream in &mut state.streams {
            drained.extend(stream.drain_pending());
        }
    }
    for otask in drained {
        match otask.kind {
            OffloadKind::Kernel(mut task) => {
                task.retries += 1;
                if task.retries > DEVICE_RETRY_LIMIT {
                    let retries = task.retries;
                    engine.fail_offloaded(
                        device,
                        OffloadTask::kernel(task),
                        DeviceError::MemoryExhausted(retries),
                    );
                } else {
                    debug!(
                        device = device.index,
                        retries = task.retries,
                        task = ?task,
                        "rescheduling task after pool exhaustion"
                    );
                    engine.reschedule_offloaded(device, worker, task);
                }
            }
            OffloadKind::WriteBack(copies) => {
                let mut table = engine.data_table();
                for cr in copies {
                    if let Some(copy) = table.get_copy_mut(cr.key, device.index) {
                        copy.readers -= 1;
                    }
                }
            }
        }
    }
}

/// Poisons a device after a backend API failure: pending work is
/// rerouted to the CPU scheduler and the device leaves selector
/// consideration.
fn disable_device(
    engine: &Engine,
    worker: usize,
    device: &Device,
    err: DeviceError,
) -> HookReturn {
    error!(device = device.index, error = %err, "fatal device error, disabling device");
    device.enabled.store(false, Ordering::SeqCst);

    let mut drained: Vec<OffloadTask> = Vec::new();
    {
        let mut state = device.state.lock().unwrap();
        for stream in &mut state.streams {
            drained.extend(stream.drain_pending());
            drained.extend(stream.drain_ring());
        }
    }
    while let Some(t) = device.pending.pop() {
        drained.push(t);
    }

    let mut table = engine.data_table();
    let mut reinject = Vec::new();
    for otask in drained {
        match otask.kind {
            OffloadKind::Kernel(mut task) => {
                task.devices_mask &= !(1u64 << device.index);
                reinject.push(task);
            }
            OffloadKind::WriteBack(copies) => {
                for cr in copies {
                    if let Some(copy) = table.get_copy_mut(cr.key, device.index) {
                        copy.readers -= 1;
                    }
                }
            }
        }
    }
    drop(table);

    let rerouted = reinject.len();
    for task in reinject {
        engine.reschedule_offloaded(device, worker, task);
    }
    if rerouted > 0 {
        warn!(
            device = device.index,
            tasks = rerouted,
            "rerouted pending device tasks to the CPU scheduler"
        );
    }

    device.release_driver();
    HookReturn::Disable
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::data::DataCopy;
    use crate::device::backend::SimBackend;
    use crate::task::{Flow, FlowFlags, TaskFunction};
    use std::sync::Arc;

    fn test_device() -> Device {
        let cfg = DeviceConfig {
            memory_number_of_blocks: 4,
            memory_block_size: 64,
            ..DeviceConfig::default()
        };
        Device::new(2, Box::new(SimBackend::new("sim0", 4096)), &cfg).unwrap()
    }

    fn write_task(key: DataKey) -> Box<Task> {
        let f = Arc::new(TaskFunction::new(
            "writer",
            vec![Flow::new(0, FlowFlags::WRITE, "out")],
            vec![crate::task::Incarnation::accelerator(|_| Ok(()))],
        ));
        Task::new(f).bind(0, key)
    }

    #[test]
    fn test_epilog_is_idempotent() {
        let device = test_device();
        let mut state = device.state.lock().unwrap();
        let mut table = DataTable::new(3);
        table.register(7, vec![0u8; 64]);

        let ptr = state.pool.alloc(64).unwrap();
        table.attach(7, DataCopy::device(2, ptr), 2);
        table.transfer_ownership_to(7, 2, FlowFlags::WRITE);

        let mut task = write_task(7);
        task.data[0].data_out = Some(CopyRef::new(7, 2));

        epilog(&device, &mut state, &mut table, &mut task);
        let version = table.get_copy(7, 2).unwrap().version;
        let host_version = table.get_copy(7, HOST_DEVICE).unwrap().version;
        let lru_len = state.free_lru.len();
        assert_eq!(version, 1);
        assert_eq!(host_version, 1);
        assert_eq!(task.data[0].data_out, Some(CopyRef::new(7, HOST_DEVICE)));

        // a second application finds no device-bound flow and changes nothing
        epilog(&device, &mut state, &mut table, &mut task);
        assert_eq!(table.get_copy(7, 2).unwrap().version, version);
        assert_eq!(table.get_copy(7, HOST_DEVICE).unwrap().version, host_version);
        assert_eq!(state.free_lru.len(), lru_len);
    }

    #[test]
    fn test_writeback_bundles_oldest_owned_copies() {
        let device = test_device();
        let mut state = device.state.lock().unwrap();
        let mut table = DataTable::new(3);

        for key in [1u64, 2, 3] {
            table.register(key, vec![0u8; 64]);
            let ptr = state.pool.alloc(64).unwrap();
            table.attach(key, DataCopy::device(2, ptr), 2);
            table.transfer_ownership_to(key, 2, FlowFlags::WRITE);
            state.owned_lru.push_back(key);
        }

        let w2r = create_writeback_task(&device, &mut state, &mut table).unwrap();
        let OffloadKind::WriteBack(copies) = &w2r.kind else {
            panic!("expected a write-back task");
        };
        assert_eq!(copies.len(), W2R_BATCH);
        assert_eq!(copies[0].key, 1);
        assert_eq!(copies[1].key, 2);
        // bundled copies are pinned and off the owned LRU
        assert_eq!(state.owned_lru.len(), 1);
        assert_eq!(table.get_copy(1, 2).unwrap().readers, 1);

        let OffloadKind::WriteBack(copies) = w2r.kind else {
            unreachable!()
        };
        writeback_fini(&device, &mut state, &mut table, &copies);
        assert_eq!(table.get_copy(1, 2).unwrap().readers, 0);
        assert_eq!(table.get_copy(1, 2).unwrap().coherency, Coherency::Shared);
        assert_eq!(state.free_lru.len(), 2);
    }

    #[test]
    fn test_writeback_skips_pinned_copies() {
        let device = test_device();
        let mut state = device.state.lock().unwrap();
        let mut table = DataTable::new(3);

        table.register(9, vec![0u8; 64]);
        let ptr = state.pool.alloc(64).unwrap();
        table.attach(9, DataCopy::device(2, ptr), 2);
        table.transfer_ownership_to(9, 2, FlowFlags::WRITE);
        table.get_copy_mut(9, 2).unwrap().readers = 1;
        state.owned_lru.push_back(9);

        assert!(create_writeback_task(&device, &mut state, &mut table).is_none());
        assert!(state.owned_lru.contains(9));
    }

    #[test]
    fn test_offload_priority_writeback_first() {
        let w2r = OffloadTask::writeback(vec![CopyRef::new(1, 2)]);
        let kernel = OffloadTask::kernel(write_task(1).with_priority(100));
        assert!(w2r.priority() > kernel.priority());
    }
}
