//! Task descriptors and static task-function specifications.
//!
//! A [`TaskFunction`] is the static description of a task type: its
//! dependency slots (flows) and its per-device-class implementations
//! (incarnations). A [`Task`] is one runnable instance, carrying the
//! per-flow data bindings, a priority and a completion counter.

use crate::counter::Counter;
use crate::data::{CopyRef, DataKey, HOST_DEVICE};
use crate::device::offload::KernelLaunch;
use crate::error::DeviceError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Access flags of a flow. An empty set of flags marks a pure control
/// dependency (CTL) that moves no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowFlags(u8);

impl FlowFlags {
    pub const CTL: FlowFlags = FlowFlags(0);
    pub const READ: FlowFlags = FlowFlags(0x1);
    pub const WRITE: FlowFlags = FlowFlags(0x2);
    pub const READ_WRITE: FlowFlags = FlowFlags(0x3);

    pub fn is_ctl(self) -> bool {
        self.0 == 0
    }

    pub fn is_read(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub fn is_write(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl std::ops::BitOr for FlowFlags {
    type Output = FlowFlags;
    fn bitor(self, rhs: FlowFlags) -> FlowFlags {
        FlowFlags(self.0 | rhs.0)
    }
}

/// Static description of one dependency slot on a task function.
#[derive(Debug, Clone)]
pub struct Flow {
    pub index: usize,
    pub flags: FlowFlags,
    pub name: &'static str,
}

impl Flow {
    pub fn new(index: usize, flags: FlowFlags, name: &'static str) -> Self {
        Flow { index, flags, name }
    }
}

/// Device class an incarnation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Cpu,
    Accelerator,
}

/// CPU entry point of a task function.
pub type CpuHook = Arc<dyn Fn(&mut Task) + Send + Sync>;

/// Device entry point: enqueues kernels for the task on the stream held
/// by the launch context.
pub type SubmitFn = Arc<dyn Fn(&mut KernelLaunch<'_>) -> Result<(), DeviceError> + Send + Sync>;

/// One implementation of a task function, specialized for a device class.
#[derive(Clone)]
pub struct Incarnation {
    pub class: DeviceClass,
    /// CPU entry, present when `class == Cpu`.
    pub hook: Option<CpuHook>,
    /// Device entry, present when `class == Accelerator`.
    pub submit: Option<SubmitFn>,
    /// Shared-object symbol name resolved at device registration time.
    pub dyld: Option<&'static str>,
}

impl Incarnation {
    pub fn cpu<F>(hook: F) -> Self
    where
        F: Fn(&mut Task) + Send + Sync + 'static,
    {
        Incarnation {
            class: DeviceClass::Cpu,
            hook: Some(Arc::new(hook)),
            submit: None,
            dyld: None,
        }
    }

    pub fn accelerator<F>(submit: F) -> Self
    where
        F: Fn(&mut KernelLaunch<'_>) -> Result<(), DeviceError> + Send + Sync + 'static,
    {
        Incarnation {
            class: DeviceClass::Accelerator,
            hook: None,
            submit: Some(Arc::new(submit)),
            dyld: None,
        }
    }

    /// Attaches a dynamic-library symbol name to this incarnation.
    pub fn with_dyld(mut self, name: &'static str) -> Self {
        self.dyld = Some(name);
        self
    }
}

impl fmt::Debug for Incarnation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incarnation")
            .field("class", &self.class)
            .field("dyld", &self.dyld)
            .finish()
    }
}

/// Static specification of a task type.
pub struct TaskFunction {
    pub name: &'static str,
    pub flows: Vec<Flow>,
    pub incarnations: Vec<Incarnation>,
}

impl TaskFunction {
    pub fn new(name: &'static str, flows: Vec<Flow>, incarnations: Vec<Incarnation>) -> Self {
        debug_assert!(flows.iter().enumerate().all(|(i, f)| f.index == i));
        TaskFunction {
            name,
            flows,
            incarnations,
        }
    }

    /// Convenience constructor for a CPU-only task function.
    pub fn cpu_only<F>(name: &'static str, flows: Vec<Flow>, hook: F) -> Self
    where
        F: Fn(&mut Task) + Send + Sync + 'static,
    {
        TaskFunction::new(name, flows, vec![Incarnation::cpu(hook)])
    }

    pub fn nb_flows(&self) -> usize {
        self.flows.len()
    }

    /// First incarnation matching the given device class.
    pub fn incarnation_for(&self, class: DeviceClass) -> Option<&Incarnation> {
        self.incarnations.iter().find(|inc| inc.class == class)
    }

    pub fn supports(&self, class: DeviceClass) -> bool {
        self.incarnation_for(class).is_some()
    }
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFunction")
            .field("name", &self.name)
            .field("nb_flows", &self.flows.len())
            .finish()
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    Queued,
    Running,
    Complete,
    Failed,
}

/// Per-flow data binding on a task instance.
///
/// `data_in` references the copy the task reads from, `data_out` the copy
/// it produces. Both start on the host; the offload engine retargets
/// `data_out` to a device copy during staging and back to the host copy
/// in the epilog so successors see the host copy by default.
#[derive(Debug, Clone, Default)]
pub struct DataBinding {
    pub data_in: Option<CopyRef>,
    pub data_out: Option<CopyRef>,
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Unique task identity, used to tag pending transfers with their pusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

/// A runnable task instance.
pub struct Task {
    pub id: TaskId,
    pub function: Arc<TaskFunction>,
    pub data: Vec<DataBinding>,
    pub priority: i32,
    pub status: TaskStatus,
    /// Requested device class; `Cpu` tasks never enter the offload engine.
    pub class: DeviceClass,
    /// Work amount used for device selection.
    pub ratio: f64,
    /// Bitmask of devices this task may still run on.
    pub devices_mask: u64,
    /// Per-flow push-out mask: a set bit stages the written copy back to
    /// the host at stage-out instead of parking it on the owned LRU.
    pushout: u64,
    /// Times this task bounced off an exhausted device pool.
    pub(crate) retries: u32,
    counter: Option<Counter>,
}

impl Task {
    pub fn new(function: Arc<TaskFunction>) -> Box<Task> {
        let nb_flows = function.nb_flows();
        Box::new(Task {
            id: TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed)),
            function,
            data: vec![DataBinding::default(); nb_flows],
            priority: 0,
            status: TaskStatus::Ready,
            class: DeviceClass::Cpu,
            ratio: 1.0,
            devices_mask: u64::MAX,
            pushout: u64::MAX,
            retries: 0,
            counter: None,
        })
    }

    pub fn with_priority(mut self: Box<Task>, priority: i32) -> Box<Task> {
        self.priority = priority;
        self
    }

    pub fn with_class(mut self: Box<Task>, class: DeviceClass) -> Box<Task> {
        self.class = class;
        self
    }

    pub fn with_ratio(mut self: Box<Task>, ratio: f64) -> Box<Task> {
        self.ratio = ratio;
        self
    }

    pub fn with_counter(mut self: Box<Task>, counter: Counter) -> Box<Task> {
        self.counter = Some(counter);
        self
    }

    /// Binds flow `index` to the host copy of `key`.
    pub fn bind(mut self: Box<Task>, index: usize, key: DataKey) -> Box<Task> {
        assert!(index < self.data.len(), "flow index out of range");
        self.data[index].data_in = Some(CopyRef::new(key, HOST_DEVICE));
        self
    }

    /// Keeps the copy written by flow `index` on the device after
    /// completion; it will be written back lazily by the engine.
    pub fn keep_on_device(mut self: Box<Task>, index: usize) -> Box<Task> {
        self.pushout &= !(1u64 << index);
        self
    }

    pub fn pushout(&self, index: usize) -> bool {
        self.pushout & (1u64 << index) != 0
    }

    pub(crate) fn take_counter(&mut self) -> Option<Counter> {
        self.counter.take()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{} prio {}",
            self.function.name, self.id.0, self.priority
        )
    }
}

/// Priority comparator: higher priority sorts first; equal priorities
/// keep FIFO order (stable insertion).
pub fn priority_cmp(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority.cmp(&a.priority)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_flags() {
        assert!(FlowFlags::CTL.is_ctl());
        assert!(FlowFlags::READ.is_read());
        assert!(!FlowFlags::READ.is_write());
        let rw = FlowFlags::READ | FlowFlags::WRITE;
        assert!(rw.is_read() && rw.is_write());
        assert_eq!(rw, FlowFlags::READ_WRITE);
    }

    #[test]
    fn test_task_ids_unique() {
        let f = Arc::new(TaskFunction::cpu_only("noop", vec![], |_| {}));
        let a = Task::new(f.clone());
        let b = Task::new(f);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_pushout_default_and_keep() {
        let f = Arc::new(TaskFunction::cpu_only(
            "w",
            vec![Flow::new(0, FlowFlags::WRITE, "out")],
            |_| {},
        ));
        let t = Task::new(f);
        assert!(t.pushout(0));
        let t = t.keep_on_device(0);
        assert!(!t.pushout(0));
    }

    #[test]
    fn test_priority_cmp_orders_high_first() {
        let f = Arc::new(TaskFunction::cpu_only("p", vec![], |_| {}));
        let lo = Task::new(f.clone()).with_priority(1);
        let hi = Task::new(f).with_priority(9);
        assert_eq!(priority_cmp(&hi, &lo), std::cmp::Ordering::Less);
    }
}
